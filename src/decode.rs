//! Wire-format decoder: parses a serialized protobuf payload into a
//! pre-allocated [`Message`] under a [`MiniTable`] schema (§4.5).
//!
//! Grounded on a recursive-descent decoder shape — a field dispatch loop
//! driven by a lookup table plus a fallback linear scan — generalized to
//! dispatch through a runtime `MiniTable` instead of a per-message generated
//! match arm, and on `hpb/wire/decode.c` for the hasbit/oneof/extension/
//! MessageSet/group handling the MiniTable format makes possible.

use crate::arena::Arena;
use crate::containers::{self, Array, MapField, MapKey, RepeatedStorage};
use crate::message::{ExtensionSlot, Message, TaggedMessagePtr};
use crate::minitable::{
    Extendability, ExtensionRegistry, FieldType, MiniTable, MiniTableExtension, MiniTableField,
    Mode, Presence, Rep, Sub,
};
use crate::status::{DecodeOptions, DecodeStatus};
use crate::wire::{self, EpsCopyInputStream, IsDone, StringView, Tag, WireType};
use std::sync::atomic::Ordering;

pub(crate) const MESSAGE_SET_ITEM_GROUP: u32 = 1;
pub(crate) const MESSAGE_SET_TYPE_ID: u32 = 2;
pub(crate) const MESSAGE_SET_MESSAGE: u32 = 3;

/// Decode `buf` into `msg` under `mt`, consulting `extreg` for extension
/// fields and honoring `options` (alias vs. copy strings, required-field
/// checking, max recursion depth, experimental unlinked-submessage
/// tolerance).
///
/// `msg` must already be a zero-initialized payload of `mt.size` bytes
/// (typically just allocated via [`Message::new_in`]); repeated calls against
/// the same message merge, matching normal protobuf singular-field and
/// repeated-field merge semantics.
pub fn decode_message(
    buf: &[u8],
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
) -> DecodeStatus {
    let mut stream = EpsCopyInputStream::new(buf);
    let mut depth = 0u32;
    let mut unlinked = false;
    let result = decode_fields(&mut stream, 0, msg, mt, extreg, options, arena, &mut depth, &mut unlinked)
        .and_then(|()| stream.status());

    match result {
        Ok(()) => {
            if options.check_required() {
                let missing = mt.required_mask() & !msg.hasbit_word();
                if missing != 0 {
                    log::warn!("decode_message: missing required field(s), mask {:#x}", missing);
                    return DecodeStatus::MissingRequired;
                }
            }
            if unlinked {
                log::debug!("decode_message: decoded with at least one unlinked sub-message");
                return DecodeStatus::UnlinkedSubMessage;
            }
            log::debug!(
                "decode_message: decoded {} bytes against a {}-field table",
                buf.len(),
                mt.fields.len()
            );
            DecodeStatus::Ok
        }
        Err(e) => {
            log::warn!("decode_message: {e}");
            e
        }
    }
}

fn decode_fields(
    stream: &mut EpsCopyInputStream,
    mut pos: usize,
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<(), DecodeStatus> {
    let mut hint = 0usize;
    loop {
        match stream.is_done(pos) {
            IsDone::Done => return Ok(()),
            IsDone::NeedFallback => return Err(DecodeStatus::Malformed),
            IsDone::NotDone => {}
        }
        let tag_start = pos;
        let (tag, n) = wire::read_tag(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
        let after_tag = pos + n;
        pos = decode_field(
            stream, tag_start, after_tag, tag, msg, mt, extreg, options, arena, depth, &mut hint, unlinked,
        )?;
    }
}

/// Groups aren't length-prefixed, so they read fields until a matching
/// `EndGroup` tag rather than until a pushed limit is exhausted.
fn decode_group_fields(
    stream: &mut EpsCopyInputStream,
    mut pos: usize,
    group_field_number: u32,
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let mut hint = 0usize;
    loop {
        match stream.is_done(pos) {
            IsDone::Done => return Err(DecodeStatus::Malformed),
            IsDone::NeedFallback => return Err(DecodeStatus::Malformed),
            IsDone::NotDone => {}
        }
        let tag_start = pos;
        let (tag, n) = wire::read_tag(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
        let after_tag = pos + n;
        if tag.wire_type == WireType::EndGroup {
            if tag.field_number != group_field_number {
                return Err(DecodeStatus::Malformed);
            }
            return Ok(after_tag);
        }
        pos = decode_field(
            stream, tag_start, after_tag, tag, msg, mt, extreg, options, arena, depth, &mut hint, unlinked,
        )?;
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_field(
    stream: &mut EpsCopyInputStream,
    tag_start: usize,
    after_tag: usize,
    tag: Tag,
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
    depth: &mut u32,
    hint: &mut usize,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    if mt.ext == Extendability::IsMessageSet
        && tag.wire_type == WireType::StartGroup
        && tag.field_number == MESSAGE_SET_ITEM_GROUP
    {
        return decode_message_set_item(stream, tag_start, after_tag, msg, mt, extreg, options, arena, depth, unlinked);
    }

    if let Some(field) = mt.find_field(tag.field_number, hint) {
        if field_accepts_wire_type(field, tag.wire_type) {
            return decode_known_field(stream, after_tag, tag, msg, field, mt, arena, options, extreg, depth, unlinked);
        }
    } else if let Some(registry) = extreg {
        if let Some(ext) = registry.lookup(mt, tag.field_number) {
            if field_accepts_wire_type(&ext.field, tag.wire_type) {
                return decode_extension_field(stream, after_tag, tag, msg, ext, arena, options, extreg, depth, unlinked);
            }
        }
    }

    decode_unknown_field(stream, tag_start, after_tag, tag, msg)
}

/// A field-number match on the wire is only a real match if the wire type is
/// one the field's type can produce; a mismatch (e.g. a field that used to be
/// `int32` now arriving as a length-delimited value) falls back to unknown-field
/// handling rather than erroring, matching normal protobuf schema-evolution
/// tolerance. Repeated scalar fields accept both their packed and unpacked
/// wire shapes regardless of the schema's declared packing.
fn field_accepts_wire_type(field: &MiniTableField, wire_type: WireType) -> bool {
    let ft = field.field_type;
    if ft.is_submessage() {
        let want = if ft == FieldType::Group { WireType::StartGroup } else { WireType::Delimited };
        return wire_type == want;
    }
    if field.mode == Mode::Map {
        return wire_type == WireType::Delimited;
    }
    if field.mode == Mode::Array
        && wire_type == WireType::Delimited
        && ft != FieldType::String
        && ft != FieldType::Bytes
    {
        return true;
    }
    wire_type == expected_wire_type(ft)
}

pub(crate) fn expected_wire_type(ft: FieldType) -> WireType {
    use FieldType::*;
    match ft {
        Bool | Int32 | UInt32 | SInt32 | Int64 | UInt64 | SInt64 | OpenEnum | ClosedEnum => WireType::Varint,
        Float | Fixed32 | SFixed32 => WireType::Bit32,
        Double | Fixed64 | SFixed64 => WireType::Bit64,
        String | Bytes | Message => WireType::Delimited,
        Group => WireType::StartGroup,
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_known_field(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    arena: &Arena,
    options: DecodeOptions,
    extreg: Option<&ExtensionRegistry>,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    match field.mode {
        Mode::Scalar if field.field_type.is_submessage() => {
            decode_scalar_submessage(stream, pos, tag, msg, field, mt, arena, options, extreg, depth, unlinked)
        }
        Mode::Scalar => decode_scalar_field(stream, pos, tag, msg, field, mt, arena, options),
        Mode::Array if field.field_type.is_submessage() => {
            decode_array_submessage(stream, pos, tag, msg, field, mt, arena, options, extreg, depth, unlinked)
        }
        Mode::Array => decode_array_field(stream, pos, tag, msg, field, mt, arena, options),
        Mode::Map => decode_map_field(stream, pos, msg, field, mt, arena, options, extreg, depth, unlinked),
    }
}

fn set_presence(msg: &Message, field: &MiniTableField) {
    match field.presence() {
        Presence::Hasbit(idx) => msg.set_has_bit(idx),
        Presence::OneofCase(off) => msg.set_oneof_case(off, field.number),
        Presence::None => {}
    }
}

fn decode_scalar_field(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    field: &MiniTableField,
    mt: &MiniTable,
    arena: &Arena,
    options: DecodeOptions,
) -> Result<usize, DecodeStatus> {
    let base = msg.as_ptr();
    let consumed = decode_scalar_value(
        stream,
        pos,
        field.field_type,
        base,
        field.offset,
        arena,
        options.alias_string(),
        mt.validate_utf8,
    )?;

    if field.field_type == FieldType::ClosedEnum {
        let v = *msg.ref_at::<i32>(field.offset);
        if let Some(e) = mt.sub_enum(field) {
            if !e.contains(v) {
                let mut unknown = Vec::new();
                wire::write_varint(&mut unknown, ((tag.field_number as u64) << 3) | (tag.wire_type as u64));
                wire::write_varint(&mut unknown, (v as i64) as u64);
                msg.append_unknown(&unknown);
                return Ok(pos + consumed);
            }
        }
    }

    set_presence(msg, field);
    Ok(pos + consumed)
}

#[allow(clippy::too_many_arguments)]
fn decode_scalar_submessage(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    arena: &Arena,
    options: DecodeOptions,
    extreg: Option<&ExtensionRegistry>,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let sub_mt = mt.sub_message(field);
    let linked = mt.is_sub_linked(field);
    let existing = *msg.ref_at::<usize>(field.offset);

    let (tagged_ptr, effective_mt) = if existing != 0 {
        let tp = unsafe { &mut *(existing as *mut TaggedMessagePtr) };
        let effective = if tp.is_empty() { crate::minitable::empty_mini_table() } else { sub_mt };
        (tp as *mut TaggedMessagePtr, effective)
    } else {
        let effective_mt = if linked { sub_mt } else { crate::minitable::empty_mini_table() };
        let inner = Message::new_in(arena, effective_mt.size as usize).ok_or(DecodeStatus::OutOfMemory)?;
        let tp = TaggedMessagePtr::new(inner, !linked);
        let boxed = containers::alloc_in_arena(arena, tp).ok_or(DecodeStatus::OutOfMemory)?;
        *msg.ref_mut::<usize>(field.offset) = boxed.as_ptr() as usize;
        (boxed.as_ptr(), effective_mt)
    };

    if !linked && existing == 0 {
        *unlinked = true;
    }
    set_presence(msg, field);

    *depth += 1;
    if *depth > options.max_depth() {
        return Err(DecodeStatus::MaxDepthExceeded);
    }

    let inner_msg = unsafe { (*tagged_ptr).message() };
    let end = decode_submessage_body(stream, pos, tag, &inner_msg, effective_mt, extreg, options, arena, depth, unlinked)?;
    *depth -= 1;
    Ok(end)
}

#[allow(clippy::too_many_arguments)]
fn decode_array_submessage(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    arena: &Arena,
    options: DecodeOptions,
    extreg: Option<&ExtensionRegistry>,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let sub_mt = mt.sub_message(field);
    let linked = mt.is_sub_linked(field);
    let effective_mt = if linked { sub_mt } else { crate::minitable::empty_mini_table() };
    if !linked {
        *unlinked = true;
    }

    let inner = Message::new_in(arena, effective_mt.size as usize).ok_or(DecodeStatus::OutOfMemory)?;
    let tp = TaggedMessagePtr::new(inner, !linked);

    *depth += 1;
    if *depth > options.max_depth() {
        return Err(DecodeStatus::MaxDepthExceeded);
    }
    let end = decode_submessage_body(stream, pos, tag, &inner, effective_mt, extreg, options, arena, depth, unlinked)?;
    *depth -= 1;

    let storage_ptr = ensure_array_storage(msg, field, arena)?;
    let storage = unsafe { &mut *storage_ptr };
    if let RepeatedStorage::Message(a) = storage {
        a.push(tp, arena).ok_or(DecodeStatus::OutOfMemory)?;
    }
    Ok(end)
}

/// Decodes one submessage or group body (the tag has already been consumed)
/// and returns the position just past it.
#[allow(clippy::too_many_arguments)]
fn decode_submessage_body(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    inner_msg: &Message,
    inner_mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    if tag.wire_type == WireType::StartGroup {
        decode_group_fields(stream, pos, tag.field_number, inner_msg, inner_mt, extreg, options, arena, depth, unlinked)
    } else {
        let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
        let len = len as usize;
        let saved = stream.push_limit(pos + n, len).ok_or(DecodeStatus::Malformed)?;
        let r = decode_fields(stream, pos + n, inner_msg, inner_mt, extreg, options, arena, depth, unlinked);
        stream.pop_limit(saved);
        r?;
        Ok(pos + n + len)
    }
}

fn decode_array_field(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    field: &MiniTableField,
    mt: &MiniTable,
    arena: &Arena,
    options: DecodeOptions,
) -> Result<usize, DecodeStatus> {
    let ft = field.field_type;
    let storage_ptr = ensure_array_storage(msg, field, arena)?;
    let storage = unsafe { &mut *storage_ptr };

    if tag.wire_type == WireType::Delimited && ft != FieldType::String && ft != FieldType::Bytes {
        let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
        let len = len as usize;
        let saved = stream.push_limit(pos + n, len).ok_or(DecodeStatus::Malformed)?;
        let mut p = pos + n;
        loop {
            match stream.is_done(p) {
                IsDone::Done => break,
                IsDone::NeedFallback => {
                    stream.pop_limit(saved);
                    return Err(DecodeStatus::Malformed);
                }
                IsDone::NotDone => {}
            }
            match push_scalar_element(stream, p, ft, storage, arena, options.alias_string(), mt.validate_utf8) {
                Ok(next) => p = next,
                Err(e) => {
                    stream.pop_limit(saved);
                    return Err(e);
                }
            }
        }
        stream.pop_limit(saved);
        Ok(p)
    } else {
        push_scalar_element(stream, pos, ft, storage, arena, options.alias_string(), mt.validate_utf8)
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_map_field(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    arena: &Arena,
    options: DecodeOptions,
    extreg: Option<&ExtensionRegistry>,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let entry_mt = mt.sub_message(field);
    let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
    let len = len as usize;
    let entry_msg = Message::new_in(arena, entry_mt.size as usize).ok_or(DecodeStatus::OutOfMemory)?;

    let saved = stream.push_limit(pos + n, len).ok_or(DecodeStatus::Malformed)?;
    let r = decode_fields(stream, pos + n, &entry_msg, entry_mt, extreg, options, arena, depth, unlinked);
    stream.pop_limit(saved);
    r?;

    let key_field = &entry_mt.fields[0];
    let value_field = &entry_mt.fields[1];
    let key_bytes = scalar_field_to_bytes(&entry_msg, key_field);
    let value_bytes = scalar_field_to_bytes(&entry_msg, value_field);

    let map_ptr = ensure_map_storage(msg, field, arena)?;
    let map = unsafe { &mut *map_ptr };
    map.insert(MapKey(key_bytes), value_bytes);

    Ok(pos + n + len)
}

/// Flattens one map-entry field's stored slot into a byte vector for use as
/// a [`MapKey`] or map value payload: raw little-endian bytes for scalars,
/// the string/bytes content for `StringView`, and the slot's own pointer
/// address (also little-endian) when the value is message-typed — the
/// pointee is independently arena-owned and outlives the entry message.
fn scalar_field_to_bytes(msg: &Message, field: &MiniTableField) -> Vec<u8> {
    match field.rep {
        Rep::OneByte => vec![*msg.ref_at::<u8>(field.offset)],
        Rep::FourByte => msg.ref_at::<u32>(field.offset).to_le_bytes().to_vec(),
        Rep::EightByte => msg.ref_at::<u64>(field.offset).to_le_bytes().to_vec(),
        Rep::StringView => msg.ref_at::<StringView>(field.offset).as_slice().to_vec(),
        Rep::Pointer => (*msg.ref_at::<usize>(field.offset)).to_le_bytes().to_vec(),
    }
}

fn ensure_array_storage(msg: &Message, field: &MiniTableField, arena: &Arena) -> Result<*mut RepeatedStorage, DecodeStatus> {
    let existing = *msg.ref_at::<usize>(field.offset);
    if existing != 0 {
        return Ok(existing as *mut RepeatedStorage);
    }
    let boxed = containers::alloc_in_arena(arena, new_repeated_storage(field.field_type)).ok_or(DecodeStatus::OutOfMemory)?;
    *msg.ref_mut::<usize>(field.offset) = boxed.as_ptr() as usize;
    Ok(boxed.as_ptr())
}

fn ensure_map_storage(msg: &Message, field: &MiniTableField, arena: &Arena) -> Result<*mut MapField, DecodeStatus> {
    let existing = *msg.ref_at::<usize>(field.offset);
    if existing != 0 {
        return Ok(existing as *mut MapField);
    }
    let boxed = containers::alloc_in_arena(arena, MapField::new()).ok_or(DecodeStatus::OutOfMemory)?;
    *msg.ref_mut::<usize>(field.offset) = boxed.as_ptr() as usize;
    Ok(boxed.as_ptr())
}

fn new_repeated_storage(ft: FieldType) -> RepeatedStorage {
    use FieldType::*;
    match ft {
        Bool => RepeatedStorage::Bool(Array::new()),
        Int32 | SInt32 | SFixed32 | OpenEnum | ClosedEnum => RepeatedStorage::I32(Array::new()),
        UInt32 | Fixed32 => RepeatedStorage::U32(Array::new()),
        Float => RepeatedStorage::F32(Array::new()),
        Int64 | SInt64 | SFixed64 => RepeatedStorage::I64(Array::new()),
        UInt64 | Fixed64 => RepeatedStorage::U64(Array::new()),
        Double => RepeatedStorage::F64(Array::new()),
        String | Bytes => RepeatedStorage::StringOrBytes(Array::new()),
        Group | Message => RepeatedStorage::Message(Array::new()),
    }
}

/// Decodes one non-submessage scalar value and writes it at `offset` bytes
/// past `base` (a message payload pointer, or a 16-byte extension value
/// buffer). Returns the number of input bytes consumed.
#[allow(clippy::too_many_arguments)]
fn decode_scalar_value(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    field_type: FieldType,
    base: *mut u8,
    offset: u16,
    arena: &Arena,
    alias: bool,
    validate_utf8: bool,
) -> Result<usize, DecodeStatus> {
    use FieldType::*;
    match field_type {
        Bool => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<u8>(base, offset, (v != 0) as u8) };
            Ok(n)
        }
        Int32 | OpenEnum | ClosedEnum => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i32>(base, offset, v as u32 as i32) };
            Ok(n)
        }
        SInt32 => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i32>(base, offset, wire::zigzag_decode32(v as u32)) };
            Ok(n)
        }
        UInt32 => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<u32>(base, offset, v as u32) };
            Ok(n)
        }
        Int64 => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i64>(base, offset, v as i64) };
            Ok(n)
        }
        SInt64 => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i64>(base, offset, wire::zigzag_decode64(v)) };
            Ok(n)
        }
        UInt64 => {
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<u64>(base, offset, v) };
            Ok(n)
        }
        Float => {
            let bits = wire::read_fixed32(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<f32>(base, offset, f32::from_bits(bits)) };
            Ok(4)
        }
        Fixed32 => {
            let bits = wire::read_fixed32(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<u32>(base, offset, bits) };
            Ok(4)
        }
        SFixed32 => {
            let bits = wire::read_fixed32(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i32>(base, offset, bits as i32) };
            Ok(4)
        }
        Double => {
            let bits = wire::read_fixed64(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<f64>(base, offset, f64::from_bits(bits)) };
            Ok(8)
        }
        Fixed64 => {
            let bits = wire::read_fixed64(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<u64>(base, offset, bits) };
            Ok(8)
        }
        SFixed64 => {
            let bits = wire::read_fixed64(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            unsafe { write_at::<i64>(base, offset, bits as i64) };
            Ok(8)
        }
        String | Bytes => {
            let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            let len = len as usize;
            let sv = stream.read_string(pos + n, len, arena, alias).ok_or(DecodeStatus::Malformed)?;
            if field_type == String && validate_utf8 && core::str::from_utf8(sv.as_slice()).is_err() {
                return Err(DecodeStatus::BadUtf8);
            }
            unsafe { write_at::<StringView>(base, offset, sv) };
            Ok(n + len)
        }
        Group | Message => unreachable!("submessage fields are decoded by decode_scalar_submessage"),
    }
}

fn push_scalar_element(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    ft: FieldType,
    storage: &mut RepeatedStorage,
    arena: &Arena,
    alias: bool,
    validate_utf8: bool,
) -> Result<usize, DecodeStatus> {
    use FieldType::*;
    macro_rules! push_varint {
        ($variant:ident, $conv:expr) => {{
            let (v, n) = wire::read_varint(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            if let RepeatedStorage::$variant(a) = storage {
                a.push($conv(v), arena).ok_or(DecodeStatus::OutOfMemory)?;
            }
            Ok(pos + n)
        }};
    }
    macro_rules! push_fixed32 {
        ($variant:ident, $conv:expr) => {{
            let bits = wire::read_fixed32(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            if let RepeatedStorage::$variant(a) = storage {
                a.push($conv(bits), arena).ok_or(DecodeStatus::OutOfMemory)?;
            }
            Ok(pos + 4)
        }};
    }
    macro_rules! push_fixed64 {
        ($variant:ident, $conv:expr) => {{
            let bits = wire::read_fixed64(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            if let RepeatedStorage::$variant(a) = storage {
                a.push($conv(bits), arena).ok_or(DecodeStatus::OutOfMemory)?;
            }
            Ok(pos + 8)
        }};
    }

    match ft {
        Bool => push_varint!(Bool, |v: u64| (v != 0) as u8),
        Int32 | OpenEnum | ClosedEnum => push_varint!(I32, |v: u64| v as u32 as i32),
        SInt32 => push_varint!(I32, |v: u64| wire::zigzag_decode32(v as u32)),
        UInt32 => push_varint!(U32, |v: u64| v as u32),
        Int64 => push_varint!(I64, |v: u64| v as i64),
        SInt64 => push_varint!(I64, wire::zigzag_decode64),
        UInt64 => push_varint!(U64, |v: u64| v),
        Float => push_fixed32!(F32, f32::from_bits),
        Fixed32 => push_fixed32!(U32, |v: u32| v),
        SFixed32 => push_fixed32!(I32, |v: u32| v as i32),
        Double => push_fixed64!(F64, f64::from_bits),
        Fixed64 => push_fixed64!(U64, |v: u64| v),
        SFixed64 => push_fixed64!(I64, |v: u64| v as i64),
        String | Bytes => {
            let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            let len = len as usize;
            let sv = stream.read_string(pos + n, len, arena, alias).ok_or(DecodeStatus::Malformed)?;
            if ft == String && validate_utf8 && core::str::from_utf8(sv.as_slice()).is_err() {
                return Err(DecodeStatus::BadUtf8);
            }
            if let RepeatedStorage::StringOrBytes(a) = storage {
                a.push(sv, arena).ok_or(DecodeStatus::OutOfMemory)?;
            }
            Ok(pos + n + len)
        }
        Group | Message => unreachable!("submessage arrays are decoded by decode_array_submessage"),
    }
}

fn decode_unknown_field(
    stream: &mut EpsCopyInputStream,
    tag_start: usize,
    after_tag: usize,
    tag: Tag,
    msg: &Message,
) -> Result<usize, DecodeStatus> {
    if tag.wire_type == WireType::EndGroup {
        return Err(DecodeStatus::Malformed);
    }
    let value_len = wire::skip_value(stream.bytes_until_limit(after_tag), tag, 64).ok_or(DecodeStatus::Malformed)?;
    let end = after_tag + value_len;
    let whole = stream.bytes_until_limit(tag_start);
    msg.append_unknown(&whole[..end - tag_start]);
    Ok(end)
}

pub(crate) fn ext_sub_message(ext: &'static MiniTableExtension) -> &'static MiniTable {
    match &ext.sub {
        Sub::Message(slot) => {
            let p = slot.load(Ordering::Acquire);
            if p.is_null() {
                crate::minitable::empty_mini_table()
            } else {
                unsafe { &*p }
            }
        }
        Sub::Enum(_) => crate::minitable::empty_mini_table(),
    }
}

pub(crate) fn ext_is_linked(ext: &MiniTableExtension) -> bool {
    match &ext.sub {
        Sub::Message(slot) => !slot.load(Ordering::Acquire).is_null(),
        Sub::Enum(_) => true,
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_extension_field(
    stream: &mut EpsCopyInputStream,
    pos: usize,
    tag: Tag,
    msg: &Message,
    ext: &'static MiniTableExtension,
    arena: &Arena,
    options: DecodeOptions,
    extreg: Option<&ExtensionRegistry>,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let field = &ext.field;
    if field.field_type.is_submessage() {
        let sub_mt = ext_sub_message(ext);
        let linked = ext_is_linked(ext);
        let effective_mt = if linked { sub_mt } else { crate::minitable::empty_mini_table() };
        if !linked {
            *unlinked = true;
        }
        let inner = Message::new_in(arena, effective_mt.size as usize).ok_or(DecodeStatus::OutOfMemory)?;

        *depth += 1;
        if *depth > options.max_depth() {
            return Err(DecodeStatus::MaxDepthExceeded);
        }
        let end = decode_submessage_body(stream, pos, tag, &inner, effective_mt, extreg, options, arena, depth, unlinked)?;
        *depth -= 1;

        let tp = TaggedMessagePtr::new(inner, !linked);
        let boxed = containers::alloc_in_arena(arena, tp).ok_or(DecodeStatus::OutOfMemory)?;
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&(boxed.as_ptr() as usize).to_le_bytes());
        msg.push_extension(ExtensionSlot { extension: ext, value });
        Ok(end)
    } else if field.mode == Mode::Array {
        let storage_ptr = ensure_extension_array(msg, ext, arena)?;
        let storage = unsafe { &mut *storage_ptr };
        let ft = field.field_type;
        if tag.wire_type == WireType::Delimited && ft != FieldType::String && ft != FieldType::Bytes {
            let (len, n) = wire::read_size(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
            let len = len as usize;
            let saved = stream.push_limit(pos + n, len).ok_or(DecodeStatus::Malformed)?;
            let mut p = pos + n;
            loop {
                match stream.is_done(p) {
                    IsDone::Done => break,
                    IsDone::NeedFallback => {
                        stream.pop_limit(saved);
                        return Err(DecodeStatus::Malformed);
                    }
                    IsDone::NotDone => {}
                }
                match push_scalar_element(stream, p, ft, storage, arena, options.alias_string(), false) {
                    Ok(next) => p = next,
                    Err(e) => {
                        stream.pop_limit(saved);
                        return Err(e);
                    }
                }
            }
            stream.pop_limit(saved);
            Ok(p)
        } else {
            push_scalar_element(stream, pos, ft, storage, arena, options.alias_string(), false)
        }
    } else {
        let mut value = [0u8; 16];
        let consumed = decode_scalar_value(
            stream,
            pos,
            field.field_type,
            value.as_mut_ptr(),
            0,
            arena,
            options.alias_string(),
            false,
        )?;
        msg.push_extension(ExtensionSlot { extension: ext, value });
        Ok(pos + consumed)
    }
}

/// Finds (or allocates) the [`RepeatedStorage`] backing a repeated extension
/// field, so repeated occurrences of the same extension field number
/// accumulate into one array instead of one slot per occurrence.
fn ensure_extension_array(
    msg: &Message,
    ext: &'static MiniTableExtension,
    arena: &Arena,
) -> Result<*mut RepeatedStorage, DecodeStatus> {
    let list = msg.internal().extensions.take();
    let found = list
        .iter()
        .find(|s| core::ptr::eq(s.extension, ext))
        .map(|s| usize::from_le_bytes(s.value[..8].try_into().unwrap()));
    msg.internal().extensions.set(list);
    if let Some(addr) = found {
        return Ok(addr as *mut RepeatedStorage);
    }

    let boxed = containers::alloc_in_arena(arena, new_repeated_storage(ext.field.field_type)).ok_or(DecodeStatus::OutOfMemory)?;
    let mut value = [0u8; 16];
    value[..8].copy_from_slice(&(boxed.as_ptr() as usize).to_le_bytes());
    msg.push_extension(ExtensionSlot { extension: ext, value });
    Ok(boxed.as_ptr())
}

/// Decodes a `MessageSet` item group (field 1: `{type_id: 2, message: 3}`),
/// looking the extendee up in `extreg` by `type_id` the way MessageSet
/// extensions have always been registered: under their type id as the
/// "field number".
#[allow(clippy::too_many_arguments)]
fn decode_message_set_item(
    stream: &mut EpsCopyInputStream,
    tag_start: usize,
    after_tag: usize,
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
    depth: &mut u32,
    unlinked: &mut bool,
) -> Result<usize, DecodeStatus> {
    let mut pos = after_tag;
    let mut type_id: Option<u32> = None;
    let mut message_range: Option<(usize, usize)> = None;

    loop {
        match stream.is_done(pos) {
            IsDone::Done | IsDone::NeedFallback => return Err(DecodeStatus::Malformed),
            IsDone::NotDone => {}
        }
        let (inner_tag, n) = wire::read_tag(stream.bytes_until_limit(pos)).ok_or(DecodeStatus::Malformed)?;
        let inner_after = pos + n;
        if inner_tag.wire_type == WireType::EndGroup {
            if inner_tag.field_number != MESSAGE_SET_ITEM_GROUP {
                return Err(DecodeStatus::Malformed);
            }
            pos = inner_after;
            break;
        }
        match (inner_tag.field_number, inner_tag.wire_type) {
            (MESSAGE_SET_TYPE_ID, WireType::Varint) => {
                let (v, vn) = wire::read_varint(stream.bytes_until_limit(inner_after)).ok_or(DecodeStatus::Malformed)?;
                type_id = Some(v as u32);
                pos = inner_after + vn;
            }
            (MESSAGE_SET_MESSAGE, WireType::Delimited) => {
                let (len, vn) = wire::read_size(stream.bytes_until_limit(inner_after)).ok_or(DecodeStatus::Malformed)?;
                message_range = Some((inner_after + vn, len as usize));
                pos = inner_after + vn + len as usize;
            }
            _ => {
                let skip = wire::skip_value(stream.bytes_until_limit(inner_after), inner_tag, 64).ok_or(DecodeStatus::Malformed)?;
                pos = inner_after + skip;
            }
        }
    }

    if let (Some(tid), Some((mpos, mlen)), Some(registry)) = (type_id, message_range, extreg) {
        if let Some(ext) = registry.lookup(mt, tid) {
            if matches!(&ext.sub, Sub::Message(_)) {
                let sub_mt = ext_sub_message(ext);
                let linked = ext_is_linked(ext);
                let effective_mt = if linked { sub_mt } else { crate::minitable::empty_mini_table() };
                if !linked {
                    *unlinked = true;
                }
                let body = stream.bytes_until_limit(mpos);
                let body = &body[..mlen.min(body.len())];

                let inner = Message::new_in(arena, effective_mt.size as usize).ok_or(DecodeStatus::OutOfMemory)?;
                *depth += 1;
                if *depth > options.max_depth() {
                    return Err(DecodeStatus::MaxDepthExceeded);
                }
                let status = decode_message(body, &inner, effective_mt, extreg, options, arena);
                *depth -= 1;
                if !status.is_recoverable() {
                    return Err(status);
                }

                let tp = TaggedMessagePtr::new(inner, !linked);
                let boxed = containers::alloc_in_arena(arena, tp).ok_or(DecodeStatus::OutOfMemory)?;
                let mut value = [0u8; 16];
                value[..8].copy_from_slice(&(boxed.as_ptr() as usize).to_le_bytes());
                msg.push_extension(ExtensionSlot { extension: ext, value });
                return Ok(pos);
            }
        }
    }

    let whole = stream.bytes_until_limit(tag_start);
    msg.append_unknown(&whole[..pos - tag_start]);
    Ok(pos)
}

#[inline]
unsafe fn write_at<T>(base: *mut u8, offset: u16, value: T) {
    unsafe { (base.add(offset as usize) as *mut T).write(value) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minitable::{FieldFlags, MiniTableEnum};

    fn field(number: u32, offset: u16, mode: Mode, rep: Rep, field_type: FieldType) -> MiniTableField {
        MiniTableField {
            number,
            offset,
            presence: 0,
            sub_index: 0,
            mode,
            rep,
            flags: FieldFlags::empty(),
            field_type,
        }
    }

    fn leak(mt: MiniTable) -> &'static MiniTable {
        Box::leak(Box::new(mt))
    }

    #[test]
    fn decodes_required_int32_and_optional_string() {
        let mut f1 = field(1, 8, Mode::Scalar, Rep::FourByte, FieldType::Int32);
        f1.set_presence(Presence::Hasbit(1));
        let mut f2 = field(2, 24, Mode::Scalar, Rep::StringView, FieldType::String);
        f2.set_presence(Presence::Hasbit(2));

        let mt = leak(MiniTable {
            fields: vec![f1, f2],
            subs: vec![],
            size: 40,
            required_count: 1,
            dense_below: 2,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: true,
        });

        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (1 << 3) | 0);
        wire::write_varint(&mut buf, 42);
        wire::write_varint(&mut buf, (2 << 3) | 2);
        wire::write_varint(&mut buf, 5);
        buf.extend_from_slice(b"hello");

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 40).unwrap();
        let status = decode_message(
            &buf,
            &msg,
            mt,
            None,
            DecodeOptions::new().with_check_required(),
            &arena,
        );
        assert_eq!(status, DecodeStatus::Ok);
        assert_eq!(*msg.ref_at::<i32>(8), 42);
        assert_eq!(msg.ref_at::<StringView>(24).as_slice(), b"hello");
    }

    #[test]
    fn missing_required_field_is_reported_but_recoverable() {
        let mut f1 = field(1, 8, Mode::Scalar, Rep::FourByte, FieldType::Int32);
        f1.set_presence(Presence::Hasbit(1));
        let mt = leak(MiniTable {
            fields: vec![f1],
            subs: vec![],
            size: 16,
            required_count: 1,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        });

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&[], &msg, mt, None, DecodeOptions::new().with_check_required(), &arena);
        assert_eq!(status, DecodeStatus::MissingRequired);
        assert!(status.is_recoverable());
    }

    #[test]
    fn unrecognized_field_is_preserved_as_unknown_bytes() {
        let mt = leak(MiniTable {
            fields: vec![],
            subs: vec![],
            size: 8,
            required_count: 0,
            dense_below: 0,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        });

        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (9 << 3) | 0);
        wire::write_varint(&mut buf, 7);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 8).unwrap();
        let status = decode_message(&buf, &msg, mt, None, DecodeOptions::new(), &arena);
        assert_eq!(status, DecodeStatus::Ok);
        assert_eq!(msg.unknown_bytes(), buf);
    }

    #[test]
    fn packed_repeated_int32_decodes_into_array() {
        let f1 = field(1, 8, Mode::Array, Rep::FourByte, FieldType::Int32);
        let mt = leak(MiniTable {
            fields: vec![f1],
            subs: vec![],
            size: 16,
            required_count: 0,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        });

        let mut packed = Vec::new();
        wire::write_varint(&mut packed, 1);
        wire::write_varint(&mut packed, 300);
        wire::write_varint(&mut packed, 3);

        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (1 << 3) | 2);
        wire::write_varint(&mut buf, packed.len() as u64);
        buf.extend_from_slice(&packed);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&buf, &msg, mt, None, DecodeOptions::new(), &arena);
        assert_eq!(status, DecodeStatus::Ok);
        let ptr = *msg.ref_at::<usize>(8);
        let storage = unsafe { &*(ptr as *const RepeatedStorage) };
        match storage {
            RepeatedStorage::I32(a) => assert_eq!(a.as_slice(), &[1, 300, 3]),
            _ => panic!("wrong storage variant"),
        }
    }

    #[test]
    fn invalid_closed_enum_value_becomes_unknown() {
        let mut e = MiniTableEnum::default();
        e.insert(0);
        e.insert(1);

        let f1 = field(1, 8, Mode::Scalar, Rep::FourByte, FieldType::ClosedEnum);
        let mut mt = MiniTable {
            fields: vec![f1],
            subs: vec![Sub::Enum(Box::new(e))],
            size: 16,
            required_count: 0,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        };
        mt.fields[0].sub_index = 0;
        let mt = leak(mt);

        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (1 << 3) | 0);
        wire::write_varint(&mut buf, 99);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&buf, &msg, mt, None, DecodeOptions::new(), &arena);
        assert_eq!(status, DecodeStatus::Ok);
        assert!(!msg.has_bit(0));
        assert!(!msg.unknown_bytes().is_empty());
    }

    #[test]
    fn deeply_nested_submessages_hit_max_depth() {
        let mut f1 = field(1, 8, Mode::Scalar, Rep::Pointer, FieldType::Message);
        f1.sub_index = 0;
        let mut mt = MiniTable {
            fields: vec![f1],
            subs: vec![Sub::Message(std::sync::atomic::AtomicPtr::new(core::ptr::null_mut()))],
            size: 16,
            required_count: 0,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        };
        mt.fields[0].sub_index = 0;
        let mt = leak(mt);
        mt.set_sub_message(&mt.fields[0], mt as *const MiniTable as *mut MiniTable);

        // build nested length-delimited field-1 submessages, 10 levels deep.
        let mut buf: Vec<u8> = Vec::new();
        for _ in 0..10 {
            let mut next = Vec::new();
            wire::write_varint(&mut next, (1 << 3) | 2);
            wire::write_varint(&mut next, buf.len() as u64);
            next.extend_from_slice(&buf);
            buf = next;
        }

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&buf, &msg, mt, None, DecodeOptions::new().with_max_depth(3), &arena);
        assert_eq!(status, DecodeStatus::MaxDepthExceeded);
    }
}
