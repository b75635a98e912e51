//! Wire-format encoder: serializes a [`Message`] under a [`MiniTable`] schema
//! back into a protobuf byte stream (§4.6).
//!
//! Grounded on `hpb/wire/encode.c` for field ordering, packed/unpacked
//! selection, and MessageSet re-encoding. Unlike the C original's
//! backward-growth output buffer (the encoder writes from the end of a
//! preallocated block towards its start, to avoid a fix-up pass once a
//! submessage's length is known), this module builds each message's body
//! into its own `Vec<u8>` bottom-up and lets the caller prepend the tag and
//! length once the body is complete — same result, without the unsafe
//! pointer-walking-backwards trick (see DESIGN.md's Open Question entry).

use crate::decode::{
    ext_sub_message, expected_wire_type, MESSAGE_SET_ITEM_GROUP, MESSAGE_SET_MESSAGE,
    MESSAGE_SET_TYPE_ID,
};
use crate::message::{ExtensionSlot, Message, TaggedMessagePtr};
use crate::minitable::{
    Extendability, ExtensionRegistry, FieldType, MiniTable, MiniTableExtension, MiniTableField,
    Mode, Presence,
};
use crate::containers::{MapField, MapKey, RepeatedStorage};
use crate::status::{EncodeOptions, EncodeStatus};
use crate::wire::{self, StringView, WireType};

/// Encode `msg` under `mt` into a freshly allocated byte buffer, consulting
/// `extreg` for any extension fields present on `msg`.
pub fn encode_message(
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: EncodeOptions,
) -> Result<Vec<u8>, EncodeStatus> {
    if options.check_required() {
        let missing = mt.required_mask() & !msg.hasbit_word();
        if missing != 0 {
            log::warn!("encode_message: missing required field(s), mask {:#x}", missing);
            return Err(EncodeStatus::MissingRequired);
        }
    }

    let mut depth = 0u32;
    let body = encode_fields(msg, mt, extreg, options, &mut depth)?;
    log::debug!(
        "encode_message: {} bytes from a {}-field table",
        body.len(),
        mt.fields.len()
    );
    Ok(body)
}

/// One message's wire bytes: declared fields in schema order, then
/// extensions (if the table is extendable), then unknown bytes (unless
/// `SkipUnknown`).
fn encode_fields(
    msg: &Message,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: EncodeOptions,
    depth: &mut u32,
) -> Result<Vec<u8>, EncodeStatus> {
    let mut buf = Vec::new();

    for field in &mt.fields {
        match field.mode {
            Mode::Scalar if field.field_type.is_submessage() => {
                write_scalar_submessage_field(&mut buf, msg, field, mt, depth, options, extreg)?;
            }
            Mode::Scalar => write_scalar_field(&mut buf, msg, field),
            Mode::Array if field.field_type.is_submessage() => {
                write_array_submessage_field(&mut buf, msg, field, mt, depth, options, extreg)?;
            }
            Mode::Array => write_array_field(&mut buf, field, msg),
            Mode::Map => write_map_field(&mut buf, msg, field, mt, depth, options, extreg)?,
        }
    }

    if matches!(mt.ext, Extendability::Extendable | Extendability::IsMessageSet) {
        write_extensions(&mut buf, msg, mt, depth, options, extreg)?;
    }

    if !options.skip_unknown() {
        buf.extend_from_slice(&msg.unknown_bytes());
    }

    Ok(buf)
}

/// One scalar value, already reduced to the bits its wire type needs:
/// zigzag/sign-extension for varints already applied, fixed-width values
/// already in their raw little-endian bit pattern, strings/bytes borrowed
/// verbatim.
enum ScalarBits<'a> {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
    Bytes(&'a [u8]),
}

fn write_scalar_bits(buf: &mut Vec<u8>, field_number: u32, wire_type: WireType, bits: ScalarBits) {
    wire::write_varint(buf, ((field_number as u64) << 3) | (wire_type as u64));
    match bits {
        ScalarBits::Varint(v) => wire::write_varint(buf, v),
        ScalarBits::Fixed32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ScalarBits::Fixed64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        ScalarBits::Bytes(b) => {
            wire::write_varint(buf, b.len() as u64);
            buf.extend_from_slice(b);
        }
    }
}

fn scalar_bits_from_message<'a>(msg: &'a Message, field: &MiniTableField) -> ScalarBits<'a> {
    use FieldType::*;
    match field.field_type {
        Bool => ScalarBits::Varint(*msg.ref_at::<u8>(field.offset) as u64),
        Int32 | OpenEnum | ClosedEnum => {
            ScalarBits::Varint(*msg.ref_at::<i32>(field.offset) as i64 as u64)
        }
        SInt32 => ScalarBits::Varint(wire::zigzag_encode32(*msg.ref_at::<i32>(field.offset)) as u64),
        UInt32 => ScalarBits::Varint(*msg.ref_at::<u32>(field.offset) as u64),
        Int64 => ScalarBits::Varint(*msg.ref_at::<i64>(field.offset) as u64),
        SInt64 => ScalarBits::Varint(wire::zigzag_encode64(*msg.ref_at::<i64>(field.offset))),
        UInt64 => ScalarBits::Varint(*msg.ref_at::<u64>(field.offset)),
        Float => ScalarBits::Fixed32(msg.ref_at::<f32>(field.offset).to_bits()),
        Fixed32 => ScalarBits::Fixed32(*msg.ref_at::<u32>(field.offset)),
        SFixed32 => ScalarBits::Fixed32(*msg.ref_at::<i32>(field.offset) as u32),
        Double => ScalarBits::Fixed64(msg.ref_at::<f64>(field.offset).to_bits()),
        Fixed64 => ScalarBits::Fixed64(*msg.ref_at::<u64>(field.offset)),
        SFixed64 => ScalarBits::Fixed64(*msg.ref_at::<i64>(field.offset) as u64),
        String | Bytes => ScalarBits::Bytes(msg.ref_at::<StringView>(field.offset).as_slice()),
        Group | Message => unreachable!("submessage fields are encoded separately"),
    }
}

/// Same as [`scalar_bits_from_message`] but for a 16-byte extension value
/// slot, which isn't a `Message` and so can't go through `ref_at`.
fn scalar_bits_from_ext_slot(field_type: FieldType, slot: &[u8; 16]) -> ScalarBits<'_> {
    use FieldType::*;
    let base = slot.as_ptr();
    // Safety: `slot` was filled by `decode::decode_extension_field` using the
    // same per-`FieldType` layout this match reads back.
    unsafe {
        match field_type {
            Bool => ScalarBits::Varint(*base as u64),
            Int32 | OpenEnum | ClosedEnum => ScalarBits::Varint(*(base as *const i32) as i64 as u64),
            SInt32 => ScalarBits::Varint(wire::zigzag_encode32(*(base as *const i32)) as u64),
            UInt32 => ScalarBits::Varint(*(base as *const u32) as u64),
            Int64 => ScalarBits::Varint(*(base as *const i64) as u64),
            SInt64 => ScalarBits::Varint(wire::zigzag_encode64(*(base as *const i64))),
            UInt64 => ScalarBits::Varint(*(base as *const u64)),
            Float => ScalarBits::Fixed32((*(base as *const f32)).to_bits()),
            Fixed32 => ScalarBits::Fixed32(*(base as *const u32)),
            SFixed32 => ScalarBits::Fixed32(*(base as *const i32) as u32),
            Double => ScalarBits::Fixed64((*(base as *const f64)).to_bits()),
            Fixed64 => ScalarBits::Fixed64(*(base as *const u64)),
            SFixed64 => ScalarBits::Fixed64(*(base as *const i64) as u64),
            String | Bytes => ScalarBits::Bytes((*(base as *const StringView)).as_slice()),
            Group | Message => unreachable!("submessage extensions are encoded separately"),
        }
    }
}

/// The inverse of `decode::scalar_field_to_bytes`: reconstructs a scalar
/// wire value from the little-endian byte vector a map key or non-message
/// map value was flattened into.
fn scalar_bits_from_raw(field_type: FieldType, raw: &[u8]) -> ScalarBits<'_> {
    use FieldType::*;
    match field_type {
        Bool => ScalarBits::Varint(raw[0] as u64),
        Int32 | OpenEnum | ClosedEnum => {
            let v = u32::from_le_bytes(raw[..4].try_into().unwrap()) as i32;
            ScalarBits::Varint(v as i64 as u64)
        }
        SInt32 => {
            let v = u32::from_le_bytes(raw[..4].try_into().unwrap()) as i32;
            ScalarBits::Varint(wire::zigzag_encode32(v) as u64)
        }
        UInt32 => ScalarBits::Varint(u32::from_le_bytes(raw[..4].try_into().unwrap()) as u64),
        Int64 => ScalarBits::Varint(u64::from_le_bytes(raw[..8].try_into().unwrap())),
        SInt64 => {
            let v = u64::from_le_bytes(raw[..8].try_into().unwrap()) as i64;
            ScalarBits::Varint(wire::zigzag_encode64(v))
        }
        UInt64 => ScalarBits::Varint(u64::from_le_bytes(raw[..8].try_into().unwrap())),
        Float => ScalarBits::Fixed32(u32::from_le_bytes(raw[..4].try_into().unwrap())),
        Fixed32 => ScalarBits::Fixed32(u32::from_le_bytes(raw[..4].try_into().unwrap())),
        SFixed32 => ScalarBits::Fixed32(u32::from_le_bytes(raw[..4].try_into().unwrap())),
        Double => ScalarBits::Fixed64(u64::from_le_bytes(raw[..8].try_into().unwrap())),
        Fixed64 => ScalarBits::Fixed64(u64::from_le_bytes(raw[..8].try_into().unwrap())),
        SFixed64 => ScalarBits::Fixed64(u64::from_le_bytes(raw[..8].try_into().unwrap())),
        String | Bytes => ScalarBits::Bytes(raw),
        Group | Message => unreachable!("submessage map values are encoded separately"),
    }
}

fn is_default_scalar(msg: &Message, field: &MiniTableField) -> bool {
    use FieldType::*;
    match field.field_type {
        Bool => *msg.ref_at::<u8>(field.offset) == 0,
        Int32 | SInt32 | SFixed32 | OpenEnum | ClosedEnum => *msg.ref_at::<i32>(field.offset) == 0,
        UInt32 | Fixed32 => *msg.ref_at::<u32>(field.offset) == 0,
        Float => *msg.ref_at::<f32>(field.offset) == 0.0,
        Int64 | SInt64 | SFixed64 => *msg.ref_at::<i64>(field.offset) == 0,
        UInt64 | Fixed64 => *msg.ref_at::<u64>(field.offset) == 0,
        Double => *msg.ref_at::<f64>(field.offset) == 0.0,
        String | Bytes => msg.ref_at::<StringView>(field.offset).as_slice().is_empty(),
        Group | Message => unreachable!("submessage presence is pointer-checked separately"),
    }
}

fn field_is_present_scalar(msg: &Message, field: &MiniTableField) -> bool {
    match field.presence() {
        Presence::Hasbit(idx) => msg.has_bit(idx),
        Presence::OneofCase(off) => msg.oneof_case(off) == field.number,
        Presence::None => !is_default_scalar(msg, field),
    }
}

fn write_scalar_field(buf: &mut Vec<u8>, msg: &Message, field: &MiniTableField) {
    if !field_is_present_scalar(msg, field) {
        return;
    }
    let bits = scalar_bits_from_message(msg, field);
    write_scalar_bits(buf, field.number, expected_wire_type(field.field_type), bits);
}

#[allow(clippy::too_many_arguments)]
fn write_scalar_submessage_field(
    buf: &mut Vec<u8>,
    msg: &Message,
    field: &MiniTableField,
    mt: &'static MiniTable,
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return Ok(());
    }
    let tp = unsafe { &*(ptr as *const TaggedMessagePtr) };
    let inner = tp.message();
    let sub_mt = mt.sub_message(field);
    encode_submessage_value(buf, field.number, field.field_type, &inner, sub_mt, depth, options, extreg)
}

#[allow(clippy::too_many_arguments)]
fn write_array_submessage_field(
    buf: &mut Vec<u8>,
    msg: &Message,
    field: &MiniTableField,
    mt: &'static MiniTable,
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return Ok(());
    }
    let storage = unsafe { &*(ptr as *const RepeatedStorage) };
    let RepeatedStorage::Message(arr) = storage else {
        return Ok(());
    };
    let sub_mt = mt.sub_message(field);
    for tp in arr.as_slice() {
        let inner = tp.message();
        encode_submessage_value(buf, field.number, field.field_type, &inner, sub_mt, depth, options, extreg)?;
    }
    Ok(())
}

/// Encodes one submessage or group body and writes its tag(s), handling the
/// length-delimited vs. start/end-group shapes.
#[allow(clippy::too_many_arguments)]
fn encode_submessage_value(
    buf: &mut Vec<u8>,
    field_number: u32,
    field_type: FieldType,
    inner: &Message,
    inner_mt: &'static MiniTable,
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    *depth += 1;
    if *depth > options.max_depth() {
        return Err(EncodeStatus::MaxDepthExceeded);
    }
    let body = encode_fields(inner, inner_mt, extreg, options, depth)?;
    *depth -= 1;

    if field_type == FieldType::Group {
        wire::write_varint(buf, ((field_number as u64) << 3) | (WireType::StartGroup as u64));
        buf.extend_from_slice(&body);
        wire::write_varint(buf, ((field_number as u64) << 3) | (WireType::EndGroup as u64));
    } else {
        wire::write_varint(buf, ((field_number as u64) << 3) | (WireType::Delimited as u64));
        wire::write_varint(buf, body.len() as u64);
        buf.extend_from_slice(&body);
    }
    Ok(())
}

/// One repeated scalar field element's bits, reading the typed storage array
/// by `field_type` (the variant `new_repeated_storage` would have chosen for
/// it, so the match always lands on the right arm).
fn array_element_bits(storage: &RepeatedStorage, field_type: FieldType, i: usize) -> ScalarBits<'_> {
    use FieldType::*;
    match field_type {
        Bool => {
            let RepeatedStorage::Bool(a) = storage else { unreachable!() };
            ScalarBits::Varint(a.as_slice()[i] as u64)
        }
        Int32 | OpenEnum | ClosedEnum => {
            let RepeatedStorage::I32(a) = storage else { unreachable!() };
            ScalarBits::Varint(a.as_slice()[i] as i64 as u64)
        }
        SInt32 => {
            let RepeatedStorage::I32(a) = storage else { unreachable!() };
            ScalarBits::Varint(wire::zigzag_encode32(a.as_slice()[i]) as u64)
        }
        SFixed32 => {
            let RepeatedStorage::I32(a) = storage else { unreachable!() };
            ScalarBits::Fixed32(a.as_slice()[i] as u32)
        }
        UInt32 => {
            let RepeatedStorage::U32(a) = storage else { unreachable!() };
            ScalarBits::Varint(a.as_slice()[i] as u64)
        }
        Fixed32 => {
            let RepeatedStorage::U32(a) = storage else { unreachable!() };
            ScalarBits::Fixed32(a.as_slice()[i])
        }
        Float => {
            let RepeatedStorage::F32(a) = storage else { unreachable!() };
            ScalarBits::Fixed32(a.as_slice()[i].to_bits())
        }
        Int64 => {
            let RepeatedStorage::I64(a) = storage else { unreachable!() };
            ScalarBits::Varint(a.as_slice()[i] as u64)
        }
        SInt64 => {
            let RepeatedStorage::I64(a) = storage else { unreachable!() };
            ScalarBits::Varint(wire::zigzag_encode64(a.as_slice()[i]))
        }
        SFixed64 => {
            let RepeatedStorage::I64(a) = storage else { unreachable!() };
            ScalarBits::Fixed64(a.as_slice()[i] as u64)
        }
        UInt64 => {
            let RepeatedStorage::U64(a) = storage else { unreachable!() };
            ScalarBits::Varint(a.as_slice()[i])
        }
        Fixed64 => {
            let RepeatedStorage::U64(a) = storage else { unreachable!() };
            ScalarBits::Fixed64(a.as_slice()[i])
        }
        Double => {
            let RepeatedStorage::F64(a) = storage else { unreachable!() };
            ScalarBits::Fixed64(a.as_slice()[i].to_bits())
        }
        String | Bytes => {
            let RepeatedStorage::StringOrBytes(a) = storage else { unreachable!() };
            ScalarBits::Bytes(a.as_slice()[i].as_slice())
        }
        Group | Message => unreachable!("submessage arrays are encoded separately"),
    }
}

/// Writes a non-submessage repeated field: packed (one tag, one
/// length-delimited body of concatenated values) when the schema marks it
/// packed and the type is packable, unpacked (one tag per value) otherwise.
/// `string`/`bytes` fields are never packable regardless of the flag.
fn write_repeated_scalar(buf: &mut Vec<u8>, field: &MiniTableField, storage: &RepeatedStorage) {
    let len = storage.len();
    if len == 0 {
        return;
    }
    let ft = field.field_type;
    let packable = !matches!(ft, FieldType::String | FieldType::Bytes);
    if packable && field.is_packed() {
        let mut body = Vec::new();
        for i in 0..len {
            match array_element_bits(storage, ft, i) {
                ScalarBits::Varint(v) => wire::write_varint(&mut body, v),
                ScalarBits::Fixed32(v) => body.extend_from_slice(&v.to_le_bytes()),
                ScalarBits::Fixed64(v) => body.extend_from_slice(&v.to_le_bytes()),
                ScalarBits::Bytes(_) => unreachable!("strings/bytes are never packed"),
            }
        }
        wire::write_varint(buf, ((field.number as u64) << 3) | (WireType::Delimited as u64));
        wire::write_varint(buf, body.len() as u64);
        buf.extend_from_slice(&body);
    } else {
        let wt = expected_wire_type(ft);
        for i in 0..len {
            write_scalar_bits(buf, field.number, wt, array_element_bits(storage, ft, i));
        }
    }
}

fn write_array_field(buf: &mut Vec<u8>, field: &MiniTableField, msg: &Message) {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return;
    }
    let storage = unsafe { &*(ptr as *const RepeatedStorage) };
    write_repeated_scalar(buf, field, storage);
}

#[allow(clippy::too_many_arguments)]
fn write_map_field(
    buf: &mut Vec<u8>,
    msg: &Message,
    field: &MiniTableField,
    mt: &'static MiniTable,
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return Ok(());
    }
    let map = unsafe { &*(ptr as *const MapField) };
    if map.is_empty() {
        return Ok(());
    }
    let entry_mt = mt.sub_message(field);
    let key_field = &entry_mt.fields[0];
    let value_field = &entry_mt.fields[1];

    let entries: Vec<(&MapKey, &[u8])> = if options.deterministic() {
        let mut v: Vec<(&MapKey, &[u8])> = map.iter().collect();
        v.sort_by(|a, b| a.0.cmp(b.0));
        v
    } else {
        map.iter().collect()
    };

    for (key, value_bytes) in entries {
        let mut entry_buf = Vec::new();
        write_scalar_bits(
            &mut entry_buf,
            key_field.number,
            expected_wire_type(key_field.field_type),
            scalar_bits_from_raw(key_field.field_type, &key.0),
        );
        if value_field.field_type.is_submessage() {
            let addr = usize::from_le_bytes(value_bytes[..8].try_into().unwrap());
            let tp = unsafe { &*(addr as *const TaggedMessagePtr) };
            let inner = tp.message();
            let value_mt = entry_mt.sub_message(value_field);
            encode_submessage_value(
                &mut entry_buf,
                value_field.number,
                value_field.field_type,
                &inner,
                value_mt,
                depth,
                options,
                extreg,
            )?;
        } else {
            write_scalar_bits(
                &mut entry_buf,
                value_field.number,
                expected_wire_type(value_field.field_type),
                scalar_bits_from_raw(value_field.field_type, value_bytes),
            );
        }
        wire::write_varint(buf, ((field.number as u64) << 3) | (WireType::Delimited as u64));
        wire::write_varint(buf, entry_buf.len() as u64);
        buf.extend_from_slice(&entry_buf);
    }
    Ok(())
}

/// Writes every extension present on `msg`, in field-number order under
/// `Deterministic` and otherwise in the order they were first decoded/set.
fn write_extensions(
    buf: &mut Vec<u8>,
    msg: &Message,
    mt: &'static MiniTable,
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let list = msg.internal().extensions.take();
    let result = (|| -> Result<(), EncodeStatus> {
        let mut entries: Vec<&ExtensionSlot> = list.iter().collect();
        if options.deterministic() {
            entries.sort_by_key(|s| s.extension.field.number);
        }
        for slot in entries {
            let ext = slot.extension;
            if mt.ext == Extendability::IsMessageSet {
                write_message_set_item(buf, ext, &slot.value, depth, options, extreg)?;
            } else {
                write_extension_slot(buf, ext, &slot.value, depth, options, extreg)?;
            }
        }
        Ok(())
    })();
    msg.internal().extensions.set(list);
    result
}

fn write_extension_slot(
    buf: &mut Vec<u8>,
    ext: &'static MiniTableExtension,
    slot_value: &[u8; 16],
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let field = &ext.field;
    if field.field_type.is_submessage() {
        let addr = usize::from_le_bytes(slot_value[..8].try_into().unwrap());
        let tp = unsafe { &*(addr as *const TaggedMessagePtr) };
        let inner = tp.message();
        let sub_mt = ext_sub_message(ext);
        encode_submessage_value(buf, field.number, field.field_type, &inner, sub_mt, depth, options, extreg)
    } else if field.mode == Mode::Array {
        let addr = usize::from_le_bytes(slot_value[..8].try_into().unwrap());
        let storage = unsafe { &*(addr as *const RepeatedStorage) };
        write_repeated_scalar(buf, field, storage);
        Ok(())
    } else {
        let bits = scalar_bits_from_ext_slot(field.field_type, slot_value);
        write_scalar_bits(buf, field.number, expected_wire_type(field.field_type), bits);
        Ok(())
    }
}

/// Re-wraps a message-typed extension as a MessageSet item group (field 1:
/// `{type_id: 2, message: 3}`), the mirror of `decode::decode_message_set_item`.
fn write_message_set_item(
    buf: &mut Vec<u8>,
    ext: &'static MiniTableExtension,
    slot_value: &[u8; 16],
    depth: &mut u32,
    options: EncodeOptions,
    extreg: Option<&ExtensionRegistry>,
) -> Result<(), EncodeStatus> {
    let addr = usize::from_le_bytes(slot_value[..8].try_into().unwrap());
    let tp = unsafe { &*(addr as *const TaggedMessagePtr) };
    let inner = tp.message();
    let sub_mt = ext_sub_message(ext);

    *depth += 1;
    if *depth > options.max_depth() {
        return Err(EncodeStatus::MaxDepthExceeded);
    }
    let body = encode_fields(&inner, sub_mt, extreg, options, depth)?;
    *depth -= 1;

    wire::write_varint(buf, ((MESSAGE_SET_ITEM_GROUP as u64) << 3) | (WireType::StartGroup as u64));
    wire::write_varint(buf, ((MESSAGE_SET_TYPE_ID as u64) << 3) | (WireType::Varint as u64));
    wire::write_varint(buf, ext.field.number as u64);
    wire::write_varint(buf, ((MESSAGE_SET_MESSAGE as u64) << 3) | (WireType::Delimited as u64));
    wire::write_varint(buf, body.len() as u64);
    buf.extend_from_slice(&body);
    wire::write_varint(buf, ((MESSAGE_SET_ITEM_GROUP as u64) << 3) | (WireType::EndGroup as u64));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::decode::decode_message;
    use crate::minitable::{FieldFlags, Rep};
    use crate::status::DecodeOptions;

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
    fn encodes_scalar_int32_with_presence() {
        let mut f1 = field(1, 8, Mode::Scalar, Rep::FourByte, FieldType::Int32);
        f1.set_presence(Presence::Hasbit(1));
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

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        *msg.ref_mut::<i32>(8) = -5;
        msg.set_has_bit(1);

        let out = encode_message(&msg, mt, None, EncodeOptions::new()).unwrap();
        let mut expected = Vec::new();
        wire::write_varint(&mut expected, (1 << 3) | 0);
        wire::write_varint(&mut expected, (-5i64) as u64);
        assert_eq!(out, expected);
    }

    #[test]
    fn implicit_presence_scalar_skips_default_value() {
        let f1 = field(1, 8, Mode::Scalar, Rep::FourByte, FieldType::Int32);
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

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let out = encode_message(&msg, mt, None, EncodeOptions::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn missing_required_field_refuses_to_encode() {
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
        let status = encode_message(&msg, mt, None, EncodeOptions::new().with_check_required());
        assert_eq!(status, Err(EncodeStatus::MissingRequired));
    }

    #[test]
    fn round_trips_packed_repeated_int32() {
        let f1 = field(1, 8, Mode::Array, Rep::FourByte, FieldType::Int32);
        let mut f1 = f1;
        f1.flags.insert(FieldFlags::IS_PACKED);
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
        wire::write_varint(&mut packed, 7);
        wire::write_varint(&mut packed, 300);
        let mut input = Vec::new();
        wire::write_varint(&mut input, (1 << 3) | 2);
        wire::write_varint(&mut input, packed.len() as u64);
        input.extend_from_slice(&packed);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&input, &msg, mt, None, DecodeOptions::new(), &arena);
        assert!(status.is_ok());

        let out = encode_message(&msg, mt, None, EncodeOptions::new()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn round_trips_unknown_bytes() {
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

        let mut input = Vec::new();
        wire::write_varint(&mut input, (9 << 3) | 0);
        wire::write_varint(&mut input, 7);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 8).unwrap();
        let status = decode_message(&input, &msg, mt, None, DecodeOptions::new(), &arena);
        assert!(status.is_ok());

        let out = encode_message(&msg, mt, None, EncodeOptions::new()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn skip_unknown_drops_unrecognized_bytes() {
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

        let mut input = Vec::new();
        wire::write_varint(&mut input, (9 << 3) | 0);
        wire::write_varint(&mut input, 7);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 8).unwrap();
        decode_message(&input, &msg, mt, None, DecodeOptions::new(), &arena);

        let out = encode_message(&msg, mt, None, EncodeOptions::new().with_skip_unknown()).unwrap();
        assert!(out.is_empty());
    }
}
