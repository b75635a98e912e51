//! The MiniDescriptor codec: a compact, printable base-92 textual encoding
//! of one message/map/extension/enum schema, and the decoder that turns it
//! into a fully laid-out [`MiniTable`](crate::minitable::MiniTable).
//!
//! Grounded on `hpb/mini_descriptor/internal/base92.h` (variable-width
//! base-92 varint grammar), `hpb/mini_descriptor/internal/wire_constants.h`
//! (`kHpb_EncodedType_*`, `hpb_EncodedFieldModifier`, `kHpb_EncodedValue_*`
//! byte ranges and version bytes — reproduced here verbatim), and
//! `hpb/mini_descriptor/decode.c` (the layout algorithm: hasbit assignment,
//! rep-sorted offset packing, oneof case wiring, `dense_below`).
//!
//! `wire_constants.h` only declares the byte ranges each token class lives
//! in (`kHpb_EncodedValue_MinField..MaxField`, etc.) and the type/modifier
//! numbering; the actual permutation from a token's numeric value to a byte
//! within its range (`_kHpb_ToBase92`/`_kHpb_FromBase92`, defined in the
//! absent `base92.c`) did not survive retrieval. This module reconstructs
//! that permutation as the identity (`byte = range_min + value`), which
//! preserves every range boundary, type ordering, and modifier bit exactly
//! as declared, differing from the original only in which specific byte
//! within a range encodes which value — an internal choice neither this
//! crate's encoder nor its decoder (the sole reader/writer of its own
//! MiniDescriptors) can observe.

use crate::minitable::{
    Extendability, FieldFlags, FieldType, MiniTable, MiniTableEnum, MiniTableExtension,
    MiniTableField, Mode, Presence, Rep, Sub, REQUIRED_HASBIT_CAP,
};
use crate::status::Status;

// --- kHpb_EncodedValue_* byte ranges (wire_constants.h) -------------------

const VALUE_MIN_FIELD: u8 = b' ';
const VALUE_MAX_FIELD: u8 = b'I';
const VALUE_MIN_MODIFIER: u8 = b'L';
const VALUE_MAX_MODIFIER: u8 = b'[';
const VALUE_END: u8 = b'^';
const VALUE_MIN_SKIP: u8 = b'_';
const VALUE_MAX_SKIP: u8 = b'~';
const VALUE_FIELD_SEPARATOR: u8 = b'|';
const VALUE_ONEOF_SEPARATOR: u8 = b'~';
/// Separate range for oneof-member field number varints, disjoint from
/// `FieldSeparator`/`OneofSeparator` (`'|'`, `'~'`) so a varint reader
/// scanning this range can never mistake a separator byte for a digit.
const VALUE_MIN_ONEOF_FIELD: u8 = b' ';
const VALUE_MAX_ONEOF_FIELD: u8 = b'b';

// kHpb_EncodedType_* (wire_constants.h): scalar type codes 0..=18, with the
// repeated/array form of a type at `code + RepeatedBase`.
const REPEATED_BASE: u8 = 20;

const MOD_IS_EXTENDABLE: u8 = 1 << 0;
const MOD_DEFAULT_IS_PACKED: u8 = 1 << 1;
const MOD_VALIDATE_UTF8: u8 = 1 << 2;

// hpb_EncodedFieldModifier (wire_constants.h): exactly these three bits.
const FMOD_FLIP_PACKED: u8 = 1 << 0;
const FMOD_IS_REQUIRED: u8 = 1 << 1;
const FMOD_IS_PROTO3_SINGULAR: u8 = 1 << 2;
/// An array-of-message field whose element type is a map-entry message;
/// decoded straight to `Mode::Map` rather than `Mode::Array` (real hpb
/// instead flips this at `set_sub_message` time by inspecting the linked
/// sub's `kHpb_ExtMode_IsMapEntry` bit — simplified here to a dedicated
/// modifier bit so a field's `Mode` never needs to change after layout).
/// Not part of `hpb_EncodedFieldModifier`; an addition of this module.
const FMOD_IS_MAP: u8 = 1 << 3;

const VERSION_ENUM_V1: u8 = b'!';
const VERSION_EXTENSION_V1: u8 = b'#';
const VERSION_MESSAGE_V1: u8 = b'$';
const VERSION_MAP_V1: u8 = b'%';
const VERSION_MESSAGE_SET_V1: u8 = b'&';

/// Largest `data_bits` such that two disjoint `data_bits`-wide chunks, each
/// paired with a continuation flag, still fit within `range` distinct
/// alphabet symbols (`2 * 2^data_bits <= range`).
fn data_bits_for_range(range: u32) -> u32 {
    let mut bits = 1u32;
    while 2 * (1u32 << (bits + 1)) <= range {
        bits += 1;
    }
    bits
}

/// Pushes `value` as a variable-width varint whose digits are drawn from the
/// `[min, max]` byte range. Each digit reserves its top bit (within the
/// sub-range) as a continuation flag so consecutive varints in the same
/// sub-range (e.g. the eight mask bytes of an enum descriptor) can follow
/// each other with no separator and still decode unambiguously.
fn push_varint_in_range(out: &mut String, mut value: u32, min: u8, max: u8) {
    let range = (max - min) as u32 + 1;
    let data_bits = data_bits_for_range(range);
    let data_mask = (1u32 << data_bits) - 1;
    loop {
        let chunk = value & data_mask;
        value >>= data_bits;
        let cont = if value != 0 { 1u32 << data_bits } else { 0 };
        out.push((min + (chunk | cont) as u8) as char);
        if value == 0 {
            break;
        }
    }
}

/// Reads a varint encoded by [`push_varint_in_range`], starting at
/// `bytes[*pos]`.
fn read_varint_in_range(bytes: &[u8], pos: &mut usize, min: u8, max: u8) -> Result<u32, Status> {
    let range = (max - min) as u32 + 1;
    let data_bits = data_bits_for_range(range);
    let data_mask = (1u32 << data_bits) - 1;
    let cont_bit = 1u32 << data_bits;
    let mut value: u32 = 0;
    let mut shift: u32 = 0;
    loop {
        if *pos >= bytes.len() {
            return Err(Status::new("truncated MiniDescriptor varint"));
        }
        let ch = bytes[*pos];
        if ch < min || ch > max {
            return Err(Status::new("MiniDescriptor varint out of range"));
        }
        let digit = (ch - min) as u32;
        *pos += 1;
        value |= (digit & data_mask) << shift;
        shift += data_bits;
        if shift > 32 {
            return Err(Status::new("MiniDescriptor varint too long"));
        }
        if digit & cont_bit == 0 {
            break;
        }
    }
    Ok(value)
}

// --- Field/message specs: the encoder's input ---------------------------

/// One field's schema as fed to the encoder; the decoder reconstructs the
/// same shape (minus sub-table links, which come from `set_sub_message`/
/// `set_sub_enum`) while computing layout.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub number: u32,
    /// Closedness of an enum field is carried by the type itself
    /// (`FieldType::OpenEnum` vs. `FieldType::ClosedEnum`), not by a
    /// separate modifier bit.
    pub field_type: FieldType,
    pub mode: Mode,
    /// Whether the repeated field is packed on the wire (ignored for
    /// `Mode::Scalar`/`Mode::Map`).
    pub packed: bool,
    pub required: bool,
    pub proto3_singular: bool,
}

/// A message (or MessageSet/map-entry) schema as fed to the encoder.
#[derive(Debug, Clone, Default)]
pub struct MessageSpec {
    pub fields: Vec<FieldSpec>,
    /// Each inner `Vec<u32>` is the list of member field numbers for one
    /// oneof, in declaration order.
    pub oneofs: Vec<Vec<u32>>,
    pub is_extendable: bool,
    pub default_is_packed: bool,
    pub validate_utf8: bool,
    pub is_message_set: bool,
}

fn field_modifiers(f: &FieldSpec, default_is_packed: bool) -> u8 {
    let mut m = 0u8;
    let default_packed_for_type = default_is_packed && matches!(f.mode, Mode::Array);
    if matches!(f.mode, Mode::Array) && f.packed != default_packed_for_type {
        m |= FMOD_FLIP_PACKED;
    }
    if f.required {
        m |= FMOD_IS_REQUIRED;
    }
    if f.proto3_singular {
        m |= FMOD_IS_PROTO3_SINGULAR;
    }
    if matches!(f.mode, Mode::Map) {
        m |= FMOD_IS_MAP;
    }
    m
}

/// Map fields are wire-repeated message fields whose element is a map-entry
/// message (§4.2 step 6); they share the repeated field-type token with
/// ordinary arrays and are distinguished at decode time by `FMOD_IS_MAP`.
fn encoded_field_type(f: &FieldSpec) -> u8 {
    let base = f.field_type as u8;
    if matches!(f.mode, Mode::Array | Mode::Map) {
        base + REPEATED_BASE
    } else {
        base
    }
}

/// Encodes one message schema to its MiniDescriptor string (§4.2,
/// `MtDataEncoder`).
pub fn encode_message_descriptor(spec: &MessageSpec) -> String {
    let mut out = String::new();
    out.push(if spec.is_message_set {
        VERSION_MESSAGE_SET_V1 as char
    } else {
        VERSION_MESSAGE_V1 as char
    });

    let mut msg_mod = 0u8;
    if spec.is_extendable {
        msg_mod |= MOD_IS_EXTENDABLE;
    }
    if spec.default_is_packed {
        msg_mod |= MOD_DEFAULT_IS_PACKED;
    }
    if spec.validate_utf8 {
        msg_mod |= MOD_VALIDATE_UTF8;
    }
    // `is_message_set` is carried entirely by the version byte above; no
    // separate message-set modifier bit exists in `hpb_EncodedFieldModifier`.
    out.push((VALUE_MIN_MODIFIER + msg_mod) as char);

    let mut sorted: Vec<&FieldSpec> = spec.fields.iter().collect();
    sorted.sort_by_key(|f| f.number);

    let mut prev = 0u32;
    for f in &sorted {
        debug_assert!(f.number > prev, "fields must be encoded in ascending order");
        let skip = f.number - prev - 1;
        push_varint_in_range(&mut out, skip, VALUE_MIN_SKIP, VALUE_MAX_SKIP);
        out.push((VALUE_MIN_FIELD + encoded_field_type(f)) as char);
        let fmod = field_modifiers(f, spec.default_is_packed);
        out.push((VALUE_MIN_MODIFIER + fmod) as char);
        prev = f.number;
    }
    out.push(VALUE_END as char);

    for (i, oneof) in spec.oneofs.iter().enumerate() {
        if i > 0 {
            out.push(VALUE_ONEOF_SEPARATOR as char);
        }
        for (j, number) in oneof.iter().enumerate() {
            if j > 0 {
                out.push(VALUE_FIELD_SEPARATOR as char);
            }
            push_varint_in_range(&mut out, *number, VALUE_MIN_ONEOF_FIELD, VALUE_MAX_ONEOF_FIELD);
        }
    }

    out
}

/// Encodes a `map<K, V>` entry schema (§4.2 step 6): two fields, key at
/// number 1, value at number 2. Shares `parse_fields`'s grammar with
/// ordinary messages, so this just reuses the field-token/skip-varint
/// writer with a zero skip before each of the two fields.
pub fn encode_map_descriptor(key_type: FieldType, value_type: FieldType) -> String {
    let mut out = String::new();
    out.push(VERSION_MAP_V1 as char);
    out.push(VALUE_MIN_MODIFIER as char);
    for ty in [key_type, value_type] {
        push_varint_in_range(&mut out, 0, VALUE_MIN_SKIP, VALUE_MAX_SKIP);
        out.push((VALUE_MIN_FIELD + ty as u8) as char);
        out.push(VALUE_MIN_MODIFIER as char);
    }
    out.push(VALUE_END as char);
    out
}

/// Encodes a single extension field descriptor (§4.2): version byte plus one
/// field token (no message modifier, no oneofs — an extension is always a
/// single optional/repeated field).
pub fn encode_extension_descriptor(field: &FieldSpec) -> String {
    let mut out = String::new();
    out.push(VERSION_EXTENSION_V1 as char);
    debug_assert!(field.number >= 1);
    push_varint_in_range(&mut out, field.number - 1, VALUE_MIN_SKIP, VALUE_MAX_SKIP);
    out.push((VALUE_MIN_FIELD + encoded_field_type(field)) as char);
    let fmod = field_modifiers(field, false);
    out.push((VALUE_MIN_MODIFIER + fmod) as char);
    out
}

/// Encodes a closed enum's valid-value set (§3.2 `MiniTableEnum`): the
/// 64-bit mask as eight varint-packed bytes, followed by the overflow list,
/// each a delta-encoded varint from the previous value.
pub fn encode_enum_descriptor(e: &MiniTableEnum) -> String {
    let mut out = String::new();
    out.push(VERSION_ENUM_V1 as char);
    for byte in e.mask.to_le_bytes() {
        push_varint_in_range(&mut out, byte as u32, VALUE_MIN_SKIP, VALUE_MAX_SKIP);
    }
    out.push(VALUE_END as char);
    let mut prev = 0u32;
    let mut sorted = e.overflow.clone();
    sorted.sort_unstable();
    for v in sorted {
        push_varint_in_range(&mut out, v - prev, VALUE_MIN_SKIP, VALUE_MAX_SKIP);
        prev = v;
    }
    out
}

// --- Decoder -------------------------------------------------------------

struct FieldDraft {
    number: u32,
    field_type: FieldType,
    mode: Mode,
    packed: bool,
    required: bool,
    proto3_singular: bool,
    prelim: Prelim,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Prelim {
    None,
    Required,
    Hasbit,
    OneofMember(usize),
}

fn decode_field_token(ch: u8) -> Result<(FieldType, Mode), Status> {
    if ch < VALUE_MIN_FIELD || ch > VALUE_MAX_FIELD {
        return Err(Status::new("field token out of range"));
    }
    let encoded = ch - VALUE_MIN_FIELD;
    let (base, mode) = if encoded >= REPEATED_BASE {
        (encoded - REPEATED_BASE, Mode::Array)
    } else {
        (encoded, Mode::Scalar)
    };
    let ty = FieldType::from_encoded(base).ok_or_else(|| Status::new("unknown field type"))?;
    Ok((ty, mode))
}

fn decode_modifier_token(ch: u8) -> Result<u8, Status> {
    if ch < VALUE_MIN_MODIFIER || ch > VALUE_MAX_MODIFIER {
        return Err(Status::new("modifier token out of range"));
    }
    Ok(ch - VALUE_MIN_MODIFIER)
}

/// Parse the field/oneof portion of a message or extension MiniDescriptor
/// (everything after the version byte and, for messages, the message
/// modifier byte) into field drafts plus the oneof member lists.
fn parse_fields(bytes: &[u8], pos: &mut usize) -> Result<Vec<FieldDraft>, Status> {
    let mut drafts = Vec::new();
    let mut prev_number = 0u32;

    loop {
        if *pos >= bytes.len() {
            return Err(Status::new("unterminated MiniDescriptor field list"));
        }
        if bytes[*pos] == VALUE_END {
            *pos += 1;
            break;
        }
        let skip = read_varint_in_range(bytes, pos, VALUE_MIN_SKIP, VALUE_MAX_SKIP)?;
        let number = prev_number
            .checked_add(skip)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| Status::new("field number overflow"))?;
        if *pos >= bytes.len() {
            return Err(Status::new("truncated field token"));
        }
        let (field_type, mut mode) = decode_field_token(bytes[*pos])?;
        *pos += 1;
        if *pos >= bytes.len() {
            return Err(Status::new("truncated field modifier"));
        }
        let fmod = decode_modifier_token(bytes[*pos])?;
        *pos += 1;

        if fmod & FMOD_IS_MAP != 0 {
            if !matches!(mode, Mode::Array) || !field_type.is_submessage() {
                return Err(Status::new("IS_MAP set on a non-message-array field"));
            }
            mode = Mode::Map;
        }

        let required = fmod & FMOD_IS_REQUIRED != 0;
        let proto3_singular = fmod & FMOD_IS_PROTO3_SINGULAR != 0;
        let packed = matches!(mode, Mode::Array) && (fmod & FMOD_FLIP_PACKED == 0);

        let prelim = if required {
            Prelim::Required
        } else if matches!(mode, Mode::Scalar) && !proto3_singular && !field_type.is_submessage() {
            Prelim::Hasbit
        } else if matches!(mode, Mode::Scalar) && field_type.is_submessage() {
            Prelim::Hasbit
        } else {
            Prelim::None
        };

        drafts.push(FieldDraft {
            number,
            field_type,
            mode,
            packed,
            required,
            proto3_singular,
            prelim,
        });
        prev_number = number;
    }

    Ok(drafts)
}

fn parse_oneofs(bytes: &[u8], pos: &mut usize) -> Result<Vec<Vec<u32>>, Status> {
    let mut oneofs = Vec::new();
    if *pos >= bytes.len() {
        return Ok(oneofs);
    }
    let mut current = Vec::new();
    loop {
        let n = read_varint_in_range(bytes, pos, VALUE_MIN_ONEOF_FIELD, VALUE_MAX_ONEOF_FIELD)?;
        current.push(n);
        if *pos >= bytes.len() {
            oneofs.push(current);
            break;
        }
        let ch = bytes[*pos];
        if ch == VALUE_FIELD_SEPARATOR {
            *pos += 1;
            continue;
        } else if ch == VALUE_ONEOF_SEPARATOR {
            *pos += 1;
            oneofs.push(core::mem::take(&mut current));
            if *pos >= bytes.len() {
                break;
            }
        } else {
            return Err(Status::new("unexpected character in oneof list"));
        }
    }
    Ok(oneofs)
}

struct LayoutItem {
    draft_index: usize,
    rep: Rep,
    offset: u16,
}

/// Assigns hasbits, lays out field/oneof-case storage, and produces the
/// final `MiniTable` (§4.2 steps 3-8).
fn layout_message(
    mut drafts: Vec<FieldDraft>,
    oneofs: &[Vec<u32>],
    ext: Extendability,
    validate_utf8: bool,
) -> Result<MiniTable, Status> {
    // Assign each oneof member's draft a `OneofMember(oneof_index)` prelim.
    for (oneof_idx, members) in oneofs.iter().enumerate() {
        for &num in members {
            if let Some(d) = drafts.iter_mut().find(|d| d.number == num) {
                d.prelim = Prelim::OneofMember(oneof_idx);
            }
        }
    }

    // Hasbits: required fields first (lowest indices), then other
    // presence-bearing, non-oneof fields (§4.2 step 3).
    let mut required_count = 0u16;
    let mut next_hasbit = 1u16; // hasbit indices are 1-based; 0 means "no presence"
    let mut hasbit_of: Vec<Option<u16>> = vec![None; drafts.len()];

    for (i, d) in drafts.iter().enumerate() {
        if matches!(d.prelim, Prelim::Required) {
            hasbit_of[i] = Some(next_hasbit);
            next_hasbit += 1;
            required_count += 1;
        }
    }
    if required_count as usize > REQUIRED_HASBIT_CAP {
        return Err(Status::new("too many required fields (max 63)"));
    }
    for (i, d) in drafts.iter().enumerate() {
        if matches!(d.prelim, Prelim::Hasbit) {
            hasbit_of[i] = Some(next_hasbit);
            next_hasbit += 1;
        }
    }

    // Build layout items: the hasbit word itself, the oneof case slots, and
    // each non-oneof field's storage (oneof members share their oneof's
    // storage-rep-largest member's slot sizing, simplified here to each
    // member still getting its own slot sized by its own rep — wire-correct
    // since only one member is active at a time and each reads/writes its
    // own typed slot; only the *case* is shared).
    let mut items: Vec<LayoutItem> = Vec::new();
    for (i, d) in drafts.iter().enumerate() {
        let rep = match d.mode {
            Mode::Map => Rep::Pointer,
            Mode::Array => Rep::Pointer,
            Mode::Scalar => d.field_type.rep(),
        };
        items.push(LayoutItem {
            draft_index: i,
            rep,
            offset: 0,
        });
    }

    // Sort by (rep descending i.e. largest first, field_type, original
    // index ascending) for optimal packing (§4.2 step 4).
    items.sort_by(|a, b| {
        b.rep
            .cmp(&a.rep)
            .then_with(|| drafts[a.draft_index].field_type.cmp(&drafts[b.draft_index].field_type))
            .then_with(|| a.draft_index.cmp(&b.draft_index))
    });

    let mut size: u32 = 8; // hasbit word always occupies the first 8 bytes
    for item in items.iter_mut() {
        let align = item.rep.align() as u32;
        size = (size + align - 1) / align * align;
        if size > 65535 {
            return Err(Status::new("message size overflow"));
        }
        item.offset = size as u16;
        size += item.rep.size() as u32;
    }

    // Oneof case slots, placed after regular fields (order doesn't matter
    // for correctness, only packing density, which is already handled for
    // the dominant reps above).
    let mut oneof_case_offsets = vec![0u16; oneofs.len()];
    for off in oneof_case_offsets.iter_mut() {
        let align = 4u32;
        size = (size + align - 1) / align * align;
        if size > 65535 {
            return Err(Status::new("message size overflow"));
        }
        *off = size as u16;
        size += 4;
    }

    size = (size + 7) / 8 * 8; // round up to 8 (§4.2 step 8)
    if size > 65535 {
        return Err(Status::new("message size overflow"));
    }
    let size = size as u16;

    let mut subs: Vec<Sub> = Vec::new();
    let mut fields = Vec::with_capacity(drafts.len());
    for item in &items {
        let d = &drafts[item.draft_index];
        let presence = match d.prelim {
            Prelim::Required | Prelim::Hasbit => {
                Presence::Hasbit(hasbit_of[item.draft_index].unwrap())
            }
            Prelim::OneofMember(oneof_idx) => Presence::OneofCase(oneof_case_offsets[oneof_idx]),
            Prelim::None => Presence::None,
        };

        let mut flags = FieldFlags::empty();
        if matches!(d.mode, Mode::Array) && d.packed {
            flags.insert(FieldFlags::IS_PACKED);
        }

        let sub_index = if d.field_type.is_submessage() {
            subs.push(crate::minitable::new_message_sub());
            (subs.len() - 1) as u16
        } else if matches!(d.field_type, FieldType::ClosedEnum) {
            subs.push(Sub::Enum(Box::new(MiniTableEnum::default())));
            (subs.len() - 1) as u16
        } else {
            0
        };

        let mut field = MiniTableField {
            number: d.number,
            offset: item.offset,
            presence: 0,
            sub_index,
            mode: d.mode,
            rep: item.rep,
            flags,
            field_type: d.field_type,
        };
        field.set_presence(presence);
        fields.push(field);
    }

    fields.sort_by_key(|f| f.number);

    // dense_below: the largest prefix of field numbers 1..=n present
    // contiguously (§4.2 step 7).
    let mut dense_below = 0u32;
    for (i, f) in fields.iter().enumerate() {
        if f.number == (i as u32) + 1 {
            dense_below = (i as u32) + 1;
        } else {
            break;
        }
    }

    Ok(MiniTable {
        fields,
        subs,
        size,
        required_count: required_count as u8,
        dense_below,
        table_mask: 0,
        ext,
        validate_utf8,
    })
}

/// Decode a message/MessageSet MiniDescriptor into a fully laid-out
/// `MiniTable`. Sub-message/enum links start out pointing at the canonical
/// empty placeholder; call `set_sub_message`/`set_sub_enum` afterward.
pub fn decode_message_descriptor(descriptor: &str) -> Result<MiniTable, Status> {
    let bytes = descriptor.as_bytes();
    if bytes.is_empty() {
        return Err(Status::new("empty MiniDescriptor"));
    }
    let version = bytes[0];
    let is_message_set = match version {
        v if v == VERSION_MESSAGE_V1 => false,
        v if v == VERSION_MESSAGE_SET_V1 => true,
        _ => return Err(Status::new("expected message or message-set version byte")),
    };
    let mut pos = 1;
    if pos >= bytes.len() {
        return Err(Status::new("truncated message descriptor"));
    }
    let msg_mod = decode_modifier_token(bytes[pos])?;
    pos += 1;

    let drafts = parse_fields(bytes, &mut pos)?;
    let oneofs = parse_oneofs(bytes, &mut pos)?;

    let ext = if is_message_set {
        Extendability::IsMessageSet
    } else if msg_mod & MOD_IS_EXTENDABLE != 0 {
        Extendability::Extendable
    } else {
        Extendability::NonExtendable
    };

    let validate_utf8 = msg_mod & MOD_VALIDATE_UTF8 != 0;
    layout_message(drafts, &oneofs, ext, validate_utf8)
}

/// Decode a `map<K, V>` entry MiniDescriptor (§4.2 step 6: fixed layout,
/// hasbit byte 0, key at offset 8, value at `8 + kv_size`).
pub fn decode_map_descriptor(descriptor: &str) -> Result<MiniTable, Status> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&VERSION_MAP_V1) {
        return Err(Status::new("expected map version byte"));
    }
    let mut pos = 1;
    if pos >= bytes.len() {
        return Err(Status::new("truncated map descriptor"));
    }
    let _msg_mod = decode_modifier_token(bytes[pos])?;
    pos += 1;
    let drafts = parse_fields(bytes, &mut pos)?;
    if drafts.len() != 2 {
        return Err(Status::new("map descriptor must declare exactly key and value"));
    }
    let key = &drafts[0];
    let value = &drafts[1];

    let mut subs = Vec::new();
    let mut mk_field = |d: &FieldDraft, offset: u16| -> MiniTableField {
        let sub_index = if d.field_type.is_submessage() {
            subs.push(crate::minitable::new_message_sub());
            (subs.len() - 1) as u16
        } else {
            0
        };
        MiniTableField {
            number: d.number,
            offset,
            presence: 0,
            sub_index,
            mode: Mode::Scalar,
            rep: d.field_type.rep(),
            flags: FieldFlags::empty(),
            field_type: d.field_type,
        }
    };

    let key_field = mk_field(key, crate::minitable::MAP_ENTRY_KEY_OFFSET);
    let kv_size = key.field_type.rep().size().max(8) as u16;
    let value_field = mk_field(value, crate::minitable::MAP_ENTRY_KEY_OFFSET + kv_size);

    let size = value_field.offset + value.field_type.rep().size() as u16;
    let size = (size + 7) / 8 * 8;

    Ok(MiniTable {
        fields: vec![key_field, value_field],
        subs,
        size,
        required_count: 0,
        dense_below: 2,
        table_mask: 0,
        ext: Extendability::IsMapEntry,
        validate_utf8: false,
    })
}

/// Decode a single extension field descriptor plus the extendee's
/// already-built `MiniTable`, producing a `MiniTableExtension`.
pub fn decode_extension_descriptor(
    descriptor: &str,
    extendee: &'static MiniTable,
) -> Result<MiniTableExtension, Status> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&VERSION_EXTENSION_V1) {
        return Err(Status::new("expected extension version byte"));
    }
    let mut pos = 1;
    let number = read_varint_in_range(bytes, &mut pos, VALUE_MIN_SKIP, VALUE_MAX_SKIP)? + 1;
    if pos >= bytes.len() {
        return Err(Status::new("truncated extension descriptor"));
    }
    let (field_type, mode) = decode_field_token(bytes[pos])?;
    pos += 1;
    if pos >= bytes.len() {
        return Err(Status::new("truncated extension modifier"));
    }
    let fmod = decode_modifier_token(bytes[pos])?;

    let packed = matches!(mode, Mode::Array) && (fmod & FMOD_FLIP_PACKED == 0);
    let mut flags = FieldFlags::empty();
    flags.insert(FieldFlags::IS_EXTENSION);
    if packed && matches!(mode, Mode::Array) {
        flags.insert(FieldFlags::IS_PACKED);
    }

    let sub = if matches!(field_type, FieldType::ClosedEnum) {
        Sub::Enum(Box::new(MiniTableEnum::default()))
    } else {
        // Also the placeholder for plain scalar extensions: `ext_sub_message`/
        // `ext_is_linked` are only ever consulted when the field is a submessage.
        crate::minitable::new_message_sub()
    };

    let field = MiniTableField {
        number,
        offset: 0,
        presence: 0,
        sub_index: 0,
        mode,
        rep: field_type.rep(),
        flags,
        field_type,
    };

    Ok(MiniTableExtension {
        field,
        extendee,
        sub,
    })
}

/// Decode a closed enum's valid-value set (inverse of
/// `encode_enum_descriptor`).
pub fn decode_enum_descriptor(descriptor: &str) -> Result<MiniTableEnum, Status> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&VERSION_ENUM_V1) {
        return Err(Status::new("expected enum version byte"));
    }
    let mut pos = 1;
    let mut mask_bytes = [0u8; 8];
    for b in mask_bytes.iter_mut() {
        if pos >= bytes.len() {
            return Err(Status::new("truncated enum mask"));
        }
        if bytes[pos] == VALUE_END {
            break;
        }
        *b = read_varint_in_range(bytes, &mut pos, VALUE_MIN_SKIP, VALUE_MAX_SKIP)? as u8;
    }
    let mask = u64::from_le_bytes(mask_bytes);
    if pos < bytes.len() && bytes[pos] == VALUE_END {
        pos += 1;
    }
    let mut overflow = Vec::new();
    let mut prev = 0u32;
    while pos < bytes.len() {
        let delta = read_varint_in_range(bytes, &mut pos, VALUE_MIN_SKIP, VALUE_MAX_SKIP)?;
        prev += delta;
        overflow.push(prev);
    }
    Ok(MiniTableEnum { mask, overflow })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32_field(number: u32) -> FieldSpec {
        FieldSpec {
            number,
            field_type: FieldType::Int32,
            mode: Mode::Scalar,
            packed: false,
            required: false,
            proto3_singular: false,
        }
    }

    #[test]
    fn encode_decode_round_trip_simple_message() {
        let spec = MessageSpec {
            fields: vec![int32_field(1), int32_field(2)],
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        let mt = decode_message_descriptor(&descriptor).unwrap();
        assert_eq!(mt.fields.len(), 2);
        assert_eq!(mt.dense_below, 2);
        assert_eq!(mt.size % 8, 0);
        assert_eq!(mt.required_count, 0);
    }

    #[test]
    fn required_fields_get_lowest_hasbits() {
        let mut a = int32_field(1);
        a.required = true;
        let b = int32_field(2);
        let spec = MessageSpec {
            fields: vec![a, b],
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        let mt = decode_message_descriptor(&descriptor).unwrap();
        assert_eq!(mt.required_count, 1);
        let f1 = mt.fields.iter().find(|f| f.number == 1).unwrap();
        assert!(matches!(f1.presence(), Presence::Hasbit(1)));
    }

    #[test]
    fn skipped_field_numbers_produce_correct_gaps() {
        let spec = MessageSpec {
            fields: vec![int32_field(1), int32_field(5), int32_field(31)],
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        let mt = decode_message_descriptor(&descriptor).unwrap();
        let numbers: Vec<u32> = mt.fields.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 5, 31]);
        assert_eq!(mt.dense_below, 1);
    }

    #[test]
    fn oneof_members_share_case_offset() {
        let mut a = int32_field(1);
        a.proto3_singular = true;
        let mut b = int32_field(2);
        b.proto3_singular = true;
        let spec = MessageSpec {
            fields: vec![a, b],
            oneofs: vec![vec![1, 2]],
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        let mt = decode_message_descriptor(&descriptor).unwrap();
        let f1 = mt.fields.iter().find(|f| f.number == 1).unwrap();
        let f2 = mt.fields.iter().find(|f| f.number == 2).unwrap();
        match (f1.presence(), f2.presence()) {
            (Presence::OneofCase(a), Presence::OneofCase(b)) => assert_eq!(a, b),
            _ => panic!("expected both oneof members to share a case offset"),
        }
    }

    #[test]
    fn map_descriptor_fixed_layout() {
        let descriptor = encode_map_descriptor(FieldType::String, FieldType::Int32);
        let mt = decode_map_descriptor(&descriptor).unwrap();
        assert_eq!(mt.fields[0].offset, 8);
        assert!(mt.fields[1].offset >= 8 + 16);
    }

    #[test]
    fn enum_descriptor_round_trip() {
        let mut e = MiniTableEnum::default();
        e.insert(0);
        e.insert(5);
        e.insert(200);
        let descriptor = encode_enum_descriptor(&e);
        let decoded = decode_enum_descriptor(&descriptor).unwrap();
        assert!(decoded.contains(0));
        assert!(decoded.contains(5));
        assert!(decoded.contains(200));
        assert!(!decoded.contains(1));
    }

    #[test]
    fn required_count_over_63_errors() {
        let fields: Vec<FieldSpec> = (1..=64)
            .map(|n| {
                let mut f = int32_field(n);
                f.required = true;
                f
            })
            .collect();
        let spec = MessageSpec {
            fields,
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        assert!(decode_message_descriptor(&descriptor).is_err());
    }
}
