//! In-memory schema model: `MiniTable`, `MiniTableField`, `MiniTableEnum`,
//! `MiniTableExtension`, and the extension registry.
//!
//! A `MiniTable` is produced once per message type by
//! [`crate::mini_descriptor::decode_mini_descriptor`] and is immutable from
//! then on, except for [`MiniTable::set_sub_message`]/
//! [`MiniTable::set_sub_enum`], which link a previously-unresolved
//! sub-schema in place. That single mutation path must be a release store
//! (§4.2) so a concurrently-decoding reader observing the new sub-table also
//! observes everything it points to.
//!
//! Grounded on `hpb/mini_table/field.h`, `hpb/mini_table/message.h`,
//! `hpb/mini_table/extension_registry.h`; field/offset access idiom follows
//! an `Object::ref_at`/`has_bit` byte-offset style.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicPtr, Ordering};

// A tiny macro-free bitflags shim for a handful of bits, plain `u8` + `const`s
// rather than pulling in the `bitflags` crate for three bits.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }

            pub const fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn from_bits_truncate(bits: $repr) -> Self {
                $name(bits)
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }
    };
}

/// Wire-level field type, matching proto's `FieldDescriptorProto.Type`
/// ordering closely enough to double as the MiniDescriptor's encoded type
/// (see `hpb_EncodedType` in `wire_constants.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldType {
    Double = 0,
    Float = 1,
    Fixed32 = 2,
    Fixed64 = 3,
    SFixed32 = 4,
    SFixed64 = 5,
    Int32 = 6,
    UInt32 = 7,
    SInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    SInt64 = 11,
    OpenEnum = 12,
    Bool = 13,
    Bytes = 14,
    String = 15,
    Group = 16,
    Message = 17,
    ClosedEnum = 18,
}

impl FieldType {
    pub fn from_encoded(v: u8) -> Option<Self> {
        use FieldType::*;
        Some(match v {
            0 => Double,
            1 => Float,
            2 => Fixed32,
            3 => Fixed64,
            4 => SFixed32,
            5 => SFixed64,
            6 => Int32,
            7 => UInt32,
            8 => SInt32,
            9 => Int64,
            10 => UInt64,
            11 => SInt64,
            12 => OpenEnum,
            13 => Bool,
            14 => Bytes,
            15 => String,
            16 => Group,
            17 => Message,
            18 => ClosedEnum,
            _ => return None,
        })
    }

    /// Storage representation this type occupies when stored as a scalar.
    pub fn rep(self) -> Rep {
        use FieldType::*;
        match self {
            Bool => Rep::OneByte,
            Float | Fixed32 | SFixed32 | Int32 | UInt32 | SInt32 | OpenEnum | ClosedEnum => {
                Rep::FourByte
            }
            Double | Fixed64 | SFixed64 | Int64 | UInt64 | SInt64 => Rep::EightByte,
            String | Bytes => Rep::StringView,
            Group | Message => Rep::Pointer,
        }
    }

    pub fn is_submessage(self) -> bool {
        matches!(self, FieldType::Message | FieldType::Group)
    }

    pub fn is_enum(self) -> bool {
        matches!(self, FieldType::OpenEnum | FieldType::ClosedEnum)
    }

    /// Varint-coded scalar that zigzags (signed `sint32`/`sint64`).
    pub fn is_zigzag(self) -> bool {
        matches!(self, FieldType::SInt32 | FieldType::SInt64)
    }
}

/// In-memory storage representation of one field slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rep {
    OneByte = 0,
    FourByte = 1,
    EightByte = 2,
    StringView = 3,
    Pointer = 4,
}

impl Rep {
    pub fn size(self) -> usize {
        match self {
            Rep::OneByte => 1,
            Rep::FourByte => 4,
            Rep::EightByte => 8,
            Rep::StringView => 16,
            Rep::Pointer => 8,
        }
    }

    pub fn align(self) -> usize {
        self.size().min(8).max(1)
    }
}

/// Cardinality: scalar, repeated array, or map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Scalar,
    Array,
    Map,
}

bitflags_like! {
    /// Field flag bits, packed alongside `mode`/`rep` in `MiniTableField::mode_word`.
    pub struct FieldFlags: u8 {
        const IS_PACKED = 1 << 0;
        const IS_EXTENSION = 1 << 1;
        const IS_ALTERNATE = 1 << 2;
    }
}

/// Presence descriptor: positive values are a 1-based hasbit index, negative
/// values are `-(oneof case byte offset) - 1`, and zero means no presence
/// tracking (proto3 implicit-presence scalars).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    None,
    Hasbit(u16),
    OneofCase(u16),
}

impl Presence {
    fn encode(self) -> i16 {
        match self {
            Presence::None => 0,
            Presence::Hasbit(i) => i as i16,
            Presence::OneofCase(off) => -(off as i16) - 1,
        }
    }

    fn decode(v: i16) -> Self {
        if v == 0 {
            Presence::None
        } else if v > 0 {
            Presence::Hasbit(v as u16)
        } else {
            Presence::OneofCase((-(v + 1)) as u16)
        }
    }
}

/// One field's schema: number, payload offset, presence, sub-table index,
/// mode/rep/flags, and wire field type.
#[derive(Debug, Clone, Copy)]
pub struct MiniTableField {
    pub number: u32,
    pub offset: u16,
    pub(crate) presence: i16,
    pub sub_index: u16,
    pub mode: Mode,
    pub rep: Rep,
    pub flags: FieldFlags,
    pub field_type: FieldType,
}

impl MiniTableField {
    pub fn presence(&self) -> Presence {
        Presence::decode(self.presence)
    }

    pub fn set_presence(&mut self, p: Presence) {
        self.presence = p.encode();
    }

    pub fn is_packed(&self) -> bool {
        self.flags.contains(FieldFlags::IS_PACKED)
    }

    pub fn is_extension(&self) -> bool {
        self.flags.contains(FieldFlags::IS_EXTENSION)
    }
}

// `required_count` is capped at 63 so the required mask fits a u64 (§3.2).
pub const REQUIRED_HASBIT_CAP: usize = 63;

/// One value of a closed enum's valid set: a bitmap of the first 64 values
/// plus an overflow list for the rest.
#[derive(Debug, Clone, Default)]
pub struct MiniTableEnum {
    pub mask: u64,
    pub overflow: Vec<u32>,
}

impl MiniTableEnum {
    pub fn contains(&self, value: i32) -> bool {
        if value < 0 {
            return self.overflow.contains(&(value as u32));
        }
        let value = value as u32;
        if (value as usize) < 64 {
            self.mask & (1 << value) != 0
        } else {
            self.overflow.contains(&value)
        }
    }

    pub fn insert(&mut self, value: u32) {
        if (value as usize) < 64 {
            self.mask |= 1 << value;
        } else {
            self.overflow.push(value);
        }
    }
}

/// A declared sub-schema: either a linked/unlinked sub-message or a closed
/// enum validator.
pub enum Sub {
    Message(AtomicPtr<MiniTable>),
    Enum(Box<MiniTableEnum>),
}

impl Sub {
    fn message_unlinked() -> Sub {
        Sub::Message(AtomicPtr::new(core::ptr::null_mut()))
    }
}

/// Extendability class of a message (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extendability {
    NonExtendable,
    Extendable,
    IsMessageSet,
    IsMapEntry,
}

/// A message's compiled, runtime-interpretable schema.
pub struct MiniTable {
    /// Ordered so fields `1..=dense_below` occupy the first `dense_below`
    /// slots (O(1) dispatch fast path).
    pub fields: Vec<MiniTableField>,
    pub subs: Vec<Sub>,
    pub size: u16,
    pub required_count: u8,
    pub dense_below: u32,
    pub table_mask: u32,
    pub ext: Extendability,
    /// `MOD_VALIDATE_UTF8` from the message modifier byte (§4.2): whether
    /// `string` fields reject non-UTF-8 payloads with `BadUtf8` rather than
    /// accepting them as opaque bytes.
    pub validate_utf8: bool,
}

impl MiniTable {
    /// Required-field mask: bit `i` set means hasbit `i+1` is required.
    pub fn required_mask(&self) -> u64 {
        if self.required_count == 0 {
            0
        } else {
            (1u64 << self.required_count) - 1
        }
    }

    /// Look up a field by number using the dense prefix, falling back to a
    /// linear scan starting at `hint` (fields usually arrive in order on the
    /// wire) per §4.5 step 1.
    pub fn find_field(&self, number: u32, hint: &mut usize) -> Option<&MiniTableField> {
        if number >= 1 && number <= self.dense_below as u32 {
            return self.fields.get((number - 1) as usize);
        }
        let n = self.fields.len();
        if n == 0 {
            return None;
        }
        let start = (*hint).min(n - 1);
        for i in 0..n {
            let idx = (start + i) % n;
            if self.fields[idx].number == number {
                *hint = idx;
                return Some(&self.fields[idx]);
            }
        }
        None
    }

    /// Replace the placeholder sub-table for `field` with `sub`. Must be
    /// called at most once per field; the store is a release so concurrent
    /// readers synchronizing externally observe a fully-built `sub` (§4.2).
    pub fn set_sub_message(&self, field: &MiniTableField, sub: *mut MiniTable) {
        match &self.subs[field.sub_index as usize] {
            Sub::Message(slot) => slot.store(sub, Ordering::Release),
            Sub::Enum(_) => panic!("set_sub_message called on an enum sub-entry"),
        }
    }

    pub fn set_sub_enum(&mut self, field: &MiniTableField, e: MiniTableEnum) {
        self.subs[field.sub_index as usize] = Sub::Enum(Box::new(e));
    }

    /// The linked sub-message table for `field`, or the canonical
    /// [`empty_mini_table`] if unlinked.
    pub fn sub_message(&self, field: &MiniTableField) -> &'static MiniTable {
        match &self.subs[field.sub_index as usize] {
            Sub::Message(slot) => {
                let p = slot.load(Ordering::Acquire);
                if p.is_null() {
                    empty_mini_table()
                } else {
                    // Safety: link-up only ever replaces null with a pointer
                    // to a `MiniTable` that outlives the registry owning it.
                    unsafe { &*p }
                }
            }
            Sub::Enum(_) => panic!("sub_message called on an enum sub-entry"),
        }
    }

    pub fn sub_enum(&self, field: &MiniTableField) -> Option<&MiniTableEnum> {
        match &self.subs[field.sub_index as usize] {
            Sub::Enum(e) => Some(e),
            Sub::Message(_) => None,
        }
    }

    pub fn is_sub_linked(&self, field: &MiniTableField) -> bool {
        match &self.subs[field.sub_index as usize] {
            Sub::Message(slot) => !slot.load(Ordering::Acquire).is_null(),
            Sub::Enum(_) => true,
        }
    }
}

/// Map-entry fixed layout (§4.2 step 6): hasbit byte 0, key at offset 8,
/// value at `8 + kv_size`.
pub const MAP_ENTRY_HASBIT_BYTES: u16 = 8;
pub const MAP_ENTRY_KEY_OFFSET: u16 = 8;

/// The canonical placeholder used for sub-message fields that have not yet
/// been linked via [`MiniTable::set_sub_message`] (§3.2). Immutable,
/// process-wide, zero fields.
pub fn empty_mini_table() -> &'static MiniTable {
    static EMPTY: std::sync::OnceLock<MiniTable> = std::sync::OnceLock::new();
    EMPTY.get_or_init(|| MiniTable {
        fields: Vec::new(),
        subs: Vec::new(),
        size: 8,
        required_count: 0,
        dense_below: 0,
        table_mask: 0,
        ext: Extendability::NonExtendable,
        validate_utf8: false,
    })
}

/// Bundles a field descriptor, a back-pointer to the extended message's
/// table, and the sub-entry for the extension's own type.
pub struct MiniTableExtension {
    pub field: MiniTableField,
    pub extendee: &'static MiniTable,
    pub sub: Sub,
}

/// Append-only registry mapping `(extendee, field number)` to a known
/// extension. Lookups may race with inserts only if callers synchronize
/// externally (§5); this crate models that with an ordinary `Mutex`-free
/// `BTreeMap` behind `&mut` registration and `&` lookup, matching the
/// append-only contract without hiding a lock in the hot decode path.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: BTreeMap<(usize, u32), Box<MiniTableExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ext: MiniTableExtension) {
        let key = (ext.extendee as *const MiniTable as usize, ext.field.number);
        self.entries.insert(key, Box::new(ext));
    }

    pub fn lookup(&self, extendee: &MiniTable, number: u32) -> Option<&MiniTableExtension> {
        let key = (extendee as *const MiniTable as usize, number);
        self.entries.get(&key).map(|b| b.as_ref())
    }
}

/// Structural equality of two messages under the same schema (§4.7,
/// supplemented from `hpb/util/compare.c`'s `hpb_Message_IsEqual`): walks
/// fields the same way the encoder does, comparing by rep rather than by
/// re-encoding. Unknown bytes are compared as a reordering-tolerant
/// multiset of whole tag+value entries, since a relay may reorder unknown
/// fields without changing meaning.
pub fn message_eq(a: &crate::message::Message, b: &crate::message::Message, mt: &MiniTable) -> bool {
    for field in &mt.fields {
        if !field_eq(a, b, field, mt) {
            return false;
        }
    }
    unknown_eq(&a.unknown_bytes(), &b.unknown_bytes())
}

fn field_eq(
    a: &crate::message::Message,
    b: &crate::message::Message,
    field: &MiniTableField,
    mt: &MiniTable,
) -> bool {
    match field.presence() {
        Presence::Hasbit(idx) => {
            let ha = a.has_bit(idx);
            let hb = b.has_bit(idx);
            if ha != hb {
                return false;
            }
            if !ha {
                return true;
            }
        }
        Presence::OneofCase(off) => {
            let ca = a.oneof_case(off);
            let cb = b.oneof_case(off);
            if ca != cb {
                return false;
            }
            if ca != field.number {
                return true;
            }
        }
        Presence::None => {}
    }

    match field.mode {
        Mode::Scalar => scalar_eq(a, b, field, mt),
        Mode::Array => {
            let pa = *a.ref_at::<usize>(field.offset);
            let pb = *b.ref_at::<usize>(field.offset);
            array_eq(pa, pb, field, mt)
        }
        Mode::Map => {
            let pa = *a.ref_at::<usize>(field.offset);
            let pb = *b.ref_at::<usize>(field.offset);
            map_eq(pa, pb)
        }
    }
}

fn scalar_eq(
    a: &crate::message::Message,
    b: &crate::message::Message,
    field: &MiniTableField,
    mt: &MiniTable,
) -> bool {
    if field.field_type.is_submessage() {
        let pa = *a.ref_at::<usize>(field.offset);
        let pb = *b.ref_at::<usize>(field.offset);
        return submessage_ptr_eq(pa, pb, field, mt);
    }
    match field.rep {
        Rep::OneByte => a.ref_at::<u8>(field.offset) == b.ref_at::<u8>(field.offset),
        Rep::FourByte => a.ref_at::<u32>(field.offset) == b.ref_at::<u32>(field.offset),
        Rep::EightByte => a.ref_at::<u64>(field.offset) == b.ref_at::<u64>(field.offset),
        Rep::StringView => {
            let sa = a.ref_at::<crate::wire::StringView>(field.offset);
            let sb = b.ref_at::<crate::wire::StringView>(field.offset);
            sa.as_slice() == sb.as_slice()
        }
        Rep::Pointer => unreachable!("non-submessage pointer rep"),
    }
}

fn submessage_ptr_eq(pa: usize, pb: usize, field: &MiniTableField, mt: &MiniTable) -> bool {
    if pa == 0 || pb == 0 {
        return pa == pb;
    }
    let ta = unsafe { &*(pa as *const crate::message::TaggedMessagePtr) };
    let tb = unsafe { &*(pb as *const crate::message::TaggedMessagePtr) };
    if ta.is_empty() != tb.is_empty() {
        return false;
    }
    let sub_mt = mt.sub_message(field);
    message_eq(&ta.message(), &tb.message(), sub_mt)
}

fn array_eq(pa: usize, pb: usize, field: &MiniTableField, mt: &MiniTable) -> bool {
    use crate::containers::RepeatedStorage;
    if pa == 0 || pb == 0 {
        return (pa == 0) == (pb == 0) || {
            // an absent array compares equal to an empty one.
            let len = |p: usize| -> usize {
                if p == 0 {
                    0
                } else {
                    unsafe { (*(p as *const RepeatedStorage)).len() }
                }
            };
            len(pa) == len(pb)
        };
    }
    let ra = unsafe { &*(pa as *const RepeatedStorage) };
    let rb = unsafe { &*(pb as *const RepeatedStorage) };
    match (ra, rb) {
        (RepeatedStorage::Bool(x), RepeatedStorage::Bool(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::I32(x), RepeatedStorage::I32(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::U32(x), RepeatedStorage::U32(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::F32(x), RepeatedStorage::F32(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::I64(x), RepeatedStorage::I64(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::U64(x), RepeatedStorage::U64(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::F64(x), RepeatedStorage::F64(y)) => x.as_slice() == y.as_slice(),
        (RepeatedStorage::StringOrBytes(x), RepeatedStorage::StringOrBytes(y)) => {
            x.len() == y.len()
                && x.as_slice()
                    .iter()
                    .zip(y.as_slice())
                    .all(|(sa, sb)| sa.as_slice() == sb.as_slice())
        }
        (RepeatedStorage::Message(x), RepeatedStorage::Message(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let sub_mt = mt.sub_message(field);
            x.as_slice().iter().zip(y.as_slice()).all(|(ta, tb)| {
                ta.is_empty() == tb.is_empty() && message_eq(&ta.message(), &tb.message(), sub_mt)
            })
        }
        _ => false,
    }
}

fn map_eq(pa: usize, pb: usize) -> bool {
    use crate::containers::MapField;
    let len = |p: usize| -> usize {
        if p == 0 {
            0
        } else {
            unsafe { (*(p as *const MapField)).len() }
        }
    };
    if len(pa) != len(pb) {
        return false;
    }
    if pa == 0 || pb == 0 {
        return true;
    }
    let ma = unsafe { &*(pa as *const MapField) };
    let mb = unsafe { &*(pb as *const MapField) };
    ma.iter().all(|(k, v)| mb.get(k) == Some(v))
}

/// Parses a raw unknown-fields buffer into whole tag+value byte slices
/// (§4.7): each entry is the bytes of one complete wire element, tag
/// included, used so entries can be compared as a reordering-tolerant set.
fn split_unknown_entries(bytes: &[u8]) -> Option<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (tag, tag_len) = crate::wire::read_tag(&bytes[pos..])?;
        let value_len = crate::wire::skip_value(&bytes[pos + tag_len..], tag, 100)?;
        let total = tag_len + value_len;
        out.push(&bytes[pos..pos + total]);
        pos += total;
    }
    Some(out)
}

fn unknown_eq(a: &[u8], b: &[u8]) -> bool {
    match (split_unknown_entries(a), split_unknown_entries(b)) {
        (Some(mut ea), Some(mut eb)) => {
            ea.sort_unstable();
            eb.sort_unstable();
            ea == eb
        }
        _ => a == b,
    }
}

/// Construct a fresh sub-entry for an unlinked sub-message; used by the
/// MiniDescriptor decoder while building a `MiniTable`'s `subs` vector.
pub(crate) fn new_message_sub() -> Sub {
    Sub::message_unlinked()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_round_trips() {
        for p in [Presence::None, Presence::Hasbit(5), Presence::OneofCase(12)] {
            assert_eq!(Presence::decode(p.encode()), p);
        }
    }

    #[test]
    fn enum_mask_and_overflow() {
        let mut e = MiniTableEnum::default();
        e.insert(0);
        e.insert(3);
        e.insert(100);
        assert!(e.contains(0));
        assert!(e.contains(3));
        assert!(e.contains(100));
        assert!(!e.contains(1));
        assert!(!e.contains(99));
    }

    #[test]
    fn empty_mini_table_is_singleton() {
        let a = empty_mini_table() as *const MiniTable;
        let b = empty_mini_table() as *const MiniTable;
        assert_eq!(a, b);
    }
}
