//! `Array` (arena-backed, doubling-growth repeated field storage) and
//! `MapField` (bytes-keyed hash table for `map<>` fields). `StringView`
//! lives in [`crate::wire`] since the eps-copy stream is what produces it.
//!
//! `Array`'s doubling-growth pattern is arena-backed rather than
//! global-allocator-backed; `hpb/collections/array.c`/`array.h` inform the
//! tagged element-size encoding this module's `Array::elem_size` mirrors
//! conceptually, without the original's pointer-tag trick, since ownership
//! here is a typed Rust generic rather than an erased `void*`.

use crate::arena::Arena;
use allocator_api2::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

/// A growable, arena-backed array of fixed-size elements, mirroring
/// `hpb_Array`'s doubling growth (§3.4).
pub struct Array<T> {
    data: NonNull<T>,
    len: usize,
    cap: usize,
}

impl<T: Copy> Array<T> {
    pub fn new() -> Self {
        Array {
            data: NonNull::dangling(),
            len: 0,
            cap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            &mut []
        } else {
            unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
        }
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.as_slice().get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(i)
    }

    /// Append `value`, growing the backing storage (doubling) via `arena`
    /// when at capacity. Returns `None` on arena exhaustion.
    pub fn push(&mut self, value: T, arena: &Arena) -> Option<()> {
        if self.len == self.cap {
            self.grow(arena)?;
        }
        unsafe { self.data.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Some(())
    }

    pub fn reserve(&mut self, additional: usize, arena: &Arena) -> Option<()> {
        if self.cap - self.len >= additional {
            return Some(());
        }
        let needed = self.len + additional;
        while self.cap < needed {
            self.grow(arena)?;
        }
        Some(())
    }

    fn grow(&mut self, arena: &Arena) -> Option<()> {
        let new_cap = if self.cap == 0 { 4 } else { self.cap * 2 };
        let layout = Layout::array::<T>(new_cap).ok()?;
        let new_data = arena.alloc(layout)?.cast::<T>();
        if self.len > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(self.data.as_ptr(), new_data.as_ptr(), self.len);
            }
        }
        self.data = new_data;
        self.cap = new_cap;
        Some(())
    }
}

impl<T: Copy> Default for Array<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The field-slot storage for one repeated (array-mode) field: a pointer to
/// one of these, sized to match the element's storage rep (§3.4, §4.5 step
/// 3), lives behind the field's `Rep::Pointer` slot. One variant per
/// `Rep`/`FieldType` combination the decoder and encoder need to address
/// generically.
pub enum RepeatedStorage {
    Bool(Array<u8>),
    I32(Array<i32>),
    U32(Array<u32>),
    F32(Array<f32>),
    I64(Array<i64>),
    U64(Array<u64>),
    F64(Array<f64>),
    StringOrBytes(Array<crate::wire::StringView>),
    Message(Array<crate::message::TaggedMessagePtr>),
}

impl RepeatedStorage {
    pub fn len(&self) -> usize {
        match self {
            RepeatedStorage::Bool(a) => a.len(),
            RepeatedStorage::I32(a) => a.len(),
            RepeatedStorage::U32(a) => a.len(),
            RepeatedStorage::F32(a) => a.len(),
            RepeatedStorage::I64(a) => a.len(),
            RepeatedStorage::U64(a) => a.len(),
            RepeatedStorage::F64(a) => a.len(),
            RepeatedStorage::StringOrBytes(a) => a.len(),
            RepeatedStorage::Message(a) => a.len(),
        }
    }
}

/// Allocate `value` in `arena` and return a pointer to it. Used to box a
/// [`RepeatedStorage`]/[`MapField`]/[`crate::message::TaggedMessagePtr`]
/// behind a field's pointer-rep slot.
pub fn alloc_in_arena<T>(arena: &Arena, value: T) -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    let mem = arena.alloc(layout)?.cast::<T>();
    unsafe { mem.as_ptr().write(value) };
    Some(mem)
}

/// A `bytes`/`string` field's storage: owns a copy in the arena, or aliases
/// the decode input (see [`crate::wire::StringView`] for the alias form
/// used during decode; `Bytes` is the owned variant used e.g. for default
/// values and encoder-side scratch).
#[derive(Clone, Copy)]
pub struct Bytes {
    data: NonNull<u8>,
    len: usize,
}

impl Bytes {
    pub fn empty() -> Self {
        Bytes {
            data: NonNull::dangling(),
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8], arena: &Arena) -> Option<Self> {
        if bytes.is_empty() {
            return Some(Self::empty());
        }
        let layout = Layout::from_size_align(bytes.len(), 1).ok()?;
        let data = arena.alloc(layout)?;
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), data.as_ptr(), bytes.len()) };
        Some(Bytes {
            data,
            len: bytes.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
        }
    }
}

impl Default for Bytes {
    fn default() -> Self {
        Self::empty()
    }
}

/// Key used by [`MapField`]: map keys are always scalars or strings, so a
/// byte-string representation (matching the descriptor's key encoding) is
/// sufficient and lets one hash table implementation serve every key type
/// (§3.4: "fixed-size key converted to a string view").
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MapKey(pub Vec<u8>);

/// A `map<K, V>` field's runtime storage: a bytes-keyed hash table, values
/// stored inline as raw bytes sized per the value field's storage rep.
#[derive(Default)]
pub struct MapField {
    entries: HashMap<MapKey, Vec<u8>>,
    /// Stable iteration order for deterministic encoding fallback and
    /// testing; entries are also present in `entries`.
    insertion_order: Vec<MapKey>,
}

impl MapField {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key: MapKey, value: Vec<u8>) {
        if !self.entries.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &MapKey) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Iterate in hash order (matches the "otherwise in hash-iteration
    /// order" clause of §4.6's map-encoding rule).
    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &[u8])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Iterate in insertion order (used when a deterministic sort is about
    /// to be applied downstream and a stable base ordering is convenient
    /// for tests).
    pub fn iter_insertion_order(&self) -> impl Iterator<Item = (&MapKey, &[u8])> {
        self.insertion_order
            .iter()
            .map(move |k| (k, self.entries.get(k).unwrap().as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_push_and_grow() {
        let arena = Arena::new();
        let mut arr = Array::<u32>::new();
        for i in 0..100u32 {
            arr.push(i, &arena).unwrap();
        }
        assert_eq!(arr.len(), 100);
        assert_eq!(arr.as_slice()[0], 0);
        assert_eq!(arr.as_slice()[99], 99);
    }

    #[test]
    fn bytes_from_slice_copies() {
        let arena = Arena::new();
        let b = Bytes::from_slice(b"hello", &arena).unwrap();
        assert_eq!(b.as_slice(), b"hello");
    }

    #[test]
    fn map_field_insert_and_get() {
        let mut m = MapField::new();
        m.insert(MapKey(b"a".to_vec()), b"1".to_vec());
        m.insert(MapKey(b"b".to_vec()), b"2".to_vec());
        assert_eq!(m.get(&MapKey(b"a".to_vec())), Some(&b"1"[..]));
        assert_eq!(m.len(), 2);
    }
}
