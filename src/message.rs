//! In-memory message layout: the `Internal` header, hasbit/oneof-case
//! accessors, and the tagged `TaggedMessagePtr` used for unlinked
//! sub-message placeholders.
//!
//! A message is `MiniTable::size` bytes of payload; callers allocate it
//! zero-initialized in an arena. Field access style (byte-offset
//! `ref_at`/`ref_mut`, `has_bit`/`set_has_bit`) follows an `Object`-style
//! layout; the `Internal` header and tagged-pointer promotion bit are new,
//! grounded on `hpb/message/message.h` and `hpb/message/promote.h`.

use crate::minitable::MiniTableExtension;
use std::cell::Cell;
use std::ptr::NonNull;

/// One `{extension, value}` slot in a message's extension list.
pub struct ExtensionSlot {
    pub extension: &'static MiniTableExtension,
    /// Raw payload bytes sized per the extension field's storage rep,
    /// interpreted the same way a regular field slot would be.
    pub value: [u8; 16],
}

/// Header preceding every message's payload bytes (§3.3, §6): pointers to
/// the append-only unknown-fields buffer and the extension list.
pub struct Internal {
    pub unknown_bytes: Cell<Vec<u8>>,
    pub extensions: Cell<Vec<ExtensionSlot>>,
}

impl Default for Internal {
    fn default() -> Self {
        Internal {
            unknown_bytes: Cell::new(Vec::new()),
            extensions: Cell::new(Vec::new()),
        }
    }
}

/// A raw message: an `Internal` header plus `size` payload bytes, both
/// arena-owned. `Message` itself borrows the arena allocation; it never
/// owns/frees memory directly (the arena does, en masse).
pub struct Message {
    internal: NonNull<Internal>,
    payload: NonNull<u8>,
    pub size: usize,
}

impl Message {
    /// Allocate a new zero-initialized message of `size` payload bytes in
    /// `arena`, with a fresh `Internal` header. Returns `None` on arena
    /// exhaustion (callers surface this as `DecodeStatus::OutOfMemory`).
    pub fn new_in(arena: &crate::arena::Arena, size: usize) -> Option<Message> {
        let layout = allocator_api2::alloc::Layout::from_size_align(size.max(8), 8).ok()?;
        let payload = arena.alloc(layout)?;
        unsafe { core::ptr::write_bytes(payload.as_ptr(), 0, size) };

        let internal_layout = allocator_api2::alloc::Layout::new::<Internal>();
        let internal_mem = arena.alloc(internal_layout)?;
        let internal = internal_mem.cast::<Internal>();
        unsafe { internal.as_ptr().write(Internal::default()) };

        Some(Message {
            internal,
            payload,
            size,
        })
    }

    pub fn internal(&self) -> &Internal {
        // Safety: allocated and initialized together in `new_in`, lives as
        // long as the arena.
        unsafe { self.internal.as_ref() }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.payload.as_ptr()
    }

    #[inline]
    pub fn ref_at<T>(&self, offset: u16) -> &T {
        unsafe { &*(self.base().add(offset as usize) as *const T) }
    }

    #[inline]
    pub fn ref_mut<T>(&self, offset: u16) -> &mut T {
        unsafe { &mut *(self.base().add(offset as usize) as *mut T) }
    }

    /// First 8 bytes of payload, the low-64 hasbit word (§6): bit `i` (1-based `i+1`)
    /// records presence of hasbit `i+1`.
    pub fn hasbit_word(&self) -> u64 {
        *self.ref_at::<u64>(0)
    }

    pub fn has_bit(&self, idx: u16) -> bool {
        if idx == 0 {
            return true; // no-presence fields always read as "set"
        }
        let bit = idx - 1;
        self.hasbit_word() & (1u64 << bit) != 0
    }

    pub fn set_has_bit(&self, idx: u16) {
        if idx == 0 {
            return;
        }
        let bit = idx - 1;
        let word = self.ref_mut::<u64>(0);
        *word |= 1u64 << bit;
    }

    pub fn clear_has_bit(&self, idx: u16) {
        if idx == 0 {
            return;
        }
        let bit = idx - 1;
        let word = self.ref_mut::<u64>(0);
        *word &= !(1u64 << bit);
    }

    /// Read the active oneof-case field number at byte offset `offset`.
    pub fn oneof_case(&self, offset: u16) -> u32 {
        *self.ref_at::<u32>(offset)
    }

    pub fn set_oneof_case(&self, offset: u16, field_number: u32) {
        *self.ref_mut::<u32>(offset) = field_number;
    }

    pub fn append_unknown(&self, bytes: &[u8]) {
        let mut buf = self.internal().unknown_bytes.take();
        buf.extend_from_slice(bytes);
        self.internal().unknown_bytes.set(buf);
    }

    pub fn unknown_bytes(&self) -> Vec<u8> {
        let buf = self.internal().unknown_bytes.take();
        self.internal().unknown_bytes.set(buf.clone());
        buf
    }

    pub fn push_extension(&self, slot: ExtensionSlot) {
        let mut v = self.internal().extensions.take();
        v.push(slot);
        self.internal().extensions.set(v);
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base()
    }

    /// # Safety
    /// `ptr` must point at a live message payload of at least `size` bytes
    /// with an `Internal` header allocated immediately before it by
    /// [`Message::new_in`]'s convention (internal pointer tracked
    /// separately; this just reconstructs the handle, it does not relocate
    /// anything).
    pub unsafe fn from_raw_parts(internal: NonNull<Internal>, payload: NonNull<u8>, size: usize) -> Message {
        Message {
            internal,
            payload,
            size,
        }
    }

    pub fn internal_ptr(&self) -> NonNull<Internal> {
        self.internal
    }

    pub fn payload_ptr(&self) -> NonNull<u8> {
        self.payload
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Message {
            internal: self.internal,
            payload: self.payload,
            size: self.size,
        }
    }
}
impl Copy for Message {}

/// A pointer to a [`Message`] with one tag bit: when set, the pointee was
/// decoded against the canonical `EmptyMiniTable` placeholder (its true
/// schema was not yet linked) and must be [`crate::promote`]d before its
/// fields can be read under the real type (§3.3, §4.5, glossary: "empty
/// message / tagged pointer").
#[derive(Clone, Copy)]
pub struct TaggedMessagePtr {
    internal: NonNull<Internal>,
    tagged_payload: usize,
    size: usize,
}

const EMPTY_TAG: usize = 1;

impl TaggedMessagePtr {
    pub fn new(msg: Message, is_empty: bool) -> Self {
        let addr = msg.payload_ptr().as_ptr() as usize;
        debug_assert!(addr & EMPTY_TAG == 0, "message payload must be aligned");
        TaggedMessagePtr {
            internal: msg.internal_ptr(),
            tagged_payload: if is_empty { addr | EMPTY_TAG } else { addr },
            size: msg.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tagged_payload & EMPTY_TAG != 0
    }

    pub fn message(&self) -> Message {
        let addr = self.tagged_payload & !EMPTY_TAG;
        // Safety: constructed only from a live `Message`'s parts in `new`.
        unsafe {
            Message::from_raw_parts(
                self.internal,
                NonNull::new_unchecked(addr as *mut u8),
                self.size,
            )
        }
    }

    /// Replace this tagged pointer with a freshly promoted (untagged)
    /// message, keeping the same `Internal` header identity conceptually
    /// distinct: promotion allocates a *new* message under the linked
    /// schema (§4.5 "Promotion").
    pub fn set_promoted(&mut self, msg: Message) {
        *self = TaggedMessagePtr::new(msg, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn hasbit_round_trips() {
        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        assert!(!msg.has_bit(1));
        msg.set_has_bit(1);
        assert!(msg.has_bit(1));
        msg.clear_has_bit(1);
        assert!(!msg.has_bit(1));
    }

    #[test]
    fn no_presence_field_always_set() {
        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        assert!(msg.has_bit(0));
    }

    #[test]
    fn tagged_pointer_round_trips() {
        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let tagged = TaggedMessagePtr::new(msg, true);
        assert!(tagged.is_empty());
        let mut tagged = tagged;
        let promoted = Message::new_in(&arena, 16).unwrap();
        tagged.set_promoted(promoted);
        assert!(!tagged.is_empty());
    }

    #[test]
    fn unknown_bytes_append() {
        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        msg.append_unknown(&[1, 2, 3]);
        msg.append_unknown(&[4, 5]);
        assert_eq!(msg.unknown_bytes(), vec![1, 2, 3, 4, 5]);
    }
}
