//! Bump allocator with lock-free, disjoint-set-style arena fusion.
//!
//! Allocation within a single [`Arena`] is single-writer and unsynchronized
//! (a plain `(ptr, end)` cursor bumped through a linked list of blocks).
//! [`Arena::fuse`], [`Arena::space_allocated`] and `Drop` are the only
//! operations that touch cross-thread state, and they do so exclusively
//! through atomics on the `parent_or_count` word and the group's `next`/
//! `tail` list — the same three fields the original `hpb_Arena` uses, ported
//! from `hpb/mem/arena.c`'s `_hpb_Arena_FindRoot` / `hpb_Arena_Fuse` /
//! `hpb_Arena_Free`.
//!
//! `parent_or_count` is tagged in its low bit:
//! - bit set: the remaining bits (shifted right by one) are a refcount, and
//!   this [`ArenaState`] is a root.
//! - bit clear: the word is a pointer to another `ArenaState`, one step
//!   closer to the root.

use allocator_api2::alloc::{Allocator, Global, Layout};
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Minimum block size, matching `hpb_Arena_AllocBlock`'s floor.
const MIN_BLOCK_SIZE: usize = 128;

struct BlockHeader {
    next: AtomicPtr<BlockHeader>,
    /// Size of the usable region following this header, in bytes.
    size: usize,
}

const BLOCK_HEADER_LAYOUT: Layout = Layout::new::<BlockHeader>();

fn block_data_ptr(block: *mut BlockHeader) -> *mut u8 {
    // Safety: BlockHeader is followed immediately by its data region; the
    // allocation was sized and aligned for that in `alloc_block`.
    unsafe { (block as *mut u8).add(BLOCK_HEADER_LAYOUT.size()) }
}

/// The address-stable, possibly cross-thread-shared control block backing
/// one arena. Kept out of `Arena` itself (Open Question §3.1 of
/// `SPEC_FULL.md`): a separate allocation avoids a self-referential
/// address-of-self trick the original uses to save one allocation, at the
/// cost of one extra allocation per `Arena::new`.
struct ArenaState {
    parent_or_count: AtomicUsize,
    next: AtomicPtr<ArenaState>,
    tail: AtomicPtr<ArenaState>,
    blocks: AtomicPtr<BlockHeader>,
    head_ptr: Cell<*mut u8>,
    head_end: Cell<*mut u8>,
    has_initial_block: bool,
    allocator: &'static dyn Allocator,
}

// Safety: all cross-thread-visible mutation of `ArenaState` goes through the
// atomic fields; `head_ptr`/`head_end`/allocation itself is only ever
// touched by the single owning `Arena` handle.
unsafe impl Sync for ArenaState {}
unsafe impl Send for ArenaState {}

#[inline]
fn tagged_from_refcount(count: usize) -> usize {
    (count << 1) | 1
}

#[inline]
fn is_tagged_pointer(word: usize) -> bool {
    word & 1 == 0
}

#[inline]
fn refcount_from_tagged(word: usize) -> usize {
    debug_assert!(word & 1 == 1);
    word >> 1
}

#[inline]
fn pointer_from_tagged(word: usize) -> *mut ArenaState {
    debug_assert!(word & 1 == 0);
    word as *mut ArenaState
}

#[inline]
fn tagged_from_pointer(ptr: *mut ArenaState) -> usize {
    debug_assert!(ptr as usize & 1 == 0, "ArenaState must be pointer-aligned");
    ptr as usize
}

struct ArenaRoot {
    root: *mut ArenaState,
    tagged_count: usize,
}

/// Follows `parent_or_count` to the root, path-splitting every intermediate
/// pointer it observes so repeated calls converge toward O(1).
///
/// Ported from `_hpb_Arena_FindRoot`.
fn find_root(mut a: *mut ArenaState) -> ArenaRoot {
    // Safety: callers only ever pass live `ArenaState` pointers; the group's
    // arenas are kept alive by the refcount until the last `free`.
    let mut poc = unsafe { &(*a).parent_or_count }.load(Ordering::Acquire);
    while is_tagged_pointer(poc) {
        let next = pointer_from_tagged(poc);
        debug_assert!(a != next);
        let next_state = unsafe { &*next };
        let next_poc = next_state.parent_or_count.load(Ordering::Acquire);

        if is_tagged_pointer(next_poc) {
            // Lazily collapse one level; relaxed is fine because every
            // thread doing this converges on the same eventual root.
            unsafe { &(*a).parent_or_count }.store(next_poc, Ordering::Relaxed);
        }
        a = next;
        poc = next_poc;
    }
    ArenaRoot {
        root: a,
        tagged_count: poc,
    }
}

fn alloc_block(allocator: &dyn Allocator, size: usize) -> Option<(*mut BlockHeader, usize)> {
    let total = BLOCK_HEADER_LAYOUT.size().checked_add(size)?;
    let layout = Layout::from_size_align(total, BLOCK_HEADER_LAYOUT.align()).ok()?;
    let mem = allocator.allocate(layout).ok()?;
    let block = mem.as_ptr() as *mut BlockHeader;
    Some((block, total - BLOCK_HEADER_LAYOUT.size()))
}

/// A bump allocator. Not `Send`/`Sync`: only the owning thread may call
/// [`Arena::alloc`]/[`Arena::realloc`]/[`Arena::shrink_last`]; fusion, free
/// and [`Arena::space_allocated`] are the only operations safe to race
/// across threads against other handles in the same fused group.
pub struct Arena {
    state: NonNull<ArenaState>,
}

impl Arena {
    /// Create a new arena backed by the global allocator.
    pub fn new() -> Self {
        Self::new_in(&Global)
    }

    /// Create a new arena backed by a caller-supplied allocator.
    ///
    /// The allocator reference is required to outlive any use of this arena
    /// (including after fusion, since the fused group may keep allocating
    /// new blocks through it). Callers typically pass `&Global` or a
    /// `'static` allocator.
    pub fn new_in(allocator: &'static dyn Allocator) -> Self {
        let state = Box::new(ArenaState {
            parent_or_count: AtomicUsize::new(tagged_from_refcount(1)),
            next: AtomicPtr::new(core::ptr::null_mut()),
            tail: AtomicPtr::new(core::ptr::null_mut()),
            blocks: AtomicPtr::new(core::ptr::null_mut()),
            head_ptr: Cell::new(core::ptr::null_mut()),
            head_end: Cell::new(core::ptr::null_mut()),
            has_initial_block: false,
            allocator,
        });
        let state = NonNull::from(Box::leak(state));
        unsafe {
            state.as_ref().tail.store(state.as_ptr(), Ordering::Relaxed);
        }
        Arena { state }
    }

    /// Place the arena inside caller-provided memory. Growth past that
    /// initial block still uses `allocator`; an arena created this way
    /// cannot be fused (its lifetime cannot be extended indefinitely).
    ///
    /// Mirrors `hpb_Arena_Init`.
    pub fn init_in(buffer: &'static mut [u8], allocator: &'static dyn Allocator) -> Self {
        let state = Box::new(ArenaState {
            parent_or_count: AtomicUsize::new(tagged_from_refcount(1)),
            next: AtomicPtr::new(core::ptr::null_mut()),
            tail: AtomicPtr::new(core::ptr::null_mut()),
            blocks: AtomicPtr::new(core::ptr::null_mut()),
            head_ptr: Cell::new(buffer.as_mut_ptr()),
            head_end: Cell::new(unsafe { buffer.as_mut_ptr().add(buffer.len()) }),
            has_initial_block: true,
            allocator,
        });
        let state = NonNull::from(Box::leak(state));
        unsafe {
            state.as_ref().tail.store(state.as_ptr(), Ordering::Relaxed);
        }
        Arena { state }
    }

    fn state(&self) -> &ArenaState {
        // Safety: `state` is only freed once the group refcount hits zero,
        // which cannot happen while `self` is alive and holds a ref.
        unsafe { self.state.as_ref() }
    }

    /// Bump-allocate `layout` out of this arena, growing via the pluggable
    /// allocator when the current block is exhausted.
    pub fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let st = self.state();
        let ptr = st.head_ptr.get();
        let end = st.head_end.get();
        let align = layout.align();
        let size = layout.size();

        let aligned = align_up(ptr, align);
        if !aligned.is_null() && (end as usize) >= (aligned as usize) && (end as usize - aligned as usize) >= size {
            let new_ptr = unsafe { aligned.add(size) };
            st.head_ptr.set(new_ptr);
            return NonNull::new(aligned);
        }
        self.slow_alloc(layout)
    }

    #[cold]
    fn slow_alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let st = self.state();
        let last_size = {
            let b = st.blocks.load(Ordering::Acquire);
            if b.is_null() {
                MIN_BLOCK_SIZE
            } else {
                unsafe { (*b).size }
            }
        };
        let reserve = layout.size() + layout.align();
        let block_size = reserve.max(last_size * 2);
        let (block, actual_size) = alloc_block(st.allocator, block_size)?;
        unsafe {
            (*block).size = actual_size;
            let prev = st.blocks.load(Ordering::Relaxed);
            (*block).next = AtomicPtr::new(prev);
            st.blocks.store(block, Ordering::Release);
        }
        let data = block_data_ptr(block);
        st.head_ptr.set(data);
        st.head_end.set(unsafe { data.add(actual_size) });
        self.alloc(layout)
    }

    /// Extend or shrink an allocation in place when `ptr` was the most
    /// recent allocation; otherwise allocates fresh and copies.
    ///
    /// # Safety
    /// `ptr` must have been returned by a previous `alloc`/`realloc` on this
    /// same arena with size `old_layout`, and must still be valid.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let st = self.state();
        let was_last = unsafe { ptr.as_ptr().add(old_layout.size()) } == st.head_ptr.get();
        if was_last {
            let new_end = unsafe { ptr.as_ptr().add(new_size) };
            if (new_end as usize) <= (st.head_end.get() as usize) {
                st.head_ptr.set(new_end);
                return Some(ptr);
            }
        }
        let new_layout = Layout::from_size_align(new_size, old_layout.align()).ok()?;
        let new_ptr = self.alloc(new_layout)?;
        unsafe {
            let copy_len = old_layout.size().min(new_size);
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        Some(new_ptr)
    }

    /// Move the cursor back when `ptr` was the most recent allocation.
    ///
    /// # Safety
    /// As [`Arena::realloc`]: `ptr`/`old_size` must describe the most
    /// recent live allocation from this arena.
    pub unsafe fn shrink_last(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) {
        debug_assert!(new_size <= old_size);
        let st = self.state();
        let end_of_old = unsafe { ptr.as_ptr().add(old_size) };
        if end_of_old == st.head_ptr.get() {
            st.head_ptr.set(unsafe { ptr.as_ptr().add(new_size) });
        }
    }

    /// Whether this arena was created with caller-supplied storage
    /// (`init_in`), which cannot be fused.
    pub fn has_initial_block(&self) -> bool {
        self.state().has_initial_block
    }

    /// Join the lifetime of `a` and `b`'s groups. Returns `false` iff either
    /// side has an initial block that cannot be lifetime-extended.
    ///
    /// Ported from `hpb_Arena_Fuse` / `_hpb_Arena_DoFuse`.
    pub fn fuse(a: &Arena, b: &Arena) -> bool {
        if a.state == b.state {
            return true;
        }
        if a.has_initial_block() || b.has_initial_block() {
            return false;
        }

        let mut ref_delta: usize = 0;
        loop {
            if let Some(new_root) = do_fuse(a.state.as_ptr(), b.state.as_ptr(), &mut ref_delta) {
                if fixup_refs(new_root, ref_delta) {
                    return true;
                }
            }
        }
    }

    /// Sum of block sizes across every arena in this arena's fused group.
    /// Safe to call concurrently with allocation on any member arena.
    pub fn space_allocated(&self) -> usize {
        let root = find_root(self.state.as_ptr()).root;
        let mut total = 0usize;
        let mut arena = root;
        while !arena.is_null() {
            let st = unsafe { &*arena };
            let mut block = st.blocks.load(Ordering::Relaxed);
            while !block.is_null() {
                total += BLOCK_HEADER_LAYOUT.size() + unsafe { (*block).size };
                block = unsafe { (*block).next.load(Ordering::Relaxed) };
            }
            arena = st.next.load(Ordering::Relaxed);
        }
        total
    }

    /// Current refcount of this arena's group root (debug/introspection
    /// only).
    pub fn debug_refcount(&self) -> usize {
        let r = find_root(self.state.as_ptr());
        refcount_from_tagged(r.tagged_count)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new()
    }
}

fn do_fuse(a1: *mut ArenaState, a2: *mut ArenaState, ref_delta: &mut usize) -> Option<*mut ArenaState> {
    let mut r1 = find_root(a1);
    let mut r2 = find_root(a2);

    if r1.root == r2.root {
        return Some(r1.root);
    }

    if (r1.root as usize) > (r2.root as usize) {
        core::mem::swap(&mut r1, &mut r2);
    }

    let r2_untagged_count = r2.tagged_count & !1;
    let with_r2_refs = r1.tagged_count.wrapping_add(r2_untagged_count);
    let r1_state = unsafe { &*r1.root };
    if r1_state
        .parent_or_count
        .compare_exchange(
            r1.tagged_count,
            with_r2_refs,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return None;
    }

    let r2_state = unsafe { &*r2.root };
    if r2_state
        .parent_or_count
        .compare_exchange(
            r2.tagged_count,
            tagged_from_pointer(r1.root),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        *ref_delta += r2_untagged_count;
        return None;
    }

    fuse_arena_lists(r1.root, r2.root);
    Some(r1.root)
}

fn fuse_arena_lists(parent: *mut ArenaState, mut child: *mut ArenaState) {
    let parent_state = unsafe { &*parent };
    let mut parent_tail = parent_state.tail.load(Ordering::Relaxed);
    loop {
        let mut parent_tail_next = unsafe { &*parent_tail }.next.load(Ordering::Relaxed);
        while !parent_tail_next.is_null() {
            parent_tail = parent_tail_next;
            parent_tail_next = unsafe { &*parent_tail }.next.load(Ordering::Relaxed);
        }

        let displaced = unsafe { &*parent_tail }
            .next
            .swap(child, Ordering::Relaxed);
        parent_tail = unsafe { &*child }.tail.load(Ordering::Relaxed);

        if displaced.is_null() {
            break;
        }
        child = displaced;
    }
    parent_state.tail.store(parent_tail, Ordering::Relaxed);
}

fn fixup_refs(new_root: *mut ArenaState, ref_delta: usize) -> bool {
    if ref_delta == 0 {
        return true;
    }
    let st = unsafe { &*new_root };
    let poc = st.parent_or_count.load(Ordering::Relaxed);
    if is_tagged_pointer(poc) {
        return false;
    }
    let with_refs = poc.wrapping_sub(ref_delta);
    debug_assert!(!is_tagged_pointer(with_refs));
    st.parent_or_count
        .compare_exchange(poc, with_refs, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

fn arena_do_free(mut a: *mut ArenaState) {
    while !a.is_null() {
        let st = unsafe { &*a };
        let next_arena = st.next.load(Ordering::Acquire);
        let allocator = st.allocator;
        let mut block = st.blocks.load(Ordering::Acquire);
        while !block.is_null() {
            let next_block = unsafe { (*block).next.load(Ordering::Acquire) };
            let size = unsafe { (*block).size };
            let layout =
                Layout::from_size_align(BLOCK_HEADER_LAYOUT.size() + size, BLOCK_HEADER_LAYOUT.align())
                    .expect("block layout was valid at allocation time");
            unsafe { allocator.deallocate(NonNull::new_unchecked(block as *mut u8), layout) };
            block = next_block;
        }
        // Safety: this arena's group refcount has reached zero; no other
        // handle can observe `a` again.
        unsafe { drop(Box::from_raw(a)) };
        a = next_arena;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut a = self.state.as_ptr();
        loop {
            let st = unsafe { &*a };
            let poc = st.parent_or_count.load(Ordering::Acquire);
            if is_tagged_pointer(poc) {
                a = pointer_from_tagged(poc);
                continue;
            }
            if poc == tagged_from_refcount(1) {
                arena_do_free(a);
                return;
            }
            if st
                .parent_or_count
                .compare_exchange(
                    poc,
                    tagged_from_refcount(refcount_from_tagged(poc) - 1),
                    Ordering::Release,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            // Lost the race; loop back and reload from `a` (poc was refreshed
            // by the failed compare_exchange in a real CAS loop; here we just
            // restart the whole walk from `a`, which is always correct since
            // `a` only ever moves toward the root over time).
        }
    }
}

#[inline]
fn align_up(ptr: *mut u8, align: usize) -> *mut u8 {
    let addr = ptr as usize;
    let aligned = (addr.wrapping_add(align - 1)) & !(align - 1);
    aligned as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_basic() {
        let arena = Arena::new();
        let layout = Layout::new::<u64>();
        let p1 = arena.alloc(layout).unwrap();
        let p2 = arena.alloc(layout).unwrap();
        assert_ne!(p1.as_ptr(), p2.as_ptr());
    }

    #[test]
    fn alloc_grows_blocks() {
        let arena = Arena::new();
        let layout = Layout::from_size_align(4096, 8).unwrap();
        for _ in 0..8 {
            assert!(arena.alloc(layout).is_some());
        }
        assert!(arena.space_allocated() >= 4096 * 8);
    }

    #[test]
    fn fuse_self_is_trivial() {
        let arena = Arena::new();
        assert!(Arena::fuse(&arena, &arena));
    }

    #[test]
    fn fuse_joins_groups_and_keeps_both_alive() {
        let a = Arena::new();
        let b = Arena::new();
        assert!(Arena::fuse(&a, &b));
        let layout = Layout::new::<u64>();
        assert!(a.alloc(layout).is_some());
        assert!(b.alloc(layout).is_some());
        // Both report the same total once fused.
        assert_eq!(a.space_allocated(), b.space_allocated());
        drop(a);
        // `b` is still valid: the group isn't freed until the last ref drops.
        assert!(b.alloc(layout).is_some());
    }

    #[test]
    fn fuse_rejects_initial_block_arenas() {
        let buf: &'static mut [u8] = Box::leak(Box::new([0u8; 256]));
        let with_initial = Arena::init_in(buf, &Global);
        let plain = Arena::new();
        assert!(!Arena::fuse(&with_initial, &plain));
    }
}
