//! The buddy allocator context.
//!
//! A [`BuddyMalloc`] routes each request either to its arena, where blocks
//! are split and coalesced in powers of two, or straight to an anonymous OS
//! mapping when the request does not fit in the largest arena block.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation       | Best-case | Worst-case                     |
//! |-----------------|-----------|--------------------------------|
//! | Allocate        | O(1)      | O(levels + free blocks)        |
//! | Release         | O(1)      | O(levels × free blocks)        |
//! | Reallocate      | O(1)      | O(levels × free blocks + size) |
//!
//! Free lists are kept sorted by address, so inserting a block is linear in
//! the length of its list.
//!
//! #### Fragmentation
//!
//! Arena blocks are powers of two, so a request can waste up to half of its
//! block to internal fragmentation. Freed blocks are coalesced with their
//! buddies eagerly, which bounds external fragmentation.

use core::{cmp, num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "log")]
use log::{debug, trace};

use crate::{
    arena::Arena,
    base::{addr_of, BasePtr, BlockHeader, HEADER_SIZE},
    buddy,
    order::OrderTable,
    os::OsMemory,
    stats::{Counters, Stats},
    AllocError, AllocInitError, DEFAULT_NUM_BLOCKS, SIZE_LIMIT,
};

/// A binary-buddy heap allocator.
///
/// This takes two const parameters:
/// - `BLK_SIZE` is the size of the largest arena block, header included.
///   Requests that do not fit are mapped from the OS.
/// - `LEVELS` is the number of orders in the arena.
///
/// These parameters are subject to the following invariants:
/// - `BLK_SIZE` must be a power of two.
/// - `LEVELS` must be nonzero and less than `usize::BITS`.
/// - The minimum block size, `BLK_SIZE >> (LEVELS - 1)`, must be larger
///   than a block header.
///
/// Attempting to construct a `BuddyMalloc` whose const parameters violate
/// these invariants will result in a panic.
///
/// For example, the type of an allocator whose arena hands out blocks of
/// 64 bytes to 4 KiB would be:
///
/// ```
/// use buddy_malloc::{BuddyMalloc, ReservedHeap};
///
/// // Minimum block size == BLK_SIZE >> (LEVELS - 1)
/// //                 64 ==     4096 >> (     7 - 1)
/// type SmallMalloc = BuddyMalloc<4096, 7, ReservedHeap>;
/// # fn main() {}
/// ```
///
/// The arena is reserved from `O` on the first request that needs it, and is
/// never returned.
#[derive(Debug)]
pub struct BuddyMalloc<const BLK_SIZE: usize, const LEVELS: usize, O: OsMemory> {
    os: O,
    /// The number of top-level blocks the arena is seeded with.
    num_blocks: usize,
    arena: Option<Arena>,
    orders: OrderTable<LEVELS>,
    counters: Counters,
}

impl<const BLK_SIZE: usize, const LEVELS: usize, O: OsMemory> BuddyMalloc<BLK_SIZE, LEVELS, O> {
    /// Constructs a new `BuddyMalloc` over `os` with an arena of
    /// [`DEFAULT_NUM_BLOCKS`] top-level blocks.
    ///
    /// No memory is requested until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if the const parameters violate the invariants listed on
    /// [`BuddyMalloc`].
    pub fn new(os: O) -> BuddyMalloc<BLK_SIZE, LEVELS, O> {
        match Self::try_with_blocks(DEFAULT_NUM_BLOCKS, os) {
            Ok(malloc) => malloc,
            Err(e) => panic!("buddy allocator geometry is unusable: {e}"),
        }
    }

    /// Constructs a new `BuddyMalloc` over `os` with an arena of
    /// `num_blocks` top-level blocks.
    ///
    /// No memory is requested until the first allocation.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig)` if `num_blocks` is zero
    /// or the arena would not fit in the address space.
    ///
    /// # Panics
    ///
    /// Panics if the const parameters violate the invariants listed on
    /// [`BuddyMalloc`].
    pub fn try_with_blocks(
        num_blocks: usize,
        os: O,
    ) -> Result<BuddyMalloc<BLK_SIZE, LEVELS, O>, AllocInitError> {
        Self::assert_const_param_invariants();
        Arena::layout(BLK_SIZE, num_blocks)?;

        Ok(BuddyMalloc {
            os,
            num_blocks,
            arena: None,
            orders: OrderTable::new(),
            counters: Counters::default(),
        })
    }

    fn assert_const_param_invariants() {
        Self::min_block_size();
    }

    fn min_block_size() -> usize {
        assert!(LEVELS > 0, "buddy allocator must have at least one level");
        assert!(
            BLK_SIZE.is_power_of_two(),
            "buddy allocator block size must be a power of two"
        );
        assert!(
            LEVELS < usize::BITS as usize,
            "buddy allocator cannot have more levels than bits in a usize"
        );

        let min_block_size = BLK_SIZE >> (LEVELS - 1);
        assert!(
            min_block_size > HEADER_SIZE,
            "buddy allocator minimum block size must exceed the block header"
        );

        min_block_size
    }

    #[inline]
    fn max_order() -> usize {
        LEVELS - 1
    }

    /// Returns the size in bytes of the header that precedes every payload.
    #[inline]
    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    /// Returns a reference to the OS backend.
    pub fn os(&self) -> &O {
        &self.os
    }

    fn check_size(size: usize) -> Result<(), AllocError> {
        if size == 0 || size > SIZE_LIMIT {
            return Err(AllocError::InvalidSize);
        }

        Ok(())
    }

    /// Returns the arena, reserving and seeding it first if necessary.
    fn arena(&mut self) -> Result<BasePtr, AllocError> {
        if let Some(arena) = self.arena.as_ref() {
            return Ok(arena.base());
        }

        // Validated at construction.
        let layout = Arena::layout(BLK_SIZE, self.num_blocks).map_err(|_| AllocError::Exhausted)?;
        let arena =
            Arena::reserve(&mut self.os, layout, BLK_SIZE).map_err(|_| AllocError::Exhausted)?;

        unsafe { arena.seed(self.orders.list_mut(Self::max_order())) };
        self.counters = Counters::seeded(arena.num_blocks(), BLK_SIZE);
        self.arena = Some(arena);

        Ok(arena.base())
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// On success, returns a pointer to `size` writable bytes. The contents
    /// are uninitialized, and the pointer is aligned to at least
    /// `align_of::<usize>()`.
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidSize` if `size` is zero or exceeds
    ///   [`SIZE_LIMIT`](crate::SIZE_LIMIT). No state is touched.
    /// - `AllocError::Exhausted` if the arena cannot be reserved, no free
    ///   block is large enough, or the OS refuses a mapping.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::check_size(size)?;
        let base = self.arena()?;

        let span = size + HEADER_SIZE;
        if span > BLK_SIZE {
            return self.map_block(size);
        }

        let order =
            buddy::order_for(span, Self::min_block_size()).ok_or(AllocError::InvalidSize)?;
        let block = self.take_block(base, order)?;

        Ok(base.payload_of(block))
    }

    /// Attempts to allocate `count * size` bytes, all set to zero.
    ///
    /// # Errors
    ///
    /// Fails as [`allocate`](Self::allocate) does, and with
    /// `AllocError::InvalidSize` if `count * size` overflows.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::InvalidSize)?;
        let ptr = self.allocate(total)?;

        // Reused arena blocks carry stale bytes.
        unsafe { ptr.as_ptr().write_bytes(0, total) };

        Ok(ptr)
    }

    /// Removes a free block of exactly `order` from the table, splitting a
    /// larger one if necessary, and marks it occupied.
    fn take_block(&mut self, base: BasePtr, order: usize) -> Result<NonZeroUsize, AllocError> {
        let Some(from) = self.orders.first_non_empty(order) else {
            debug!("no free block of order {} or above", order);
            return Err(AllocError::Exhausted);
        };

        let block = unsafe { self.orders.list_mut(from).pop_front(base) }
            .ok_or(AllocError::Exhausted)?;
        let block_ofs = base.offset_to(block);

        // Split the block repeatedly; the front half keeps the address and
        // the back half goes to the free list one order below.
        let mut size = buddy::block_size(from, Self::min_block_size());
        for lower in (order..from).rev() {
            size /= 2;

            let back_half = base.block_at(buddy::buddy_ofs(block_ofs, size));
            unsafe {
                base.init_header_at(back_half, BlockHeader::free(size));
                self.orders.list_mut(lower).insert(base, back_half);
            }

            self.counters.split();
        }

        unsafe { base.init_header_at(block, BlockHeader::occupied(size)) };

        Ok(block)
    }

    /// Maps a block holding `size` bytes of payload straight from the OS.
    fn map_block(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let span = size + HEADER_SIZE;
        let len = buddy::align_up(span, self.os.page_size()).ok_or(AllocError::InvalidSize)?;

        let Some(ptr) = self.os.map(len) else {
            debug!("failed to map {} bytes", len);
            return Err(AllocError::Exhausted);
        };

        trace!("mapped {} bytes at {:#x}", len, addr_of(ptr));

        unsafe {
            ptr.cast::<BlockHeader>()
                .as_ptr()
                .write(BlockHeader::occupied(span));
        }
        self.counters.mapped(size);

        // SAFETY: The mapping is at least a page, which holds the header.
        Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(HEADER_SIZE)) })
    }

    /// Returns a mapped block to the OS.
    ///
    /// # Safety
    ///
    /// `header` must be the header of a live mapped block.
    unsafe fn unmap_block(&mut self, header: NonNull<BlockHeader>) {
        let span = unsafe { header.as_ref().size };
        let len = buddy::align_up(span, self.os.page_size()).unwrap_or(span);

        trace!("unmapping {} bytes at {:#x}", len, addr_of(header));

        unsafe { self.os.unmap(header.cast(), len) };
        self.counters.unmapped(span - HEADER_SIZE);
    }

    /// Returns the buddy of the block at `block` if the two can be merged:
    /// the buddy is free, has the same size, and `size` is below the top
    /// order.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a block of `size` bytes in `base`.
    unsafe fn mergeable_buddy(
        &self,
        base: BasePtr,
        block: NonZeroUsize,
        size: usize,
    ) -> Option<NonZeroUsize> {
        if buddy::order_of(size, Self::min_block_size()) >= Self::max_order() {
            return None;
        }

        let buddy = base.block_at(buddy::buddy_ofs(base.offset_to(block), size));
        let header = unsafe { base.header_mut(buddy) };

        (header.is_free && header.size == size).then_some(buddy)
    }

    /// Merges the block at `block` with its buddies for as long as they are
    /// free and the merged size is below `limit`.
    ///
    /// Returns the address of the merged block and its size; its header
    /// records the new size, and nothing else in it is changed.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a block in `base` that is not in any
    /// free list.
    unsafe fn coalesce(
        &mut self,
        base: BasePtr,
        mut block: NonZeroUsize,
        limit: usize,
    ) -> (NonZeroUsize, usize) {
        let mut size = unsafe { base.header_mut(block).size };

        while size < limit {
            let Some(buddy) = (unsafe { self.mergeable_buddy(base, block, size) }) else {
                break;
            };

            let order = buddy::order_of(size, Self::min_block_size());
            unsafe { self.orders.list_mut(order).remove(base, buddy) };
            self.counters.merge();

            block = cmp::min(block, buddy);
            size *= 2;
            unsafe { base.header_mut(block).size = size };
        }

        (block, size)
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// Passing `None` does nothing. Releasing an arena block that is already
    /// free does nothing either.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or denote a block of memory allocated by this
    /// allocator that has not since been passed to
    /// [`reallocate`](Self::reallocate). A mapped block must not be released
    /// twice.
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };

        let header = BlockHeader::of_payload(ptr);
        if unsafe { header.as_ref().size } > BLK_SIZE {
            unsafe { self.unmap_block(header) };
            return;
        }

        let Some(base) = self.arena.as_ref().map(Arena::base) else {
            debug_assert!(false, "released an arena block before the arena exists");
            return;
        };

        let block = addr_of(header);
        let header = unsafe { base.header_mut(block) };
        if header.is_free {
            trace!("ignoring release of free block {:#x}", block);
            return;
        }
        header.is_free = true;

        let (block, size) = unsafe { self.coalesce(base, block, usize::MAX) };
        let order = buddy::order_of(size, Self::min_block_size());
        unsafe { self.orders.list_mut(order).insert(base, block) };
    }

    /// Resizes the allocation at `ptr` to hold `size` bytes.
    ///
    /// Passing `None` behaves like [`allocate`](Self::allocate). An arena
    /// block that is already large enough is returned unchanged; otherwise
    /// the block grows in place by absorbing free buddies if that suffices,
    /// and is moved to a new allocation if not. The first
    /// `min(old size, size)` bytes are preserved in every case.
    ///
    /// On success the old pointer must no longer be used, even if the
    /// returned pointer is different only because the block grew downwards.
    ///
    /// # Errors
    ///
    /// Fails as [`allocate`](Self::allocate) does. On failure the original
    /// allocation is left intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or denote a live block of memory allocated by this
    /// allocator.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        Self::check_size(size)?;

        let Some(ptr) = ptr else {
            return self.allocate(size);
        };

        let span = size + HEADER_SIZE;
        let header = BlockHeader::of_payload(ptr);
        let old_size = unsafe { header.as_ref().size };
        let old_payload = old_size - HEADER_SIZE;

        if old_size > BLK_SIZE {
            if old_size == span {
                return Ok(ptr);
            }

            return unsafe { self.move_block(ptr, old_payload, size) };
        }

        if old_size >= span {
            return Ok(ptr);
        }

        let base = self.arena.as_ref().map(Arena::base).ok_or(AllocError::Exhausted)?;
        let block = addr_of(header);

        if let Some(grown) = unsafe { self.grow_in_place(base, block, span) } {
            return Ok(grown);
        }

        unsafe { self.move_block(ptr, old_payload, size) }
    }

    /// Grows the occupied block at `block` to at least `span` bytes by
    /// absorbing free buddies, returning the new payload pointer.
    ///
    /// Returns `None`, touching nothing, if the buddies cannot supply enough
    /// room.
    ///
    /// # Safety
    ///
    /// `block` must be the address of an occupied block in `base`.
    unsafe fn grow_in_place(
        &mut self,
        base: BasePtr,
        block: NonZeroUsize,
        span: usize,
    ) -> Option<NonNull<u8>> {
        let old_size = unsafe { base.header_mut(block).size };

        // Walk the merge chain without modifying anything first, so that a
        // chain that falls short leaves the heap untouched.
        let mut probe = block;
        let mut size = old_size;
        while size < span {
            let buddy = unsafe { self.mergeable_buddy(base, probe, size) }?;
            probe = cmp::min(probe, buddy);
            size *= 2;
        }

        let (merged, size) = unsafe { self.coalesce(base, block, span) };
        debug_assert_eq!(merged, probe);

        let payload = base.payload_of(merged);
        if merged != block {
            // The block grew downwards; slide the payload to the new start.
            unsafe {
                core::ptr::copy(
                    base.payload_of(block).as_ptr(),
                    payload.as_ptr(),
                    old_size - HEADER_SIZE,
                );
            }
        }

        unsafe { base.init_header_at(merged, BlockHeader::occupied(size)) };

        Some(payload)
    }

    /// Moves the allocation at `ptr` into a fresh allocation of `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation with `old_payload` usable bytes.
    unsafe fn move_block(
        &mut self,
        ptr: NonNull<u8>,
        old_payload: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let fresh = self.allocate(size)?;

        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                fresh.as_ptr(),
                cmp::min(old_payload, size),
            );
            self.release(Some(ptr));
        }

        Ok(fresh)
    }

    /// Returns a snapshot of the allocator's statistics.
    pub fn stats(&self) -> Stats {
        let min_block_size = Self::min_block_size();

        Stats {
            free_blocks: self.orders.free_blocks(),
            free_bytes: self
                .orders
                .lens()
                .map(|(order, len)| len * (buddy::block_size(order, min_block_size) - HEADER_SIZE))
                .sum(),
            allocated_blocks: self.counters.blocks(),
            allocated_bytes: self.counters.bytes(),
            metadata_bytes: self.counters.metadata_bytes(),
            header_size: HEADER_SIZE,
        }
    }

    /// Returns the number of blocks in the free lists.
    pub fn free_block_count(&self) -> usize {
        self.orders.free_blocks()
    }

    /// Returns the payload bytes of the blocks in the free lists.
    pub fn free_byte_count(&self) -> usize {
        self.stats().free_bytes
    }

    /// Returns the number of blocks, free or occupied, including mapped
    /// blocks.
    pub fn allocated_block_count(&self) -> usize {
        self.counters.blocks()
    }

    /// Returns the payload bytes of every block, free or occupied, including
    /// mapped blocks.
    pub fn allocated_byte_count(&self) -> usize {
        self.counters.bytes()
    }

    /// Returns the bytes spent on block headers.
    pub fn metadata_byte_count(&self) -> usize {
        self.counters.metadata_bytes()
    }

    /// Returns the arena offsets of the free blocks at each order.
    #[cfg(test)]
    pub(crate) fn free_offsets(&self) -> std::vec::Vec<std::vec::Vec<usize>> {
        let Some(base) = self.arena.as_ref().map(Arena::base) else {
            return vec![vec![]; LEVELS];
        };

        (0..LEVELS)
            .map(|order| {
                unsafe { self.orders.list(order).iter(base) }
                    .map(|b| base.offset_to(b))
                    .collect()
            })
            .collect()
    }

    /// Returns the arena offset of the block holding `ptr`, if it is an
    /// arena block.
    #[cfg(test)]
    pub(crate) fn arena_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.arena.as_ref()?.base();
        let block = addr_of(BlockHeader::of_payload(ptr));

        base.contains_addr(block).then(|| base.offset_to(block))
    }

    /// Returns the arena extent, once reserved.
    #[cfg(test)]
    pub(crate) fn arena_size(&self) -> Option<usize> {
        self.arena.as_ref().map(|a| a.base().extent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec::Vec;

    use crate::{os::ReservedHeap, Malloc, MAX_BLOCK_SIZE};

    /// Enough for the default arena and its worst-case alignment padding.
    const HEAP: usize = 16 << 20;

    fn malloc() -> Malloc<ReservedHeap> {
        BuddyMalloc::new(ReservedHeap::new(HEAP))
    }

    fn arena_bytes() -> usize {
        DEFAULT_NUM_BLOCKS * MAX_BLOCK_SIZE
    }

    #[test]
    fn nothing_is_reserved_before_the_first_request() {
        let m = malloc();

        assert_eq!(m.os().used(), 0);
        assert_eq!(m.stats(), Stats {
            header_size: HEADER_SIZE,
            ..Stats::default()
        });
    }

    #[test]
    fn invalid_sizes_touch_nothing() {
        let mut m = malloc();

        assert_eq!(m.allocate(0), Err(AllocError::InvalidSize));
        assert_eq!(m.allocate(SIZE_LIMIT + 1), Err(AllocError::InvalidSize));
        assert_eq!(m.allocate_zeroed(usize::MAX, 2), Err(AllocError::InvalidSize));
        assert_eq!(m.allocate_zeroed(0, 16), Err(AllocError::InvalidSize));
        assert_eq!(
            unsafe { m.reallocate(None, 0) },
            Err(AllocError::InvalidSize)
        );
        assert_eq!(m.os().used(), 0);
        assert_eq!(m.allocated_block_count(), 0);

        m.allocate(1).unwrap();
        let before = m.stats();
        assert_eq!(m.allocate(0), Err(AllocError::InvalidSize));
        assert_eq!(m.allocate(SIZE_LIMIT + 1), Err(AllocError::InvalidSize));
        assert_eq!(m.stats(), before);
    }

    #[test]
    fn small_request_splits_down_to_the_smallest_fitting_order() {
        let mut m = malloc();

        let p = m.allocate(100).unwrap();

        // 100 + header fits in 256 bytes: order 1, reached by splitting a
        // top-level block nine times.
        let header = unsafe { *BlockHeader::of_payload(p).as_ref() };
        assert_eq!(header.size, 256);
        assert!(!header.is_free);
        assert_eq!(m.arena_offset(p), Some(0));

        assert_eq!(m.allocated_block_count(), DEFAULT_NUM_BLOCKS + 9);
        assert_eq!(m.free_block_count(), DEFAULT_NUM_BLOCKS - 1 + 9);
        assert_eq!(
            m.allocated_byte_count(),
            arena_bytes() - (DEFAULT_NUM_BLOCKS + 9) * HEADER_SIZE
        );
        assert_eq!(
            m.metadata_byte_count(),
            (DEFAULT_NUM_BLOCKS + 9) * HEADER_SIZE
        );

        let free = m.free_offsets();
        assert!(free[0].is_empty());
        for order in 1..10 {
            assert_eq!(free[order], [128 << order]);
        }
        assert_eq!(free[10].len(), DEFAULT_NUM_BLOCKS - 1);

        // The payload is usable.
        unsafe { p.as_ptr().write_bytes(0xEE, 100) };
    }

    #[test]
    fn free_bytes_match_the_free_lists() {
        let mut m = malloc();

        m.allocate(100).unwrap();
        m.allocate(5000).unwrap();

        let expected: usize = m
            .free_offsets()
            .iter()
            .enumerate()
            .map(|(order, blocks)| blocks.len() * ((128 << order) - HEADER_SIZE))
            .sum();

        assert_eq!(m.free_byte_count(), expected);
        assert_eq!(m.stats().free_bytes, expected);
    }

    #[test]
    fn release_then_allocate_reuses_the_block() {
        let mut m = malloc();

        let _keep = m.allocate(40).unwrap();
        let p = m.allocate(300).unwrap();
        let stats = m.stats();

        unsafe { m.release(Some(p)) };
        let q = m.allocate(300).unwrap();

        assert_eq!(p, q);
        assert_eq!(m.stats(), stats);
    }

    #[test]
    fn large_request_is_mapped_and_unmapped() {
        let mut m = malloc();
        m.allocate(1).unwrap();
        let before = m.stats();

        let p = m.allocate(200_000).unwrap();

        assert_eq!(m.arena_offset(p), None);
        assert_eq!(addr_of(p).get() % crate::os::page_size(), HEADER_SIZE);
        let header = unsafe { *BlockHeader::of_payload(p).as_ref() };
        assert_eq!(header.size, 200_000 + HEADER_SIZE);

        assert_eq!(m.allocated_block_count(), before.allocated_blocks + 1);
        assert_eq!(m.allocated_byte_count(), before.allocated_bytes + 200_000);
        assert_eq!(m.free_block_count(), before.free_blocks);

        unsafe {
            core::slice::from_raw_parts_mut(p.as_ptr(), 200_000).fill(7);
            m.release(Some(p));
        }

        assert_eq!(m.stats(), before);
    }

    #[test]
    fn span_just_over_the_top_order_is_mapped() {
        let mut m = malloc();

        let fits = m.allocate(MAX_BLOCK_SIZE - HEADER_SIZE).unwrap();
        assert!(m.arena_offset(fits).is_some());

        let mapped = m.allocate(MAX_BLOCK_SIZE - HEADER_SIZE + 1).unwrap();
        assert_eq!(m.arena_offset(mapped), None);

        unsafe {
            m.release(Some(mapped));
            m.release(Some(fits));
        }
    }

    #[test]
    fn sibling_blocks_merge_when_both_are_freed() {
        let mut m = malloc();

        let a = m.allocate(100).unwrap();
        let b = m.allocate(100).unwrap();
        assert_eq!(m.arena_offset(a), Some(0));
        assert_eq!(m.arena_offset(b), Some(256));

        unsafe { m.release(Some(a)) };
        assert_eq!(m.free_offsets()[1], [0]);

        unsafe { m.release(Some(b)) };

        // Everything coalesces back into the top-level block.
        let free = m.free_offsets();
        assert!(free[..10].iter().all(Vec::is_empty));
        assert_eq!(free[10].len(), DEFAULT_NUM_BLOCKS);
        assert_eq!(free[10][0], 0);
        assert_eq!(m.allocated_block_count(), DEFAULT_NUM_BLOCKS);
        assert_eq!(
            m.allocated_byte_count(),
            DEFAULT_NUM_BLOCKS * (MAX_BLOCK_SIZE - HEADER_SIZE)
        );
    }

    #[test]
    fn merging_stops_at_an_occupied_buddy() {
        let mut m = malloc();

        let a = m.allocate(100).unwrap(); // 0
        let b = m.allocate(100).unwrap(); // 256
        let c = m.allocate(300).unwrap(); // 512

        unsafe {
            m.release(Some(a));
            m.release(Some(b));
        }

        // 0 and 256 merge into a 512-byte block whose buddy at 512 is taken.
        let free = m.free_offsets();
        assert!(free[1].is_empty());
        assert_eq!(free[2], [0]);

        unsafe { m.release(Some(c)) };
        assert_eq!(m.free_offsets()[10].len(), DEFAULT_NUM_BLOCKS);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut m = malloc();

        let _keep = m.allocate(100).unwrap();
        let p = m.allocate(100).unwrap();

        unsafe { m.release(Some(p)) };
        let stats = m.stats();

        unsafe { m.release(Some(p)) };
        assert_eq!(m.stats(), stats);

        unsafe { m.release(None) };
        assert_eq!(m.stats(), stats);
    }

    #[test]
    fn top_level_blocks_never_merge() {
        let mut m = malloc();

        let blocks: Vec<_> = (0..DEFAULT_NUM_BLOCKS)
            .map(|_| m.allocate(MAX_BLOCK_SIZE - HEADER_SIZE).unwrap())
            .collect();

        assert_eq!(m.free_block_count(), 0);
        assert_eq!(m.allocate(1), Err(AllocError::Exhausted));

        for p in blocks {
            unsafe { m.release(Some(p)) };
        }

        assert_eq!(m.free_offsets()[10].len(), DEFAULT_NUM_BLOCKS);
        assert_eq!(m.allocated_block_count(), DEFAULT_NUM_BLOCKS);
    }

    #[test]
    fn exhausted_arena_is_not_grown() {
        let mut m = malloc();

        for _ in 0..DEFAULT_NUM_BLOCKS {
            m.allocate(70_000).unwrap();
        }
        let used = m.os().used();

        assert_eq!(m.allocate(10), Err(AllocError::Exhausted));
        assert_eq!(m.os().used(), used);

        // Mappings still work.
        assert!(m.allocate(MAX_BLOCK_SIZE).is_ok());
    }

    #[test]
    fn allocate_zeroed_clears_reused_memory() {
        let mut m = malloc();

        let p = m.allocate(256).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0xFF, 256);
            m.release(Some(p));
        }

        let q = m.allocate_zeroed(16, 16).unwrap();
        assert_eq!(p, q);

        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn reallocate_none_allocates() {
        let mut m = malloc();

        let p = unsafe { m.reallocate(None, 64) }.unwrap();
        assert_eq!(m.arena_offset(p), Some(0));
    }

    #[test]
    fn reallocate_within_the_block_is_a_no_op() {
        let mut m = malloc();

        let p = m.allocate(100).unwrap();
        let stats = m.stats();

        // Both still fit in the 256-byte block; shrinking never moves.
        assert_eq!(unsafe { m.reallocate(Some(p), 256 - HEADER_SIZE) }, Ok(p));
        assert_eq!(unsafe { m.reallocate(Some(p), 1) }, Ok(p));
        assert_eq!(m.stats(), stats);
    }

    #[test]
    fn reallocate_grows_into_a_free_upper_buddy() {
        let mut m = malloc();

        let p = m.allocate(100).unwrap(); // order 1 at 0
        unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 100).fill(0x42) };
        let blocks = m.allocated_block_count();

        // 600 + header needs 1024 bytes: the buddy at 256 is absorbed, then
        // the one at 512.
        let q = unsafe { m.reallocate(Some(p), 600) }.unwrap();

        assert_eq!(q, p);
        let header = unsafe { *BlockHeader::of_payload(q).as_ref() };
        assert_eq!(header.size, 1024);
        assert!(!header.is_free);
        assert_eq!(m.allocated_block_count(), blocks - 2);

        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn reallocate_stops_merging_once_the_block_fits() {
        let mut m = malloc();

        let p = m.allocate(100).unwrap(); // order 1 at 0
        let blocks = m.allocated_block_count();

        // 400 + header fits in 512 bytes, so only the buddy at 256 goes.
        let q = unsafe { m.reallocate(Some(p), 400) }.unwrap();

        assert_eq!(q, p);
        let header = unsafe { *BlockHeader::of_payload(q).as_ref() };
        assert_eq!(header.size, 512);
        assert_eq!(m.allocated_block_count(), blocks - 1);
        assert_eq!(m.free_offsets()[2], [512]);
    }

    #[test]
    fn reallocate_grows_down_then_up() {
        let mut m = malloc();

        let low = m.allocate(100).unwrap(); // 0
        let p = m.allocate(100).unwrap(); // 256
        assert_eq!(m.free_offsets()[2], [512]);

        let data: Vec<u8> = (0..100).rev().collect();
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len());
            m.release(Some(low));
        }
        let blocks = m.allocated_block_count();

        // Merges with the free block at 0, then with the one at 512.
        let q = unsafe { m.reallocate(Some(p), 600) }.unwrap();

        assert_eq!(m.arena_offset(q), Some(0));
        let header = unsafe { *BlockHeader::of_payload(q).as_ref() };
        assert_eq!(header.size, 1024);
        assert!(!header.is_free);
        assert_eq!(m.allocated_block_count(), blocks - 2);

        let free = m.free_offsets();
        assert!(free[..3].iter().all(Vec::is_empty));
        assert_eq!(free[3], [1024]);

        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 100) };
        assert_eq!(bytes, &data[..]);

        unsafe { m.release(Some(q)) };
        assert_eq!(m.free_offsets()[10].len(), DEFAULT_NUM_BLOCKS);
        assert_eq!(m.allocated_block_count(), DEFAULT_NUM_BLOCKS);
    }

    #[test]
    fn reallocate_grows_into_a_free_lower_buddy() {
        let mut m = malloc();

        let low = m.allocate(100).unwrap(); // 0
        let p = m.allocate(100).unwrap(); // 256
        assert_eq!(m.arena_offset(p), Some(256));

        let data: Vec<u8> = (0..100).collect();
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len());
            m.release(Some(low));
        }

        let q = unsafe { m.reallocate(Some(p), 300) }.unwrap();

        assert_eq!(m.arena_offset(q), Some(0));
        let header = unsafe { *BlockHeader::of_payload(q).as_ref() };
        assert_eq!(header.size, 512);
        assert!(!header.is_free);

        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 100) };
        assert_eq!(bytes, &data[..]);

        // The block is whole again: releasing it restores a pristine arena.
        unsafe { m.release(Some(q)) };
        assert_eq!(m.free_offsets()[10].len(), DEFAULT_NUM_BLOCKS);
        assert_eq!(m.allocated_block_count(), DEFAULT_NUM_BLOCKS);
    }

    #[test]
    fn reallocate_moves_when_buddies_fall_short() {
        let mut m = malloc();

        let p = m.allocate(100).unwrap(); // 0, buddy 256 free
        let _pin = m.allocate(300).unwrap(); // 512, blocks the second merge
        unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 100).fill(0x17) };

        let free_before = m.free_offsets();

        // Merging with 256 reaches 512 bytes only; 2000 needs a move.
        let q = unsafe { m.reallocate(Some(p), 2000) }.unwrap();

        assert_ne!(q, p);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0x17));

        // The old block was released and merged with its buddy at 256.
        let free = m.free_offsets();
        assert_eq!(free[2], [0]);
        assert!(!free_before[1].is_empty());
        assert!(free[1].is_empty());
    }

    #[test]
    fn reallocate_failure_keeps_the_original() {
        let mut m = malloc();

        for _ in 0..DEFAULT_NUM_BLOCKS - 1 {
            m.allocate(70_000).unwrap();
        }

        // Two halves of the last top-level block.
        let p = m.allocate(40_000).unwrap();
        let _q = m.allocate(40_000).unwrap();
        assert_eq!(m.free_block_count(), 0);
        unsafe { p.as_ptr().write(9) };
        let stats = m.stats();

        assert_eq!(
            unsafe { m.reallocate(Some(p), 70_000) },
            Err(AllocError::Exhausted)
        );
        assert_eq!(m.stats(), stats);
        assert_eq!(unsafe { p.as_ptr().read() }, 9);
    }

    #[test]
    fn reallocate_mapped_blocks() {
        let mut m = malloc();

        let p = m.allocate(200_000).unwrap();
        unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 200_000).fill(3) };

        assert_eq!(unsafe { m.reallocate(Some(p), 200_000) }, Ok(p));

        let bigger = unsafe { m.reallocate(Some(p), 300_000) }.unwrap();
        let header = unsafe { *BlockHeader::of_payload(bigger).as_ref() };
        assert_eq!(header.size, 300_000 + HEADER_SIZE);
        let bytes = unsafe { core::slice::from_raw_parts(bigger.as_ptr(), 200_000) };
        assert!(bytes.iter().all(|&b| b == 3));

        // Shrinking a mapping into the arena copies only what fits.
        let small = unsafe { m.reallocate(Some(bigger), 1000) }.unwrap();
        assert!(m.arena_offset(small).is_some());
        let bytes = unsafe { core::slice::from_raw_parts(small.as_ptr(), 1000) };
        assert!(bytes.iter().all(|&b| b == 3));

        // Only the arena block is left beside the arena itself.
        let arena_blocks = m.free_block_count() + 1;
        assert_eq!(m.allocated_block_count(), arena_blocks);
    }

    #[test]
    fn failed_reservation_is_retried() {
        /// Refuses to grow until told otherwise.
        #[derive(Debug)]
        struct Flaky {
            inner: ReservedHeap,
            refuse: bool,
        }

        impl OsMemory for Flaky {
            fn extend_heap(&mut self, increment: usize) -> Option<NonNull<u8>> {
                if self.refuse {
                    return None;
                }
                self.inner.extend_heap(increment)
            }

            fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
                self.inner.map(len)
            }

            unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
                unsafe { self.inner.unmap(ptr, len) }
            }
        }

        let mut m: Malloc<Flaky> = BuddyMalloc::new(Flaky {
            inner: ReservedHeap::new(HEAP),
            refuse: true,
        });

        assert_eq!(m.allocate(10), Err(AllocError::Exhausted));
        assert_eq!(m.allocate(1 << 20), Err(AllocError::Exhausted));
        assert_eq!(m.allocated_block_count(), 0);

        m.os.refuse = false;
        assert!(m.allocate(10).is_ok());
        assert_eq!(m.arena_size(), Some(arena_bytes()));
    }

    #[test]
    fn custom_geometry() {
        let mut m: BuddyMalloc<4096, 7, ReservedHeap> =
            BuddyMalloc::try_with_blocks(2, ReservedHeap::new(1 << 20)).unwrap();

        // 64-byte minimum blocks.
        let p = m.allocate(1).unwrap();
        let header = unsafe { *BlockHeader::of_payload(p).as_ref() };
        assert_eq!(header.size, 64);
        assert_eq!(m.allocated_block_count(), 2 + 6);

        assert!(BuddyMalloc::<4096, 7, ReservedHeap>::try_with_blocks(0, ReservedHeap::new(0))
            .is_err());
    }

    #[test]
    #[should_panic]
    fn header_sized_minimum_block_is_rejected() {
        let _ = BuddyMalloc::<4096, 10, ReservedHeap>::new(ReservedHeap::new(0));
    }
}
