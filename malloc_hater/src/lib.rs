#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_malloc::{AllocError, AllocInitError, BuddyMalloc, Malloc, OsMemory, ReservedHeap};

/// Heap capacity for the default geometry: the arena plus its worst-case
/// alignment padding.
pub const DEFAULT_HEAP: usize = 16 << 20;

pub struct MallocSubject<const BLK_SIZE: usize, const LEVELS: usize, O: OsMemory>(
    BuddyMalloc<BLK_SIZE, LEVELS, O>,
);

impl MallocSubject<{ buddy_malloc::MAX_BLOCK_SIZE }, { buddy_malloc::ORDERS }, ReservedHeap> {
    /// Creates a subject with the default geometry over a private heap.
    pub fn new() -> Self {
        MallocSubject(Malloc::<ReservedHeap>::new(ReservedHeap::new(DEFAULT_HEAP)))
    }
}

impl Default for MallocSubject<{ buddy_malloc::MAX_BLOCK_SIZE }, { buddy_malloc::ORDERS }, ReservedHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BLK_SIZE: usize, const LEVELS: usize> MallocSubject<BLK_SIZE, LEVELS, ReservedHeap> {
    pub fn with_blocks(num_blocks: usize) -> Result<Self, AllocInitError> {
        let size = BLK_SIZE
            .checked_mul(num_blocks)
            .and_then(usize::checked_next_power_of_two)
            .ok_or(AllocInitError::InvalidConfig)?;

        let m = BuddyMalloc::try_with_blocks(num_blocks, ReservedHeap::new(2 * size))?;
        Ok(MallocSubject(m))
    }
}

impl<const BLK_SIZE: usize, const LEVELS: usize, O: OsMemory> MallocSubject<BLK_SIZE, LEVELS, O> {
    pub fn inner(&self) -> &BuddyMalloc<BLK_SIZE, LEVELS, O> {
        &self.0
    }
}

impl<const BLK_SIZE: usize, const LEVELS: usize, O: OsMemory> Subject
    for MallocSubject<BLK_SIZE, LEVELS, O>
{
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError> {
        unsafe { self.0.reallocate(Some(ptr), size) }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.release(Some(ptr)) };
    }
}
