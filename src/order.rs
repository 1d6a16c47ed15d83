//! Per-order free lists.

use core::num::NonZeroUsize;

use crate::base::BasePtr;

/// An address-ordered, intrusive, doubly linked list of free blocks of one
/// order.
///
/// The links live in the headers of the blocks themselves, so the list never
/// allocates. The lowest address is always at the head.
#[derive(Debug)]
pub struct FreeList {
    head: Option<NonZeroUsize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Inserts `block` before the first entry with a greater address, or at
    /// the tail if there is none, and marks it free.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be the address of an initialized header within `base`.
    /// - `block` must not be an element of any free list.
    pub unsafe fn insert(&mut self, base: BasePtr, block: NonZeroUsize) {
        let mut prev = None;
        let mut current = self.head;

        while let Some(cur) = current {
            if cur > block {
                break;
            }

            debug_assert_ne!(cur, block, "block is already in the free list");
            prev = Some(cur);
            current = unsafe { base.header_mut(cur).next };
        }

        unsafe {
            let header = base.header_mut(block);
            header.is_free = true;
            header.prev = prev;
            header.next = current;

            match prev {
                Some(p) => base.header_mut(p).next = Some(block),
                None => self.head = Some(block),
            }

            if let Some(n) = current {
                base.header_mut(n).prev = Some(block);
            }
        }

        self.len += 1;
    }

    /// Removes the specified block from the free list.
    ///
    /// The block's `is_free` flag is left untouched.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<BlockHeader>()` bytes.
    /// - `block` must be the address of an element of this free list.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = base.header_mut(block);
            let (prev, next) = (removed.prev.take(), removed.next.take());

            match prev {
                // Link `prev` forward to `next`.
                Some(p) => base.header_mut(p).next = next,

                // If there's no previous block, then `removed` is the head of
                // the free list.
                None => self.head = next,
            }

            if let Some(n) = next {
                // Link `next` back to `prev`.
                base.header_mut(n).prev = prev;
            }
        }

        self.len -= 1;
    }

    /// Removes and returns the lowest-addressed block.
    ///
    /// # Safety
    ///
    /// Every element of the list must be an initialized header within `base`.
    pub unsafe fn pop_front(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;
        unsafe { self.remove(base, head) };
        Some(head)
    }

    /// Returns an iterator over the addresses in the list, lowest first.
    ///
    /// # Safety
    ///
    /// Every element of the list must be an initialized header within `base`,
    /// and the list must not be modified while the iterator is in use.
    #[cfg(test)]
    pub unsafe fn iter(&self, base: BasePtr) -> Iter {
        Iter {
            base,
            current: self.head,
        }
    }
}

#[cfg(test)]
pub struct Iter {
    base: BasePtr,
    current: Option<NonZeroUsize>,
}

#[cfg(test)]
impl Iterator for Iter {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.current?;
        // SAFETY: upheld by the caller of `FreeList::iter`.
        self.current = unsafe { self.base.header_mut(cur).next };
        Some(cur)
    }
}

/// One free list per order, smallest blocks first.
#[derive(Debug)]
pub struct OrderTable<const LEVELS: usize> {
    lists: [FreeList; LEVELS],
}

impl<const LEVELS: usize> OrderTable<LEVELS> {
    pub const fn new() -> OrderTable<LEVELS> {
        const EMPTY: FreeList = FreeList::new();

        OrderTable {
            lists: [EMPTY; LEVELS],
        }
    }

    #[cfg(test)]
    pub fn list(&self, order: usize) -> &FreeList {
        &self.lists[order]
    }

    #[inline]
    pub fn list_mut(&mut self, order: usize) -> &mut FreeList {
        &mut self.lists[order]
    }

    /// Returns the lowest order at or above `order` with a free block.
    pub fn first_non_empty(&self, order: usize) -> Option<usize> {
        (order..LEVELS).find(|&o| !self.lists[o].is_empty())
    }

    /// Returns the number of free blocks across all orders.
    pub fn free_blocks(&self) -> usize {
        self.lists.iter().map(FreeList::len).sum()
    }

    /// Returns `(order, free blocks)` for every order.
    pub fn lens(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.lists.iter().map(FreeList::len).enumerate()
    }
}
