//! Arena reservation.

use core::{alloc::Layout, num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "log")]
use log::{debug, warn};

#[allow(unused_imports)]
use sptr::Strict;

use crate::{
    base::{addr_of, BasePtr, BlockHeader},
    buddy,
    order::FreeList,
    os::OsMemory,
    AllocInitError,
};

/// The region of the heap that backs every buddy block.
#[derive(Copy, Clone, Debug)]
pub struct Arena {
    base: BasePtr,
    block_size: usize,
    num_blocks: usize,
}

impl Arena {
    /// Returns the layout of an arena of `num_blocks` blocks of `block_size`
    /// bytes.
    ///
    /// The alignment is the arena size rounded up to a power of two, so that
    /// every block is aligned to its own size at every order.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig)` if `num_blocks` is zero
    /// or the arena size overflows.
    pub fn layout(block_size: usize, num_blocks: usize) -> Result<Layout, AllocInitError> {
        if num_blocks == 0 || !block_size.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig);
        }

        let size = block_size
            .checked_mul(num_blocks)
            .ok_or(AllocInitError::InvalidConfig)?;
        let align = size
            .checked_next_power_of_two()
            .ok_or(AllocInitError::InvalidConfig)?;

        Layout::from_size_align(size, align).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Grows the heap to hold an arena of `layout`, discarding the unaligned
    /// prefix.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::AllocFailed(layout))` if the heap cannot
    /// be grown.
    pub fn reserve<O: OsMemory>(
        os: &mut O,
        layout: Layout,
        block_size: usize,
    ) -> Result<Arena, AllocInitError> {
        let failed = || {
            warn!(
                "failed to reserve {} bytes aligned to {} for the arena",
                layout.size(),
                layout.align()
            );
            AllocInitError::AllocFailed(layout)
        };

        let brk = os.extend_heap(0).ok_or_else(failed)?;
        let aligned = buddy::align_up(addr_of(brk).get(), layout.align()).ok_or_else(failed)?;
        let increment = (aligned - addr_of(brk).get())
            .checked_add(layout.size())
            .ok_or_else(failed)?;

        let start = os.extend_heap(increment).ok_or_else(failed)?;
        let start_addr = addr_of(start).get();

        // The break should not have moved between the two calls, but the
        // reservation is only usable if the aligned arena fits in what was
        // actually granted.
        let aligned = buddy::align_up(start_addr, layout.align()).ok_or_else(failed)?;
        if aligned - start_addr + layout.size() > increment {
            return Err(failed());
        }

        // SAFETY: `aligned >= start_addr > 0`.
        let ptr = unsafe { NonNull::new_unchecked(start.as_ptr().with_addr(aligned)) };

        debug!(
            "reserved arena of {} blocks at {:#x} ({} bytes of padding)",
            layout.size() / block_size,
            aligned,
            aligned - start_addr
        );

        Ok(Arena {
            base: BasePtr::new(ptr, layout.size()),
            block_size,
            num_blocks: layout.size() / block_size,
        })
    }

    #[inline]
    pub fn base(&self) -> BasePtr {
        self.base
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Writes a free header at the start of every top-level block and links
    /// them all into `list`.
    ///
    /// # Safety
    ///
    /// The arena must be freshly reserved, and `list` must be empty.
    pub unsafe fn seed(&self, list: &mut FreeList) {
        debug_assert!(list.is_empty());

        for block_idx in 0..self.num_blocks {
            let block: NonZeroUsize = self.base.block_at(block_idx * self.block_size);

            unsafe {
                self.base
                    .init_header_at(block, BlockHeader::free(self.block_size));
                list.insert(self.base, block);
            }
        }
    }
}
