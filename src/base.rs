use core::{mem, num::NonZeroUsize, ptr::NonNull};

// Shadowed by the inherent methods on toolchains that provide them.
#[allow(unused_imports)]
use sptr::Strict;

/// Size in bytes of the header that precedes every block's payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Returns the address of `ptr`.
#[inline]
pub fn addr_of<T>(ptr: NonNull<T>) -> NonZeroUsize {
    // SAFETY: The pointer is guaranteed by the type to be non-null, meaning
    // that the address will be non-zero.
    unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr().addr()) }
}

/// A pointer to the base of the arena.
///
/// Blocks inside the arena are named by their address alone. Any pointer to a
/// block must be acquired through this type, and NOT by casting a stored
/// address directly.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        addr_of(ptr)
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        addr_of(self.ptr)
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Cannot overflow; checked in `new`.
        NonZeroUsize::new(self.addr().get() + self.extent).unwrap()
    }

    #[cfg(test)]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(block));

        block.get() - self.addr().get()
    }

    /// Returns the address of the block which starts `offset` bytes from the
    /// base.
    #[inline]
    pub fn block_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent, "offset out of region");

        // `offset < extent`, and `addr + extent` was checked in `new`.
        NonZeroUsize::new(self.addr().get() + offset).unwrap()
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        let raw = self.ptr.as_ptr().with_addr(addr.get());

        // SAFETY: `addr` is non-zero.
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// Returns a pointer to the payload of the block at `block`.
    #[inline]
    pub fn payload_of(self, block: NonZeroUsize) -> NonNull<u8> {
        let raw = self.with_addr(block).as_ptr().wrapping_add(HEADER_SIZE);

        // SAFETY: A block is larger than its header, so the payload lies
        // inside the region and cannot be null.
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// Initializes a `BlockHeader` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockHeader` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockHeader>()` bytes.
    /// - No reference to the header at `addr` may be live.
    #[inline]
    pub unsafe fn init_header_at(self, addr: NonZeroUsize, header: BlockHeader) {
        debug_assert!(
            header.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            header.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe {
            self.with_addr(addr)
                .cast::<BlockHeader>()
                .as_ptr()
                .write(header)
        };
    }

    /// Returns a mutable reference to the `BlockHeader` at `block`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be the address of a block inside the region.
    /// - The memory at `block` must contain a properly initialized
    ///   `BlockHeader` value.
    /// - No other reference to the same header may be live while the returned
    ///   reference is used.
    #[inline]
    pub unsafe fn header_mut<'a>(self, block: NonZeroUsize) -> &'a mut BlockHeader {
        debug_assert!(self.contains_addr(block));
        debug_assert_eq!(block.get() % mem::align_of::<BlockHeader>(), 0);

        unsafe { self.with_addr(block).cast::<BlockHeader>().as_mut() }
    }
}

/// The header that precedes every block's payload.
///
/// ```text
/// +----------------------+ <- block
/// | size                 |
/// | is_free              |
/// | next (while free)    |
/// | prev (while free)    |
/// +----------------------+ <- payload, returned to the caller
/// | ...                  |
/// +----------------------+ <- block + size
/// ```
///
/// Rather than using pointers, the links store only the addresses of the
/// neighbouring free blocks. This avoids accidentally violating stacked
/// borrows; the links "point to" other blocks, but by forgoing actual
/// pointers, no borrow is implied.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Size of the block in bytes, header included.
    ///
    /// For arena blocks this is a power of two. For mapped blocks it is the
    /// requested payload plus the header.
    pub size: usize,
    pub is_free: bool,
    pub next: Option<NonZeroUsize>,
    pub prev: Option<NonZeroUsize>,
}

impl BlockHeader {
    /// A header for an unlinked block that is handed out to a caller.
    #[inline]
    pub const fn occupied(size: usize) -> BlockHeader {
        BlockHeader {
            size,
            is_free: false,
            next: None,
            prev: None,
        }
    }

    /// A header for a free block that is not linked into any list yet.
    #[inline]
    pub const fn free(size: usize) -> BlockHeader {
        BlockHeader {
            size,
            is_free: true,
            next: None,
            prev: None,
        }
    }

    /// Returns a pointer to the header that precedes `payload`.
    ///
    /// The returned pointer has the provenance of `payload`. Dereferencing it
    /// is only valid if `payload` was returned by the allocator.
    #[inline]
    pub fn of_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        let raw = payload.as_ptr().wrapping_sub(HEADER_SIZE);

        // Payloads never start within `HEADER_SIZE` bytes of null.
        NonNull::new(raw)
            .expect("payload pointer too close to null")
            .cast()
    }
}
