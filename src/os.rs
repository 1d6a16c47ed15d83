//! The operating-system services the allocator is built on.
//!
//! The allocator needs two things from the OS: a heap that can be grown
//! contiguously (the program break) and anonymous mappings for large blocks.
//! Both are reached through the [`OsMemory`] trait so that an allocator can
//! run against the real program break ([`Sbrk`]) or against a private,
//! emulated one ([`ReservedHeap`]).

use core::ptr::{self, NonNull};

use libc::{c_int, c_void, intptr_t, off_t, size_t};

/// Low-level memory services used by the allocator.
///
/// Every method either succeeds with an address or fails with `None`; no
/// method blocks beyond the underlying system call.
pub trait OsMemory {
    /// Grows the heap by `increment` bytes.
    ///
    /// Returns the previous end of the heap, which is the start of the new
    /// memory. `extend_heap(0)` returns the current end of the heap without
    /// growing it.
    fn extend_heap(&mut self, increment: usize) -> Option<NonNull<u8>>;

    /// Maps `len` bytes of zeroed, readable and writable anonymous memory.
    fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Unmaps `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping returned by [`OsMemory::map`]
    /// on the same value, and the memory must not be accessed afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size in bytes.
    fn page_size(&self) -> usize {
        page_size()
    }
}

/// The process's real program break, grown with `sbrk(2)`.
///
/// Mappings are made with `mmap(2)`.
///
/// Nothing else in the process may move the program break between the two
/// calls the allocator makes while reserving its arena.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sbrk;

impl OsMemory for Sbrk {
    fn extend_heap(&mut self, increment: usize) -> Option<NonNull<u8>> {
        let increment = intptr_t::try_from(increment).ok()?;

        // SAFETY: `sbrk` has no memory-safety preconditions; the new memory
        // is not accessed here.
        let prev = unsafe { libc::sbrk(increment) };

        if prev == usize::MAX as *mut c_void {
            return None;
        }

        NonNull::new(prev.cast())
    }

    fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        map_anonymous(len)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe { unmap(ptr, len) };
    }
}

/// An emulated program break inside a single anonymous mapping.
///
/// The mapping of `capacity` bytes is made lazily on the first call to
/// [`extend_heap`], and released when the `ReservedHeap` is dropped. Growing
/// past `capacity` fails the same way `sbrk` fails when the data segment
/// limit is reached.
///
/// Untouched pages of the reservation are never committed, so a generous
/// capacity is cheap.
///
/// [`extend_heap`]: OsMemory::extend_heap
#[derive(Debug)]
pub struct ReservedHeap {
    capacity: usize,
    region: Option<NonNull<u8>>,
    brk: usize,
}

impl ReservedHeap {
    /// Creates a heap that can grow to at most `capacity` bytes.
    pub const fn new(capacity: usize) -> ReservedHeap {
        ReservedHeap {
            capacity,
            region: None,
            brk: 0,
        }
    }

    /// Returns the number of bytes the heap has grown by so far.
    pub fn used(&self) -> usize {
        self.brk
    }

    fn region(&mut self) -> Option<NonNull<u8>> {
        if let Some(region) = self.region {
            return Some(region);
        }

        let region = map_anonymous(self.capacity)?;
        self.region = Some(region);
        Some(region)
    }
}

impl OsMemory for ReservedHeap {
    fn extend_heap(&mut self, increment: usize) -> Option<NonNull<u8>> {
        let region = self.region()?;

        let prev = self.brk;
        let next = prev.checked_add(increment)?;
        if next > self.capacity {
            return None;
        }

        self.brk = next;

        // SAFETY: `prev <= capacity`, so the result is within or one past the
        // end of the mapping.
        Some(unsafe { NonNull::new_unchecked(region.as_ptr().add(prev)) })
    }

    fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        map_anonymous(len)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe { unmap(ptr, len) };
    }
}

impl Drop for ReservedHeap {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            // SAFETY: `region` was mapped with exactly `capacity` bytes.
            unsafe { unmap(region, self.capacity) };
        }
    }
}

/// Maps `len` bytes of anonymous read-write memory.
pub(crate) fn map_anonymous(len: usize) -> Option<NonNull<u8>> {
    const ADDR: *mut c_void = ptr::null_mut::<c_void>();
    // Read-Write only memory.
    const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
    const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    const FD: c_int = -1;
    const OFFSET: off_t = 0;

    if len == 0 {
        return None;
    }

    // SAFETY: An anonymous private mapping at a kernel-chosen address cannot
    // alias existing memory.
    let addr = unsafe { libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

    if addr == libc::MAP_FAILED {
        return None;
    }

    NonNull::new(addr.cast())
}

/// Unmaps `len` bytes starting at `ptr`.
///
/// # Safety
///
/// The range must have been mapped by [`map_anonymous`] and must not be
/// accessed afterwards.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    unsafe { libc::munmap(ptr.as_ptr().cast(), len as size_t) };
}

/// Returns the virtual memory page size of the computer in bytes.
pub fn page_size() -> usize {
    // SAFETY: `sysconf` has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}
