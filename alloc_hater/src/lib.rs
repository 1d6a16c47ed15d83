//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] replays a sequence of [`AllocatorOp`]s against a
//! [`Subject`], painting every live block with the ID of the operation that
//! last wrote it and checking the paint before the block is resized or
//! freed.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{cmp, mem::MaybeUninit, ptr::NonNull, slice};

/// Limit on generated allocation sizes, expressed in bits.
pub const SIZE_LIMIT_BITS: u8 = 20;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread evenly over orders of magnitude rather than over the
/// whole range, so small and large requests are both common. Zero is
/// included.
#[derive(Clone, Copy, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a bound.
        let shift = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let bound: usize = 1 << shift;

        Ok(ArbSize(usize::arbitrary(u)? % bound))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Realloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block of the given size.
    Alloc(usize),
    /// Resize the live block at `index % n` to the given size.
    Realloc(usize, usize),
    /// Free the live block at `index % n`.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Realloc => {
                AllocatorOp::Realloc(usize::arbitrary(u)?, ArbSize::arbitrary(u)?.0)
            }
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Self::AllocError>;

    /// Resizes the block pointed to by `ptr` to `size` bytes.
    ///
    /// On success the block must have moved to the returned pointer with its
    /// leading bytes intact. On failure the block must be left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, Self::AllocError>;

    /// Deallocates the block of memory pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<u8>,
    // The size requested for the region.
    len: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `len` bytes.
    /// - No references to the memory at `ptr` may exist when this function is
    ///   called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<u8>, len: usize, id: u64) -> Block {
        let mut b = Block { ptr, len, id };
        b.paint(id);
        b
    }

    /// Returns the block's address.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice::from_raw_parts_mut(self.ptr.cast().as_ptr(), self.len) }
    }

    /// Returns the block after it has been resized to `len` bytes at `ptr`.
    ///
    /// The paint ID is kept, so that [`Block::verify_prefix`] can check what
    /// the move preserved.
    ///
    /// # Safety
    ///
    /// The same invariants as [`Block::init`] apply to `ptr` and `len`.
    pub unsafe fn moved(self, ptr: NonNull<u8>, len: usize) -> Block {
        Block { ptr, len, ..self }
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the first `len` bytes of `self` have not been
    /// overwritten.
    pub fn verify_prefix(&self, len: usize) -> bool {
        let len = cmp::min(len, self.len);
        let slice: &[u8] = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        self.verify_prefix(self.len)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    /// The operation that found a corrupted block, or `None` if it was found
    /// while freeing the blocks left over at the end.
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op {
                AllocatorOp::Alloc(size) => {
                    let ptr = match self.subject.allocate(size) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let block = unsafe { Block::init(ptr, size, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Realloc(raw_idx, size) => {
                    let block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    let kept = cmp::min(block.len, size);
                    let block = match unsafe { self.subject.reallocate(block.ptr, size) } {
                        Ok(p) => unsafe { block.moved(p, size) },
                        Err(_) => block,
                    };

                    if !block.verify_prefix(kept) {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    let mut block = block;
                    block.paint(op_id);
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    unsafe {
                        block.paint(op_id);
                        self.subject.deallocate(block.ptr);
                    }
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            unsafe { self.subject.deallocate(block.ptr) };
        }

        Ok(())
    }
}
