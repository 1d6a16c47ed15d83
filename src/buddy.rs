//! Buddy address arithmetic.
//!
//! Everything in this module works on arena offsets rather than pointers. A
//! block of size `s` always starts at an offset that is a multiple of `s`, so
//! its buddy lies at `offset ^ s` and the block they form together starts at
//! `offset & !s`.
//!
//! Orders count upwards from the smallest block: a block of order `k` is
//! `min_block_size << k` bytes.

/// Returns the offset of the buddy of the block of size `block_size` which
/// starts `block_ofs` bytes from the arena base.
///
/// # Panics
///
/// Panics in debug builds if `block_size` is not a power of two or
/// `block_ofs` is not aligned to it.
#[inline]
pub fn buddy_ofs(block_ofs: usize, block_size: usize) -> usize {
    debug_assert!(block_size.is_power_of_two());
    debug_assert_eq!(block_ofs % block_size, 0, "block is not aligned to its size");

    block_ofs ^ block_size
}

/// Returns the offset of the block formed by merging the block at
/// `block_ofs` with its buddy.
///
/// This is always the lower of the two addresses.
#[inline]
pub fn parent_ofs(block_ofs: usize, block_size: usize) -> usize {
    debug_assert!(block_size.is_power_of_two());

    block_ofs & !block_size
}

/// Returns the size in bytes of a block of order `order`.
#[inline]
pub fn block_size(order: usize, min_block_size: usize) -> usize {
    min_block_size << order
}

/// Returns the order of a block of size `block_size`.
///
/// `block_size` must be a power-of-two multiple of `min_block_size`.
#[inline]
pub fn order_of(block_size: usize, min_block_size: usize) -> usize {
    debug_assert!(block_size.is_power_of_two());
    debug_assert!(block_size >= min_block_size);

    (block_size.ilog2() - min_block_size.ilog2()) as usize
}

/// Returns the smallest order whose blocks can hold `span` bytes.
///
/// `span` is the full footprint of a request, header included. Returns
/// `None` if `span` is zero or cannot be rounded up to a power of two.
#[inline]
pub fn order_for(span: usize, min_block_size: usize) -> Option<usize> {
    if span == 0 {
        return None;
    }

    let rounded = span.checked_next_power_of_two()?;

    Some(order_of(rounded.max(min_block_size), min_block_size))
}

/// Rounds `value` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` on overflow.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    Some(value.checked_add(align - 1)? & !(align - 1))
}
