//! Statistics tracking.

use crate::base::HEADER_SIZE;

/// A snapshot of the allocator's bookkeeping.
///
/// Block and byte counts cover every block the allocator has carved, free or
/// not: all blocks of the arena plus every live mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the free lists.
    pub free_blocks: usize,
    /// Payload bytes of the blocks in the free lists.
    pub free_bytes: usize,
    /// Number of blocks, free or occupied, including mapped blocks.
    pub allocated_blocks: usize,
    /// Payload bytes of every block, free or occupied, including mapped
    /// blocks.
    pub allocated_bytes: usize,
    /// Bytes spent on block headers.
    pub metadata_bytes: usize,
    /// Size of a single block header.
    pub header_size: usize,
}

/// Running totals, updated on every split, merge, mapping and unmapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    blocks: usize,
    bytes: usize,
}

impl Counters {
    /// Totals for a freshly seeded arena of `num_blocks` blocks.
    pub const fn seeded(num_blocks: usize, block_size: usize) -> Counters {
        Counters {
            blocks: num_blocks,
            bytes: num_blocks * (block_size - HEADER_SIZE),
        }
    }

    #[inline]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn metadata_bytes(&self) -> usize {
        self.blocks * HEADER_SIZE
    }

    /// A block was split in two; the new header eats into the payload.
    #[inline]
    pub fn split(&mut self) {
        self.blocks += 1;
        self.bytes -= HEADER_SIZE;
    }

    /// Two buddies were merged; one header becomes payload again.
    #[inline]
    pub fn merge(&mut self) {
        self.blocks -= 1;
        self.bytes += HEADER_SIZE;
    }

    #[inline]
    pub fn mapped(&mut self, payload: usize) {
        self.blocks += 1;
        self.bytes += payload;
    }

    #[inline]
    pub fn unmapped(&mut self, payload: usize) {
        self.blocks -= 1;
        self.bytes -= payload;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_merge_cancel_out() {
        let seeded = Counters::seeded(32, 128 * 1024);
        assert_eq!(seeded.blocks(), 32);
        assert_eq!(seeded.bytes(), 32 * (128 * 1024 - HEADER_SIZE));

        let mut c = seeded;
        for _ in 0..10 {
            c.split();
        }
        assert_eq!(c.blocks(), 42);
        assert_eq!(c.bytes() + c.metadata_bytes(), 32 * 128 * 1024);

        for _ in 0..10 {
            c.merge();
        }
        assert_eq!(c, seeded);
    }

    #[test]
    fn mappings_count_their_payload() {
        let mut c = Counters::default();

        c.mapped(200_000);
        assert_eq!((c.blocks(), c.bytes()), (1, 200_000));
        assert_eq!(c.metadata_bytes(), HEADER_SIZE);

        c.unmapped(200_000);
        assert_eq!(c, Counters::default());
    }
}
