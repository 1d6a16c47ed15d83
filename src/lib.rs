//! A buddy-system heap allocator for user space.
//!
//! `buddy_malloc` manages a process heap without going through the platform
//! allocator. Requests of up to [`MAX_BLOCK_SIZE`] bytes (header included)
//! are served from a single arena reserved from the program break the first
//! time it is needed; anything larger is mapped directly from the OS.
//!
//! ## Arena
//!
//! The arena is a run of [`DEFAULT_NUM_BLOCKS`] maximum-order blocks whose
//! start is aligned to the arena size rounded up to a power of two. Every
//! block in it is aligned to its own size, so the sibling of a block is found
//! by flipping a single offset bit:
//!
//! ```text
//!  order 2 |               512               |
//!  order 1 |       256       |      256      |
//!  order 0 |  128   |  128   |  128  |  128  |
//!          ^ 0x000  ^ 0x080  ^ 0x100 ^ 0x180
//!
//!  buddy(0x100, 128) == 0x100 ^ 0x080 == 0x180
//! ```
//!
//! Each block starts with a [`header_size()`]-byte header recording its size,
//! whether it is free and, while free, its neighbours in the free list of its
//! order.
//!
//! ## Threading
//!
//! A [`BuddyMalloc`] holds no locks. All calls against one allocator must be
//! serialized by the caller.
//!
//! [`header_size()`]: BuddyMalloc::header_size

#![doc(html_root_url = "https://docs.rs/buddy_malloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// `sptr` shadows the strict-provenance methods that newer toolchains provide.
#![allow(unstable_name_collisions)]

#[cfg(feature = "log")]
extern crate log;

// Without the `log` feature, logging compiles to nothing.
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

mod arena;
mod base;
pub mod buddy;
mod malloc;
mod order;
pub mod os;
mod stats;


use core::{alloc::Layout, fmt};

pub use crate::{
    malloc::BuddyMalloc,
    os::{OsMemory, ReservedHeap, Sbrk},
    stats::Stats,
};

/// Size in bytes of the largest block served from the arena.
///
/// A request whose payload plus header exceeds this is mapped from the OS.
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

/// Number of orders in the default geometry.
///
/// Order 0 holds 128-byte blocks and order 10 holds [`MAX_BLOCK_SIZE`]-byte
/// blocks.
pub const ORDERS: usize = 11;

/// Number of maximum-order blocks the arena is seeded with.
pub const DEFAULT_NUM_BLOCKS: usize = 32;

/// Largest payload size, in bytes, that any request may ask for.
pub const SIZE_LIMIT: usize = 100_000_000;

/// A [`BuddyMalloc`] with the default geometry.
pub type Malloc<O = Sbrk> = BuddyMalloc<MAX_BLOCK_SIZE, ORDERS, O>;

/// The error type for allocation requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The requested size is zero, exceeds [`SIZE_LIMIT`], or overflowed
    /// while being computed.
    InvalidSize,

    /// No memory could be found for the request.
    ///
    /// This is returned when the OS refuses to grow the heap or create a
    /// mapping, and when no free arena block of a sufficient order exists.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidSize => f.write_str("invalid allocation size"),
            AllocError::Exhausted => f.write_str("memory exhausted"),
        }
    }
}

impl std::error::Error for AllocError {}

/// The error type for arena setup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// The OS refused to grow the heap by enough to hold the arena.
    ///
    /// The variant contains the [`Layout`] of the arena that could not be
    /// reserved.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to reserve a {}-byte arena aligned to {} bytes",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}

impl std::error::Error for AllocInitError {}
