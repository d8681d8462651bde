//! Read-only statistics and structural self-check.

use crate::init::Init;

/// Snapshot of a [`crate::Tlsf`] instance's bookkeeping counters.
///
/// Maintained unconditionally (the updates are a handful of integer ops per
/// call) rather than gated behind a feature, since the cost is negligible
/// next to the pointer-chasing the allocator already does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of successful `malloc`/`calloc` calls (including ones served
    /// by a realloc that fell back to allocating fresh memory).
    pub malloc_count: u64,
    /// Number of `free` calls, including the frees realloc performs
    /// internally.
    pub free_count: u64,
    /// Number of pools currently attached (initial pool plus any live
    /// auto-grown ones).
    pub pool_count: usize,
    /// Sum of the payload sizes of all free blocks.
    pub free_size: usize,
    /// Sum of the payload sizes of all used blocks.
    pub used_size: usize,
    /// `free_size + used_size`. Tracked directly (rather than computed) so
    /// it stays correct across splits and merges, which change the number
    /// of in-use block headers and therefore how many bytes are available
    /// as payload at all.
    pub total_size: usize,
}

impl Init for Stats {
    const INIT: Self = Stats {
        malloc_count: 0,
        free_count: 0,
        pool_count: 0,
        free_size: 0,
        used_size: 0,
        total_size: 0,
    };
}

/// A broken structural invariant detected by [`crate::Tlsf::check`].
///
/// Each variant corresponds to one of the invariants a [`crate::Tlsf`]
/// instance is expected to uphold between calls. `check` stops at the first
/// one it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// A block's size is not a multiple of the block alignment, or is
    /// smaller than the minimum block size.
    BadBlockSize,
    /// Two physically adjacent blocks are both free (a missed coalesce).
    AdjacentFreeBlocks,
    /// A free block's recorded free-ness disagrees with its neighbor's
    /// `is_prev_free` flag, or its size maps to a different free-list cell
    /// than the one it is enqueued in.
    FreeListMismatch,
    /// `fl_bitmap`/`sl_bitmap` disagree with the emptiness of the free-list
    /// matrix they index.
    BitmapMismatch,
    /// A pool's terminating sentinel does not have `size == 0` or is marked
    /// free.
    MissingSentinel,
    /// `free_size + used_size != total_size`.
    SizeAccountingMismatch,
}

impl core::fmt::Display for CheckError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            CheckError::BadBlockSize => "block size violates alignment or minimum-size invariant",
            CheckError::AdjacentFreeBlocks => "two physically adjacent free blocks were not coalesced",
            CheckError::FreeListMismatch => "free block's flags or index cell are inconsistent",
            CheckError::BitmapMismatch => "bitmap state disagrees with the free-list matrix",
            CheckError::MissingSentinel => "pool is missing its terminating sentinel block",
            CheckError::SizeAccountingMismatch => "free_size + used_size != total_size",
        };
        f.write_str(msg)
    }
}
