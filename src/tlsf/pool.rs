//! Pool descriptors.
//!
//! Each region of backing memory handed to [`crate::Tlsf::add_pool`] (or
//! grown internally on demand) is prefixed with a [`PoolHdr`] describing its
//! extent and threading it into the control's pool list, so `Drop` can walk
//! every live pool and unmap it.

use core::ptr::NonNull;

use crate::tlsf::block::{BlockHdr, BLOCK_HDR_SIZE};

/// Descriptor prepended to every pool's backing region.
#[repr(C)]
pub(crate) struct PoolHdr {
    /// Next pool in the control's pool list, in no particular order.
    pub next_pool: Option<NonNull<PoolHdr>>,
    /// Whether this pool was created by automatic growth (`true`) or is the
    /// control's permanent initial pool / a pool added explicitly by the
    /// caller via `add_pool` (`false`).
    ///
    /// Only auto-grown pools are eligible for automatic release when they
    /// drain back to fully free.
    pub is_auto_grown: bool,
    /// Total size in bytes of the backing region this descriptor was built
    /// over, as originally passed to `add_pool`.
    pub region_size: usize,
}

/// Size of the descriptor prepended to every pool, plus the headers of its
/// initial block and its terminating sentinel — the bytes of a pool region
/// that never become allocatable payload.
pub(crate) const POOL_OVERHEAD: usize = core::mem::size_of::<PoolHdr>() + 2 * BLOCK_HDR_SIZE;

impl PoolHdr {
    /// Pointer to the first block header within this pool, immediately
    /// following the descriptor.
    ///
    /// # Safety
    ///
    /// `this` must point to a live `PoolHdr` prepended to an actual region.
    #[inline]
    pub unsafe fn first_block(this: NonNull<PoolHdr>) -> NonNull<BlockHdr> {
        crate::utils::byte_add(this.cast(), core::mem::size_of::<PoolHdr>()).cast()
    }
}
