//! In-band block headers.
//!
//! Every block of memory managed by a [`crate::Tlsf`] instance, free or
//! used, is preceded by a [`BlockHdr`]. Free blocks carry two extra link
//! words ([`FreeBlockHdr`]) threading them into a free list; used blocks
//! have no extra fields ([`UsedBlockHdr`]) and hand the rest of the block
//! straight to the caller.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::tlsf::mapping::BLOCK_ALIGN;
use crate::utils::byte_add;

const SIZE_FREE: usize = 1 << 0;
const SIZE_PREV_FREE: usize = 1 << 1;
const SIZE_POOL: usize = 1 << 2;
const SIZE_FLAGS_MASK: usize = SIZE_FREE | SIZE_PREV_FREE | SIZE_POOL;

/// The header shared by every block, free or used.
///
/// `size` packs the block's payload size (a multiple of [`BLOCK_ALIGN`])
/// together with three flag bits in the bits that rounding guarantees are
/// zero:
///
/// - bit 0, `is_free`: this block is on a free list.
/// - bit 1, `is_prev_free`: the physically preceding block is free (so this
///   header is immediately preceded by that block's footer-like prev-size,
///   which here is simply that block's own header, reachable via
///   `prev_phys_block`).
/// - bit 2, `is_pool`: this block is the initial block of a pool that was
///   grown automatically (and so is eligible for automatic release once it
///   drains back to a single free block). Meaningless except on a pool's
///   initial block.
#[repr(C)]
pub(crate) struct BlockHdr {
    /// Size of the physically preceding block's payload, valid only when
    /// `is_prev_free` is set (mirrors the prose spec's `prev_phys_block`
    /// being used to step backward over free predecessors).
    pub prev_phys_block: Option<NonNull<BlockHdr>>,
    size: usize,
}

/// The header of a free block: a [`BlockHdr`] plus two free-list links.
#[repr(C)]
pub(crate) struct FreeBlockHdr {
    pub common: BlockHdr,
    pub next_free: Option<NonNull<FreeBlockHdr>>,
    pub prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The header of a used block: just a [`BlockHdr`]. The payload begins
/// immediately after.
#[repr(C)]
pub(crate) struct UsedBlockHdr {
    pub common: BlockHdr,
}

/// Size of [`UsedBlockHdr`], i.e. the per-allocation bookkeeping overhead.
pub(crate) const BLOCK_HDR_SIZE: usize = size_of::<UsedBlockHdr>();

/// Size of [`FreeBlockHdr`], i.e. the minimum span of memory that can be a
/// free block.
pub(crate) const FREE_BLOCK_HDR_SIZE: usize = size_of::<FreeBlockHdr>();

/// Smallest payload size a free block can hold: the two free-list link
/// words not already covered by [`BLOCK_HDR_SIZE`].
pub(crate) const BLOCK_SIZE_MIN: usize = FREE_BLOCK_HDR_SIZE - BLOCK_HDR_SIZE;

/// Per-header-pair overhead contributed when two adjacent blocks merge into
/// one: the departing block's header becomes part of the surviving block's
/// payload.
pub(crate) const BLOCK_OVERHEAD: usize = BLOCK_HDR_SIZE;

impl BlockHdr {
    #[inline]
    pub fn size(&self) -> usize {
        self.size & !SIZE_FLAGS_MASK
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size & SIZE_FLAGS_MASK, 0);
        self.size = size | (self.size & SIZE_FLAGS_MASK);
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.size & SIZE_FREE != 0
    }

    #[inline]
    pub fn set_free(&mut self, value: bool) {
        if value {
            self.size |= SIZE_FREE;
        } else {
            self.size &= !SIZE_FREE;
        }
    }

    #[inline]
    pub fn is_prev_free(&self) -> bool {
        self.size & SIZE_PREV_FREE != 0
    }

    #[inline]
    pub fn set_prev_free(&mut self, value: bool) {
        if value {
            self.size |= SIZE_PREV_FREE;
        } else {
            self.size &= !SIZE_PREV_FREE;
        }
    }

    #[inline]
    pub fn is_pool(&self) -> bool {
        self.size & SIZE_POOL != 0
    }

    #[inline]
    pub fn set_pool(&mut self, value: bool) {
        if value {
            self.size |= SIZE_POOL;
        } else {
            self.size &= !SIZE_POOL;
        }
    }

    /// Construct a raw header value: `size` with no flags set.
    #[inline]
    pub fn new_raw(size: usize) -> Self {
        debug_assert_eq!(size % BLOCK_ALIGN, 0);
        Self {
            prev_phys_block: None,
            size,
        }
    }

    /// Pointer to the first byte following this header, i.e. this block's
    /// payload (for a used block) or first free-list link (for a free
    /// block).
    ///
    /// # Safety
    ///
    /// `this` must point to a live `BlockHdr`.
    #[inline]
    pub unsafe fn data_ptr(this: NonNull<BlockHdr>) -> NonNull<u8> {
        byte_add(this.cast(), BLOCK_HDR_SIZE)
    }

    /// The physically next block's header, computed by walking past this
    /// block's payload. Returns the sentinel block when called on the last
    /// real block of a pool.
    ///
    /// # Safety
    ///
    /// `this` must point to a live, non-sentinel `BlockHdr` within a pool
    /// (the sentinel has no meaningful "next").
    #[inline]
    pub unsafe fn next_phys_block(this: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        let size = this.as_ref().size();
        byte_add(this.cast(), BLOCK_HDR_SIZE + size).cast()
    }
}

impl FreeBlockHdr {
    /// # Safety
    ///
    /// `this` must point to a live `FreeBlockHdr`.
    #[inline]
    pub unsafe fn as_block(this: NonNull<FreeBlockHdr>) -> NonNull<BlockHdr> {
        this.cast()
    }
}
