//! The allocator control structure: free-list index, pool list, and the
//! public `malloc`/`free`/`realloc`/`calloc` operations built on top of
//! them.

pub(crate) mod block;
pub(crate) mod mapping;
pub(crate) mod pool;
#[cfg(test)]
mod tests;

use core::ffi::c_void;
use core::ptr::NonNull;

use crate::diagnostics::{CheckError, Stats};
use crate::init::Init;
use crate::int::BinInteger;
use crate::utils;

use block::{BlockHdr, FreeBlockHdr, BLOCK_HDR_SIZE, BLOCK_OVERHEAD, BLOCK_SIZE_MIN, FREE_BLOCK_HDR_SIZE};
use mapping::{mapping_insert, mapping_search, BLOCK_ALIGN, BLOCK_SIZE_MAX, FL_COUNT, SL_COUNT};
use pool::{PoolHdr, POOL_OVERHEAD};

/// Requests at least `*size` bytes of `ALIGN`-aligned memory from the
/// backing source, updates `*size` to the amount actually granted, and
/// returns the region's start, or `None` on failure.
///
/// # Safety
///
/// Implementations must return a region of at least the (possibly revised)
/// `*size` bytes, valid until the matching [`UnmapFn`] call (if the
/// allocator ever makes one) or until the `Tlsf` is dropped.
pub type MapFn = unsafe fn(size: &mut usize, user: *mut c_void) -> Option<NonNull<u8>>;

/// Returns a region previously produced by a [`MapFn`] call with the same
/// `size`.
///
/// # Safety
///
/// `ptr`/`size` must be exactly a pair previously returned/passed by the
/// corresponding `map` call.
pub type UnmapFn = unsafe fn(ptr: NonNull<u8>, size: usize, user: *mut c_void);

/// A Two-Level Segregated Fit allocator instance.
///
/// `Tlsf` owns a free-list index (a two-level bitmap plus a matrix of
/// free-list heads) and zero or more memory pools obtained through a
/// caller-supplied [`MapFn`]/[`UnmapFn`] pair. See the crate documentation
/// for the algorithm overview.
///
/// `Tlsf` is [`Send`] (the backing memory and callbacks can be handed to
/// another thread) but intentionally not `Sync` — callers who share one
/// instance across threads must provide their own mutual exclusion.
pub struct Tlsf {
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_COUNT],
    blocks: [[Option<NonNull<FreeBlockHdr>>; SL_COUNT]; FL_COUNT],
    pool_list: Option<NonNull<PoolHdr>>,
    map: MapFn,
    unmap: Option<UnmapFn>,
    user: *mut c_void,
    stats: Stats,
}

unsafe impl Send for Tlsf {}

impl Tlsf {
    /// Create a new allocator, requesting an initial pool from `map`.
    ///
    /// Returns `None` if `map` fails to supply even the minimum region a
    /// control needs to operate.
    pub fn new(map: MapFn, unmap: Option<UnmapFn>, user: *mut c_void) -> Option<Self> {
        let mut control = Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            blocks: [[None; SL_COUNT]; FL_COUNT],
            pool_list: None,
            map,
            unmap,
            user,
            stats: Stats::INIT,
        };

        let mut size = POOL_OVERHEAD + BLOCK_SIZE_MIN + BLOCK_OVERHEAD;
        let mem = unsafe { (control.map)(&mut size, control.user) }?;
        control.add_pool_priv(mem, size, false);
        log::trace!("tlsf: created with initial pool of {} bytes", size);
        Some(control)
    }

    /// Attach a caller-managed region as an additional pool.
    ///
    /// Unlike pools grown automatically by [`Tlsf::malloc`], a pool added
    /// this way is never released back to `unmap` on its own — it is
    /// retained until [`Tlsf`] is dropped. Useful for callers who want to
    /// hand the allocator a fixed `static` arena without ever exercising the
    /// `map`/`unmap` path.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for reads and writes for `size` bytes, aligned to
    /// [`mapping::ALIGN`], and must outlive this `Tlsf` (or be removed again
    /// by the caller through means outside this API — this crate provides
    /// no manual pool-removal entry point, since pools are otherwise only
    /// ever released by the drain-on-free policy or by `Drop`).
    pub unsafe fn add_pool(&mut self, mem: NonNull<u8>, size: usize) {
        self.add_pool_priv(mem, size, false);
    }

    fn add_pool_priv(&mut self, mem: NonNull<u8>, size: usize, is_auto_grown: bool) -> NonNull<BlockHdr> {
        debug_assert_eq!(mem.as_ptr() as usize % BLOCK_ALIGN, 0);
        debug_assert!(size >= POOL_OVERHEAD + BLOCK_SIZE_MIN + BLOCK_OVERHEAD);

        let pool_hdr: NonNull<PoolHdr> = mem.cast();
        let initial_size = size - POOL_OVERHEAD;

        unsafe {
            core::ptr::write(
                pool_hdr.as_ptr(),
                PoolHdr {
                    next_pool: self.pool_list,
                    is_auto_grown,
                    region_size: size,
                },
            );
            self.pool_list = Some(pool_hdr);

            let block = PoolHdr::first_block(pool_hdr);
            core::ptr::write(block.as_ptr(), BlockHdr::new_raw(initial_size));
            (*block.as_ptr()).set_pool(is_auto_grown);

            let sentinel = BlockHdr::next_phys_block(block);
            core::ptr::write(sentinel.as_ptr(), BlockHdr::new_raw(0));

            Self::mark_free(block);
            self.block_insert(block);

            self.stats.pool_count += 1;
            self.stats.total_size += initial_size;
            self.stats.free_size += initial_size;

            block
        }
    }

    fn grow_pool(&mut self, size: usize) -> Option<()> {
        let mut memsize = POOL_OVERHEAD + BLOCK_OVERHEAD + size;
        let mem = unsafe { (self.map)(&mut memsize, self.user) }?;
        log::trace!("tlsf: grew pool by {} bytes", memsize);
        self.add_pool_priv(mem, memsize, true);
        Some(())
    }

    /// Release an auto-grown pool whose sole block has fully drained back
    /// to free.
    fn release_pool(&mut self, block: NonNull<BlockHdr>) {
        let size = unsafe { block.as_ref().size() };
        unsafe {
            let pool_hdr: NonNull<PoolHdr> =
                utils::byte_sub(block.cast(), core::mem::size_of::<PoolHdr>()).cast();
            self.unlink_pool(pool_hdr);
            let region_size = pool_hdr.as_ref().region_size;

            self.stats.pool_count -= 1;
            self.stats.total_size -= size;
            self.stats.free_size -= size;

            if let Some(unmap) = self.unmap {
                unmap(pool_hdr.cast(), region_size, self.user);
            }
        }
    }

    fn unlink_pool(&mut self, pool_hdr: NonNull<PoolHdr>) {
        let mut cursor = &mut self.pool_list;
        loop {
            match *cursor {
                Some(p) if p == pool_hdr => {
                    *cursor = unsafe { p.as_ref().next_pool };
                    return;
                }
                Some(p) => {
                    cursor = unsafe { &mut (*p.as_ptr()).next_pool };
                }
                None => {
                    debug_assert!(false, "tlsf: pool to release was not found in the pool list");
                    return;
                }
            }
        }
    }

    // --- free-list index -------------------------------------------------

    fn insert_free_block(&mut self, block: NonNull<BlockHdr>, fl: usize, sl: usize) {
        let free: NonNull<FreeBlockHdr> = block.cast();
        let head = self.blocks[fl][sl];
        unsafe {
            (*free.as_ptr()).next_free = head;
            (*free.as_ptr()).prev_free = None;
            if let Some(h) = head {
                (*h.as_ptr()).prev_free = Some(free);
            }
        }
        self.blocks[fl][sl] = Some(free);
        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    fn remove_free_block(&mut self, block: NonNull<BlockHdr>, fl: usize, sl: usize) {
        let free: NonNull<FreeBlockHdr> = block.cast();
        let (prev, next) = unsafe { ((*free.as_ptr()).prev_free, (*free.as_ptr()).next_free) };
        match prev {
            Some(p) => unsafe { (*p.as_ptr()).next_free = next },
            None => self.blocks[fl][sl] = next,
        }
        if let Some(n) = next {
            unsafe { (*n.as_ptr()).prev_free = prev };
        }
        if self.blocks[fl][sl].is_none() {
            self.sl_bitmap[fl].clear_bit(sl as u32);
            if self.sl_bitmap[fl] == u32::ZERO {
                self.fl_bitmap.clear_bit(fl as u32);
            }
        }
    }

    fn block_insert(&mut self, block: NonNull<BlockHdr>) {
        let size = unsafe { block.as_ref().size() };
        let (fl, sl) = mapping_insert(size);
        self.insert_free_block(block, fl, sl);
    }

    fn block_remove(&mut self, block: NonNull<BlockHdr>) {
        let size = unsafe { block.as_ref().size() };
        let (fl, sl) = mapping_insert(size);
        self.remove_free_block(block, fl, sl);
    }

    fn search_suitable_block(&self, fl: usize, sl: usize) -> Option<(usize, usize, NonNull<BlockHdr>)> {
        let sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        let (fl, sl_map) = if sl_map != 0 {
            (fl, sl_map)
        } else {
            let fl_map = self.fl_bitmap & (!0u32 << (fl + 1));
            if fl_map == 0 {
                return None;
            }
            let fl = fl_map.bit_scan_forward(0) as usize;
            (fl, self.sl_bitmap[fl])
        };
        let sl = sl_map.bit_scan_forward(0) as usize;
        self.blocks[fl][sl].map(|b| (fl, sl, b.cast()))
    }

    fn block_locate_free(&mut self, size: usize) -> Option<NonNull<BlockHdr>> {
        let (fl, sl) = mapping_search(size);
        let (fl, sl, block) = self.search_suitable_block(fl, sl)?;
        self.remove_free_block(block, fl, sl);
        Some(block)
    }

    // --- split / absorb / coalesce ---------------------------------------

    fn block_can_split(cur_size: usize, size: usize) -> bool {
        cur_size >= size + FREE_BLOCK_HDR_SIZE
    }

    /// Merges `b` into `p` (`p` immediately precedes `b` physically).
    /// Returns `b`'s old size; stats bookkeeping is the caller's
    /// responsibility since it depends on whether `p`/`b` were free or
    /// used.
    unsafe fn absorb_raw(p: NonNull<BlockHdr>, b: NonNull<BlockHdr>) -> usize {
        let b_size = b.as_ref().size();
        (*p.as_ptr()).set_size(p.as_ref().size() + b_size + BLOCK_OVERHEAD);
        let next = BlockHdr::next_phys_block(p);
        (*next.as_ptr()).prev_phys_block = Some(p);
        b_size
    }

    /// Splits `block` at `size`, leaving a free remainder physically linked
    /// in but not yet inserted into the index. `source_is_used` indicates
    /// whether `block` was counted under `used_size` (realloc-shrink path)
    /// or `free_size` (fresh-allocation path) before the split.
    fn split_block(&mut self, block: NonNull<BlockHdr>, size: usize, source_is_used: bool) -> NonNull<BlockHdr> {
        unsafe {
            let old_size = block.as_ref().size();
            let remainder_size = old_size - size - BLOCK_OVERHEAD;

            if source_is_used {
                self.stats.used_size -= BLOCK_OVERHEAD + remainder_size;
            } else {
                self.stats.free_size -= BLOCK_OVERHEAD + remainder_size;
            }
            self.stats.free_size += remainder_size;
            self.stats.total_size -= BLOCK_OVERHEAD;

            (*block.as_ptr()).set_size(size);
            let remainder = BlockHdr::next_phys_block(block);
            core::ptr::write(remainder.as_ptr(), BlockHdr::new_raw(remainder_size));
            (*remainder.as_ptr()).prev_phys_block = Some(block);
            (*remainder.as_ptr()).set_prev_free(!source_is_used);
            Self::mark_free(remainder);
            remainder
        }
    }

    fn trim_free(&mut self, block: NonNull<BlockHdr>, size: usize) {
        let cur_size = unsafe { block.as_ref().size() };
        if Self::block_can_split(cur_size, size) {
            let remainder = self.split_block(block, size, false);
            self.block_insert(remainder);
        }
    }

    fn trim_used(&mut self, block: NonNull<BlockHdr>, size: usize) {
        let cur_size = unsafe { block.as_ref().size() };
        if Self::block_can_split(cur_size, size) {
            let remainder = self.split_block(block, size, true);
            let remainder = self.merge_next(remainder);
            self.block_insert(remainder);
        }
    }

    fn merge_prev(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        unsafe {
            if block.as_ref().is_prev_free() {
                let prev = block
                    .as_ref()
                    .prev_phys_block
                    .expect("is_prev_free implies a valid prev_phys_block");
                self.block_remove(prev);
                Self::absorb_raw(prev, block);
                self.stats.free_size += BLOCK_OVERHEAD;
                self.stats.total_size += BLOCK_OVERHEAD;
                prev
            } else {
                block
            }
        }
    }

    fn merge_next(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        unsafe {
            let next = BlockHdr::next_phys_block(block);
            if next.as_ref().is_free() {
                self.block_remove(next);
                Self::absorb_raw(block, next);
                self.stats.free_size += BLOCK_OVERHEAD;
                self.stats.total_size += BLOCK_OVERHEAD;
            }
        }
        block
    }

    unsafe fn mark_free(block: NonNull<BlockHdr>) {
        (*block.as_ptr()).set_free(true);
        let next = BlockHdr::next_phys_block(block);
        (*next.as_ptr()).set_prev_free(true);
        (*next.as_ptr()).prev_phys_block = Some(block);
    }

    unsafe fn mark_used(block: NonNull<BlockHdr>) {
        (*block.as_ptr()).set_free(false);
        let next = BlockHdr::next_phys_block(block);
        (*next.as_ptr()).set_prev_free(false);
    }

    fn adjust_size(size: usize) -> Option<usize> {
        let size = utils::align_up(size, BLOCK_ALIGN)?;
        let size = size.max(BLOCK_SIZE_MIN);
        if size >= BLOCK_SIZE_MAX {
            None
        } else {
            Some(size)
        }
    }

    unsafe fn block_from_data_ptr(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        utils::byte_sub(ptr, BLOCK_HDR_SIZE).cast()
    }

    // --- public allocation API --------------------------------------------

    /// Allocate at least `size` bytes, aligned to [`mapping::ALIGN`].
    ///
    /// Returns `None` if no suitable block exists and growing the backing
    /// pool (via the `map` callback supplied to [`Tlsf::new`]) also fails.
    ///
    /// # Safety
    ///
    /// This `Tlsf` must not be moved or dropped while the returned pointer
    /// is live; the caller must eventually pass the pointer to exactly one
    /// of [`Tlsf::free`] or [`Tlsf::realloc`] on this same instance.
    pub unsafe fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = Self::adjust_size(size)?;

        let block = match self.block_locate_free(size) {
            Some(b) => b,
            None => {
                log::trace!("tlsf: malloc({}) missed the index, growing pool", size);
                self.grow_pool(size)?;
                self.block_locate_free(size)
                    .expect("pool growth did not yield a block large enough for the request")
            }
        };

        self.trim_free(block, size);

        self.stats.free_size -= size;
        self.stats.used_size += size;
        self.stats.malloc_count += 1;
        Self::mark_used(block);

        log::trace!("tlsf: malloc({}) -> {:p}", size, block.as_ptr());
        Some(BlockHdr::data_ptr(block))
    }

    /// `malloc` followed by zeroing the returned region.
    ///
    /// # Safety
    ///
    /// Same contract as [`Tlsf::malloc`].
    pub unsafe fn calloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.malloc(size)?;
        core::ptr::write_bytes(ptr.as_ptr(), 0, size);
        Some(ptr)
    }

    /// Release a pointer previously returned by [`Tlsf::malloc`],
    /// [`Tlsf::calloc`], or [`Tlsf::realloc`]. A `None` pointer is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from this same `Tlsf` and not already
    /// freed.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        let block = Self::block_from_data_ptr(ptr);
        if block.as_ref().is_free() {
            log::error!("tlsf: free: block at {:p} is already free (double free?)", block.as_ptr());
            debug_assert!(false, "tlsf: double free");
            return;
        }
        let size = block.as_ref().size();

        self.stats.used_size -= size;
        self.stats.free_size += size;
        self.stats.free_count += 1;

        Self::mark_free(block);
        let merged = self.merge_prev(block);
        let merged = self.merge_next(merged);

        let next = BlockHdr::next_phys_block(merged);
        if merged.as_ref().is_pool() && next.as_ref().size() == 0 && self.unmap.is_some() {
            log::trace!("tlsf: auto-grown pool fully drained, releasing");
            self.release_pool(merged);
        } else {
            self.block_insert(merged);
        }
    }

    /// Resize a pointer previously returned by this `Tlsf`, preserving
    /// `min(old_size, size)` bytes of content.
    ///
    /// `realloc(None, n)` behaves as `malloc(n)`; `realloc(Some(p), 0)`
    /// behaves as `free(p)` and returns `None`.
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must have been obtained from this same `Tlsf` and
    /// not already freed.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.malloc(size);
        };
        if size == 0 {
            self.free(Some(ptr));
            return None;
        }

        let size = Self::adjust_size(size)?;
        let block = Self::block_from_data_ptr(ptr);
        let cur_size = block.as_ref().size();

        if size <= cur_size {
            self.trim_used(block, size);
            log::trace!("tlsf: realloc({}) shrank in place", size);
            return Some(ptr);
        }

        let next = BlockHdr::next_phys_block(block);
        if next.as_ref().is_free() {
            let next_size = next.as_ref().size();
            let combined = cur_size + next_size + BLOCK_OVERHEAD;
            if combined >= size {
                self.block_remove(next);
                Self::absorb_raw(block, next);
                self.stats.free_size -= next_size;
                self.stats.used_size += next_size + BLOCK_OVERHEAD;
                self.stats.total_size += BLOCK_OVERHEAD;

                // `absorb_raw` only fixes up `prev_phys_block`; `block` is
                // used, so the block now following it must not still claim
                // its predecessor is free. `trim_used` below restores this
                // correctly when it actually splits, but the no-split case
                // (remainder too small for a free block) would otherwise
                // leave it stale.
                let merged_next = BlockHdr::next_phys_block(block);
                (*merged_next.as_ptr()).set_prev_free(false);

                self.trim_used(block, size);
                log::trace!("tlsf: realloc({}) grew in place", size);
                return Some(ptr);
            }
        }

        log::trace!("tlsf: realloc({}) falling back to malloc+copy", size);
        let new_ptr = self.malloc(size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), cur_size);
        self.free(Some(ptr));
        Some(new_ptr)
    }

    /// A snapshot of this instance's bookkeeping counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Walk the entire structure and return the first broken invariant
    /// found, or `Ok(())` if none is.
    ///
    /// This is an O(n) diagnostic, not something to call on the allocation
    /// fast path; it exists for test suites and for callers who suspect
    /// memory corruption.
    pub fn check(&self) -> Result<(), CheckError> {
        if self.stats.free_size + self.stats.used_size != self.stats.total_size {
            log::error!("tlsf: check: free_size + used_size != total_size");
            return Err(CheckError::SizeAccountingMismatch);
        }

        for fl in 0..FL_COUNT {
            for sl in 0..SL_COUNT {
                if self.sl_bitmap[fl].get_bit(sl as u32) != self.blocks[fl][sl].is_some() {
                    log::error!("tlsf: check: bitmap/matrix mismatch at fl={} sl={}", fl, sl);
                    return Err(CheckError::BitmapMismatch);
                }
                let mut cursor = self.blocks[fl][sl];
                while let Some(b) = cursor {
                    let block: NonNull<BlockHdr> = unsafe { FreeBlockHdr::as_block(b) };
                    let size = unsafe { block.as_ref().size() };
                    if mapping_insert(size) != (fl, sl) {
                        log::error!("tlsf: check: free block of size {} misfiled at fl={} sl={}", size, fl, sl);
                        return Err(CheckError::FreeListMismatch);
                    }
                    cursor = unsafe { b.as_ref().next_free };
                }
            }
            if self.fl_bitmap.get_bit(fl as u32) != (self.sl_bitmap[fl] != 0) {
                log::error!("tlsf: check: fl_bitmap mismatch at fl={}", fl);
                return Err(CheckError::BitmapMismatch);
            }
        }

        let mut pool = self.pool_list;
        while let Some(pool_hdr) = pool {
            unsafe {
                let mut block = PoolHdr::first_block(pool_hdr);
                loop {
                    let size = block.as_ref().size();
                    if size == 0 {
                        if block.as_ref().is_free() {
                            log::error!("tlsf: check: sentinel marked free");
                            return Err(CheckError::MissingSentinel);
                        }
                        break;
                    }
                    if size % BLOCK_ALIGN != 0 || size < BLOCK_SIZE_MIN {
                        log::error!("tlsf: check: block of invalid size {}", size);
                        return Err(CheckError::BadBlockSize);
                    }
                    let next = BlockHdr::next_phys_block(block);
                    if block.as_ref().is_free() && next.as_ref().is_free() {
                        log::error!("tlsf: check: adjacent free blocks were not coalesced");
                        return Err(CheckError::AdjacentFreeBlocks);
                    }
                    if block.as_ref().is_free() != next.as_ref().is_prev_free() {
                        log::error!("tlsf: check: is_prev_free disagrees with neighbor's actual state");
                        return Err(CheckError::FreeListMismatch);
                    }
                    block = next;
                }
                pool = pool_hdr.as_ref().next_pool;
            }
        }

        Ok(())
    }
}

impl Drop for Tlsf {
    fn drop(&mut self) {
        let Some(unmap) = self.unmap else {
            return;
        };

        let mut initial = None;
        let mut pool = self.pool_list;
        while let Some(pool_hdr) = pool {
            unsafe {
                let next_pool = pool_hdr.as_ref().next_pool;
                if pool_hdr.as_ref().is_auto_grown {
                    let block = PoolHdr::first_block(pool_hdr);
                    let sentinel = BlockHdr::next_phys_block(block);
                    if !(block.as_ref().is_free() && sentinel.as_ref().size() == 0) {
                        log::warn!(
                            "tlsf: dropping Tlsf with a non-empty pool still attached; its \
                             allocations are now dangling"
                        );
                    }
                    let region_size = pool_hdr.as_ref().region_size;
                    unmap(pool_hdr.cast(), region_size, self.user);
                } else {
                    initial = Some(pool_hdr);
                }
                pool = next_pool;
            }
        }

        if let Some(pool_hdr) = initial {
            unsafe {
                let region_size = pool_hdr.as_ref().region_size;
                unmap(pool_hdr.cast(), region_size, self.user);
            }
        }
    }
}
