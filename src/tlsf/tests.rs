use super::*;
use core::ffi::c_void;
use std::alloc::{alloc, dealloc, Layout};
use std::vec::Vec;

const TEST_ALIGN: usize = 16;

unsafe fn map_always(size: &mut usize, _user: *mut c_void) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(*size, TEST_ALIGN).unwrap();
    NonNull::new(alloc(layout))
}

unsafe fn unmap_always(ptr: NonNull<u8>, size: usize, _user: *mut c_void) {
    let layout = Layout::from_size_align(size, TEST_ALIGN).unwrap();
    dealloc(ptr.as_ptr(), layout);
}

/// `map` that stops granting memory after the caller flips `*user` (a
/// `*mut bool`) to `true`. Used to exercise the "realloc leaves the
/// original pointer intact on failure" scenario.
unsafe fn map_until_exhausted(size: &mut usize, user: *mut c_void) -> Option<NonNull<u8>> {
    let exhausted = &*(user as *const core::cell::Cell<bool>);
    if exhausted.get() {
        return None;
    }
    map_always(size, core::ptr::null_mut())
}

fn new_tlsf() -> Tlsf {
    Tlsf::new(map_always, Some(unmap_always), core::ptr::null_mut()).unwrap()
}

#[test]
fn fresh_control_passes_check() {
    let tlsf = new_tlsf();
    assert_eq!(tlsf.check(), Ok(()));
    let stats = tlsf.stats();
    assert_eq!(stats.pool_count, 1);
    assert_eq!(stats.used_size, 0);
    assert_eq!(stats.free_size, stats.total_size);
}

#[test]
fn malloc_zero_returns_a_freeable_pointer() {
    let mut tlsf = new_tlsf();
    unsafe {
        let p = tlsf.malloc(0).expect("malloc(0) should succeed");
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        tlsf.free(Some(p));
    }
    assert_eq!(tlsf.check(), Ok(()));
}

#[test]
fn free_of_null_is_a_no_op() {
    let mut tlsf = new_tlsf();
    unsafe {
        tlsf.free(None);
    }
    assert_eq!(tlsf.check(), Ok(()));
}

#[test]
fn realloc_of_null_behaves_like_malloc() {
    let mut tlsf = new_tlsf();
    unsafe {
        let p = tlsf.realloc(None, 32).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        tlsf.free(Some(p));
    }
}

#[test]
fn realloc_to_zero_behaves_like_free() {
    let mut tlsf = new_tlsf();
    unsafe {
        let p = tlsf.malloc(32).unwrap();
        let r = tlsf.realloc(Some(p), 0);
        assert!(r.is_none());
    }
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 1: split-and-coalesce round trip.
#[test]
fn split_and_coalesce_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    let free_before = tlsf.stats().free_size;
    unsafe {
        let p1 = tlsf.malloc(64).unwrap();
        let p2 = tlsf.malloc(64).unwrap();
        tlsf.free(Some(p1));
        tlsf.free(Some(p2));
    }
    let stats = tlsf.stats();
    assert_eq!(stats.used_size, 0);
    assert_eq!(stats.free_size, free_before);
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 2: good-fit selection reuses a freed block without growing the
/// pool.
#[test]
fn good_fit_selection_reuses_freed_block() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    unsafe {
        let p1 = tlsf.malloc(100).unwrap();
        let _p2 = tlsf.malloc(200).unwrap();
        let p3 = tlsf.malloc(100).unwrap();
        tlsf.free(Some(p1));
        tlsf.free(Some(p3));

        let pools_before = tlsf.stats().pool_count;
        let p4 = tlsf.malloc(90).unwrap();
        assert_eq!(tlsf.stats().pool_count, pools_before, "must not have grown the pool");
        assert!(p4 == p1 || p4 == p3);
    }
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 3: pool auto-grow and auto-release.
#[test]
fn pool_auto_grows_and_auto_releases() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    let mut allocs = Vec::new();
    unsafe {
        let initial_pools = tlsf.stats().pool_count;
        // Drain the initial pool until a second pool is grown.
        while tlsf.stats().pool_count == initial_pools {
            allocs.push(tlsf.malloc(256).expect("backing map never fails in this test"));
        }
        assert_eq!(tlsf.stats().pool_count, initial_pools + 1);

        // Free everything; the grown pool should auto-release, leaving just
        // the initial one.
        for p in allocs.drain(..) {
            tlsf.free(Some(p));
        }
        assert_eq!(tlsf.stats().pool_count, initial_pools);
    }
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 4: realloc grows in place when the next physical block is free
/// and large enough.
#[test]
fn realloc_grows_in_place_when_possible() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    unsafe {
        let p = tlsf.malloc(64).unwrap();
        *p.as_ptr() = 0xAB;
        let q = tlsf.realloc(Some(p), 96).unwrap();
        assert_eq!(q, p);
        assert_eq!(*q.as_ptr(), 0xAB);
        tlsf.free(Some(q));
    }
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 5: realloc moves when there isn't room to grow in place,
/// preserving content.
#[test]
fn realloc_moves_when_no_room_to_grow() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    unsafe {
        let p = tlsf.malloc(64).unwrap();
        let _blocker = tlsf.malloc(64).unwrap(); // occupies the space p would grow into
        *p.as_ptr() = 0xCD;

        let q = tlsf.realloc(Some(p), 4096).unwrap();
        assert_ne!(q, p);
        assert_eq!(*q.as_ptr(), 0xCD);
        tlsf.free(Some(q));
    }
    assert_eq!(tlsf.check(), Ok(()));
}

/// Scenario 6: a realloc that cannot be satisfied leaves the original
/// allocation untouched.
#[test]
fn realloc_failure_preserves_original() {
    let _ = env_logger::builder().is_test(true).try_init();

    let exhausted = core::cell::Cell::new(false);
    let mut tlsf = Tlsf::new(
        map_until_exhausted,
        Some(unmap_always),
        &exhausted as *const _ as *mut c_void,
    )
    .unwrap();

    unsafe {
        let p = tlsf.malloc(64).unwrap();
        *p.as_ptr() = 7;
        exhausted.set(true);

        let r = tlsf.realloc(Some(p), 1 << 28);
        assert!(r.is_none());
        assert_eq!(*p.as_ptr(), 7);

        tlsf.free(Some(p));
    }
}

// --- randomized fuzzing against a shadow model --------------------------

/// Tracks live allocations as non-overlapping byte ranges, independent of
/// the per-slot bookkeeping in [`Shadow`]. Catches the case `Shadow` alone
/// cannot: two allocations the pool handed out aliasing the same bytes.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum SaRegion {
    Free,
    Used,
}

struct ShadowAllocator {
    regions: std::collections::BTreeMap<usize, SaRegion>,
}

impl ShadowAllocator {
    fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Free)).into_iter().collect(),
        }
    }

    fn convert_range(&mut self, range: core::ops::Range<usize>, old: SaRegion, new: SaRegion) {
        if range.is_empty() {
            return;
        }
        assert_ne!(old, new);

        let (&addr, &region) = self.regions.range(0..range.end).next_back().unwrap();
        assert!(addr <= range.start, "discontinuity at {:?}", range);
        assert_eq!(
            region, old,
            "range {:?} is {:?}, expected {:?} (overlapping allocation?)",
            range, region, old
        );

        if addr == range.start {
            *self.regions.get_mut(&addr).unwrap() = new;
        } else {
            self.regions.insert(range.start, new);
        }

        if let Some((_, &r)) = self.regions.range(0..range.start).next_back() {
            if r == new {
                self.regions.remove(&range.start);
            }
        }
        if let Some(&end_region) = self.regions.get(&range.end) {
            if end_region == new {
                self.regions.remove(&range.end);
            }
        } else {
            self.regions.insert(range.end, old);
        }
    }

    fn allocate(&mut self, start: usize, size: usize) {
        self.convert_range(start..start + size, SaRegion::Free, SaRegion::Used);
    }

    fn deallocate(&mut self, start: usize, size: usize) {
        self.convert_range(start..start + size, SaRegion::Used, SaRegion::Free);
    }
}

enum Op {
    Alloc(usize),
    Free(usize),
    Realloc(usize, usize),
}

/// Each raw `(u8, usize, usize)` tuple (quickcheck already knows how to
/// generate and shrink these) is decoded into an [`Op`] here rather than
/// through a hand-written `Arbitrary` impl.
fn decode_op((kind, a, b): (u8, usize, usize)) -> Op {
    match kind % 3 {
        0 => Op::Alloc(a % 512),
        1 => Op::Free(a % 64),
        _ => Op::Realloc(a % 64, b % 512),
    }
}

/// Tracks live allocations as `(pointer, requested size, fill byte)` so
/// reallocated/freed slots can be checked for content preservation and
/// reused as indices by later ops.
type Shadow = Vec<Option<(NonNull<u8>, usize, u8)>>;

fn run(raw_ops: Vec<(u8, usize, usize)>) -> bool {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tlsf = new_tlsf();
    let mut shadow: Shadow = Vec::new();
    let mut sa = ShadowAllocator::new();

    for (i, raw_op) in raw_ops.into_iter().enumerate() {
        let op = decode_op(raw_op);
        unsafe {
            match op {
                Op::Alloc(size) => match tlsf.malloc(size) {
                    Some(p) => {
                        if p.as_ptr() as usize % ALIGN != 0 {
                            return false;
                        }
                        sa.allocate(p.as_ptr() as usize, size);
                        let fill = (i % 251) as u8;
                        core::ptr::write_bytes(p.as_ptr(), fill, size);
                        shadow.push(Some((p, size, fill)));
                    }
                    None => shadow.push(None),
                },
                Op::Free(idx) => {
                    if shadow.is_empty() {
                        continue;
                    }
                    let idx = idx % shadow.len();
                    if let Some((p, size, _)) = shadow[idx].take() {
                        sa.deallocate(p.as_ptr() as usize, size);
                        tlsf.free(Some(p));
                    }
                }
                Op::Realloc(idx, new_size) => {
                    if shadow.is_empty() {
                        continue;
                    }
                    let idx = idx % shadow.len();
                    if let Some((p, old_size, fill)) = shadow[idx].take() {
                        if new_size == 0 {
                            // `realloc(_, 0)` behaves like `free`: the block
                            // is gone regardless of what it returns.
                            sa.deallocate(p.as_ptr() as usize, old_size);
                            tlsf.realloc(Some(p), 0);
                            shadow[idx] = None;
                            continue;
                        }
                        match tlsf.realloc(Some(p), new_size) {
                            Some(new_p) => {
                                if new_p.as_ptr() as usize % ALIGN != 0 {
                                    return false;
                                }
                                sa.deallocate(p.as_ptr() as usize, old_size);
                                sa.allocate(new_p.as_ptr() as usize, new_size);
                                let check_len = old_size.min(new_size);
                                for k in 0..check_len {
                                    if *new_p.as_ptr().add(k) != fill {
                                        return false;
                                    }
                                }
                                shadow[idx] = Some((new_p, new_size, fill));
                            }
                            None => {
                                // Original must remain valid and untouched.
                                shadow[idx] = Some((p, old_size, fill));
                            }
                        }
                    }
                }
            }
        }
        if tlsf.check().is_err() {
            return false;
        }
    }
    true
}

#[quickcheck_macros::quickcheck]
fn shadow_model_fuzz(ops: Vec<(u8, usize, usize)>) -> bool {
    run(ops)
}
