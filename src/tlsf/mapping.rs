//! Size-to-free-list-cell mapping. The core arithmetic of the two-level
//! segregated fit index, kept free of any `Tlsf` state so it can be tested
//! in isolation.

/// Minimum alignment of user pointers and block sizes.
#[cfg(target_pointer_width = "64")]
pub const ALIGN: usize = 8;
#[cfg(target_pointer_width = "32")]
pub const ALIGN: usize = 4;

/// log2 of the number of second-level subdivisions per first-level class.
pub const SL_SHIFT: u32 = 5;

/// Number of second-level subdivisions per first-level class.
pub const SL_COUNT: usize = 1 << SL_SHIFT;

/// log2 of the largest representable block.
#[cfg(target_pointer_width = "64")]
pub const FL_MAX: u32 = 33;
#[cfg(target_pointer_width = "32")]
pub const FL_MAX: u32 = 29;

/// `SL_SHIFT + log2(ALIGN)`.
pub const FL_SHIFT: u32 = SL_SHIFT + ALIGN.trailing_zeros();

/// Number of first-level classes.
pub const FL_COUNT: usize = (FL_MAX - FL_SHIFT + 1) as usize;

/// The threshold below which sizes are bucketed linearly instead of
/// logarithmically (`1 << FL_SHIFT`).
pub const SMALL: usize = 1 << FL_SHIFT;

/// The block-size granularity actually used for header packing.
///
/// The packed header word needs three free low bits (`is_free`,
/// `is_prev_free`, `is_pool`), which requires rounding block sizes to at
/// least 8 bytes. On 64-bit targets this is the same as [`ALIGN`]; on 32-bit
/// targets (`ALIGN == 4`) it is stricter. Rounding up only ever *relaxes* the
/// alignment of a block's size, so invariant 1 (`size` is a multiple of
/// `ALIGN`) still holds.
pub const BLOCK_ALIGN: usize = if ALIGN >= 8 { ALIGN } else { 8 };

/// Largest size a single allocation may request, per §6's stated limit.
pub const BLOCK_SIZE_MAX: usize = 1 << FL_MAX;

const USIZE_BITS: u32 = usize::BITS;

/// Find the free-list cell to store a free block of the given size in
/// (`mapping_insert` in the prose spec).
///
/// `size` must already be a multiple of [`BLOCK_ALIGN`].
#[inline]
pub(crate) fn mapping_insert(size: usize) -> (usize, usize) {
    debug_assert!(size % BLOCK_ALIGN == 0);

    if size < SMALL {
        (0, size / BLOCK_ALIGN)
    } else {
        let k = USIZE_BITS - 1 - size.leading_zeros();
        let sl = (size >> (k - SL_SHIFT)) ^ (1 << SL_SHIFT);
        let fl = k - (FL_SHIFT - 1);
        (fl as usize, sl)
    }
}

/// Find the smallest free-list cell all of whose blocks are guaranteed to be
/// `>= size` (`mapping_search` in the prose spec).
#[inline]
pub(crate) fn mapping_search(size: usize) -> (usize, usize) {
    debug_assert!(size % BLOCK_ALIGN == 0);

    if size >= SMALL {
        let k = USIZE_BITS - 1 - size.leading_zeros();
        let round_up = (1usize << (k - SL_SHIFT)).wrapping_sub(1);
        mapping_insert(size.wrapping_add(round_up))
    } else {
        mapping_insert(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_are_linear() {
        assert_eq!(mapping_insert(0), (0, 0));
        assert_eq!(mapping_insert(BLOCK_ALIGN), (0, 1));
        assert_eq!(mapping_insert(SMALL - BLOCK_ALIGN), (0, SL_COUNT - 1));
    }

    #[test]
    fn first_large_class_starts_at_fl_one() {
        let (fl, sl) = mapping_insert(SMALL);
        assert_eq!(fl, 1);
        assert_eq!(sl, 0);
    }

    #[test]
    fn search_rounds_up_within_the_same_class() {
        // `SMALL + BLOCK_ALIGN` should map to a cell whose minimum size is
        // `>= SMALL + BLOCK_ALIGN`, not the literal `(fl, sl)` of that exact
        // size (unless they coincide).
        let (fl, sl) = mapping_search(SMALL + BLOCK_ALIGN);
        let (fl2, sl2) = mapping_insert(SMALL + BLOCK_ALIGN);
        assert!((fl, sl) >= (fl2, sl2));
    }

    #[test]
    fn search_of_a_class_boundary_is_a_no_op() {
        // Exact boundaries of a class should map identically in both
        // directions, since there's nothing to round up to.
        let (fl, sl) = mapping_insert(SMALL);
        assert_eq!(mapping_search(SMALL), (fl, sl));
    }

    #[test]
    fn fl_count_fits_max_block_size() {
        let max_size = (1usize << FL_MAX) - BLOCK_ALIGN;
        let (fl, _) = mapping_insert(max_size);
        assert!(fl < FL_COUNT);
    }
}
