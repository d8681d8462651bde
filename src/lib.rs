//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** TLSF is suitable for real-time applications.
//!
//!  - **The memory pool is provided by an application.** An initial pool is
//!    obtained through a caller-supplied `map` callback when a [`Tlsf`] is
//!    created; further pools are requested automatically on demand and
//!    released automatically once fully drained, through the same `map`/
//!    `unmap` pair.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications. It does not install itself as
//!    `#[global_allocator]`; wiring a `Tlsf` into one is left to downstream
//!    crates.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Example
//!
//! ```rust
//! use tlsf_alloc::Tlsf;
//! use std::{alloc::{alloc, Layout}, ffi::c_void, ptr::NonNull};
//!
//! unsafe fn map(size: &mut usize, _user: *mut c_void) -> Option<NonNull<u8>> {
//!     let layout = Layout::from_size_align(*size, 16).ok()?;
//!     NonNull::new(alloc(layout))
//! }
//!
//! let mut tlsf = Tlsf::new(map, None, core::ptr::null_mut()).unwrap();
//!
//! unsafe {
//!     let p = tlsf.malloc(64).unwrap();
//!     *p.as_ptr() = 42;
//!     assert_eq!(*p.as_ptr(), 42);
//!     tlsf.free(Some(p));
//! }
//! ```
//!
//! # Details
//!
//! ## Changes from the original algorithm
//!
//!  - The end of each memory pool is capped by a sentinel block (a
//!    permanently occupied, zero-size block) instead of a normal block with
//!    a last-block-in-pool flag. This simplifies the code and improves
//!    worst-case performance.
//!  - The shared "empty free list" terminator (traditionally a
//!    self-referential sentinel block) is realized here as `Option::None`,
//!    relying on `NonNull`'s niche optimization for the same branch-free
//!    codegen without a shared mutable sentinel aliasing across instances.
#![no_std]

pub mod diagnostics;
mod init;
pub mod int;
mod tlsf;
mod utils;

pub use self::diagnostics::{CheckError, Stats};
pub use self::init::Init;
pub use self::tlsf::mapping::{ALIGN, BLOCK_SIZE_MAX};
pub use self::tlsf::{MapFn, Tlsf, UnmapFn};

#[cfg(any(test, feature = "std"))]
extern crate std;
