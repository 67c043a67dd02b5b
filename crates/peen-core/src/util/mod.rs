//! Utility constants and helpers shared across the crate.
//!
//! This module provides:
//! - Memory geometry constants ([`PAGE_SIZE`], [`ROW_SIZE`], [`CL_SIZE`], ...)
//! - Thin mmap/mprotect/munmap wrappers used by the inventory and the
//!   jitted hammer code

mod constants;
mod mmap;

pub use self::constants::*;
pub use self::mmap::*;
