//! Common types shared across the library.
//!
//! This module provides:
//! 1. **Errors:** The library-wide [`Error`] enum and [`Result`] alias.
//! 2. **Masks:** Capacity-bit-mask helpers for cache-way validation.

pub mod error;
pub mod mask;

pub use error::{Error, Result};
