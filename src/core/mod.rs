//! Core constants, error types, and sequence arithmetic.
//!
//! Everything here is pure and shared by the channel and transport layers.

pub mod constants;
mod error;
mod sequence;

pub use error::*;
pub use sequence::*;
