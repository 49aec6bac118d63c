//! Testing utilities and mock implementations
//!
//! Everything needed to drive supervisors without a real broker.

pub mod mocks;

pub use mocks::*;
