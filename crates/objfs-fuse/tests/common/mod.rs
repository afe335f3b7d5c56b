//! Shared helpers for the kernel-mount integration tests.

pub mod harness;

#[allow(unused_imports)]
pub use harness::*;
