//! Testing utilities and mock implementations
//!
//! Lets the failover, probing and dispatch logic be exercised without a
//! running message broker.

pub mod mocks;

pub use mocks::*;
