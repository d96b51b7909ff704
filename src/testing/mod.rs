//! Testing utilities
//!
//! In-memory transport for exercising the connection manager, publisher and
//! receiver without a broker.

pub mod mocks;

pub use mocks::*;
