//! Testing utilities
//!
//! An in-memory broker that lets the connector be exercised end to end
//! without a running RabbitMQ.

pub mod mocks;

pub use mocks::*;
