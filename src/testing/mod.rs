//! Testing utilities and mock implementations
//!
//! A scripted engine lets the bridge be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
