//! Value types that cross the caller boundary
//!
//! Session configuration, subscribe/publish parameters and the events
//! published on the shared channel.

pub mod events;
pub mod messages;
pub mod options;

pub use events::*;
pub use messages::*;
pub use options::*;
