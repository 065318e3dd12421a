//! Session registry, command correlation and event fan-out
//!
//! [`SessionRegistry`] owns every live [`Session`]; each session correlates
//! engine completions with the commands that caused them and publishes the
//! outcome on the shared [`EventBus`]. [`MqttClient`] is the per-reference
//! handle most callers want.

pub mod correlator;
pub mod error_translator;
pub mod event_bus;
pub mod facade;
pub mod registry;
pub mod session;

pub use correlator::{CommandKind, CompletionCorrelator, CompletionSlot};
pub use event_bus::{EventBus, EventStream, DEFAULT_EVENT_CAPACITY};
pub use facade::{ClientEvent, EventHandler, MqttClient};
pub use registry::{ClientReference, CommandResult, SessionRegistry};
pub use session::Session;
