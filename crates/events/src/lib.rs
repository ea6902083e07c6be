//! Domain events for the annotation pipeline.
//!
//! - [`EventEnvelope`] / [`EventPayload`] — the canonical event records
//!   consumed from the delivery transport.
//! - [`EventBus`] — in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`CallbackBus`] / [`CallbackEvent`] — outbound status-reporting
//!   events emitted after aggregate state changes.

pub mod bus;
pub mod event;

pub use bus::{CallbackBus, EventBus};
pub use event::{CallbackEvent, EventEnvelope, EventPayload, ImageKind};
