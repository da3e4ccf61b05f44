//! # Upward Event Interface
//!
//! This module exposes the [`EventSink`] trait through which the transport
//! notifies higher driver layers: received frames keyed by logical service,
//! send completions, and fatal device failures. Implementors must not block;
//! notifications are delivered from the deferred interrupt worker.

use std::fmt::Debug;
use std::sync::Arc;

use super::wire::ServiceId;

/// Receiver of transport notifications.
pub trait EventSink: Debug + Send + Sync {
    /// An inbound frame arrived for `service`.
    fn frame_received(&self, service: ServiceId, frame: Vec<u8>);

    /// An outbound frame for `service` completed; its send permit is
    /// available again.
    fn send_complete(&self, service: ServiceId);

    /// The firmware signalled a fatal error. The device needs a full reset;
    /// the transport will not retry anything on its behalf.
    fn firmware_fault(&self);
}

/// A reference-counted reference to an event sink.
pub type EventSinkRef = Arc<dyn EventSink>;

/// A do-nothing sink for transports whose events nobody consumes yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyEventSink {}

impl DummyEventSink {
    /// Create a new dummy sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for DummyEventSink {
    fn frame_received(&self, _service: ServiceId, _frame: Vec<u8>) {}

    fn send_complete(&self, _service: ServiceId) {}

    fn firmware_fault(&self) {}
}
