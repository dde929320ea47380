//! The seam between a room session and whatever carries its frames.
//!
//! A transport delivers relay-ordered frames for one room connection. It
//! reports gaps in delivery as [`TransportEvent::Desynced`] so the session
//! can request a snapshot, and loss of the connection as
//! [`TransportEvent::Closed`].
//!
//! A frame addressed to one member (welcome, resync, kick) must be
//! delivered before any room frame the relay sequenced after it.

use std::future::Future;
use std::sync::Arc;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Encoded [`Frame`](crate::protocol::Frame).
    Frame(Arc<Vec<u8>>),
    /// Frames were lost; local state can no longer be trusted.
    Desynced,
    Closed { reason: String },
}

pub trait Transport: Send {
    /// Queue an encoded frame for the relay.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), ProtocolError>;

    /// Wait for the next inbound event.
    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Next inbound event if one is already queued.
    fn try_recv(&mut self) -> Option<TransportEvent>;

    /// Tear the connection down. Idempotent.
    fn close(&mut self);
}
