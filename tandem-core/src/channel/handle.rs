//! Outbound channel handle

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sync::{InboundEvent, OutboundEvent};

/// Channel-related errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
}

/// Events delivered by the channel collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A decoded wire message
    Message(InboundEvent),
    /// The connection was lost
    Closed { reason: String },
}

/// Handle to emit messages toward the room channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound_tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelHandle {
    /// Create a handle and the receiver the channel collaborator drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (Self { outbound_tx }, outbound_rx)
    }

    pub fn send(&self, message: OutboundEvent) -> Result<(), ChannelError> {
        debug!("Outbound: {:?}", message);
        self.outbound_tx
            .send(message)
            .map_err(|_| ChannelError::Closed)
    }

    /// Check if the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.outbound_tx.is_closed()
    }
}
