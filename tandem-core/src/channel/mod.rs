//! Room Channel
//!
//! The network channel itself lives outside this crate. This module holds the
//! handle the engine uses to emit wire messages and the per-device
//! participant identifier.

mod handle;
mod participant;

pub use handle::{ChannelError, ChannelEvent, ChannelHandle};
pub use participant::ParticipantId;
