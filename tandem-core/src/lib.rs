//! Tandem - Core Library
//!
//! Keeps a group of listeners in lockstep on the same stream. Each participant
//! reconciles its local media engine against authoritative room snapshots;
//! the participant holding the host role also answers timing probes.

pub mod channel;
pub mod config;
pub mod ffi;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::{LocalProfile, SyncConfig};
pub use sync::{InboundEvent, OutboundEvent, SessionNotice, SyncEngine};
pub use transport::{EngineClient, EngineTransport, MediaTransport};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
