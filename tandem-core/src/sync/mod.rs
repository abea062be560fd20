//! Sync Engine
//!
//! Reconciles local playback against authoritative room snapshots.

mod clock;
pub mod driver;
mod engine;
mod fault;
mod host;
mod loader;
mod protocol;
mod state;

pub use clock::*;
pub use driver::{DriverHandle, DriverStatus};
pub use engine::*;
pub use fault::*;
pub use host::*;
pub use loader::*;
pub use protocol::*;
pub use state::*;
