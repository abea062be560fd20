//! FFI bindings for native UI integration
//!
//! This module provides the interface exposed via uniffi to Swift/Kotlin.
//! The native side owns the room channel: it feeds inbound messages to
//! [`Session::deliver`] and sends whatever arrives on
//! [`SessionCallback::on_outbound`].

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
