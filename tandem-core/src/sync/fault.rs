//! Fault classification

use thiserror::Error;

use crate::transport::MediaFaultKind;

/// Server message for a room that does not exist
const ROOM_NOT_FOUND: &str = "room not found";
/// Server message for a rejected room password
const INVALID_PASSWORD: &str = "invalid password";
/// Server message for a banned participant
const BANNED: &str = "banned";

/// Everything that can go wrong during a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Credential rejected; the session waits for a retry
    #[error("Invalid password")]
    Authentication,
    /// The room no longer exists
    #[error("Room not found")]
    NotFound,
    /// We were kicked or banned
    #[error("Removed from the room")]
    Removed,
    /// Decode or network error from the media engine
    #[error("Playback error: {0}")]
    Transport(String),
    /// Segmented pipeline failed to parse or attach
    #[error("Stream failed to load: {0}")]
    Load(String),
    /// Anything else the server reported
    #[error("{0}")]
    Generic(String),
}

impl Fault {
    /// Classify a server `error` message
    pub fn classify(message: &str) -> Self {
        let lower = message.trim().to_ascii_lowercase();
        if lower.contains(ROOM_NOT_FOUND) {
            Fault::NotFound
        } else if lower.contains(INVALID_PASSWORD) {
            Fault::Authentication
        } else if lower.contains(BANNED) {
            Fault::Removed
        } else {
            Fault::Generic(message.to_string())
        }
    }

    /// Map a media engine fault
    pub fn from_media(kind: MediaFaultKind, message: impl Into<String>) -> Self {
        match kind {
            MediaFaultKind::Playback => Fault::Transport(message.into()),
            MediaFaultKind::Load => Fault::Load(message.into()),
        }
    }

    /// Check if the session must be torn down
    pub fn is_terminal(&self) -> bool {
        matches!(self, Fault::NotFound | Fault::Removed)
    }

    /// Check if the host should skip past the current track
    pub fn is_media(&self) -> bool {
        matches!(self, Fault::Transport(_) | Fault::Load(_))
    }
}
