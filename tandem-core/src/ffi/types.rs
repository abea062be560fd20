//! FFI types exposed via uniffi

use crate::config::{ConfigError, LocalProfile};
use crate::sync::{
    ControlAction, LoopMode, PlayerState, RoomState as InternalRoomState, SessionError,
    Track as InternalTrack,
};
use crate::transport::TransportError;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Media engine is not reachable")]
    EngineNotReachable,

    #[error("Media engine error: {0}")]
    EngineError(String),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Not waiting for a password")]
    NotJoining,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Session stopped")]
    SessionStopped,
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotInRoom => CoreError::NotInRoom,
            SessionError::AlreadyInRoom => CoreError::AlreadyInRoom,
            SessionError::NotJoining => CoreError::NotJoining,
            SessionError::InvalidControl(msg) => CoreError::InvalidRequest(msg),
            SessionError::Channel(_) | SessionError::Stopped => CoreError::SessionStopped,
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotReachable => CoreError::EngineNotReachable,
            TransportError::Unauthorized => CoreError::EngineError("Invalid API token".to_string()),
            other => CoreError::EngineError(other.to_string()),
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::ConfigError(e.to_string())
    }
}

/// Transport control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PlaybackAction {
    Play,
    Pause,
    Seek,
    Next,
    Previous,
    Loop,
}

impl From<PlaybackAction> for ControlAction {
    fn from(a: PlaybackAction) -> Self {
        match a {
            PlaybackAction::Play => ControlAction::Play,
            PlaybackAction::Pause => ControlAction::Pause,
            PlaybackAction::Seek => ControlAction::Seek,
            PlaybackAction::Next => ControlAction::Next,
            PlaybackAction::Previous => ControlAction::Prev,
            PlaybackAction::Loop => ControlAction::Loop,
        }
    }
}

/// Loop behaviour exposed via FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LoopSetting {
    Off,
    Queue,
    Track,
}

impl From<LoopMode> for LoopSetting {
    fn from(m: LoopMode) -> Self {
        match m {
            LoopMode::Off => LoopSetting::Off,
            LoopMode::Queue => LoopSetting::Queue,
            LoopMode::Track => LoopSetting::Track,
        }
    }
}

impl From<LoopSetting> for LoopMode {
    fn from(s: LoopSetting) -> Self {
        match s {
            LoopSetting::Off => LoopMode::Off,
            LoopSetting::Queue => LoopMode::Queue,
            LoopSetting::Track => LoopMode::Track,
        }
    }
}

/// Queued track exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub added_by: String,
    pub source: Option<String>,
}

impl From<&InternalTrack> for TrackInfo {
    fn from(t: &InternalTrack) -> Self {
        Self {
            id: t.id.clone(),
            title: t.title.clone(),
            author: t.author.clone(),
            thumbnail: t.thumbnail.clone(),
            duration_seconds: t.duration,
            added_by: t.added_by.clone(),
            source: t.source.clone(),
        }
    }
}

/// Room member exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct Participant {
    pub connection_id: String,
    pub display_name: String,
    pub is_host: bool,
}

/// Authoritative playback state exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub position_seconds: f64,
    pub loop_mode: LoopSetting,
}

impl From<&PlayerState> for PlaybackState {
    fn from(p: &PlayerState) -> Self {
        Self {
            is_playing: p.is_playing,
            position_seconds: p.position_seconds,
            loop_mode: p.loop_mode.into(),
        }
    }
}

/// Room state exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct RoomInfo {
    pub room_id: String,
    pub host_id: Option<String>,
    pub participants: Vec<Participant>,
    pub queue: Vec<TrackInfo>,
    pub current_index: i64,
    pub playback: PlaybackState,
}

impl From<&InternalRoomState> for RoomInfo {
    fn from(r: &InternalRoomState) -> Self {
        Self {
            room_id: r.room_id.clone(),
            host_id: r.host_id.clone(),
            participants: r
                .users
                .iter()
                .map(|u| Participant {
                    connection_id: u.connection_id.clone(),
                    display_name: u.display_name.clone(),
                    is_host: r.host_id.as_deref() == Some(u.connection_id.as_str()),
                })
                .collect(),
            queue: r.queue.iter().map(TrackInfo::from).collect(),
            current_index: r.player.current_index,
            playback: PlaybackState::from(&r.player),
        }
    }
}

/// Persisted per-device profile exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct ProfileInfo {
    pub participant_id: String,
    pub display_name: Option<String>,
    pub volume: f32,
}

impl From<&LocalProfile> for ProfileInfo {
    fn from(p: &LocalProfile) -> Self {
        Self {
            participant_id: p.participant_id.clone(),
            display_name: p.display_name.clone(),
            volume: p.volume,
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    /// A wire message to send on the room channel (JSON)
    fn on_outbound(&self, message: String);
    fn on_room_state_changed(&self, room: RoomInfo);
    fn on_role_changed(&self, is_host: bool);
    fn on_track_changed(&self, track: Option<TrackInfo>);
    /// Playback needs one user interaction before it can start
    fn on_autoplay_blocked(&self);
    /// The room password was rejected; call `retry_join`
    fn on_password_required(&self);
    fn on_error(&self, message: String);
    fn on_notification(&self, message: String);
    fn on_session_ended(&self, reason: String);
}
