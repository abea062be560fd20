//! Sync Protocol Messages
//!
//! Every message on the room channel is a JSON envelope of the form
//! `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding or encoding wire messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Loop behaviour of the room player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// No looping
    #[default]
    #[serde(alias = "none")]
    Off,
    /// Wrap around to the first track after the last one
    Queue,
    /// Repeat the current track
    Track,
}

impl LoopMode {
    /// Next mode in the off → queue → track cycle
    pub fn next(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Track,
            LoopMode::Track => LoopMode::Off,
        }
    }
}

/// A queued track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Track ID (unique within the room)
    pub id: String,
    /// URL the track was added from
    pub url: String,
    /// Resolved, playable stream URL
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Display title
    pub title: String,
    /// Author or uploader
    #[serde(default)]
    pub author: Option<String>,
    /// Thumbnail URL
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Duration in seconds, if known
    #[serde(default)]
    pub duration: Option<f64>,
    /// Display name of whoever queued it
    pub added_by: String,
    /// Source kind tag (e.g. "soundcloud", "youtube")
    #[serde(default)]
    pub source: Option<String>,
}

/// Authoritative player state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Index into the queue (may be out of range when the queue is empty)
    #[serde(rename = "current_track_index", default)]
    pub current_index: i64,
    /// Whether the room is playing
    #[serde(default)]
    pub is_playing: bool,
    /// Position in seconds when the player state was last written
    #[serde(rename = "timestamp", default)]
    pub position_seconds: f64,
    /// Authoritative-clock time at which playback would have been at zero
    /// (`written_at - position` while playing)
    #[serde(rename = "start_time", default)]
    pub start_time_seconds: f64,
    /// Authoritative-clock time of the last change
    #[serde(rename = "last_updated", default)]
    pub last_updated_seconds: f64,
    /// Loop behaviour
    #[serde(default)]
    pub loop_mode: LoopMode,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            current_index: 0,
            is_playing: false,
            position_seconds: 0.0,
            start_time_seconds: 0.0,
            last_updated_seconds: 0.0,
            loop_mode: LoopMode::Off,
        }
    }
}

/// Room member (membership only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Connection ID
    #[serde(rename = "sid")]
    pub connection_id: String,
    /// Display name
    #[serde(rename = "nickname")]
    pub display_name: String,
}

/// Full room description as sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    /// Room ID
    #[serde(rename = "id")]
    pub room_id: String,
    /// Connection ID of the current host (timing source)
    #[serde(rename = "admin_sid", default)]
    pub host_id: Option<String>,
    /// Members in join order
    #[serde(default)]
    pub users: Vec<User>,
    /// Playback order
    #[serde(default)]
    pub queue: Vec<Track>,
    /// Player state
    #[serde(default)]
    pub player: PlayerState,
}

impl RoomState {
    /// Track at the current index, if the index is in range
    pub fn current_track(&self) -> Option<&Track> {
        usize::try_from(self.player.current_index)
            .ok()
            .and_then(|i| self.queue.get(i))
    }
}

/// Messages received from the room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Full room snapshot
    RoomState {
        state: RoomState,
        server_time: f64,
    },

    /// Queue changed; the index is only present when it moved
    QueueUpdate {
        queue: Vec<Track>,
        #[serde(default)]
        current_track_index: Option<i64>,
        #[serde(default)]
        server_time: Option<f64>,
    },

    /// Timing probe for the host, on behalf of `requester_sid`
    GetHostState { requester_sid: String },

    /// Targeted timing correction (answer to our resync request)
    SyncTarget {
        timestamp: f64,
        is_playing: bool,
        server_time: f64,
    },

    /// Liveness ping
    Ping {
        #[serde(default)]
        room_id: Option<String>,
    },

    /// Periodic timing pulse from the host, relayed to everyone else
    SyncPulse {
        timestamp: f64,
        is_playing: bool,
        server_time: f64,
    },

    /// Player state changed
    PlayerUpdate { player: PlayerState, server_time: f64 },

    /// Fault reported by the server
    Error { message: String },

    /// We were removed from the room
    Kicked {},

    /// Someone joined (host pushes timing to them)
    UserJoined { nickname: String, sid: String },

    /// Informational message (join acknowledgements and the like)
    Notification { message: String },
}

impl InboundEvent {
    /// Decode a wire message
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Transport control actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Play,
    Pause,
    Seek,
    Next,
    Prev,
    Loop,
}

/// Messages sent to the room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Request to join a room
    JoinRoom {
        room_id: String,
        nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        user_id: String,
    },

    /// Ask the host for a fresh timing push
    RequestSync { room_id: String },

    /// Bare host liveness pulse
    HostHeartbeat { room_id: String },

    /// Host answer to a timing probe
    HostStateResponse {
        room_id: String,
        requester_sid: String,
        timestamp: f64,
        is_playing: bool,
    },

    /// Unsolicited full timing push from the host
    HostSync {
        room_id: String,
        timestamp: f64,
        is_playing: bool,
    },

    /// Reply to a liveness ping
    ClientPong { room_id: String },

    /// Transport control request
    PlayerControl {
        room_id: String,
        action: ControlAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_mode: Option<LoopMode>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        auto: bool,
    },
}

impl OutboundEvent {
    /// Encode for the wire
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check if this message may only be sent while holding the host role
    pub fn requires_host(&self) -> bool {
        matches!(
            self,
            OutboundEvent::HostHeartbeat { .. }
                | OutboundEvent::HostStateResponse { .. }
                | OutboundEvent::HostSync { .. }
        )
    }
}
