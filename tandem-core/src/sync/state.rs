//! Snapshot Store
//!
//! Holds the last authoritative room snapshot together with the local instant
//! it was accepted. Envelopes are never mutated in place; partial updates
//! build a fresh envelope from the current one.

use super::protocol::{PlayerState, RoomState, Track};

/// Authoritative clock reconstructed from one snapshot.
///
/// Pairs the authoritative timing fields with the local instant the snapshot
/// was received, so the current authoritative position can be projected
/// without any clock-offset negotiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingAnchor {
    /// Whether the room is playing
    pub is_playing: bool,
    /// Position reported when the player state was written
    pub position_seconds: f64,
    /// Authoritative time at which playback would have been at zero
    pub start_time_seconds: f64,
    /// Authoritative time attached to the message
    pub server_time_seconds: f64,
    /// Local clock (ms) when the message was accepted
    pub received_at_ms: u64,
}

impl TimingAnchor {
    /// Project the authoritative position at local time `now_ms`.
    ///
    /// While playing, `server_time - start_time` is how far into the track the
    /// room was when the message was sent. A playing room never reports less
    /// than its last written position, so that position is the floor.
    pub fn project(&self, now_ms: u64) -> f64 {
        if !self.is_playing {
            return self.position_seconds;
        }
        let elapsed_authoritative = (self.server_time_seconds - self.start_time_seconds).max(0.0);
        let elapsed_local = now_ms.saturating_sub(self.received_at_ms) as f64 / 1000.0;
        elapsed_authoritative.max(self.position_seconds) + elapsed_local
    }
}

/// A room snapshot and its local reception time
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Room state as last received
    pub room: RoomState,
    /// Authoritative time attached to the message that set the timing fields
    pub server_time_seconds: f64,
    /// Local clock (ms) when the timing fields were accepted
    pub received_at_ms: u64,
}

impl Envelope {
    pub fn new(room: RoomState, server_time_seconds: f64, received_at_ms: u64) -> Self {
        Self {
            room,
            server_time_seconds,
            received_at_ms,
        }
    }

    /// Timing anchor for projection
    pub fn anchor(&self) -> TimingAnchor {
        let player = &self.room.player;
        TimingAnchor {
            is_playing: player.is_playing,
            position_seconds: player.position_seconds,
            start_time_seconds: player.start_time_seconds,
            server_time_seconds: self.server_time_seconds,
            received_at_ms: self.received_at_ms,
        }
    }

    /// Track at the current index
    pub fn current_track(&self) -> Option<&Track> {
        self.room.current_track()
    }

    /// Check if `connection_id` currently holds the host role
    pub fn is_host(&self, connection_id: &str) -> bool {
        self.room.host_id.as_deref() == Some(connection_id)
    }

    /// New envelope with the player replaced
    pub fn with_player(&self, player: PlayerState, server_time_seconds: f64, received_at_ms: u64) -> Self {
        let mut room = self.room.clone();
        room.player = player;
        Self::new(room, server_time_seconds, received_at_ms.max(self.received_at_ms))
    }

    /// New envelope with the queue replaced and, if given, the index moved.
    /// Timing fields are carried over untouched.
    pub fn with_queue(&self, queue: Vec<Track>, current_index: Option<i64>) -> Self {
        let mut room = self.room.clone();
        room.queue = queue;
        if let Some(index) = current_index {
            room.player.current_index = index;
        }
        Self::new(room, self.server_time_seconds, self.received_at_ms)
    }

    /// New envelope from a timing event: the position is valid at the
    /// authoritative timestamp itself.
    pub fn with_timing(&self, position_seconds: f64, is_playing: bool, server_time_seconds: f64, received_at_ms: u64) -> Self {
        let player = PlayerState {
            position_seconds,
            is_playing,
            start_time_seconds: server_time_seconds - position_seconds,
            last_updated_seconds: server_time_seconds,
            ..self.room.player.clone()
        };
        self.with_player(player, server_time_seconds, received_at_ms)
    }
}

/// Holds the current envelope (or nothing before the first snapshot)
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: Option<Envelope>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally overwrite the current envelope
    pub fn replace(&mut self, envelope: Envelope) {
        self.current = Some(envelope);
    }

    /// Latest envelope, if any
    pub fn current(&self) -> Option<&Envelope> {
        self.current.as_ref()
    }

    /// Check if a message carrying `server_time_seconds` is older than what
    /// has already been applied
    pub fn is_stale(&self, server_time_seconds: f64) -> bool {
        self.current
            .as_ref()
            .map(|e| server_time_seconds < e.server_time_seconds)
            .unwrap_or(false)
    }

    /// Discard everything (leaving the room)
    pub fn clear(&mut self) {
        self.current = None;
    }
}
