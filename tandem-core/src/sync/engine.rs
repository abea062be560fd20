//! Session engine
//!
//! Owns the snapshot store, reconciler, loader, host responder and the
//! transport for one participant session. Every input is one discrete,
//! non-blocking step; callers pass the local clock in explicitly. The only
//! wall-clock read is the cache-busting stamp on freshly loaded sources.
//!
//! Inputs only record what changed. [`SyncEngine::flush`] then runs a single
//! load + reconcile pass, so a burst of updates collapses into one set of
//! transport commands.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelHandle};
use crate::config::{ConfigError, SyncConfig};
use crate::transport::{MediaTransport, TransportError, TransportEvent};

use super::clock::{ClockReconciler, Correction};
use super::fault::Fault;
use super::host::HostResponder;
use super::loader::{LoadOutcome, SourcePolicy, TrackLoader};
use super::protocol::{ControlAction, InboundEvent, LoopMode, OutboundEvent, RoomState, Track};
use super::state::{Envelope, SnapshotStore};

/// Errors from user-initiated session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Not waiting for a credential")]
    NotJoining,

    #[error("Invalid control request: {0}")]
    InvalidControl(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Session driver stopped")]
    Stopped,
}

/// Who we are in the room
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub room_id: String,
    pub display_name: String,
    /// Stable per-device identifier
    pub participant_id: String,
    /// Connection ID assigned by the channel; compared against the host ID
    pub connection_id: String,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session
    Idle,
    /// Join sent, no snapshot yet
    Joining,
    /// Receiving snapshots
    Active,
    /// Torn down by a terminal fault or channel loss
    Ended,
}

/// Things the user-facing layer should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A snapshot or partial update was applied
    RoomUpdated(RoomState),
    /// The local host role changed
    RoleChanged { is_host: bool },
    /// The transport now points at a different track (or none)
    TrackChanged(Option<Track>),
    /// Playback needs one user interaction to start
    AutoplayBlocked,
    /// Non-terminal fault
    Fault(Fault),
    /// Informational server message
    Info(String),
    /// The session is over
    Ended { reason: String },
}

/// Why a reconciliation pass runs, ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Trigger {
    /// Periodic tick or position report
    Drift,
    /// Authoritative state changed or a load completed
    Change,
    /// Targeted correction, bypasses the tolerance band
    Forced,
}

/// Auto-advance scheduled after a media fault
#[derive(Debug, Clone)]
struct PendingSkip {
    due_ms: u64,
    track_id: Option<String>,
}

/// Playback reconciliation for one participant
pub struct SyncEngine<T: MediaTransport> {
    config: SyncConfig,
    transport: T,
    channel: ChannelHandle,
    store: SnapshotStore,
    reconciler: ClockReconciler,
    loader: TrackLoader,
    host: HostResponder,
    identity: Option<SessionIdentity>,
    credential: Option<String>,
    phase: Phase,
    volume: f32,
    trigger: Option<Trigger>,
    /// Set after a local scrub; drift passes wait for the authoritative echo
    awaiting_echo: bool,
    autoplay_blocked: bool,
    pending_skip: Option<PendingSkip>,
    loaded_track_id: Option<String>,
    notices: Vec<SessionNotice>,
}

impl<T: MediaTransport> SyncEngine<T> {
    pub fn new(config: SyncConfig, transport: T, channel: ChannelHandle) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = SourcePolicy::from_config(&config)?;

        Ok(Self {
            reconciler: ClockReconciler::new(config.correction_threshold_seconds),
            loader: TrackLoader::new(policy),
            host: HostResponder::new(config.heartbeat_interval_ms),
            config,
            transport,
            channel,
            store: SnapshotStore::new(),
            identity: None,
            credential: None,
            phase: Phase::Idle,
            volume: 1.0,
            trigger: None,
            awaiting_echo: false,
            autoplay_blocked: false,
            pending_skip: None,
            loaded_track_id: None,
            notices: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_in_room(&self) -> bool {
        matches!(self.phase, Phase::Joining | Phase::Active)
    }

    /// Check if we hold the host role, from the current snapshot
    pub fn is_host(&self) -> bool {
        match (&self.identity, self.store.current()) {
            (Some(identity), Some(envelope)) => envelope.is_host(&identity.connection_id),
            _ => false,
        }
    }

    pub fn room(&self) -> Option<&RoomState> {
        self.store.current().map(|e| &e.room)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Drain pending notices
    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Projected authoritative position at `now_ms`
    pub fn target_position(&self, now_ms: u64) -> Option<f64> {
        self.store.current().map(|e| e.anchor().project(now_ms))
    }

    /// Start a session and send the join request
    pub fn join(&mut self, identity: SessionIdentity, credential: Option<String>) -> Result<(), SessionError> {
        if self.is_in_room() {
            return Err(SessionError::AlreadyInRoom);
        }

        info!("Joining room {} as {}", identity.room_id, identity.display_name);
        self.store.clear();
        self.transport.set_volume(self.volume);
        self.identity = Some(identity);
        self.credential = credential;
        self.phase = Phase::Joining;
        self.send_join()
    }

    /// Re-send the join request with a corrected credential
    pub fn retry_join(&mut self, credential: Option<String>) -> Result<(), SessionError> {
        if self.phase != Phase::Joining {
            return Err(SessionError::NotJoining);
        }
        self.credential = credential;
        self.send_join()
    }

    fn send_join(&mut self) -> Result<(), SessionError> {
        let identity = self.identity.as_ref().ok_or(SessionError::NotInRoom)?;
        self.channel.send(OutboundEvent::JoinRoom {
            room_id: identity.room_id.clone(),
            nickname: identity.display_name.clone(),
            password: self.credential.clone(),
            user_id: identity.participant_id.clone(),
        })?;
        Ok(())
    }

    /// Ask the host for a fresh timing push
    pub fn request_resync(&mut self) -> Result<(), SessionError> {
        let room_id = self.joined_room_id()?;
        debug!("Requesting resync");
        self.channel.send(OutboundEvent::RequestSync { room_id })?;
        Ok(())
    }

    /// A scrub gesture started; reconciliation is suspended until release
    pub fn begin_scrub(&mut self) {
        debug!("Scrub started");
        self.reconciler.begin_scrub();
    }

    /// A scrub gesture ended at `position_seconds`. The local position wins
    /// and is broadcast as a seek.
    pub fn end_scrub(&mut self, position_seconds: f64) -> Result<(), SessionError> {
        self.reconciler.end_scrub();
        let room_id = self.active_room_id()?;

        let position = position_seconds.max(0.0);
        debug!("Scrub released at {:.2}s", position);
        self.transport.seek(position);
        self.awaiting_echo = true;
        self.channel.send(OutboundEvent::PlayerControl {
            room_id,
            action: ControlAction::Seek,
            timestamp: Some(position),
            loop_mode: None,
            auto: false,
        })?;
        Ok(())
    }

    /// Request a transport control. Only the request is sent; the local
    /// transport follows once the authoritative state comes back.
    pub fn control(
        &mut self,
        action: ControlAction,
        position_seconds: Option<f64>,
        loop_mode: Option<LoopMode>,
    ) -> Result<(), SessionError> {
        let room_id = self.active_room_id()?;

        let (timestamp, loop_mode) = match action {
            ControlAction::Seek => {
                let position = position_seconds
                    .ok_or_else(|| SessionError::InvalidControl("seek needs a position".to_string()))?;
                (Some(position.max(0.0)), None)
            }
            ControlAction::Play | ControlAction::Pause => {
                let position = position_seconds.or_else(|| {
                    self.loader.has_source().then(|| self.transport.position())
                });
                (position.map(|p| p.max(0.0)), None)
            }
            ControlAction::Loop => {
                let current = self
                    .store
                    .current()
                    .map(|e| e.room.player.loop_mode)
                    .unwrap_or_default();
                (None, Some(loop_mode.unwrap_or_else(|| current.next())))
            }
            ControlAction::Next | ControlAction::Prev => (None, None),
        };

        debug!("Control request: {:?}", action);
        self.channel.send(OutboundEvent::PlayerControl {
            room_id,
            action,
            timestamp,
            loop_mode,
            auto: false,
        })?;
        Ok(())
    }

    /// Set the local volume (0.0 to 1.0)
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.transport.set_volume(self.volume);
    }

    /// Leave the room
    pub fn leave(&mut self) -> Result<(), SessionError> {
        if !self.is_in_room() {
            return Err(SessionError::NotInRoom);
        }
        info!("Leaving room");
        self.teardown();
        self.phase = Phase::Idle;
        Ok(())
    }

    /// The channel connection was lost
    pub fn channel_lost(&mut self, reason: &str) {
        if !self.is_in_room() {
            return;
        }
        warn!("Channel lost: {}", reason);
        self.end(reason.to_string());
    }

    /// Apply one message from the room channel
    pub fn handle_inbound(&mut self, event: InboundEvent, now_ms: u64) {
        if !self.is_in_room() {
            debug!("Dropping message outside a session: {:?}", event);
            return;
        }

        match event {
            InboundEvent::RoomState { state, server_time } => {
                if self.is_stale(server_time) {
                    return;
                }
                if self.phase == Phase::Joining {
                    info!("Joined room {}", state.room_id);
                    self.phase = Phase::Active;
                }
                let received_at = self.receipt_time(now_ms);
                self.notices.push(SessionNotice::RoomUpdated(state.clone()));
                self.store.replace(Envelope::new(state, server_time, received_at));
                self.mark(Trigger::Change);
            }

            InboundEvent::QueueUpdate {
                queue,
                current_track_index,
                server_time,
            } => {
                if server_time.map(|t| self.is_stale(t)).unwrap_or(false) {
                    return;
                }
                let Some(envelope) = self.store.current() else {
                    debug!("Queue update before the first snapshot, ignoring");
                    return;
                };
                let next = envelope.with_queue(queue, current_track_index);
                self.notices.push(SessionNotice::RoomUpdated(next.room.clone()));
                self.store.replace(next);
                self.mark(Trigger::Change);
            }

            InboundEvent::PlayerUpdate { player, server_time } => {
                if self.is_stale(server_time) {
                    return;
                }
                let Some(envelope) = self.store.current() else {
                    debug!("Player update before the first snapshot, ignoring");
                    return;
                };
                let next = envelope.with_player(player, server_time, now_ms);
                self.notices.push(SessionNotice::RoomUpdated(next.room.clone()));
                self.store.replace(next);
                self.mark(Trigger::Change);
            }

            InboundEvent::SyncTarget {
                timestamp,
                is_playing,
                server_time,
            } => {
                debug!("Sync target: {:.2}s (playing: {})", timestamp, is_playing);
                self.apply_timing(timestamp, is_playing, server_time, now_ms, Trigger::Forced);
            }

            InboundEvent::SyncPulse {
                timestamp,
                is_playing,
                server_time,
            } => {
                // The host is the timing source; its own pulse echoes are noise
                if self.is_host() {
                    return;
                }
                self.apply_timing(timestamp, is_playing, server_time, now_ms, Trigger::Change);
                self.pong();
            }

            InboundEvent::GetHostState { requester_sid } => {
                self.refresh_role(now_ms);
                let Some(room_id) = self.room_id() else {
                    return;
                };
                if let Some(answer) = self.host.answer_probe(&room_id, &requester_sid, &self.transport) {
                    debug!("Answering timing probe from {}", requester_sid);
                    self.send(answer);
                }
            }

            InboundEvent::UserJoined { nickname, sid } => {
                info!("{} joined the room", nickname);
                let is_self = self
                    .identity
                    .as_ref()
                    .map(|i| i.connection_id == sid)
                    .unwrap_or(false);
                if is_self {
                    return;
                }
                self.refresh_role(now_ms);
                let Some(room_id) = self.room_id() else {
                    return;
                };
                if let Some(push) = self.host.welcome(&room_id, &self.transport) {
                    self.send(push);
                }
            }

            InboundEvent::Ping { .. } => self.pong(),

            InboundEvent::Error { message } => self.handle_fault(Fault::classify(&message), now_ms),

            InboundEvent::Kicked {} => self.handle_fault(Fault::Removed, now_ms),

            InboundEvent::Notification { message } => {
                debug!("Notification: {}", message);
                self.notices.push(SessionNotice::Info(message));
            }
        }
    }

    /// Apply one notification from the media engine
    pub fn handle_transport_event(&mut self, event: TransportEvent, now_ms: u64) {
        if !self.is_in_room() {
            return;
        }

        match event {
            TransportEvent::Position { .. } => self.mark(Trigger::Drift),
            TransportEvent::Loaded { duration_seconds } => {
                debug!("Source loaded (duration: {:?})", duration_seconds);
                self.mark(Trigger::Change);
            }
            TransportEvent::Ended => {
                self.refresh_role(now_ms);
                if !self.host.is_active() {
                    return;
                }
                let Some(room_id) = self.room_id() else {
                    return;
                };
                info!("Track ended, advancing");
                self.send(OutboundEvent::PlayerControl {
                    room_id,
                    action: ControlAction::Next,
                    timestamp: None,
                    loop_mode: None,
                    auto: true,
                });
            }
            TransportEvent::Fault { kind, message } => {
                self.handle_fault(Fault::from_media(kind, message), now_ms);
            }
            TransportEvent::AutoplayBlocked => self.notify_autoplay_blocked(),
        }
    }

    /// Periodic housekeeping: heartbeat, pending skip, drift check
    pub fn on_tick(&mut self, now_ms: u64) {
        if self.phase != Phase::Active {
            return;
        }

        self.refresh_role(now_ms);
        if let Some(room_id) = self.room_id() {
            if let Some(beat) = self.host.poll_heartbeat(&room_id, now_ms) {
                self.send(beat);
            }
        }
        self.fire_pending_skip(now_ms);
        self.mark(Trigger::Drift);
    }

    /// Run one load + reconcile pass for everything recorded since the last
    /// flush
    pub fn flush(&mut self, now_ms: u64) {
        let Some(trigger) = self.trigger.take() else {
            return;
        };
        if self.phase != Phase::Active {
            return;
        }

        self.refresh_role(now_ms);
        let loaded = self.sync_source(now_ms);
        let trigger = if loaded { trigger.max(Trigger::Change) } else { trigger };
        self.reconcile(trigger, now_ms);
    }

    fn mark(&mut self, trigger: Trigger) {
        self.trigger = Some(self.trigger.map_or(trigger, |t| t.max(trigger)));
    }

    fn room_id(&self) -> Option<String> {
        self.identity.as_ref().map(|i| i.room_id.clone())
    }

    fn joined_room_id(&self) -> Result<String, SessionError> {
        if !self.is_in_room() {
            return Err(SessionError::NotInRoom);
        }
        self.room_id().ok_or(SessionError::NotInRoom)
    }

    fn active_room_id(&self) -> Result<String, SessionError> {
        if self.phase != Phase::Active {
            return Err(SessionError::NotInRoom);
        }
        self.room_id().ok_or(SessionError::NotInRoom)
    }

    fn send(&mut self, message: OutboundEvent) {
        if message.requires_host() && !self.host.is_active() {
            warn!("Not host, dropping {:?}", message);
            return;
        }
        if let Err(e) = self.channel.send(message) {
            warn!("Failed to send: {}", e);
        }
    }

    fn pong(&mut self) {
        if let Some(room_id) = self.room_id() {
            self.send(OutboundEvent::ClientPong { room_id });
        }
    }

    fn is_stale(&self, server_time: f64) -> bool {
        let stale = self.config.reject_stale_snapshots && self.store.is_stale(server_time);
        if stale {
            debug!("Dropping stale message (server time {})", server_time);
        }
        stale
    }

    /// Local receipt time, never earlier than the one already applied
    fn receipt_time(&self, now_ms: u64) -> u64 {
        self.store
            .current()
            .map(|e| now_ms.max(e.received_at_ms))
            .unwrap_or(now_ms)
    }

    fn apply_timing(&mut self, position: f64, is_playing: bool, server_time: f64, now_ms: u64, trigger: Trigger) {
        if self.is_stale(server_time) {
            return;
        }
        let Some(envelope) = self.store.current() else {
            debug!("Timing before the first snapshot, ignoring");
            return;
        };
        let next = envelope.with_timing(position, is_playing, server_time, now_ms);
        self.store.replace(next);
        self.mark(trigger);
    }

    /// Level-triggered host role check
    fn refresh_role(&mut self, now_ms: u64) {
        let is_host = self.is_host();
        if let Some(is_host) = self.host.refresh(is_host, now_ms) {
            self.notices.push(SessionNotice::RoleChanged { is_host });
        }
    }

    fn current_track_id(&self) -> Option<String> {
        self.store
            .current()
            .and_then(|e| e.current_track())
            .map(|t| t.id.clone())
    }

    fn is_room_playing(&self) -> bool {
        self.store
            .current()
            .map(|e| e.room.player.is_playing)
            .unwrap_or(false)
    }

    /// Point the transport at the current track. Returns true if a new
    /// source was attached.
    fn sync_source(&mut self, now_ms: u64) -> bool {
        let track = self
            .store
            .current()
            .and_then(|e| e.current_track())
            .cloned();

        let outcome = self
            .loader
            .sync(track.as_ref(), &mut self.transport, current_time_ms());

        let track_id = track.as_ref().map(|t| t.id.clone());
        if track_id != self.loaded_track_id {
            self.loaded_track_id = track_id;
            self.notices.push(SessionNotice::TrackChanged(track));
        }

        match outcome {
            LoadOutcome::Loaded { .. } => {
                self.autoplay_blocked = false;
                true
            }
            LoadOutcome::Failed(e) => {
                self.handle_fault(Fault::Load(e.to_string()), now_ms);
                false
            }
            LoadOutcome::Unchanged | LoadOutcome::Cleared | LoadOutcome::Idle => false,
        }
    }

    fn reconcile(&mut self, trigger: Trigger, now_ms: u64) {
        if !self.loader.has_source() {
            return;
        }
        if trigger == Trigger::Drift {
            // The host is ground truth and does not chase its own drift
            if self.host.is_active() || self.awaiting_echo {
                return;
            }
        } else {
            self.awaiting_echo = false;
        }

        let Some(anchor) = self.store.current().map(|e| e.anchor()) else {
            return;
        };

        let mut target = anchor.project(now_ms).max(0.0);
        if let Some(duration) = self.transport.duration() {
            target = target.min(duration);
        }

        let actual = self.transport.position();
        match self.reconciler.evaluate(target, actual, trigger == Trigger::Forced) {
            Correction::Suspended => {
                debug!("Scrub in progress, reconciliation suspended");
                return;
            }
            Correction::Seek(position) => {
                info!("Correcting position {:.2}s -> {:.2}s", actual, position);
                self.transport.seek(position);
            }
            Correction::None => {}
        }

        // Play/pause after the seek so playback resumes from the corrected spot
        if anchor.is_playing && !self.transport.is_playing() {
            match self.transport.play() {
                Ok(()) => {
                    debug!("Playback started");
                    self.autoplay_blocked = false;
                }
                Err(TransportError::AutoplayBlocked) => self.notify_autoplay_blocked(),
                Err(e) => warn!("Failed to start playback: {}", e),
            }
        } else if !anchor.is_playing && self.transport.is_playing() {
            debug!("Playback paused");
            self.transport.pause();
        }
    }

    fn notify_autoplay_blocked(&mut self) {
        if !self.autoplay_blocked {
            info!("Autoplay blocked, waiting for user interaction");
            self.autoplay_blocked = true;
            self.notices.push(SessionNotice::AutoplayBlocked);
        }
    }

    fn handle_fault(&mut self, fault: Fault, now_ms: u64) {
        if fault.is_terminal() {
            warn!("Terminal fault: {}", fault);
            self.end(fault.to_string());
            return;
        }

        if fault.is_media() {
            self.refresh_role(now_ms);
            if self.host.is_active() && self.is_room_playing() {
                info!(
                    "{} as host, skipping track in {}ms",
                    fault, self.config.fault_skip_delay_ms
                );
                self.pending_skip = Some(PendingSkip {
                    due_ms: now_ms + self.config.fault_skip_delay_ms,
                    track_id: self.current_track_id(),
                });
            } else {
                warn!("{}", fault);
            }
        } else if fault == Fault::Authentication {
            info!("Credential rejected, waiting for a retry");
        } else {
            warn!("Session fault: {}", fault);
        }

        self.notices.push(SessionNotice::Fault(fault));
    }

    fn fire_pending_skip(&mut self, now_ms: u64) {
        match &self.pending_skip {
            Some(skip) if now_ms >= skip.due_ms => {}
            _ => return,
        }
        let Some(skip) = self.pending_skip.take() else {
            return;
        };

        if !self.host.is_active() || !self.is_room_playing() || self.current_track_id() != skip.track_id {
            debug!("Dropping pending skip, state moved on");
            return;
        }
        let Some(room_id) = self.room_id() else {
            return;
        };

        info!("Skipping failed track");
        self.send(OutboundEvent::PlayerControl {
            room_id,
            action: ControlAction::Next,
            timestamp: None,
            loop_mode: None,
            auto: false,
        });
    }

    fn end(&mut self, reason: String) {
        self.teardown();
        self.phase = Phase::Ended;
        self.notices.push(SessionNotice::Ended { reason });
    }

    /// Release every session resource within the current step
    fn teardown(&mut self) {
        self.loader.teardown(&mut self.transport);
        self.store.clear();
        self.host.stop();
        self.reconciler.reset();
        self.trigger = None;
        self.awaiting_echo = false;
        self.autoplay_blocked = false;
        self.pending_skip = None;
        self.loaded_track_id = None;
        self.identity = None;
        self.credential = None;
    }
}

/// Wall-clock milliseconds, used to stamp cache-busting parameters
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::{PlayerState, User};
    use crate::transport::testing::{RecordingTransport, TransportCall};
    use crate::transport::MediaFaultKind;
    use tokio::sync::mpsc::UnboundedReceiver;

    const T0: u64 = 10_000;

    fn engine() -> (SyncEngine<RecordingTransport>, UnboundedReceiver<OutboundEvent>) {
        let (channel, rx) = ChannelHandle::new();
        let engine = SyncEngine::new(SyncConfig::default(), RecordingTransport::new(), channel).unwrap();
        (engine, rx)
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            room_id: "room1".to_string(),
            display_name: "Ana".to_string(),
            participant_id: "PARTICIPANT".to_string(),
            connection_id: "sid-me".to_string(),
        }
    }

    fn track(id: &str, stream_url: &str) -> Track {
        Track {
            id: id.to_string(),
            url: format!("https://soundcloud.com/x/{}", id),
            stream_url: Some(stream_url.to_string()),
            title: id.to_string(),
            author: None,
            thumbnail: None,
            duration: None,
            added_by: "Ana".to_string(),
            source: None,
        }
    }

    /// Player state as the room server writes it at `written_at`
    fn player(is_playing: bool, position: f64, written_at: f64) -> PlayerState {
        PlayerState {
            current_index: 0,
            is_playing,
            position_seconds: position,
            start_time_seconds: written_at - position,
            last_updated_seconds: written_at,
            loop_mode: LoopMode::Off,
        }
    }

    /// Player state with every timing field given, as it arrives on the wire
    fn written(is_playing: bool, timestamp: f64, start_time: f64, last_updated: f64) -> PlayerState {
        PlayerState {
            current_index: 0,
            is_playing,
            position_seconds: timestamp,
            start_time_seconds: start_time,
            last_updated_seconds: last_updated,
            loop_mode: LoopMode::Off,
        }
    }

    fn room(host: &str, player: PlayerState) -> RoomState {
        RoomState {
            room_id: "room1".to_string(),
            host_id: Some(host.to_string()),
            users: vec![
                User {
                    connection_id: "sid-host".to_string(),
                    display_name: "Host".to_string(),
                },
                User {
                    connection_id: "sid-me".to_string(),
                    display_name: "Ana".to_string(),
                },
            ],
            queue: vec![track("t1", "/static/a.mp3")],
            player,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Join and apply a first snapshot at `T0`
    fn joined(host: &str, player: PlayerState) -> (SyncEngine<RecordingTransport>, UnboundedReceiver<OutboundEvent>) {
        let (mut engine, mut rx) = engine();
        engine.join(identity(), None).unwrap();
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: room(host, player),
                server_time: 100.0,
            },
            T0,
        );
        engine.flush(T0);
        drain(&mut rx);
        engine.take_notices();
        engine.transport_mut().clear_calls();
        (engine, rx)
    }

    fn player_update(engine: &mut SyncEngine<RecordingTransport>, player: PlayerState, server_time: f64, now: u64) {
        engine.handle_inbound(InboundEvent::PlayerUpdate { player, server_time }, now);
    }

    #[test]
    fn test_join_sends_request_and_applies_volume() {
        let (mut engine, mut rx) = engine();
        engine.set_volume(0.3);
        engine.join(identity(), Some("pw".to_string())).unwrap();

        assert_eq!(engine.phase(), Phase::Joining);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::JoinRoom {
                room_id: "room1".to_string(),
                nickname: "Ana".to_string(),
                password: Some("pw".to_string()),
                user_id: "PARTICIPANT".to_string(),
            }]
        );
        assert_eq!(engine.transport().volume, 0.3);
        assert!(matches!(engine.join(identity(), None), Err(SessionError::AlreadyInRoom)));
    }

    #[test]
    fn test_first_snapshot_loads_seeks_and_plays() {
        let (mut engine, _rx) = engine();
        engine.join(identity(), None).unwrap();
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: room("sid-host", player(true, 10.0, 100.0)),
                server_time: 100.0,
            },
            T0,
        );
        engine.flush(T0);

        assert_eq!(engine.phase(), Phase::Active);
        let transport = engine.transport();
        assert_eq!(transport.calls[0], TransportCall::Volume(1.0));
        assert!(matches!(transport.calls[1], TransportCall::Load(_)));
        assert_eq!(transport.seeks(), vec![10.0]);
        assert!(transport.playing);
        assert!(engine
            .take_notices()
            .iter()
            .any(|n| matches!(n, SessionNotice::TrackChanged(Some(t)) if t.id == "t1")));
    }

    #[test]
    fn test_drift_beyond_band_seeks_to_projection() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 11.4;

        engine.on_tick(T0 + 2000);
        engine.flush(T0 + 2000);

        assert_eq!(engine.transport().seeks(), vec![12.0]);
    }

    #[test]
    fn test_drift_within_band_is_left_alone() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 11.6;

        engine.on_tick(T0 + 2000);
        engine.flush(T0 + 2000);

        assert!(engine.transport().seeks().is_empty());
    }

    #[test]
    fn test_target_is_clamped_to_duration() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().duration = Some(5.0);

        engine.on_tick(T0 + 2000);
        engine.flush(T0 + 2000);

        assert_eq!(engine.transport().seeks(), vec![5.0]);
    }

    #[test]
    fn test_empty_queue_clears_and_stops_reconciling() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));

        engine.handle_inbound(
            InboundEvent::QueueUpdate {
                queue: Vec::new(),
                current_track_index: None,
                server_time: None,
            },
            T0 + 500,
        );
        engine.flush(T0 + 500);
        assert_eq!(engine.transport().count(&TransportCall::Clear), 1);
        assert!(engine.transport().source.is_none());
        assert!(engine
            .take_notices()
            .contains(&SessionNotice::TrackChanged(None)));

        engine.transport_mut().clear_calls();
        engine.on_tick(T0 + 5000);
        engine.flush(T0 + 5000);
        assert!(engine.transport().calls.is_empty());
    }

    #[test]
    fn test_burst_of_updates_applies_only_the_last() {
        let (mut engine, _rx) = joined("sid-host", player(false, 10.0, 100.0));

        player_update(&mut engine, player(false, 10.0, 101.0), 101.0, T0 + 10);
        player_update(&mut engine, player(true, 10.0, 102.0), 102.0, T0 + 20);
        player_update(&mut engine, player(false, 10.0, 103.0), 103.0, T0 + 30);
        engine.flush(T0 + 30);

        let transport = engine.transport();
        assert_eq!(transport.count(&TransportCall::Play), 0);
        assert_eq!(transport.count(&TransportCall::Pause), 0);
        assert!(!transport.playing);
    }

    #[test]
    fn test_play_update_resumes_after_seek() {
        let (mut engine, _rx) = joined("sid-host", player(false, 10.0, 100.0));

        player_update(&mut engine, player(true, 30.0, 101.0), 101.0, T0 + 100);
        engine.flush(T0 + 100);

        assert_eq!(
            engine.transport().calls,
            vec![TransportCall::Seek(30.0), TransportCall::Play]
        );
    }

    #[test]
    fn test_stale_update_is_dropped() {
        let (mut engine, _rx) = joined("sid-host", player(false, 10.0, 100.0));

        player_update(&mut engine, player(true, 50.0, 99.0), 99.0, T0 + 100);
        engine.flush(T0 + 100);

        assert!(engine.transport().calls.is_empty());
        assert!(!engine.room().unwrap().player.is_playing);
    }

    #[test]
    fn test_sync_target_forces_seek_inside_band() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 20.2;

        engine.handle_inbound(
            InboundEvent::SyncTarget {
                timestamp: 20.0,
                is_playing: true,
                server_time: 150.0,
            },
            T0 + 1000,
        );
        engine.flush(T0 + 1000);

        assert_eq!(engine.transport().seeks(), vec![20.0]);
    }

    #[test]
    fn test_sync_pulse_uses_band_and_pongs() {
        let (mut engine, mut rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 20.2;

        engine.handle_inbound(
            InboundEvent::SyncPulse {
                timestamp: 20.0,
                is_playing: true,
                server_time: 150.0,
            },
            T0 + 1000,
        );
        engine.flush(T0 + 1000);

        assert!(engine.transport().seeks().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::ClientPong { room_id: "room1".to_string() }]
        );
    }

    #[test]
    fn test_host_ignores_sync_pulse() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));
        engine.transport_mut().position = 50.0;

        engine.handle_inbound(
            InboundEvent::SyncPulse {
                timestamp: 20.0,
                is_playing: true,
                server_time: 150.0,
            },
            T0 + 1000,
        );
        engine.flush(T0 + 1000);

        assert!(engine.transport().seeks().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_ping_gets_pong() {
        let (mut engine, mut rx) = joined("sid-host", player(false, 0.0, 100.0));
        engine.handle_inbound(InboundEvent::Ping { room_id: None }, T0);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::ClientPong { room_id: "room1".to_string() }]
        );
    }

    #[test]
    fn test_host_answers_probe_until_role_moves() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));
        engine.transport_mut().position = 33.0;

        engine.handle_inbound(
            InboundEvent::GetHostState {
                requester_sid: "sid-2".to_string(),
            },
            T0 + 100,
        );
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::HostStateResponse {
                room_id: "room1".to_string(),
                requester_sid: "sid-2".to_string(),
                timestamp: 33.0,
                is_playing: true,
            }]
        );

        // Host moves away; the very next probe is ignored even before a flush
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: room("sid-host", player(true, 10.0, 100.0)),
                server_time: 101.0,
            },
            T0 + 200,
        );
        engine.handle_inbound(
            InboundEvent::GetHostState {
                requester_sid: "sid-2".to_string(),
            },
            T0 + 300,
        );
        assert!(drain(&mut rx).is_empty());
        assert!(engine
            .take_notices()
            .contains(&SessionNotice::RoleChanged { is_host: false }));
    }

    #[test]
    fn test_host_heartbeat_and_welcome() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));
        engine.transport_mut().position = 12.0;

        engine.on_tick(T0 + 5000);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::HostHeartbeat { room_id: "room1".to_string() }]
        );

        engine.handle_inbound(
            InboundEvent::UserJoined {
                nickname: "Bo".to_string(),
                sid: "sid-bo".to_string(),
            },
            T0 + 5100,
        );
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::HostSync {
                room_id: "room1".to_string(),
                timestamp: 12.0,
                is_playing: true,
            }]
        );
    }

    #[test]
    fn test_non_host_sends_no_host_traffic() {
        let (mut engine, mut rx) = joined("sid-host", player(true, 10.0, 100.0));

        engine.on_tick(T0 + 60_000);
        engine.handle_inbound(
            InboundEvent::UserJoined {
                nickname: "Bo".to_string(),
                sid: "sid-bo".to_string(),
            },
            T0 + 60_000,
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_host_does_not_chase_own_drift() {
        let (mut engine, _rx) = joined("sid-me", player(true, 10.0, 100.0));
        engine.transport_mut().position = 40.0;

        engine.on_tick(T0 + 2000);
        engine.flush(T0 + 2000);
        assert!(engine.transport().seeks().is_empty());

        // An authoritative change is still honoured
        player_update(&mut engine, player(true, 80.0, 101.0), 101.0, T0 + 2100);
        engine.flush(T0 + 2100);
        assert_eq!(engine.transport().seeks(), vec![80.0]);
    }

    #[test]
    fn test_scrub_suspends_then_broadcasts() {
        let (mut engine, mut rx) = joined("sid-host", player(true, 10.0, 100.0));

        engine.begin_scrub();
        engine.transport_mut().position = 95.0;
        engine.on_tick(T0 + 1000);
        player_update(&mut engine, player(true, 10.0, 101.0), 101.0, T0 + 1000);
        engine.flush(T0 + 1000);
        assert!(engine.transport().seeks().is_empty());

        engine.end_scrub(60.0).unwrap();
        assert_eq!(engine.transport().seeks(), vec![60.0]);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::PlayerControl {
                room_id: "room1".to_string(),
                action: ControlAction::Seek,
                timestamp: Some(60.0),
                loop_mode: None,
                auto: false,
            }]
        );

        // Drift passes wait for the echo instead of snapping back
        engine.on_tick(T0 + 1500);
        engine.flush(T0 + 1500);
        assert_eq!(engine.transport().seeks(), vec![60.0]);

        player_update(&mut engine, player(true, 60.0, 102.0), 102.0, T0 + 1600);
        engine.flush(T0 + 1600);
        assert_eq!(engine.transport().seeks(), vec![60.0]);
    }

    #[test]
    fn test_controls_do_not_touch_transport() {
        let (mut engine, mut rx) = joined("sid-host", player(false, 10.0, 100.0));

        engine.control(ControlAction::Next, None, None).unwrap();
        engine.control(ControlAction::Loop, None, None).unwrap();
        assert!(matches!(
            engine.control(ControlAction::Seek, None, None),
            Err(SessionError::InvalidControl(_))
        ));

        assert!(engine.transport().calls.is_empty());
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[1],
            OutboundEvent::PlayerControl {
                action: ControlAction::Loop,
                loop_mode: Some(LoopMode::Queue),
                ..
            }
        ));
    }

    #[test]
    fn test_host_advances_on_end_of_media() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));

        engine.handle_transport_event(TransportEvent::Ended, T0 + 1000);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundEvent::PlayerControl {
                room_id: "room1".to_string(),
                action: ControlAction::Next,
                timestamp: None,
                loop_mode: None,
                auto: true,
            }]
        );
    }

    #[test]
    fn test_host_skips_after_media_fault() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));

        engine.handle_transport_event(
            TransportEvent::Fault {
                kind: MediaFaultKind::Playback,
                message: "decode error".to_string(),
            },
            T0,
        );
        assert!(engine
            .take_notices()
            .contains(&SessionNotice::Fault(Fault::Transport("decode error".to_string()))));

        engine.on_tick(T0 + 2000);
        assert!(drain(&mut rx).is_empty());

        engine.on_tick(T0 + 3000);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [OutboundEvent::PlayerControl {
                action: ControlAction::Next,
                auto: false,
                ..
            }]
        ));
    }

    #[test]
    fn test_pending_skip_dropped_when_paused() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));

        engine.handle_transport_event(
            TransportEvent::Fault {
                kind: MediaFaultKind::Load,
                message: "bad manifest".to_string(),
            },
            T0,
        );
        player_update(&mut engine, player(false, 10.0, 101.0), 101.0, T0 + 1000);
        engine.on_tick(T0 + 4000);

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_listener_does_not_skip_after_fault() {
        let (mut engine, mut rx) = joined("sid-host", player(true, 10.0, 100.0));

        engine.handle_transport_event(
            TransportEvent::Fault {
                kind: MediaFaultKind::Playback,
                message: "decode error".to_string(),
            },
            T0,
        );
        engine.on_tick(T0 + 10_000);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.phase(), Phase::Active);
    }

    #[test]
    fn test_kick_tears_down_session() {
        let (mut engine, mut rx) = engine();
        engine.join(identity(), None).unwrap();
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: RoomState {
                    queue: vec![track("t1", "/live/a.m3u8")],
                    ..room("sid-me", player(true, 10.0, 100.0))
                },
                server_time: 100.0,
            },
            T0,
        );
        engine.flush(T0);
        drain(&mut rx);

        engine.handle_inbound(InboundEvent::Kicked {}, T0 + 100);

        assert_eq!(engine.phase(), Phase::Ended);
        assert!(engine.room().is_none());
        assert!(engine.transport().source.is_none());
        assert_eq!(engine.transport().pipelines().len(), 2);
        assert!(engine
            .take_notices()
            .iter()
            .any(|n| matches!(n, SessionNotice::Ended { .. })));

        // Nothing keeps driving playback or host traffic afterwards
        engine.on_tick(T0 + 60_000);
        engine.handle_inbound(InboundEvent::Ping { room_id: None }, T0 + 60_000);
        engine.flush(T0 + 60_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_room_not_found_is_terminal() {
        let (mut engine, _rx) = engine();
        engine.join(identity(), None).unwrap();
        engine.handle_inbound(
            InboundEvent::Error {
                message: "Room not found".to_string(),
            },
            T0,
        );
        assert_eq!(engine.phase(), Phase::Ended);
        assert!(!engine.is_in_room());
    }

    #[test]
    fn test_bad_password_allows_retry() {
        let (mut engine, mut rx) = engine();
        engine.join(identity(), None).unwrap();
        drain(&mut rx);

        engine.handle_inbound(
            InboundEvent::Error {
                message: "Invalid password".to_string(),
            },
            T0,
        );
        assert_eq!(engine.phase(), Phase::Joining);
        assert_eq!(
            engine.take_notices(),
            vec![SessionNotice::Fault(Fault::Authentication)]
        );

        engine.retry_join(Some("secret".to_string())).unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [OutboundEvent::JoinRoom { password: Some(p), .. }] if p == "secret"
        ));
    }

    #[test]
    fn test_generic_error_keeps_session() {
        let (mut engine, _rx) = joined("sid-host", player(false, 0.0, 100.0));
        engine.handle_inbound(
            InboundEvent::Error {
                message: "Only admin can do that".to_string(),
            },
            T0,
        );
        assert_eq!(engine.phase(), Phase::Active);
    }

    #[test]
    fn test_autoplay_block_is_reported_once() {
        let (mut engine, _rx) = engine();
        engine.transport_mut().autoplay_blocked = true;
        engine.join(identity(), None).unwrap();
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: room("sid-host", player(true, 10.0, 100.0)),
                server_time: 100.0,
            },
            T0,
        );
        engine.flush(T0);
        engine.on_tick(T0 + 1000);
        engine.flush(T0 + 1000);

        let blocked = engine
            .take_notices()
            .into_iter()
            .filter(|n| *n == SessionNotice::AutoplayBlocked)
            .count();
        assert_eq!(blocked, 1);
        assert_eq!(engine.phase(), Phase::Active);
    }

    #[test]
    fn test_leave_clears_everything() {
        let (mut engine, mut rx) = joined("sid-me", player(true, 10.0, 100.0));

        engine.leave().unwrap();
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(engine.transport().source.is_none());
        assert!(matches!(engine.leave(), Err(SessionError::NotInRoom)));
        assert!(matches!(engine.request_resync(), Err(SessionError::NotInRoom)));

        engine.on_tick(T0 + 60_000);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_resync_request() {
        let (mut engine, mut rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.request_resync().unwrap();
        engine.request_resync().unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                OutboundEvent::RequestSync { room_id: "room1".to_string() },
                OutboundEvent::RequestSync { room_id: "room1".to_string() },
            ]
        );
    }

    #[test]
    fn test_same_stream_keeps_pipeline() {
        let (mut engine, _rx) = engine();
        engine.join(identity(), None).unwrap();
        let state = RoomState {
            queue: vec![track("t1", "/live/a.m3u8")],
            ..room("sid-host", player(true, 0.0, 100.0))
        };
        engine.handle_inbound(
            InboundEvent::RoomState {
                state,
                server_time: 100.0,
            },
            T0,
        );
        engine.flush(T0);
        engine.handle_inbound(
            InboundEvent::QueueUpdate {
                queue: vec![track("t1", "/live/a.m3u8?t=5"), track("t2", "/static/b.mp3")],
                current_track_index: None,
                server_time: Some(101.0),
            },
            T0 + 100,
        );
        engine.flush(T0 + 100);

        assert_eq!(engine.transport().pipelines().len(), 1);
    }

    #[test]
    fn test_server_room_state_lands_on_timestamp() {
        let (mut engine, _rx) = engine();
        engine.join(identity(), None).unwrap();

        // Room server `play` at 30s: start_time = 1000 - 30
        let text = r#"{
            "event": "room_state",
            "data": {
                "state": {
                    "id": "room1",
                    "admin_sid": "sid-host",
                    "users": [{"sid": "sid-host", "nickname": "Host"}, {"sid": "sid-me", "nickname": "Ana"}],
                    "queue": [{"id": "t1", "url": "u", "stream_url": "/static/media/b.mp3", "title": "B", "added_by": "Host"}],
                    "player": {
                        "current_track_index": 0,
                        "is_playing": true,
                        "timestamp": 30.0,
                        "start_time": 970.0,
                        "last_updated": 1000.0,
                        "loop_mode": "off"
                    }
                },
                "server_time": 1000.0
            }
        }"#;
        engine.handle_inbound(InboundEvent::from_json(text).unwrap(), T0);
        engine.flush(T0);

        assert_eq!(engine.target_position(T0), Some(30.0));
        assert_eq!(engine.transport().seeks(), vec![30.0]);
        assert!(engine.transport().playing);
    }

    #[test]
    fn test_server_play_update_resumes_without_seek() {
        let (mut engine, _rx) = joined("sid-host", player(false, 10.0, 100.0));
        assert_eq!(engine.transport().position, 10.0);

        // Resume at 10s written at 104, broadcast a quarter second later
        player_update(&mut engine, written(true, 10.0, 94.0, 104.0), 104.25, T0 + 4000);
        engine.flush(T0 + 4000);

        assert_eq!(engine.transport().calls, vec![TransportCall::Play]);
    }

    #[test]
    fn test_server_seek_update_moves_to_timestamp() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 15.0;

        player_update(&mut engine, written(true, 60.0, 45.0, 105.0), 105.0, T0 + 5000);
        engine.flush(T0 + 5000);
        assert_eq!(engine.transport().seeks(), vec![60.0]);

        // Two seconds later the projection follows the track, not twice the track
        engine.transport_mut().position = 62.0;
        engine.on_tick(T0 + 7000);
        engine.flush(T0 + 7000);
        assert_eq!(engine.transport().seeks(), vec![60.0]);
    }

    #[test]
    fn test_server_pause_update_freezes_at_timestamp() {
        let (mut engine, _rx) = joined("sid-host", player(true, 10.0, 100.0));
        engine.transport_mut().position = 14.8;

        // Pause leaves start_time untouched on the server
        player_update(&mut engine, written(false, 15.0, 90.0, 105.0), 105.0, T0 + 5000);
        engine.flush(T0 + 5000);
        assert_eq!(engine.transport().calls, vec![TransportCall::Pause]);

        engine.on_tick(T0 + 20_000);
        engine.flush(T0 + 20_000);
        assert_eq!(engine.transport().calls, vec![TransportCall::Pause]);
    }

    #[test]
    fn test_host_keeps_position_on_membership_snapshot() {
        let (mut engine, _rx) = joined("sid-me", player(true, 10.0, 100.0));
        engine.transport_mut().position = 13.0;

        // Someone joined: same player state, newer server time
        engine.handle_inbound(
            InboundEvent::RoomState {
                state: room("sid-me", player(true, 10.0, 100.0)),
                server_time: 103.0,
            },
            T0 + 3000,
        );
        engine.flush(T0 + 3000);

        assert!(engine.transport().seeks().is_empty());
    }
}
