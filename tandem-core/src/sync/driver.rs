//! Session driver
//!
//! A single task owns the [`SyncEngine`]. Everything else talks to it through
//! a [`DriverHandle`]; notices flow back on an mpsc stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::channel::ChannelEvent;
use crate::transport::{MediaTransport, TransportEvent};

use super::engine::{Phase, SessionError, SessionIdentity, SessionNotice, SyncEngine};
use super::protocol::{ControlAction, LoopMode};

type Reply = oneshot::Sender<Result<(), SessionError>>;

/// Commands sent to the driver task
#[derive(Debug)]
pub enum DriverCommand {
    Join {
        identity: SessionIdentity,
        credential: Option<String>,
        reply: Reply,
    },
    RetryJoin {
        credential: Option<String>,
        reply: Reply,
    },
    /// Something arrived from the room channel
    Deliver(ChannelEvent),
    RequestResync { reply: Reply },
    BeginScrub,
    EndScrub { position_seconds: f64, reply: Reply },
    Control {
        action: ControlAction,
        position_seconds: Option<f64>,
        loop_mode: Option<LoopMode>,
        reply: Reply,
    },
    SetVolume { volume: f32 },
    Leave { reply: Reply },
    Shutdown,
}

/// Session status readable from any thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStatus {
    pub phase: Phase,
    pub is_host: bool,
}

impl Default for DriverStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            is_host: false,
        }
    }
}

/// Handle to the running driver
#[derive(Clone)]
pub struct DriverHandle {
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    status: Arc<RwLock<DriverStatus>>,
}

impl DriverHandle {
    pub fn status(&self) -> DriverStatus {
        *self.status.read()
    }

    fn send(&self, command: DriverCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(command)
            .map_err(|_| SessionError::Stopped)
    }

    async fn request(&self, build: impl FnOnce(Reply) -> DriverCommand) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    pub async fn join(&self, identity: SessionIdentity, credential: Option<String>) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::Join {
            identity,
            credential,
            reply,
        })
        .await
    }

    pub async fn retry_join(&self, credential: Option<String>) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::RetryJoin { credential, reply })
            .await
    }

    /// Hand over a channel event; never waits
    pub fn deliver(&self, event: ChannelEvent) -> Result<(), SessionError> {
        self.send(DriverCommand::Deliver(event))
    }

    pub async fn request_resync(&self) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::RequestResync { reply })
            .await
    }

    pub fn begin_scrub(&self) -> Result<(), SessionError> {
        self.send(DriverCommand::BeginScrub)
    }

    pub async fn end_scrub(&self, position_seconds: f64) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::EndScrub {
            position_seconds,
            reply,
        })
        .await
    }

    pub async fn control(
        &self,
        action: ControlAction,
        position_seconds: Option<f64>,
        loop_mode: Option<LoopMode>,
    ) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::Control {
            action,
            position_seconds,
            loop_mode,
            reply,
        })
        .await
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.send(DriverCommand::SetVolume { volume })
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|reply| DriverCommand::Leave { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(DriverCommand::Shutdown);
    }
}

/// Spawn the driver task. Must be called from within a tokio runtime.
pub fn start<T: MediaTransport + 'static>(
    engine: SyncEngine<T>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    tick_interval: Duration,
) -> (DriverHandle, mpsc::UnboundedReceiver<SessionNotice>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let status = Arc::new(RwLock::new(DriverStatus::default()));

    let task_status = Arc::clone(&status);
    tokio::spawn(async move {
        run(engine, command_rx, transport_rx, notice_tx, task_status, tick_interval).await;
    });

    (DriverHandle { command_tx, status }, notice_rx)
}

/// Run the driver event loop
async fn run<T: MediaTransport>(
    mut engine: SyncEngine<T>,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    status: Arc<RwLock<DriverStatus>>,
    tick_interval: Duration,
) {
    let origin = Instant::now();
    let now_ms = || origin.elapsed().as_millis() as u64;

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Session driver started");

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    debug!("All driver handles dropped");
                    break;
                };
                if !apply(&mut engine, command, now_ms()) {
                    break;
                }
                // Take everything already queued before reconciling once
                let mut stop = false;
                while let Ok(command) = command_rx.try_recv() {
                    if !apply(&mut engine, command, now_ms()) {
                        stop = true;
                        break;
                    }
                }
                if stop {
                    break;
                }
            }
            Some(event) = transport_rx.recv() => {
                engine.handle_transport_event(event, now_ms());
                while let Ok(event) = transport_rx.try_recv() {
                    engine.handle_transport_event(event, now_ms());
                }
            }
            _ = ticker.tick() => {
                engine.on_tick(now_ms());
            }
        }

        engine.flush(now_ms());
        publish(&mut engine, &notice_tx, &status);
    }

    if engine.is_in_room() {
        let _ = engine.leave();
    }
    publish(&mut engine, &notice_tx, &status);
    info!("Session driver stopped");
}

/// Apply one command. Returns false when the driver should stop.
fn apply<T: MediaTransport>(engine: &mut SyncEngine<T>, command: DriverCommand, now_ms: u64) -> bool {
    match command {
        DriverCommand::Join {
            identity,
            credential,
            reply,
        } => {
            let _ = reply.send(engine.join(identity, credential));
        }
        DriverCommand::RetryJoin { credential, reply } => {
            let _ = reply.send(engine.retry_join(credential));
        }
        DriverCommand::Deliver(ChannelEvent::Message(event)) => {
            engine.handle_inbound(event, now_ms);
        }
        DriverCommand::Deliver(ChannelEvent::Closed { reason }) => {
            engine.channel_lost(&reason);
        }
        DriverCommand::RequestResync { reply } => {
            let _ = reply.send(engine.request_resync());
        }
        DriverCommand::BeginScrub => engine.begin_scrub(),
        DriverCommand::EndScrub {
            position_seconds,
            reply,
        } => {
            let _ = reply.send(engine.end_scrub(position_seconds));
        }
        DriverCommand::Control {
            action,
            position_seconds,
            loop_mode,
            reply,
        } => {
            let _ = reply.send(engine.control(action, position_seconds, loop_mode));
        }
        DriverCommand::SetVolume { volume } => engine.set_volume(volume),
        DriverCommand::Leave { reply } => {
            let _ = reply.send(engine.leave());
        }
        DriverCommand::Shutdown => {
            info!("Session driver shutting down");
            return false;
        }
    }
    true
}

fn publish<T: MediaTransport>(
    engine: &mut SyncEngine<T>,
    notice_tx: &mpsc::UnboundedSender<SessionNotice>,
    status: &Arc<RwLock<DriverStatus>>,
) {
    {
        let mut status = status.write();
        status.phase = engine.phase();
        status.is_host = engine.is_host();
    }
    for notice in engine.take_notices() {
        let _ = notice_tx.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::config::SyncConfig;
    use crate::sync::protocol::{InboundEvent, OutboundEvent};
    use crate::transport::testing::{RecordingTransport, TransportCall};
    use crate::transport::{SegmentedPipeline, TransportError};
    use parking_lot::Mutex;

    /// Recording transport the test can inspect while the driver owns it
    #[derive(Clone, Default)]
    struct SharedTransport(Arc<Mutex<RecordingTransport>>);

    impl MediaTransport for SharedTransport {
        fn load(&mut self, url: &str) -> Result<(), TransportError> {
            self.0.lock().load(url)
        }
        fn open_segmented(&mut self, manifest_url: &str) -> Result<Box<dyn SegmentedPipeline>, TransportError> {
            self.0.lock().open_segmented(manifest_url)
        }
        fn clear_source(&mut self) {
            self.0.lock().clear_source()
        }
        fn play(&mut self) -> Result<(), TransportError> {
            self.0.lock().play()
        }
        fn pause(&mut self) {
            self.0.lock().pause()
        }
        fn seek(&mut self, position_seconds: f64) {
            self.0.lock().seek(position_seconds)
        }
        fn position(&self) -> f64 {
            self.0.lock().position()
        }
        fn duration(&self) -> Option<f64> {
            self.0.lock().duration()
        }
        fn is_playing(&self) -> bool {
            self.0.lock().is_playing()
        }
        fn set_volume(&mut self, volume: f32) {
            self.0.lock().set_volume(volume)
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            room_id: "room1".to_string(),
            display_name: "Ana".to_string(),
            participant_id: "PARTICIPANT".to_string(),
            connection_id: "sid-me".to_string(),
        }
    }

    fn message(text: &str) -> ChannelEvent {
        ChannelEvent::Message(InboundEvent::from_json(text).unwrap())
    }

    fn player_update(is_playing: bool, server_time: f64) -> ChannelEvent {
        message(&format!(
            r#"{{"event": "player_update", "data": {{"player": {{"current_track_index": 0, "is_playing": {}, "timestamp": 5.0, "start_time": {}}}, "server_time": {}}}}}"#,
            is_playing,
            server_time - 5.0,
            server_time
        ))
    }

    const ROOM_STATE: &str = r#"{"event": "room_state", "data": {"state": {
        "id": "room1",
        "admin_sid": "sid-host",
        "users": [],
        "queue": [{"id": "t1", "url": "u", "stream_url": "/static/a.mp3", "title": "A", "added_by": "Ana"}],
        "player": {"current_track_index": 0, "is_playing": false, "timestamp": 5.0, "start_time": 95.0}
    }, "server_time": 100.0}}"#;

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<SessionNotice>) -> SessionNotice {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_driver_joins_and_applies_snapshot() {
        let transport = SharedTransport::default();
        let (channel, mut outbound_rx) = ChannelHandle::new();
        let engine = SyncEngine::new(SyncConfig::default(), transport.clone(), channel).unwrap();
        let (_transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (handle, mut notices) = start(engine, transport_rx, Duration::from_secs(1));

        handle.join(identity(), None).await.unwrap();
        assert!(matches!(
            outbound_rx.recv().await,
            Some(OutboundEvent::JoinRoom { .. })
        ));

        handle.deliver(message(ROOM_STATE)).unwrap();
        assert!(matches!(next_notice(&mut notices).await, SessionNotice::RoomUpdated(_)));
        assert_eq!(handle.status().phase, Phase::Active);
        assert!(!handle.status().is_host);

        let inner = transport.0.lock();
        assert!(inner.source.is_some());
        assert_eq!(inner.seeks(), vec![5.0]);
    }

    #[tokio::test]
    async fn test_driver_collapses_queued_updates() {
        let transport = SharedTransport::default();
        let (channel, _outbound_rx) = ChannelHandle::new();
        let engine = SyncEngine::new(SyncConfig::default(), transport.clone(), channel).unwrap();
        let (_transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (handle, mut notices) = start(engine, transport_rx, Duration::from_secs(1));

        handle.join(identity(), None).await.unwrap();

        // Queued before the driver gets to run again
        handle.deliver(message(ROOM_STATE)).unwrap();
        handle.deliver(player_update(false, 101.0)).unwrap();
        handle.deliver(player_update(true, 102.0)).unwrap();
        handle.deliver(player_update(false, 103.0)).unwrap();

        let mut updates = 0;
        while updates < 4 {
            if let SessionNotice::RoomUpdated(_) = next_notice(&mut notices).await {
                updates += 1;
            }
        }

        let inner = transport.0.lock();
        assert_eq!(inner.count(&TransportCall::Play), 0);
        assert!(!inner.playing);
    }

    #[tokio::test]
    async fn test_channel_loss_ends_session() {
        let transport = SharedTransport::default();
        let (channel, _outbound_rx) = ChannelHandle::new();
        let engine = SyncEngine::new(SyncConfig::default(), transport.clone(), channel).unwrap();
        let (_transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (handle, mut notices) = start(engine, transport_rx, Duration::from_secs(1));

        handle.join(identity(), None).await.unwrap();
        handle.deliver(message(ROOM_STATE)).unwrap();
        handle
            .deliver(ChannelEvent::Closed {
                reason: "transport close".to_string(),
            })
            .unwrap();

        loop {
            if let SessionNotice::Ended { reason } = next_notice(&mut notices).await {
                assert_eq!(reason, "transport close");
                break;
            }
        }
        assert_eq!(handle.status().phase, Phase::Ended);
        assert!(transport.0.lock().source.is_none());
        assert!(matches!(handle.request_resync().await, Err(SessionError::NotInRoom)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let (channel, _outbound_rx) = ChannelHandle::new();
        let engine = SyncEngine::new(SyncConfig::default(), SharedTransport::default(), channel).unwrap();
        let (_transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (handle, mut notices) = start(engine, transport_rx, Duration::from_secs(1));

        handle.shutdown();
        // The notice stream closes once the task exits
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while notices.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
        assert!(matches!(handle.leave().await, Err(SessionError::Stopped)));
    }
}
