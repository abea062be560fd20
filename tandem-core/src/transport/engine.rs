//! Media engine transport
//!
//! [`EngineTransport`] is a handle; a background task owns the HTTP client,
//! executes commands in order and polls engine status. The handle keeps a
//! status mirror so position reads never block.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::EngineClient;
use super::types::{EngineState, EngineStatus};
use super::{MediaFaultKind, MediaTransport, SegmentedPipeline, TransportError, TransportEvent};

/// Polled positions are ignored this long after a local seek, so a status
/// snapshot taken before the engine applied the seek doesn't undo it
const SEEK_SETTLE: Duration = Duration::from_millis(750);

/// Last known engine status, extrapolated while playing
#[derive(Debug)]
struct StatusMirror {
    position: f64,
    reported_at: Instant,
    duration: Option<f64>,
    state: EngineState,
    settle_until: Option<Instant>,
}

impl StatusMirror {
    fn new() -> Self {
        Self {
            position: 0.0,
            reported_at: Instant::now(),
            duration: None,
            state: EngineState::Idle,
            settle_until: None,
        }
    }

    fn is_playing(&self) -> bool {
        self.state == EngineState::Playing
    }

    fn position(&self) -> f64 {
        if self.is_playing() {
            self.position + self.reported_at.elapsed().as_secs_f64()
        } else {
            self.position
        }
    }

    fn set_position(&mut self, position: f64) {
        self.position = position;
        self.reported_at = Instant::now();
    }

    fn reset(&mut self, state: EngineState) {
        self.set_position(0.0);
        self.duration = None;
        self.state = state;
        self.settle_until = None;
    }

    fn apply(&mut self, status: &EngineStatus) {
        let settling = self
            .settle_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false);
        if !settling {
            self.settle_until = None;
            self.set_position(status.position);
        }
        if status.duration.is_some() {
            self.duration = status.duration;
        }
        self.state = status.state;
    }
}

/// Commands sent to the engine task
#[derive(Debug)]
enum EngineCommand {
    Load { url: String },
    Clear,
    Play,
    Pause,
    Seek { position: f64 },
    Volume { volume: f32 },
    OpenPipeline { id: String, manifest_url: String },
    ClosePipeline { id: String },
    Shutdown,
}

impl EngineCommand {
    /// Check if the command attaches a new source
    fn attaches_source(&self) -> bool {
        matches!(self, EngineCommand::Load { .. } | EngineCommand::OpenPipeline { .. })
    }
}

/// Engine state as last seen by the task, used to derive transition events
#[derive(Debug)]
struct StateTracker {
    last: EngineState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            last: EngineState::Idle,
        }
    }

    /// A source was attached; the next settled poll reports the load
    fn source_attached(&mut self) {
        self.last = EngineState::Loading;
    }

    /// Record a polled status and return the events it implies
    fn observe(&mut self, status: &EngineStatus) -> Vec<TransportEvent> {
        let events = transition_events(self.last, status);
        self.last = status.state;
        events
    }
}

/// Handle to the running engine task
#[derive(Clone)]
pub struct EngineTransport {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<RwLock<StatusMirror>>,
}

impl EngineTransport {
    /// Start the engine task and return a handle plus its event stream.
    /// Must be called from within a tokio runtime.
    pub fn start(
        client: EngineClient,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(StatusMirror::new()));

        let task_status = Arc::clone(&status);
        tokio::spawn(async move {
            run(client, command_rx, event_tx, task_status, poll_interval).await;
        });

        (Self { command_tx, status }, event_rx)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
    }

    fn send(&self, command: EngineCommand) -> Result<(), TransportError> {
        self.command_tx
            .send(command)
            .map_err(|_| TransportError::Closed)
    }
}

impl MediaTransport for EngineTransport {
    fn load(&mut self, url: &str) -> Result<(), TransportError> {
        self.status.write().reset(EngineState::Loading);
        self.send(EngineCommand::Load { url: url.to_string() })
    }

    fn open_segmented(&mut self, manifest_url: &str) -> Result<Box<dyn SegmentedPipeline>, TransportError> {
        let id = format!("{:016x}", rand::random::<u64>());
        self.status.write().reset(EngineState::Loading);
        self.send(EngineCommand::OpenPipeline {
            id: id.clone(),
            manifest_url: manifest_url.to_string(),
        })?;
        Ok(Box::new(EnginePipeline {
            id,
            manifest_url: manifest_url.to_string(),
            command_tx: self.command_tx.clone(),
        }))
    }

    fn clear_source(&mut self) {
        self.status.write().reset(EngineState::Idle);
        let _ = self.send(EngineCommand::Clear);
    }

    fn play(&mut self) -> Result<(), TransportError> {
        {
            let mut status = self.status.write();
            let position = status.position();
            status.set_position(position);
            status.state = EngineState::Playing;
        }
        self.send(EngineCommand::Play)
    }

    fn pause(&mut self) {
        {
            let mut status = self.status.write();
            let position = status.position();
            status.set_position(position);
            status.state = EngineState::Paused;
        }
        let _ = self.send(EngineCommand::Pause);
    }

    fn seek(&mut self, position_seconds: f64) {
        {
            let mut status = self.status.write();
            status.set_position(position_seconds);
            status.settle_until = Some(Instant::now() + SEEK_SETTLE);
        }
        let _ = self.send(EngineCommand::Seek {
            position: position_seconds,
        });
    }

    fn position(&self) -> f64 {
        self.status.read().position()
    }

    fn duration(&self) -> Option<f64> {
        self.status.read().duration
    }

    fn is_playing(&self) -> bool {
        self.status.read().is_playing()
    }

    fn set_volume(&mut self, volume: f32) {
        let _ = self.send(EngineCommand::Volume { volume });
    }
}

/// Engine-side segmented pipeline, destroyed through the engine task
struct EnginePipeline {
    id: String,
    manifest_url: String,
    command_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl SegmentedPipeline for EnginePipeline {
    fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    fn destroy(&mut self) {
        let _ = self.command_tx.send(EngineCommand::ClosePipeline {
            id: self.id.clone(),
        });
    }
}

/// Engine task: executes commands in order and polls status
async fn run(
    client: EngineClient,
    mut command_rx: mpsc::UnboundedReceiver<EngineCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    status: Arc<RwLock<StatusMirror>>,
    poll_interval: Duration,
) {
    info!("Media engine task started ({})", client.base_url());

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tracker = StateTracker::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    None | Some(EngineCommand::Shutdown) => break,
                    Some(cmd) => {
                        let attaches_source = cmd.attaches_source();
                        if execute(&client, cmd, &event_tx).await && attaches_source {
                            tracker.source_attached();
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                match client.status().await {
                    Ok(engine_status) => {
                        status.write().apply(&engine_status);
                        for event in tracker.observe(&engine_status) {
                            let _ = event_tx.send(event);
                        }
                    }
                    Err(e) => debug!("Status poll failed: {}", e),
                }
            }
        }
    }

    info!("Media engine task ended");
}

/// Run one command. Returns true if the engine accepted it.
async fn execute(
    client: &EngineClient,
    command: EngineCommand,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> bool {
    let result = match &command {
        EngineCommand::Load { url } => client.load(url).await,
        EngineCommand::Clear => client.clear().await,
        EngineCommand::Play => client.play().await,
        EngineCommand::Pause => client.pause().await,
        EngineCommand::Seek { position } => client.seek(*position).await,
        EngineCommand::Volume { volume } => client.set_volume(*volume).await,
        EngineCommand::OpenPipeline { id, manifest_url } => client.open_pipeline(id, manifest_url).await,
        EngineCommand::ClosePipeline { id } => client.close_pipeline(id).await,
        EngineCommand::Shutdown => Ok(()),
    };

    match (result, command) {
        (Ok(()), _) => return true,
        (Err(TransportError::AutoplayBlocked), _) => {
            let _ = event_tx.send(TransportEvent::AutoplayBlocked);
        }
        (Err(e), EngineCommand::Load { url }) => {
            warn!("Failed to load {}: {}", url, e);
            let _ = event_tx.send(TransportEvent::Fault {
                kind: MediaFaultKind::Load,
                message: e.to_string(),
            });
        }
        (Err(e), EngineCommand::OpenPipeline { manifest_url, .. }) => {
            warn!("Failed to attach pipeline for {}: {}", manifest_url, e);
            let _ = event_tx.send(TransportEvent::Fault {
                kind: MediaFaultKind::Load,
                message: e.to_string(),
            });
        }
        (Err(e), command) => warn!("Engine command {:?} failed: {}", command, e),
    }
    false
}

/// Events implied by a status change
fn transition_events(previous: EngineState, status: &EngineStatus) -> Vec<TransportEvent> {
    let mut events = vec![TransportEvent::Position {
        position_seconds: status.position,
        duration_seconds: status.duration,
    }];

    if previous == EngineState::Loading
        && !matches!(status.state, EngineState::Loading | EngineState::Error)
    {
        events.push(TransportEvent::Loaded {
            duration_seconds: status.duration,
        });
    }

    if status.state == EngineState::Ended && previous != EngineState::Ended {
        events.push(TransportEvent::Ended);
    }

    if status.state == EngineState::Error && previous != EngineState::Error {
        events.push(TransportEvent::Fault {
            kind: MediaFaultKind::Playback,
            message: status
                .error
                .clone()
                .unwrap_or_else(|| "media engine error".to_string()),
        });
    }

    events
}
