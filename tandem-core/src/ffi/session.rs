//! Session implementation for FFI

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, ParticipantId};
use crate::config::{LocalProfile, SyncConfig};
use crate::sync::{driver, DriverHandle, InboundEvent, Phase, SessionIdentity, SyncEngine};
use crate::transport::{EngineClient, EngineTransport};

use super::handlers::{forward_outbound, handle_notice, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

/// Running driver plus the transport it owns
struct Running {
    driver: DriverHandle,
    transport: EngineTransport,
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    config: SyncConfig,
    engine_token: RwLock<Option<String>>,
    profile: RwLock<LocalProfile>,
    callback: SharedCallback,
    running: RwLock<Option<Running>>,
}

#[uniffi::export]
impl Session {
    /// Create a session with default configuration
    #[uniffi::constructor]
    pub fn new() -> Self {
        Self::build(SyncConfig::default())
    }

    /// Create a session from a JSON configuration document
    #[uniffi::constructor]
    pub fn with_config(config_json: String) -> Result<Arc<Self>, CoreError> {
        let config = SyncConfig::from_json(&config_json)?;
        Ok(Arc::new(Self::build(config)))
    }

    /// Set the media engine API token (applies from the next join)
    pub fn set_engine_token(&self, token: Option<String>) {
        *self.engine_token.write() = token;
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Check if the media engine is reachable
    pub fn check_engine_connection(&self) -> Result<(), CoreError> {
        debug!("Checking media engine connection...");
        let client = self.engine_client();
        let result = self
            .runtime
            .block_on(async { client.is_active().await })
            .map_err(CoreError::from);
        match &result {
            Ok(()) => info!("Media engine connection OK"),
            Err(e) => warn!("Media engine connection failed: {:?}", e),
        }
        result
    }

    /// Load the persisted profile (a fresh one if the file is missing)
    pub fn load_profile(&self, path: String) -> Result<ProfileInfo, CoreError> {
        let profile = LocalProfile::load_or_generate(&path)?;
        let info = ProfileInfo::from(&profile);
        *self.profile.write() = profile;
        Ok(info)
    }

    /// Persist the current profile
    pub fn save_profile(&self, path: String) -> Result<(), CoreError> {
        self.profile.read().save(&path)?;
        Ok(())
    }

    pub fn get_profile(&self) -> ProfileInfo {
        ProfileInfo::from(&*self.profile.read())
    }

    /// Join a room. `connection_id` is the channel's ID for this connection.
    pub fn join_room(
        &self,
        room_id: String,
        display_name: String,
        connection_id: String,
        password: Option<String>,
    ) -> Result<(), CoreError> {
        if self.is_in_room() {
            return Err(CoreError::AlreadyInRoom);
        }

        let room_id = room_id.trim().to_string();
        let display_name = display_name.trim().to_string();
        if room_id.is_empty() || display_name.is_empty() {
            return Err(CoreError::InvalidRequest("Room and name are required".to_string()));
        }

        let participant_id = {
            let mut profile = self.profile.write();
            if ParticipantId::parse(&profile.participant_id).is_none() {
                warn!("Stored participant ID is invalid, generating a new one");
                profile.participant_id = ParticipantId::random().to_string();
            }
            profile.display_name = Some(display_name.clone());
            profile.participant_id.clone()
        };

        let driver = self.ensure_driver_running()?;
        let identity = SessionIdentity {
            room_id,
            display_name,
            participant_id,
            connection_id,
        };

        self.runtime
            .block_on(driver.join(identity, password))
            .map_err(CoreError::from)
    }

    /// Re-send the join request with another password
    pub fn retry_join(&self, password: Option<String>) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.retry_join(password))
            .map_err(CoreError::from)
    }

    /// Deliver one inbound wire message (JSON)
    pub fn deliver(&self, message: String) -> Result<(), CoreError> {
        let event = InboundEvent::from_json(&message).map_err(|e| {
            warn!("Dropping malformed message: {}", e);
            CoreError::InvalidRequest(e.to_string())
        })?;
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        driver
            .deliver(ChannelEvent::Message(event))
            .map_err(CoreError::from)
    }

    /// The room channel disconnected
    pub fn channel_closed(&self, reason: String) {
        if let Some(driver) = self.driver() {
            let _ = driver.deliver(ChannelEvent::Closed { reason });
        }
    }

    /// Ask the host to push fresh timing
    pub fn request_resync(&self) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.request_resync())
            .map_err(CoreError::from)
    }

    /// The user started dragging the position slider
    pub fn begin_scrub(&self) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        driver.begin_scrub().map_err(CoreError::from)
    }

    /// The user released the position slider
    pub fn end_scrub(&self, position_seconds: f64) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.end_scrub(position_seconds))
            .map_err(CoreError::from)
    }

    /// Request a transport control for the whole room
    pub fn control(&self, action: PlaybackAction, position_seconds: Option<f64>) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.control(action.into(), position_seconds, None))
            .map_err(CoreError::from)
    }

    /// Set the room loop mode
    pub fn set_loop(&self, mode: LoopSetting) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.control(PlaybackAction::Loop.into(), None, Some(mode.into())))
            .map_err(CoreError::from)
    }

    /// Set local volume (0.0 to 1.0); remembered in the profile
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.profile.write().volume = volume;
        if let Some(driver) = self.driver() {
            let _ = driver.set_volume(volume);
        }
    }

    /// Leave the current room
    pub fn leave_room(&self) -> Result<(), CoreError> {
        let driver = self.driver().ok_or(CoreError::NotInRoom)?;
        self.runtime
            .block_on(driver.leave())
            .map_err(CoreError::from)?;
        info!("Left room");
        Ok(())
    }

    /// Check if we are in (or joining) a room
    pub fn is_in_room(&self) -> bool {
        self.driver()
            .map(|d| matches!(d.status().phase, Phase::Joining | Phase::Active))
            .unwrap_or(false)
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        self.driver().map(|d| d.status().is_host).unwrap_or(false)
    }
}

impl Session {
    fn build(config: SyncConfig) -> Self {
        TRACING_INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tandem_core=debug,reqwest=off,hyper=off,hyper_util=off"));
            tracing_subscriber::fmt()
                .with_ansi(false) // Native consoles don't render colors
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        });

        info!("Initializing tandem-core session");

        let runtime = Runtime::new().expect("Failed to create tokio runtime");

        Self {
            runtime,
            config,
            engine_token: RwLock::new(None),
            profile: RwLock::new(LocalProfile::generate()),
            callback: Arc::new(RwLock::new(None)),
            running: RwLock::new(None),
        }
    }

    fn engine_client(&self) -> EngineClient {
        let client = EngineClient::with_port(self.config.engine_port);
        match self.engine_token.read().clone() {
            Some(token) => client.with_token(token),
            None => client,
        }
    }

    fn driver(&self) -> Option<DriverHandle> {
        self.running.read().as_ref().map(|r| r.driver.clone())
    }

    /// Start the transport and driver if not already running
    fn ensure_driver_running(&self) -> Result<DriverHandle, CoreError> {
        let mut running = self.running.write();
        if let Some(r) = running.as_ref() {
            if r.driver.status().phase != Phase::Ended {
                return Ok(r.driver.clone());
            }
        }
        // A previous session ended; start fresh
        if let Some(old) = running.take() {
            old.driver.shutdown();
            old.transport.shutdown();
        }

        let client = self.engine_client();
        let poll_interval = Duration::from_millis(self.config.engine_poll_interval_ms);
        let (transport, transport_rx) = self
            .runtime
            .block_on(async { EngineTransport::start(client, poll_interval) });

        let (channel, mut outbound_rx) = ChannelHandle::new();
        let mut engine = SyncEngine::new(self.config.clone(), transport.clone(), channel)?;
        engine.set_volume(self.profile.read().volume);

        let tick_interval = Duration::from_millis(self.config.tick_interval_ms);
        let (handle, mut notice_rx) = self
            .runtime
            .block_on(async { driver::start(engine, transport_rx, tick_interval) });

        let callback = Arc::clone(&self.callback);
        self.runtime.spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                forward_outbound(message, &callback);
            }
        });

        let callback = Arc::clone(&self.callback);
        self.runtime.spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                handle_notice(notice, &callback);
            }
        });

        *running = Some(Running {
            driver: handle.clone(),
            transport,
        });
        Ok(handle)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = self.running.write().take() {
            running.driver.shutdown();
            running.transport.shutdown();
        }
    }
}
