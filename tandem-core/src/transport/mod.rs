//! Transport Adapter
//!
//! Capability wrapper over the local media engine. The engine is driven only
//! through [`MediaTransport`]; completions and failures arrive later as
//! [`TransportEvent`]s.

mod client;
mod engine;
#[cfg(test)]
pub(crate) mod testing;
mod types;

use thiserror::Error;
use tracing::debug;

pub use client::EngineClient;
pub use engine::EngineTransport;
pub use types::*;

/// Errors from the media engine
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Media engine is not running or not reachable")]
    NotReachable,

    #[error("Invalid API token")]
    Unauthorized,

    #[error("Playback blocked by autoplay policy")]
    AutoplayBlocked,

    #[error("Segmented pipeline error: {0}")]
    Pipeline(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Transport worker stopped")]
    Closed,
}

/// What went wrong inside the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFaultKind {
    /// Decode or network error while playing
    Playback,
    /// Segmented pipeline failed to parse or attach
    Load,
}

/// Asynchronous notifications from the media engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Position report
    Position {
        position_seconds: f64,
        duration_seconds: Option<f64>,
    },
    /// The current source finished loading
    Loaded { duration_seconds: Option<f64> },
    /// End of media reached
    Ended,
    /// Media error
    Fault { kind: MediaFaultKind, message: String },
    /// A play request was refused by autoplay policy
    AutoplayBlocked,
}

/// Local media engine capabilities
pub trait MediaTransport: Send {
    /// Point the engine at a direct (single-file) source
    fn load(&mut self, url: &str) -> Result<(), TransportError>;

    /// Create a segmented-stream pipeline for a manifest and attach it
    fn open_segmented(&mut self, manifest_url: &str) -> Result<Box<dyn SegmentedPipeline>, TransportError>;

    /// Detach any source
    fn clear_source(&mut self);

    fn play(&mut self) -> Result<(), TransportError>;

    fn pause(&mut self);

    fn seek(&mut self, position_seconds: f64);

    /// Current position in seconds
    fn position(&self) -> f64;

    /// Media duration in seconds, once known
    fn duration(&self) -> Option<f64>;

    fn is_playing(&self) -> bool;

    /// Volume from 0.0 to 1.0
    fn set_volume(&mut self, volume: f32);
}

/// A segmented-stream decoding pipeline bound to one track
pub trait SegmentedPipeline: Send {
    fn manifest_url(&self) -> &str;

    /// Release buffers and detach from the engine
    fn destroy(&mut self);
}

/// Owns a pipeline and destroys it when dropped
pub struct PipelineGuard {
    pipeline: Option<Box<dyn SegmentedPipeline>>,
}

impl PipelineGuard {
    pub fn new(pipeline: Box<dyn SegmentedPipeline>) -> Self {
        Self {
            pipeline: Some(pipeline),
        }
    }

    pub fn manifest_url(&self) -> Option<&str> {
        self.pipeline.as_ref().map(|p| p.manifest_url())
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            debug!("Destroying segmented pipeline for {}", pipeline.manifest_url());
            pipeline.destroy();
        }
    }
}

impl std::fmt::Debug for PipelineGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGuard")
            .field("manifest_url", &self.manifest_url())
            .finish()
    }
}
