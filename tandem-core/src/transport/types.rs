//! Types for media engine API requests and responses

use serde::{Deserialize, Serialize};

/// Response wrapper for most engine API endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(flatten)]
    pub data: T,
}

/// Coarse engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Ended,
    Error,
}

/// Response for the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Current position in seconds
    #[serde(default)]
    pub position: f64,

    /// Duration in seconds, once metadata is known
    #[serde(default)]
    pub duration: Option<f64>,

    /// Engine state
    #[serde(default)]
    pub state: EngineState,

    /// Loaded source URL
    #[serde(default)]
    pub source: Option<String>,

    /// Last error message when `state` is `error`
    #[serde(default)]
    pub error: Option<String>,
}

impl EngineStatus {
    pub fn is_playing(&self) -> bool {
        self.state == EngineState::Playing
    }
}

/// Response for the status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub info: EngineStatus,
}

/// Request body for the load endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LoadRequest {
    pub url: String,
}

/// Request body for the seek endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SeekRequest {
    pub position: f64,
}

/// Request body for the volume endpoint
#[derive(Debug, Clone, Serialize)]
pub struct VolumeRequest {
    pub volume: f32,
}

/// Request body for creating a segmented pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub id: String,
    pub manifest_url: String,
}
