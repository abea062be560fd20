//! Media Engine HTTP Client

use std::time::Duration;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::types::*;
use super::TransportError;

/// Default connection timeout (short since it's localhost)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default request timeout (short since it's localhost)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the local media engine's REST API
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl EngineClient {
    /// Create a client for the engine on localhost at `port`
    pub fn with_port(port: u16) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            http,
            // Use 127.0.0.1 explicitly to avoid IPv6 issues
            base_url: format!("http://127.0.0.1:{}", port),
            api_token: None,
        }
    }

    /// Set the API token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request with optional authentication
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1/player{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.api_token {
            req = req.header("apitoken", token);
        }

        req
    }

    /// Map a response status onto the error taxonomy
    fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::UNAUTHORIZED => Err(TransportError::Unauthorized),
            // The engine refuses unattended playback with 403
            StatusCode::FORBIDDEN => Err(TransportError::AutoplayBlocked),
            s => Err(TransportError::Api(format!("Unexpected response (HTTP {})", s.as_u16()))),
        }
    }

    /// Check if the engine is reachable
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn is_active(&self) -> Result<(), TransportError> {
        debug!("Checking media engine connection");

        let resp = self
            .request(reqwest::Method::GET, "/active")
            .send()
            .await
            .map_err(|e| {
                warn!("Connection error: {:?}", e);
                if e.is_connect() || e.is_timeout() {
                    TransportError::NotReachable
                } else {
                    TransportError::Http(e)
                }
            })?;

        Self::check(resp).map(|_| ())
    }

    /// Current engine status
    pub async fn status(&self) -> Result<EngineStatus, TransportError> {
        let resp = self.request(reqwest::Method::GET, "/status").send().await?;
        let body: ApiResponse<StatusResponse> = Self::check(resp)?.json().await?;
        Ok(body.data.info)
    }

    /// Load a direct source
    pub async fn load(&self, url: &str) -> Result<(), TransportError> {
        let resp = self
            .request(reqwest::Method::POST, "/load")
            .json(&LoadRequest { url: url.to_string() })
            .send()
            .await?;
        Self::check(resp).map(|_| ())
    }

    /// Detach the current source
    pub async fn clear(&self) -> Result<(), TransportError> {
        let resp = self.request(reqwest::Method::POST, "/clear").send().await?;
        Self::check(resp).map(|_| ())
    }

    /// Resume playback
    pub async fn play(&self) -> Result<(), TransportError> {
        let resp = self.request(reqwest::Method::POST, "/play").send().await?;
        Self::check(resp).map(|_| ())
    }

    /// Pause playback
    pub async fn pause(&self) -> Result<(), TransportError> {
        let resp = self.request(reqwest::Method::POST, "/pause").send().await?;
        Self::check(resp).map(|_| ())
    }

    /// Seek to a position in seconds
    pub async fn seek(&self, position_secs: f64) -> Result<(), TransportError> {
        let resp = self
            .request(reqwest::Method::POST, "/seek")
            .json(&SeekRequest {
                position: position_secs.max(0.0),
            })
            .send()
            .await?;
        Self::check(resp).map(|_| ())
    }

    /// Set volume (0.0 to 1.0)
    pub async fn set_volume(&self, volume: f32) -> Result<(), TransportError> {
        let resp = self
            .request(reqwest::Method::POST, "/volume")
            .json(&VolumeRequest {
                volume: volume.clamp(0.0, 1.0),
            })
            .send()
            .await?;
        Self::check(resp).map(|_| ())
    }

    /// Create and attach a segmented-stream pipeline
    pub async fn open_pipeline(&self, id: &str, manifest_url: &str) -> Result<(), TransportError> {
        let resp = self
            .request(reqwest::Method::POST, "/pipelines")
            .json(&PipelineRequest {
                id: id.to_string(),
                manifest_url: manifest_url.to_string(),
            })
            .send()
            .await?;
        Self::check(resp)
            .map(|_| ())
            .map_err(|e| match e {
                TransportError::Api(msg) => TransportError::Pipeline(msg),
                other => other,
            })
    }

    /// Destroy a segmented-stream pipeline
    pub async fn close_pipeline(&self, id: &str) -> Result<(), TransportError> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/pipelines/{}", id))
            .send()
            .await?;
        Self::check(resp).map(|_| ())
    }
}

impl Default for EngineClient {
    fn default() -> Self {
        Self::with_port(crate::config::DEFAULT_ENGINE_PORT)
    }
}
