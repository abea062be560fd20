//! Track Loader
//!
//! Keeps the transport pointed at the stream for `queue[current_index]` and
//! nothing else. Reloads only when the normalized stream URL changes.

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SyncConfig};
use crate::transport::{MediaTransport, PipelineGuard, TransportError};

use super::protocol::Track;

/// How a source is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Single file handed straight to the engine
    Direct,
    /// Manifest plus segments, needs a dedicated pipeline
    Segmented,
}

/// A stream URL after classification
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    /// Absolute URL with any cache-busting parameter removed
    pub normalized: String,
    /// URL the engine should fetch (proxied if externally hosted)
    pub playable: String,
    pub kind: SourceKind,
    /// Whether the source is served by our own origin
    pub local: bool,
}

/// Rules for turning stream URLs into engine sources
#[derive(Debug, Clone)]
pub struct SourcePolicy {
    base: Url,
    proxy_path: String,
    cache_bust_param: String,
    segmented_marker: String,
}

impl SourcePolicy {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let base = Url::parse(&config.server_base_url).map_err(|e| {
            ConfigError::Invalid(format!("server_base_url {:?}: {}", config.server_base_url, e))
        })?;

        Ok(Self {
            base,
            proxy_path: config.proxy_path.clone(),
            cache_bust_param: config.cache_bust_param.clone(),
            segmented_marker: config.segmented_marker.to_ascii_lowercase(),
        })
    }

    /// Absolute form of `url` with the cache-busting parameter stripped
    fn absolute(&self, url: &str) -> Option<Url> {
        let mut absolute = self.base.join(url).ok()?;
        let kept: Vec<(String, String)> = absolute
            .query_pairs()
            .filter(|(k, _)| k != self.cache_bust_param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            absolute.set_query(None);
        } else {
            absolute.query_pairs_mut().clear().extend_pairs(kept);
        }
        Some(absolute)
    }

    /// Comparison key for a stream URL
    pub fn normalize(&self, url: &str) -> String {
        self.absolute(url)
            .map(String::from)
            .unwrap_or_else(|| url.to_string())
    }

    /// Classify a stream URL
    pub fn resolve(&self, url: &str) -> ResolvedSource {
        let Some(absolute) = self.absolute(url) else {
            // Unparseable: hand it over untouched and let the engine fail it
            return ResolvedSource {
                normalized: url.to_string(),
                playable: url.to_string(),
                kind: SourceKind::Direct,
                local: true,
            };
        };

        let local = absolute.origin() == self.base.origin();
        let kind = if absolute
            .path()
            .to_ascii_lowercase()
            .ends_with(&self.segmented_marker)
        {
            SourceKind::Segmented
        } else {
            SourceKind::Direct
        };

        let playable = if local {
            absolute.to_string()
        } else {
            self.proxied(&absolute)
        };

        ResolvedSource {
            normalized: absolute.into(),
            playable,
            kind,
            local,
        }
    }

    /// Route an external URL through the media proxy
    fn proxied(&self, external: &Url) -> String {
        match self.base.join(&self.proxy_path) {
            Ok(mut proxy) => {
                proxy.query_pairs_mut().append_pair("url", external.as_str());
                proxy.into()
            }
            Err(e) => {
                warn!("Invalid proxy path {:?}: {}", self.proxy_path, e);
                external.to_string()
            }
        }
    }

    /// Append the cache-busting parameter
    pub fn cache_busted(&self, url: &str, stamp: u64) -> String {
        match Url::parse(url) {
            Ok(mut parsed) => {
                parsed
                    .query_pairs_mut()
                    .append_pair(&self.cache_bust_param, &stamp.to_string());
                parsed.into()
            }
            Err(_) => url.to_string(),
        }
    }
}

/// Result of one loader pass
#[derive(Debug)]
pub enum LoadOutcome {
    /// Already pointed at the right stream
    Unchanged,
    /// A new source was handed to the transport
    Loaded { kind: SourceKind },
    /// The previous source was torn down and nothing replaces it
    Cleared,
    /// Nothing loaded and nothing to load
    Idle,
    /// The new source could not be attached
    Failed(TransportError),
}

#[derive(Debug)]
struct ActiveSource {
    normalized: String,
    kind: SourceKind,
    /// False once attaching failed; the same URL is not retried
    ready: bool,
}

/// Tracks what the transport is pointed at
#[derive(Debug)]
pub struct TrackLoader {
    policy: SourcePolicy,
    active: Option<ActiveSource>,
    pipeline: Option<PipelineGuard>,
}

impl TrackLoader {
    pub fn new(policy: SourcePolicy) -> Self {
        Self {
            policy,
            active: None,
            pipeline: None,
        }
    }

    pub fn policy(&self) -> &SourcePolicy {
        &self.policy
    }

    /// Whether a source is attached and usable for reconciliation
    pub fn has_source(&self) -> bool {
        self.active.as_ref().map(|a| a.ready).unwrap_or(false)
    }

    /// Kind of the attached source
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.active.as_ref().map(|a| a.kind)
    }

    /// Point the transport at `track`'s stream. `stamp` feeds the
    /// cache-busting parameter for direct sources.
    pub fn sync<T: MediaTransport>(&mut self, track: Option<&Track>, transport: &mut T, stamp: u64) -> LoadOutcome {
        let stream_url = track
            .and_then(|t| t.stream_url.as_deref())
            .filter(|u| !u.is_empty());

        let Some(stream_url) = stream_url else {
            if self.active.is_some() || self.pipeline.is_some() {
                info!("No playable track, clearing transport source");
                self.teardown(transport);
                return LoadOutcome::Cleared;
            }
            return LoadOutcome::Idle;
        };

        let resolved = self.policy.resolve(stream_url);
        if let Some(active) = &self.active {
            if active.normalized == resolved.normalized {
                return LoadOutcome::Unchanged;
            }
        }

        // Segment buffers belong to the previous track; never reuse them
        self.pipeline = None;

        info!(
            "Loading {:?} source {} (local: {})",
            resolved.kind, resolved.normalized, resolved.local
        );

        let result = match resolved.kind {
            SourceKind::Segmented => transport
                .open_segmented(&resolved.playable)
                .map(|pipeline| self.pipeline = Some(PipelineGuard::new(pipeline))),
            SourceKind::Direct => {
                let url = self.policy.cache_busted(&resolved.playable, stamp);
                debug!("Direct source URL: {}", url);
                transport.load(&url)
            }
        };

        let ready = result.is_ok();
        self.active = Some(ActiveSource {
            normalized: resolved.normalized,
            kind: resolved.kind,
            ready,
        });

        match result {
            Ok(()) => LoadOutcome::Loaded { kind: resolved.kind },
            Err(e) => {
                warn!("Failed to attach source: {}", e);
                transport.clear_source();
                LoadOutcome::Failed(e)
            }
        }
    }

    /// Release any pipeline and clear the transport
    pub fn teardown<T: MediaTransport>(&mut self, transport: &mut T) {
        self.pipeline = None;
        self.active = None;
        transport.clear_source();
    }
}
