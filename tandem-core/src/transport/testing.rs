//! Recording transport for tests

use std::sync::Arc;

use parking_lot::Mutex;

use super::{MediaTransport, SegmentedPipeline, TransportError};

/// A call made against the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Load(String),
    OpenSegmented(String),
    Clear,
    Play,
    Pause,
    Seek(f64),
    Volume(f32),
}

/// Pipeline lifecycle record shared with the pipelines handed out
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Created(String),
    Destroyed(String),
}

/// In-memory transport that records every call
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<TransportCall>,
    pub pipeline_log: Arc<Mutex<Vec<PipelineEvent>>>,
    pub source: Option<String>,
    pub position: f64,
    pub duration: Option<f64>,
    pub playing: bool,
    pub volume: f32,
    pub autoplay_blocked: bool,
    pub fail_segmented: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Seek(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn pipelines(&self) -> Vec<PipelineEvent> {
        self.pipeline_log.lock().clone()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl MediaTransport for RecordingTransport {
    fn load(&mut self, url: &str) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Load(url.to_string()));
        self.source = Some(url.to_string());
        self.position = 0.0;
        self.playing = false;
        Ok(())
    }

    fn open_segmented(&mut self, manifest_url: &str) -> Result<Box<dyn SegmentedPipeline>, TransportError> {
        self.calls.push(TransportCall::OpenSegmented(manifest_url.to_string()));
        if self.fail_segmented {
            return Err(TransportError::Pipeline("manifest rejected".to_string()));
        }
        self.source = Some(manifest_url.to_string());
        self.position = 0.0;
        self.playing = false;
        self.pipeline_log
            .lock()
            .push(PipelineEvent::Created(manifest_url.to_string()));
        Ok(Box::new(RecordingPipeline {
            manifest_url: manifest_url.to_string(),
            log: Arc::clone(&self.pipeline_log),
        }))
    }

    fn clear_source(&mut self) {
        self.calls.push(TransportCall::Clear);
        self.source = None;
        self.playing = false;
    }

    fn play(&mut self) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Play);
        if self.autoplay_blocked {
            return Err(TransportError::AutoplayBlocked);
        }
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.calls.push(TransportCall::Pause);
        self.playing = false;
    }

    fn seek(&mut self, position_seconds: f64) {
        self.calls.push(TransportCall::Seek(position_seconds));
        self.position = position_seconds;
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn set_volume(&mut self, volume: f32) {
        self.calls.push(TransportCall::Volume(volume));
        self.volume = volume;
    }
}

struct RecordingPipeline {
    manifest_url: String,
    log: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl SegmentedPipeline for RecordingPipeline {
    fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    fn destroy(&mut self) {
        self.log
            .lock()
            .push(PipelineEvent::Destroyed(self.manifest_url.clone()));
    }
}
