//! Host Timing Responder
//!
//! Runs only while the local participant holds the host role. Timing answers
//! are always read live from the transport, never from the snapshot store.

use tracing::{debug, info};

use crate::transport::MediaTransport;

use super::protocol::OutboundEvent;

/// Answers probes and keeps the host heartbeat going
#[derive(Debug)]
pub struct HostResponder {
    heartbeat_interval_ms: u64,
    active: bool,
    /// Local time (ms) the next heartbeat is due; `None` when stopped
    next_heartbeat_ms: Option<u64>,
}

impl HostResponder {
    pub fn new(heartbeat_interval_ms: u64) -> Self {
        Self {
            heartbeat_interval_ms,
            active: false,
            next_heartbeat_ms: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Align with the current role. Called after every state change whether
    /// or not the role moved. Returns the new role on a transition.
    pub fn refresh(&mut self, is_host: bool, now_ms: u64) -> Option<bool> {
        if is_host == self.active {
            return None;
        }

        self.active = is_host;
        if is_host {
            info!("Became host, starting heartbeat");
            self.next_heartbeat_ms = Some(now_ms + self.heartbeat_interval_ms);
        } else {
            info!("No longer host, stopping heartbeat");
            self.next_heartbeat_ms = None;
        }
        Some(is_host)
    }

    /// Emit a heartbeat if one is due
    pub fn poll_heartbeat(&mut self, room_id: &str, now_ms: u64) -> Option<OutboundEvent> {
        let due = self.next_heartbeat_ms?;
        if !self.active || now_ms < due {
            return None;
        }

        // Skip missed beats rather than bursting them
        let mut next = due + self.heartbeat_interval_ms;
        if next <= now_ms {
            next = now_ms + self.heartbeat_interval_ms;
        }
        self.next_heartbeat_ms = Some(next);

        Some(OutboundEvent::HostHeartbeat {
            room_id: room_id.to_string(),
        })
    }

    /// Local time the next heartbeat is due
    pub fn next_heartbeat_ms(&self) -> Option<u64> {
        self.next_heartbeat_ms
    }

    /// Answer a timing probe for `requester`
    pub fn answer_probe<T: MediaTransport>(&self, room_id: &str, requester: &str, transport: &T) -> Option<OutboundEvent> {
        if !self.active {
            debug!("Ignoring timing probe for {} (not host)", requester);
            return None;
        }

        Some(OutboundEvent::HostStateResponse {
            room_id: room_id.to_string(),
            requester_sid: requester.to_string(),
            timestamp: transport.position().max(0.0),
            is_playing: transport.is_playing(),
        })
    }

    /// Full timing push for a participant who just joined
    pub fn welcome<T: MediaTransport>(&self, room_id: &str, transport: &T) -> Option<OutboundEvent> {
        if !self.active {
            return None;
        }

        Some(OutboundEvent::HostSync {
            room_id: room_id.to_string(),
            timestamp: transport.position().max(0.0),
            is_playing: transport.is_playing(),
        })
    }

    /// Stop everything (leaving the room)
    pub fn stop(&mut self) {
        self.active = false;
        self.next_heartbeat_ms = None;
    }
}
