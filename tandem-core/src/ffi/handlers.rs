//! Session notice and outbound message handlers

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::sync::{Fault, OutboundEvent, SessionNotice};

use super::types::{RoomInfo, SessionCallback, TrackInfo};

pub(crate) type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Hand an outbound wire message to the native channel
pub(crate) fn forward_outbound(message: OutboundEvent, callback: &SharedCallback) {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode outbound message: {}", e);
            return;
        }
    };

    match callback.read().as_ref() {
        Some(cb) => cb.on_outbound(json),
        None => debug!("No callback set, dropping outbound message"),
    }
}

/// Translate a session notice into callback calls
pub(crate) fn handle_notice(notice: SessionNotice, callback: &SharedCallback) {
    let guard = callback.read();
    let Some(cb) = guard.as_ref() else {
        debug!("No callback set, dropping notice {:?}", notice);
        return;
    };

    match notice {
        SessionNotice::RoomUpdated(room) => cb.on_room_state_changed(RoomInfo::from(&room)),
        SessionNotice::RoleChanged { is_host } => cb.on_role_changed(is_host),
        SessionNotice::TrackChanged(track) => cb.on_track_changed(track.as_ref().map(TrackInfo::from)),
        SessionNotice::AutoplayBlocked => cb.on_autoplay_blocked(),
        SessionNotice::Fault(Fault::Authentication) => cb.on_password_required(),
        SessionNotice::Fault(fault) => cb.on_error(fault.to_string()),
        SessionNotice::Info(message) => cb.on_notification(message),
        SessionNotice::Ended { reason } => cb.on_session_ended(reason),
    }
}
