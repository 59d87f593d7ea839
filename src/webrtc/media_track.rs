//! Media tracks
//!
//! A track is either a local source created by the application or a remote
//! track owned by an `RtpReceiver`. Ownership is never shared between the
//! two: senders only borrow application tracks, receivers own theirs.

use crate::handle_table::HandleId;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Media kind of a track or transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Live,
    Ended,
}

const STATE_LIVE: u8 = 0;
const STATE_ENDED: u8 = 1;

/// Who owns the track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOrigin {
    /// Application-created source
    Local,
    /// Created by the receiver of the given transceiver
    Remote { transceiver: HandleId },
}

/// A single audio or video track
pub struct MediaTrack {
    handle: HandleId,
    id: String,
    kind: MediaKind,
    label: String,
    origin: TrackOrigin,
    state: AtomicU8,
    enabled: AtomicBool,
}

impl MediaTrack {
    /// Create an application-owned source track
    pub fn new_local(kind: MediaKind, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(
            kind,
            format!("{}-{}", kind, uuid::Uuid::new_v4()),
            label.into(),
            TrackOrigin::Local,
        ))
    }

    pub(crate) fn new_remote(kind: MediaKind, id: impl Into<String>, transceiver: HandleId) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self::build(kind, id.clone(), id, TrackOrigin::Remote { transceiver }))
    }

    fn build(kind: MediaKind, id: String, label: String, origin: TrackOrigin) -> Self {
        Self {
            handle: HandleId::next(),
            id,
            kind,
            label,
            origin,
            state: AtomicU8::new(STATE_LIVE),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn origin(&self) -> &TrackOrigin {
        &self.origin
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.origin, TrackOrigin::Remote { .. })
    }

    pub fn ready_state(&self) -> TrackState {
        match self.state.load(Ordering::Acquire) {
            STATE_LIVE => TrackState::Live,
            _ => TrackState::Ended,
        }
    }

    pub fn is_live(&self) -> bool {
        self.ready_state() == TrackState::Live
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// End the track. Returns true only for the call that performed the
    /// Live -> Ended transition.
    pub fn stop(&self) -> bool {
        let ended = self
            .state
            .compare_exchange(STATE_LIVE, STATE_ENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ended {
            debug!("Track {} ({}) ended", self.id, self.kind);
        }
        ended
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_track_starts_live() {
        let track = MediaTrack::new_local(MediaKind::Video, "camera");
        assert_eq!(track.kind(), MediaKind::Video);
        assert_eq!(track.label(), "camera");
        assert!(track.id().starts_with("video-"));
        assert!(track.is_live());
        assert!(!track.is_remote());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = MediaTrack::new_local(MediaKind::Audio, "mic");
        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(track.ready_state(), TrackState::Ended);
    }

    #[test]
    fn test_remote_track_origin() {
        let owner = HandleId::next();
        let track = MediaTrack::new_remote(MediaKind::Audio, "remote-audio", owner);
        assert!(track.is_remote());
        assert_eq!(track.origin(), &TrackOrigin::Remote { transceiver: owner });
    }
}
