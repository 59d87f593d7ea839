//! Transceivers, senders and receivers
//!
//! Mutable transceiver state (direction, mid, stopped) lives in the owning
//! session and is looked up through the session handle. The wrappers here
//! only carry identity plus the per-sender/receiver pieces that have their
//! own synchronization: the attached track and the send parameters.

use super::media_track::{MediaKind, MediaTrack};
use super::peer_connection::SessionInner;
use super::stats::{PendingStats, StatsTarget};
use super::transport::MediaFrame;
use super::WebRTCError;
use crate::handle_table::HandleId;
use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => TransceiverDirection::SendRecv,
            (true, false) => TransceiverDirection::SendOnly,
            (false, true) => TransceiverDirection::RecvOnly,
            (false, false) => TransceiverDirection::Inactive,
        }
    }

    pub fn sends(&self) -> bool {
        matches!(self, TransceiverDirection::SendRecv | TransceiverDirection::SendOnly)
    }

    pub fn receives(&self) -> bool {
        matches!(self, TransceiverDirection::SendRecv | TransceiverDirection::RecvOnly)
    }

    /// Direction seen from the other end of the media section
    pub fn reverse(&self) -> Self {
        Self::from_flags(self.receives(), self.sends())
    }

    /// Direction to answer with, given our preference and the offered direction
    pub fn answer_direction(&self, offered: TransceiverDirection) -> Self {
        Self::from_flags(
            self.sends() && offered.receives(),
            self.receives() && offered.sends(),
        )
    }

    /// Same direction with the send half switched off
    pub fn without_send(&self) -> Self {
        Self::from_flags(false, self.receives())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransceiverDirection::SendRecv => "sendrecv",
            TransceiverDirection::SendOnly => "sendonly",
            TransceiverDirection::RecvOnly => "recvonly",
            TransceiverDirection::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(TransceiverDirection::SendRecv),
            "sendonly" => Some(TransceiverDirection::SendOnly),
            "recvonly" => Some(TransceiverDirection::RecvOnly),
            "inactive" => Some(TransceiverDirection::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for TransceiverDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a new transceiver is built from: a bare kind or an existing track
#[derive(Debug, Clone)]
pub enum TransceiverSource {
    Kind(MediaKind),
    Track(Arc<MediaTrack>),
}

impl TransceiverSource {
    pub fn kind(&self) -> MediaKind {
        match self {
            TransceiverSource::Kind(kind) => *kind,
            TransceiverSource::Track(track) => track.kind(),
        }
    }

    pub(crate) fn into_track(self) -> Option<Arc<MediaTrack>> {
        match self {
            TransceiverSource::Kind(_) => None,
            TransceiverSource::Track(track) => Some(track),
        }
    }
}

impl From<MediaKind> for TransceiverSource {
    fn from(kind: MediaKind) -> Self {
        TransceiverSource::Kind(kind)
    }
}

impl From<Arc<MediaTrack>> for TransceiverSource {
    fn from(track: Arc<MediaTrack>) -> Self {
        TransceiverSource::Track(track)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_fmtp_line: Option<String>,
    pub payload_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpHeaderExtensionCapability {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    pub header_extensions: Vec<RtpHeaderExtensionCapability>,
}

fn codec(mime_type: &str, clock_rate: u32, channels: Option<u16>, fmtp: Option<&str>, payload_type: u8) -> RtpCodecCapability {
    RtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        channels,
        sdp_fmtp_line: fmtp.map(str::to_string),
        payload_type,
    }
}

/// Codec table advertised for a media kind
pub fn capabilities(kind: MediaKind) -> RtpCapabilities {
    match kind {
        MediaKind::Audio => RtpCapabilities {
            codecs: vec![
                codec("audio/opus", 48000, Some(2), Some("minptime=10;useinbandfec=1"), 111),
                codec("audio/PCMU", 8000, Some(1), None, 0),
                codec("audio/PCMA", 8000, Some(1), None, 8),
                codec("audio/telephone-event", 8000, Some(1), None, 126),
            ],
            header_extensions: vec![RtpHeaderExtensionCapability {
                uri: "urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_string(),
            }],
        },
        MediaKind::Video => RtpCapabilities {
            codecs: vec![
                codec(
                    "video/H264",
                    90000,
                    None,
                    Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
                    96,
                ),
                codec("video/VP8", 90000, None, None, 97),
                codec("video/VP9", 90000, None, Some("profile-id=0"), 98),
                codec("video/AV1", 90000, None, None, 99),
            ],
            header_extensions: vec![
                RtpHeaderExtensionCapability {
                    uri: "urn:ietf:params:rtp-hdrext:toffset".to_string(),
                },
                RtpHeaderExtensionCapability {
                    uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
                },
            ],
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_framerate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

impl Default for RtpEncodingParameters {
    fn default() -> Self {
        Self {
            rid: None,
            active: true,
            max_bitrate: None,
            max_framerate: None,
            scale_resolution_down_by: None,
        }
    }
}

/// Send parameters snapshot. `transaction_id` is the version token that
/// guards `set_parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpSendParameters {
    pub transaction_id: String,
    pub encodings: Vec<RtpEncodingParameters>,
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpSendParameters {
    fn initial(kind: MediaKind) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            encodings: vec![RtpEncodingParameters::default()],
            codecs: capabilities(kind).codecs,
        }
    }
}

fn validate_encoding(encoding: &RtpEncodingParameters) -> Result<(), WebRTCError> {
    if let Some(scale) = encoding.scale_resolution_down_by {
        if !(scale >= 1.0) {
            return Err(WebRTCError::InvalidParameter(format!(
                "scaleResolutionDownBy must be >= 1.0, got {}",
                scale
            )));
        }
    }
    if let Some(framerate) = encoding.max_framerate {
        if !(framerate > 0.0) {
            return Err(WebRTCError::InvalidParameter(format!(
                "maxFramerate must be positive, got {}",
                framerate
            )));
        }
    }
    Ok(())
}

/// Application-visible transceiver handle
pub struct RtpTransceiver {
    handle: HandleId,
    kind: MediaKind,
    sender: Arc<RtpSender>,
    receiver: Arc<RtpReceiver>,
    session: Weak<SessionInner>,
}

impl RtpTransceiver {
    pub(crate) fn new(
        handle: HandleId,
        kind: MediaKind,
        sender: Arc<RtpSender>,
        receiver: Arc<RtpReceiver>,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            handle,
            kind,
            sender,
            receiver,
            session,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn sender(&self) -> &Arc<RtpSender> {
        &self.sender
    }

    pub fn receiver(&self) -> &Arc<RtpReceiver> {
        &self.receiver
    }

    /// Media section id, assigned once the transceiver is negotiated
    pub fn mid(&self) -> Option<String> {
        self.session.upgrade().and_then(|inner| inner.transceiver_mid(self.handle))
    }

    /// Preferred direction. Stopped transceivers report `Inactive`.
    pub fn direction(&self) -> TransceiverDirection {
        self.session
            .upgrade()
            .and_then(|inner| inner.transceiver_direction(self.handle))
            .unwrap_or(TransceiverDirection::Inactive)
    }

    /// Direction agreed by the last applied answer
    pub fn current_direction(&self) -> Option<TransceiverDirection> {
        self.session
            .upgrade()
            .and_then(|inner| inner.transceiver_current_direction(self.handle))
    }

    pub fn set_direction(&self, direction: TransceiverDirection) -> Result<(), WebRTCError> {
        let inner = self.session.upgrade().ok_or(WebRTCError::SessionClosed)?;
        inner.set_transceiver_direction(self.handle, direction)
    }

    pub fn is_stopped(&self) -> bool {
        match self.session.upgrade() {
            Some(inner) => inner.transceiver_direction(self.handle).is_none(),
            None => true,
        }
    }

    /// Stop both halves. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<(), WebRTCError> {
        match self.session.upgrade() {
            Some(inner) => inner.stop_transceiver(self.handle),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RtpTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpTransceiver")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("mid", &self.mid())
            .finish()
    }
}

/// Sending half of a transceiver
pub struct RtpSender {
    handle: HandleId,
    transceiver: HandleId,
    kind: MediaKind,
    /// Read-held for the duration of a frame write; `replace_track` takes
    /// the write side so it never lands mid-write.
    track: RwLock<Option<Arc<MediaTrack>>>,
    parameters: Mutex<RtpSendParameters>,
    session: Weak<SessionInner>,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl RtpSender {
    pub(crate) fn new(
        transceiver: HandleId,
        kind: MediaKind,
        track: Option<Arc<MediaTrack>>,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            handle: HandleId::next(),
            transceiver,
            kind,
            track: RwLock::new(track),
            parameters: Mutex::new(RtpSendParameters::initial(kind)),
            session,
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub(crate) fn transceiver_handle(&self) -> HandleId {
        self.transceiver
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Option<Arc<MediaTrack>> {
        self.track.read().clone()
    }

    pub fn get_capabilities(kind: MediaKind) -> RtpCapabilities {
        capabilities(kind)
    }

    /// Swap the outgoing track without renegotiation. `None` detaches.
    pub fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), WebRTCError> {
        if let Some(track) = &track {
            if track.kind() != self.kind {
                return Err(WebRTCError::InvalidParameter(format!(
                    "cannot send a {} track on a {} sender",
                    track.kind(),
                    self.kind
                )));
            }
        }
        let inner = self.session.upgrade().ok_or(WebRTCError::SessionClosed)?;
        inner.ensure_transceiver_active(self.transceiver)?;

        let mut slot = self.track.write();
        debug!(
            "Sender {} track {:?} -> {:?}",
            self.handle,
            slot.as_ref().map(|t| t.id().to_string()),
            track.as_ref().map(|t| t.id().to_string())
        );
        *slot = track;
        Ok(())
    }

    pub(crate) fn detach_track(&self) -> Option<Arc<MediaTrack>> {
        self.track.write().take()
    }

    /// Queue one encoded frame of the attached track for the next media flush
    pub fn write_frame(&self, payload: impl Into<Bytes>) -> Result<(), WebRTCError> {
        let inner = self.session.upgrade().ok_or(WebRTCError::SessionClosed)?;
        // Resolved before taking the track lock; the session lock is never
        // acquired while a track guard is held.
        let mid = inner.negotiated_mid(self.transceiver)?.ok_or_else(|| {
            WebRTCError::InvalidStateTransition(format!("sender {} is not negotiated", self.handle))
        })?;

        let guard = self.track.read();
        let track = guard
            .as_ref()
            .ok_or_else(|| WebRTCError::NotFound(format!("sender {} has no track", self.handle)))?;
        if !track.is_live() {
            return Err(WebRTCError::InvalidParameter(format!("track {} has ended", track.id())));
        }
        if !track.enabled() {
            return Ok(());
        }

        let payload = payload.into();
        let size = payload.len() as u64;
        inner.push_media(MediaFrame {
            mid,
            track_id: track.id().to_string(),
            payload,
        })?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Current parameters together with the token needed to change them
    pub fn get_parameters(&self) -> RtpSendParameters {
        self.parameters.lock().clone()
    }

    /// Apply parameters obtained from `get_parameters`.
    ///
    /// Rejected whole if the token is out of date or the encoding layout
    /// changed; a successful call issues a fresh token.
    pub fn set_parameters(&self, params: RtpSendParameters) -> Result<(), WebRTCError> {
        let inner = self.session.upgrade().ok_or(WebRTCError::SessionClosed)?;
        inner.ensure_transceiver_active(self.transceiver)?;

        let mut current = self.parameters.lock();
        if params.transaction_id != current.transaction_id {
            return Err(WebRTCError::StaleParameters);
        }
        if params.encodings.len() != current.encodings.len() {
            return Err(WebRTCError::InvalidParameter(format!(
                "encoding count is fixed at {}, got {}",
                current.encodings.len(),
                params.encodings.len()
            )));
        }
        for encoding in &params.encodings {
            validate_encoding(encoding)?;
        }

        current.encodings = params.encodings;
        current.transaction_id = uuid::Uuid::new_v4().to_string();
        debug!("Sender {} parameters updated", self.handle);
        Ok(())
    }

    pub fn get_stats(&self) -> PendingStats {
        let inner = match self.session.upgrade() {
            Some(inner) => inner,
            None => return PendingStats::failed(WebRTCError::SessionClosed),
        };
        match inner.negotiated_mid(self.transceiver) {
            Ok(Some(mid)) => inner.request_stats(StatsTarget::Sender { mid }),
            Ok(None) => PendingStats::failed(WebRTCError::InvalidStateTransition(format!(
                "sender {} is not negotiated",
                self.handle
            ))),
            Err(err) => PendingStats::failed(err),
        }
    }
}

impl fmt::Debug for RtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSender")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("track", &self.track.read().as_ref().map(|t| t.id().to_string()))
            .finish()
    }
}

/// Receiving half of a transceiver. Owns its remote track.
pub struct RtpReceiver {
    handle: HandleId,
    transceiver: HandleId,
    kind: MediaKind,
    track: RwLock<Arc<MediaTrack>>,
    session: Weak<SessionInner>,
}

impl RtpReceiver {
    pub(crate) fn new(transceiver: HandleId, kind: MediaKind, session: Weak<SessionInner>) -> Self {
        let track_id = format!("remote-{}-{}", kind, transceiver.as_u64());
        Self {
            handle: HandleId::next(),
            transceiver,
            kind,
            track: RwLock::new(MediaTrack::new_remote(kind, track_id, transceiver)),
            session,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<MediaTrack> {
        self.track.read().clone()
    }

    pub fn get_capabilities(kind: MediaKind) -> RtpCapabilities {
        capabilities(kind)
    }

    /// Point the receiver at the remote track announced by the peer.
    /// A live track with the same id is kept; otherwise a new one replaces it.
    pub(crate) fn adopt_remote_track(&self, track_id: &str) -> Arc<MediaTrack> {
        let mut slot = self.track.write();
        if slot.id() == track_id && slot.is_live() {
            return slot.clone();
        }
        slot.stop();
        let track = MediaTrack::new_remote(self.kind, track_id, self.transceiver);
        *slot = track.clone();
        track
    }

    pub fn get_stats(&self) -> PendingStats {
        let inner = match self.session.upgrade() {
            Some(inner) => inner,
            None => return PendingStats::failed(WebRTCError::SessionClosed),
        };
        match inner.negotiated_mid(self.transceiver) {
            Ok(Some(mid)) => inner.request_stats(StatsTarget::Receiver { mid }),
            Ok(None) => PendingStats::failed(WebRTCError::InvalidStateTransition(format!(
                "receiver {} is not negotiated",
                self.handle
            ))),
            Err(err) => PendingStats::failed(err),
        }
    }
}

impl fmt::Debug for RtpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpReceiver")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("track", &self.track.read().id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_direction() {
        use TransceiverDirection::*;
        assert_eq!(SendRecv.answer_direction(SendRecv), SendRecv);
        assert_eq!(SendRecv.answer_direction(SendOnly), RecvOnly);
        assert_eq!(SendRecv.answer_direction(RecvOnly), SendOnly);
        assert_eq!(RecvOnly.answer_direction(RecvOnly), Inactive);
        assert_eq!(SendOnly.answer_direction(Inactive), Inactive);
    }

    #[test]
    fn test_reverse_and_without_send() {
        use TransceiverDirection::*;
        assert_eq!(SendOnly.reverse(), RecvOnly);
        assert_eq!(SendRecv.reverse(), SendRecv);
        assert_eq!(SendRecv.without_send(), RecvOnly);
        assert_eq!(SendOnly.without_send(), Inactive);
    }

    #[test]
    fn test_direction_parse() {
        for dir in [
            TransceiverDirection::SendRecv,
            TransceiverDirection::SendOnly,
            TransceiverDirection::RecvOnly,
            TransceiverDirection::Inactive,
        ] {
            assert_eq!(TransceiverDirection::parse(dir.as_str()), Some(dir));
        }
        assert_eq!(TransceiverDirection::parse("stopped"), None);
    }

    #[test]
    fn test_video_capabilities() {
        let caps = RtpSender::get_capabilities(MediaKind::Video);
        let h264 = &caps.codecs[0];
        assert_eq!(h264.mime_type, "video/H264");
        assert_eq!(h264.clock_rate, 90000);
        assert!(h264
            .sdp_fmtp_line
            .as_deref()
            .unwrap()
            .contains("packetization-mode=1"));
        assert!(caps.codecs.iter().any(|c| c.mime_type == "video/VP8"));
    }

    #[test]
    fn test_audio_capabilities() {
        let caps = RtpReceiver::get_capabilities(MediaKind::Audio);
        assert_eq!(caps.codecs[0].mime_type, "audio/opus");
        assert_eq!(caps.codecs[0].channels, Some(2));
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let encoding = RtpEncodingParameters {
            scale_resolution_down_by: Some(0.5),
            ..Default::default()
        };
        assert!(matches!(
            validate_encoding(&encoding),
            Err(WebRTCError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_detached_sender_reports_closed() {
        let sender = RtpSender::new(HandleId::next(), MediaKind::Audio, None, Weak::new());
        assert_eq!(sender.write_frame(vec![1u8, 2, 3]), Err(WebRTCError::SessionClosed));
        let params = sender.get_parameters();
        assert_eq!(sender.set_parameters(params), Err(WebRTCError::SessionClosed));
    }

    #[test]
    fn test_receiver_adopts_remote_track() {
        let receiver = RtpReceiver::new(HandleId::next(), MediaKind::Video, Weak::new());
        let first = receiver.track();
        let adopted = receiver.adopt_remote_track("peer-video");
        assert_eq!(adopted.id(), "peer-video");
        assert!(!first.is_live());

        let again = receiver.adopt_remote_track("peer-video");
        assert!(Arc::ptr_eq(&adopted, &again));
    }
}
