//! Media transport seam
//!
//! The session owns negotiation state; a `MediaTransport` owns the wire
//! (ICE, DTLS, SCTP, RTP) and the SDP text. The transport reports engine
//! events back through the `TransportObserver` it is bound to, from its
//! own tasks.
//!
//! Contract for implementations:
//! - Synchronous methods may be called with the session lock held and must
//!   never call the observer from inside the call.
//! - Observer calls after `close()` are allowed and are dropped.

use super::data_channel::{ChannelMessage, DataChannelInit};
use super::description::{IceCandidate, SessionDescription};
use super::media_track::MediaKind;
use super::signaling::IceConnectionState;
use super::stats::{StatsRecord, StatsTarget};
use super::transceiver::TransceiverDirection;
use super::WebRTCError;
use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use std::sync::Weak;

/// One media section as the session sees it at negotiation time
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSectionInfo {
    pub mid: String,
    pub kind: MediaKind,
    pub direction: TransceiverDirection,
    /// Track currently attached to the sender, if any
    pub track_id: Option<String>,
}

/// Session state handed to `create_offer` / `create_answer`
#[derive(Debug, Clone)]
pub struct NegotiationSnapshot {
    pub session_id: String,
    pub media: Vec<MediaSectionInfo>,
    /// Whether an SCTP association is wanted
    pub data_channels: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
    pub voice_activity_detection: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub voice_activity_detection: bool,
}

/// Remote track announced in a remote description
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrackInfo {
    pub mid: String,
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_ids: Vec<String>,
}

/// DataChannel open request, in either direction
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub id: u16,
    pub label: String,
    pub init: DataChannelInit,
}

/// One encoded frame queued by a sender
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub mid: String,
    pub track_id: String,
    pub payload: Bytes,
}

/// Engine callbacks
#[derive(Debug, Clone)]
pub enum TransportEvent {
    NegotiationNeeded,
    IceConnectionStateChange(IceConnectionState),
    IceCandidate(IceCandidate),
    TrackAdded(RemoteTrackInfo),
    TrackRemoved { mid: String },
    DataChannel(ChannelSpec),
    ChannelOpen(u16),
    ChannelMessage(u16, ChannelMessage),
    ChannelClosed(u16),
}

/// Receiver of engine callbacks
pub trait TransportEventSink: Send + Sync {
    fn on_transport_event(&self, event: TransportEvent);
}

/// Handle the transport uses to report back. Holds the sink weakly, so a
/// transport that outlives its session simply has its callbacks dropped.
#[derive(Clone)]
pub struct TransportObserver {
    sink: Weak<dyn TransportEventSink>,
}

impl TransportObserver {
    pub fn new(sink: Weak<dyn TransportEventSink>) -> Self {
        Self { sink }
    }

    pub fn deliver(&self, event: TransportEvent) {
        match self.sink.upgrade() {
            Some(sink) => sink.on_transport_event(event),
            None => trace!("Dropping transport event after session teardown: {:?}", event),
        }
    }

    pub fn on_negotiation_needed(&self) {
        self.deliver(TransportEvent::NegotiationNeeded)
    }

    pub fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        self.deliver(TransportEvent::IceConnectionStateChange(state))
    }

    pub fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.deliver(TransportEvent::IceCandidate(candidate))
    }

    pub fn on_track_added(&self, info: RemoteTrackInfo) {
        self.deliver(TransportEvent::TrackAdded(info))
    }

    pub fn on_track_removed(&self, mid: String) {
        self.deliver(TransportEvent::TrackRemoved { mid })
    }

    pub fn on_data_channel(&self, spec: ChannelSpec) {
        self.deliver(TransportEvent::DataChannel(spec))
    }

    pub fn on_channel_open(&self, channel_id: u16) {
        self.deliver(TransportEvent::ChannelOpen(channel_id))
    }

    pub fn on_channel_message(&self, channel_id: u16, message: ChannelMessage) {
        self.deliver(TransportEvent::ChannelMessage(channel_id, message))
    }

    pub fn on_channel_closed(&self, channel_id: u16) {
        self.deliver(TransportEvent::ChannelClosed(channel_id))
    }
}

/// The wire side of a peer connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Called once by the session before any other method
    fn bind(&self, observer: TransportObserver);

    /// 0 or 1: parity of SCTP stream ids this end may allocate (DTLS role)
    fn channel_id_parity(&self) -> u16;

    async fn create_offer(
        &self,
        snapshot: NegotiationSnapshot,
        options: OfferOptions,
    ) -> Result<SessionDescription, WebRTCError>;

    async fn create_answer(
        &self,
        snapshot: NegotiationSnapshot,
        options: AnswerOptions,
    ) -> Result<SessionDescription, WebRTCError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError>;

    /// Returns the media sections of the applied description, with
    /// directions as written by the remote end. Rollback returns none.
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<Vec<MediaSectionInfo>, WebRTCError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError>;

    fn open_data_channel(&self, spec: ChannelSpec) -> Result<(), WebRTCError>;

    fn send_data(&self, channel_id: u16, message: ChannelMessage) -> Result<(), WebRTCError>;

    /// Completion is reported through `on_channel_closed`
    fn close_data_channel(&self, channel_id: u16);

    fn write_media(&self, frames: Vec<MediaFrame>);

    async fn collect_stats(&self, target: StatsTarget) -> Result<Vec<StatsRecord>, WebRTCError>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder(Mutex<Vec<String>>);

    impl TransportEventSink for Recorder {
        fn on_transport_event(&self, event: TransportEvent) {
            self.0.lock().push(format!("{:?}", event));
        }
    }

    #[test]
    fn test_observer_forwards_while_sink_alive() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink: Arc<dyn TransportEventSink> = recorder.clone();
        let observer = TransportObserver::new(Arc::downgrade(&sink));

        observer.on_channel_open(3);
        observer.on_track_removed("0".to_string());
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[test]
    fn test_observer_drops_after_sink_gone() {
        let sink: Arc<dyn TransportEventSink> = Arc::new(Recorder(Mutex::new(Vec::new())));
        let observer = TransportObserver::new(Arc::downgrade(&sink));
        drop(sink);
        observer.on_negotiation_needed();
    }
}
