//! Ordered session event delivery
//!
//! Engine callbacks arrive on transport tasks. They are turned into
//! `SessionEvent`s while the session lock is held and pushed onto a FIFO,
//! so the consumer sees them in exactly the order the engine produced them.
//! The consumer drains the queue on its own task, or at explicit sync
//! points via `pump`/`drain`.

use super::data_channel::{ChannelMessage, DataChannel};
use super::description::{IceCandidate, SdpType};
use super::media_track::MediaTrack;
use super::signaling::{DescriptionSide, IceConnectionState, SignalingState};
use super::transceiver::RtpTransceiver;
use super::ErrorRecord;
use futures::Stream;
use log::{debug, warn};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Everything a session reports to the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NegotiationNeeded,
    SignalingStateChange(SignalingState),
    IceConnectionStateChange(IceConnectionState),
    IceCandidate(IceCandidate),
    TrackAdded {
        transceiver: Arc<RtpTransceiver>,
        track: Arc<MediaTrack>,
    },
    TrackRemoved {
        mid: Option<String>,
        track: Arc<MediaTrack>,
    },
    /// Channel announced by the remote peer
    DataChannel(Arc<DataChannel>),
    ChannelOpen {
        channel_id: u16,
        label: String,
    },
    ChannelMessage {
        channel_id: u16,
        message: ChannelMessage,
    },
    ChannelClosing {
        channel_id: u16,
    },
    ChannelClosed {
        channel_id: u16,
        label: String,
    },
    SetDescriptionSuccess {
        side: DescriptionSide,
        sdp_type: SdpType,
    },
    SetDescriptionFailure {
        side: DescriptionSide,
        sdp_type: SdpType,
        error: ErrorRecord,
    },
}

impl SessionEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::NegotiationNeeded => "negotiationneeded",
            SessionEvent::SignalingStateChange(_) => "signalingstatechange",
            SessionEvent::IceConnectionStateChange(_) => "iceconnectionstatechange",
            SessionEvent::IceCandidate(_) => "icecandidate",
            SessionEvent::TrackAdded { .. } => "track",
            SessionEvent::TrackRemoved { .. } => "removetrack",
            SessionEvent::DataChannel(_) => "datachannel",
            SessionEvent::ChannelOpen { .. } => "open",
            SessionEvent::ChannelMessage { .. } => "message",
            SessionEvent::ChannelClosing { .. } => "closing",
            SessionEvent::ChannelClosed { .. } => "close",
            SessionEvent::SetDescriptionSuccess { .. } => "setdescriptionsuccess",
            SessionEvent::SetDescriptionFailure { .. } => "setdescriptionfailure",
        }
    }
}

/// Producer side, owned by the session
pub(crate) struct EventDispatch {
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    depth: Arc<AtomicUsize>,
    warn_depth: usize,
    /// Undelivered events kept at most; 0 means no cap
    limit: usize,
    dropped: AtomicU64,
    overflowing: AtomicBool,
    session_id: String,
}

impl EventDispatch {
    pub fn new(session_id: &str, warn_depth: usize, limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            warn_depth,
            limit,
            dropped: AtomicU64::new(0),
            overflowing: AtomicBool::new(false),
            session_id: session_id.to_string(),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if self.limit > 0 && depth > self.limit {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.overflowing.swap(true, Ordering::AcqRel) {
                warn!(
                    "Session {}: event queue full ({} undelivered), discarding {} and later events",
                    self.session_id,
                    self.limit,
                    event.name()
                );
            }
            return;
        }
        if self.overflowing.swap(false, Ordering::AcqRel) {
            debug!("Session {}: event queue has room again", self.session_id);
        }
        if self.tx.send(event).is_err() {
            // Consumer dropped its stream; nothing left to deliver to
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if self.warn_depth > 0 && depth == self.warn_depth {
            warn!(
                "Session {}: {} undelivered events queued, is anyone draining the event stream?",
                self.session_id, depth
            );
        }
    }

    /// Hand the consumer end to the application. Only the first call succeeds.
    pub fn take_stream(&self) -> Option<EventStream> {
        self.rx.lock().take().map(|rx| EventStream {
            rx,
            depth: self.depth.clone(),
        })
    }

    pub fn queued(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of a session's event queue
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventStream {
    fn delivered(&self, event: Option<SessionEvent>) -> Option<SessionEvent> {
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }

    /// Wait for the next event. `None` once the session is gone and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.recv().await;
        self.delivered(event)
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.try_recv().ok();
        self.delivered(event)
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Run `handler` over everything queued right now, in order
    pub fn pump<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(SessionEvent),
    {
        let mut count = 0;
        while let Some(event) = self.try_recv() {
            handler(event);
            count += 1;
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(self.delivered(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_events_arrive_in_emit_order() {
        let dispatch = EventDispatch::new("s1", 0, 0);
        let mut stream = dispatch.take_stream().unwrap();

        dispatch.emit(SessionEvent::SignalingStateChange(SignalingState::HaveLocalOffer));
        dispatch.emit(SessionEvent::NegotiationNeeded);
        dispatch.emit(SessionEvent::SignalingStateChange(SignalingState::Stable));

        let names: Vec<_> = stream.drain().iter().map(SessionEvent::name).collect();
        assert_eq!(
            names,
            vec!["signalingstatechange", "negotiationneeded", "signalingstatechange"]
        );
        assert_eq!(stream.pending(), 0);
    }

    #[tokio::test]
    async fn test_stream_taken_once() {
        let dispatch = EventDispatch::new("s1", 0, 0);
        assert!(dispatch.take_stream().is_some());
        assert!(dispatch.take_stream().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_with_dispatch() {
        let dispatch = EventDispatch::new("s1", 0, 0);
        let mut stream = dispatch.take_stream().unwrap();
        dispatch.emit(SessionEvent::NegotiationNeeded);
        drop(dispatch);

        assert!(matches!(stream.next().await, Some(SessionEvent::NegotiationNeeded)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_counts_and_tracks_depth() {
        let dispatch = EventDispatch::new("s1", 2, 0);
        let mut stream = dispatch.take_stream().unwrap();
        for _ in 0..3 {
            dispatch.emit(SessionEvent::NegotiationNeeded);
        }
        assert_eq!(dispatch.queued(), 3);

        let mut seen = 0;
        assert_eq!(stream.pump(|_| seen += 1), 3);
        assert_eq!(seen, 3);
        assert_eq!(dispatch.queued(), 0);
    }

    #[tokio::test]
    async fn test_queue_is_capped_without_consumer() {
        let dispatch = EventDispatch::new("s1", 0, 3);
        for _ in 0..10 {
            dispatch.emit(SessionEvent::NegotiationNeeded);
        }
        assert_eq!(dispatch.queued(), 3);
        assert_eq!(dispatch.dropped(), 7);

        let mut stream = dispatch.take_stream().unwrap();
        assert_eq!(stream.drain().len(), 3);

        dispatch.emit(SessionEvent::SignalingStateChange(SignalingState::Stable));
        assert_eq!(dispatch.queued(), 1);
        assert_eq!(dispatch.dropped(), 7);
        assert!(matches!(
            stream.try_recv(),
            Some(SessionEvent::SignalingStateChange(SignalingState::Stable))
        ));
    }
}
