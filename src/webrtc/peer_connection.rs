//! Peer connection session
//!
//! `PeerConnectionSession` owns the signaling state machine, the
//! transceiver and DataChannel collections and the stats bookkeeping of one
//! peer connection. The wire is delegated to a [`MediaTransport`].
//!
//! Concurrency model:
//! - All session state sits behind one lock. Transport callbacks take the
//!   same lock, update state and enqueue the resulting events before
//!   releasing it, so events are delivered in engine order.
//! - Negotiation calls (offer/answer creation, set*Description, candidate
//!   adds) are chained: each waits for the previous one to finish, including
//!   its transport round trip. State validity is checked once the call
//!   reaches the head of the chain.
//! - `close()` is synchronous and idempotent. It closes channels, stops
//!   transceivers, fails outstanding stats requests, flushes queued media and
//!   then releases the transport. Every later mutating call fails with
//!   `SessionClosed`, and transport callbacks arriving after that are dropped.

use super::data_channel::{ChannelEntry, ChannelMessage, DataChannel, DataChannelInit, DataChannelState, MAX_CHANNEL_ID};
use super::description::{IceCandidate, SdpType, SessionDescription};
use super::events::{EventDispatch, EventStream, SessionEvent};
use super::media_track::{MediaKind, MediaTrack};
use super::signaling::{next_state, DescriptionSide, IceConnectionState, SignalingState};
use super::stats::{PendingStats, StatsCollector, StatsRecord, StatsTarget};
use super::transceiver::{RtpReceiver, RtpSender, RtpTransceiver, TransceiverDirection, TransceiverSource};
use super::transport::{
    AnswerOptions, ChannelSpec, MediaFrame, MediaSectionInfo, MediaTransport, NegotiationSnapshot, OfferOptions,
    RemoteTrackInfo, TransportEvent, TransportEventSink, TransportObserver,
};
use super::{ErrorRecord, WebRTCError};
use crate::batch::UpdateBatcher;
use crate::config::SessionConfig;
use crate::handle_table::{HandleId, HandleTable};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Session-side record of a transceiver
pub(crate) struct TransceiverEntry {
    handle: HandleId,
    kind: MediaKind,
    mid: Option<String>,
    direction: TransceiverDirection,
    current_direction: Option<TransceiverDirection>,
    /// Direction written by the remote end in its latest description
    remote_direction: Option<TransceiverDirection>,
    sender: Arc<RtpSender>,
    receiver: Arc<RtpReceiver>,
}

/// Transceiver change made while applying a remote description, undone
/// if that description is rolled back
#[derive(Debug, Clone, Copy)]
enum RemoteChange {
    Created(HandleId),
    Claimed(HandleId),
    Direction(HandleId, Option<TransceiverDirection>),
    TrackAdopted(HandleId),
}

struct SessionState {
    signaling: SignalingState,
    ice: IceConnectionState,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    transceivers: Vec<TransceiverEntry>,
    channels: BTreeMap<u16, ChannelEntry>,
    next_channel_id: u16,
    next_mid: u32,
    /// An SCTP association has been asked for
    data_requested: bool,
    negotiation_needed: bool,
    /// Changes since the last stable state, newest last
    remote_changes: Vec<RemoteChange>,
    stats: StatsCollector,
    channels_opened: u64,
    channels_closed: u64,
    closed: bool,
}

impl SessionState {
    fn new(channel_id_parity: u16) -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            pending_local: None,
            current_local: None,
            pending_remote: None,
            current_remote: None,
            transceivers: Vec::new(),
            channels: BTreeMap::new(),
            next_channel_id: channel_id_parity,
            next_mid: 0,
            data_requested: false,
            negotiation_needed: false,
            remote_changes: Vec::new(),
            stats: StatsCollector::new(),
            channels_opened: 0,
            channels_closed: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), WebRTCError> {
        if self.closed {
            Err(WebRTCError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn transceiver(&self, handle: HandleId) -> Option<&TransceiverEntry> {
        self.transceivers.iter().find(|t| t.handle == handle)
    }

    fn transceiver_mut(&mut self, handle: HandleId) -> Option<&mut TransceiverEntry> {
        self.transceivers.iter_mut().find(|t| t.handle == handle)
    }

    fn position_by_mid(&self, mid: &str) -> Option<usize> {
        self.transceivers.iter().position(|t| t.mid.as_deref() == Some(mid))
    }

    /// Give every unassociated transceiver a fresh numeric mid
    fn assign_mids(&mut self) {
        for i in 0..self.transceivers.len() {
            if self.transceivers[i].mid.is_some() {
                continue;
            }
            let mid = loop {
                let candidate = self.next_mid.to_string();
                self.next_mid += 1;
                if self.position_by_mid(&candidate).is_none() {
                    break candidate;
                }
            };
            self.transceivers[i].mid = Some(mid);
        }
    }

    fn snapshot(&self, session_id: &str) -> NegotiationSnapshot {
        NegotiationSnapshot {
            session_id: session_id.to_string(),
            media: self
                .transceivers
                .iter()
                .filter_map(|t| {
                    Some(MediaSectionInfo {
                        mid: t.mid.clone()?,
                        kind: t.kind,
                        direction: t.direction,
                        track_id: t.sender.track().map(|track| track.id().to_string()),
                    })
                })
                .collect(),
            data_channels: self.data_requested,
        }
    }

    fn allocate_channel_id(&mut self) -> Result<u16, WebRTCError> {
        let exhausted = || WebRTCError::InvalidParameter("no free DataChannel ids".to_string());
        let mut id = self.next_channel_id;
        while self.channels.contains_key(&id) {
            id = id.checked_add(2).ok_or_else(exhausted)?;
        }
        if id > MAX_CHANNEL_ID {
            return Err(exhausted());
        }
        self.next_channel_id = id.saturating_add(2);
        Ok(id)
    }

    fn commit_description(&mut self, side: DescriptionSide, desc: SessionDescription) {
        use DescriptionSide::{Local, Remote};
        match (side, desc.sdp_type()) {
            (Local, SdpType::Rollback) => self.pending_local = None,
            (Remote, SdpType::Rollback) => self.pending_remote = None,
            (Local, SdpType::Offer | SdpType::Pranswer) => self.pending_local = Some(desc),
            (Remote, SdpType::Offer | SdpType::Pranswer) => self.pending_remote = Some(desc),
            (Local, SdpType::Answer) => {
                self.current_local = Some(desc);
                if let Some(offer) = self.pending_remote.take() {
                    self.current_remote = Some(offer);
                }
                self.pending_local = None;
            }
            (Remote, SdpType::Answer) => {
                self.current_remote = Some(desc);
                if let Some(offer) = self.pending_local.take() {
                    self.current_local = Some(offer);
                }
                self.pending_remote = None;
            }
        }
    }

    fn update_current_directions(&mut self, side: DescriptionSide) {
        for entry in self.transceivers.iter_mut().filter(|t| t.mid.is_some()) {
            let Some(remote) = entry.remote_direction else {
                continue;
            };
            entry.current_direction = Some(match side {
                DescriptionSide::Local => entry.direction.answer_direction(remote),
                DescriptionSide::Remote => remote.reverse(),
            });
        }
    }
}

fn into_negotiation_error(err: WebRTCError) -> WebRTCError {
    match err {
        WebRTCError::NegotiationFailed { .. } | WebRTCError::SessionClosed | WebRTCError::InvalidStateTransition(_) => {
            err
        }
        other => WebRTCError::negotiation("OperationError", other.to_string()),
    }
}

pub(crate) struct SessionInner {
    handle: HandleId,
    id: String,
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Operations chain for negotiation calls
    negotiation: tokio::sync::Mutex<()>,
    transport: Arc<dyn MediaTransport>,
    events: EventDispatch,
    channels: HandleTable<DataChannel>,
    transceivers: HandleTable<RtpTransceiver>,
    media: UpdateBatcher<MediaFrame>,
    weak_self: Weak<SessionInner>,
}

impl SessionInner {
    fn new_transceiver_entry(
        &self,
        kind: MediaKind,
        track: Option<Arc<MediaTrack>>,
        direction: TransceiverDirection,
    ) -> TransceiverEntry {
        let handle = HandleId::next();
        TransceiverEntry {
            handle,
            kind,
            mid: None,
            direction,
            current_direction: None,
            remote_direction: None,
            sender: Arc::new(RtpSender::new(handle, kind, track, self.weak_self.clone())),
            receiver: Arc::new(RtpReceiver::new(handle, kind, self.weak_self.clone())),
        }
    }

    fn transceiver_wrapper(&self, entry: &TransceiverEntry) -> Result<Arc<RtpTransceiver>, WebRTCError> {
        self.transceivers.find_or_create(entry.handle, |handle| {
            RtpTransceiver::new(
                handle,
                entry.kind,
                entry.sender.clone(),
                entry.receiver.clone(),
                self.weak_self.clone(),
            )
        })
    }

    fn channel_wrapper(&self, id: u16, entry: &ChannelEntry) -> Result<Arc<DataChannel>, WebRTCError> {
        self.channels
            .find_or_create(entry.handle, |handle| DataChannel::new(handle, id, entry, self.weak_self.clone()))
    }

    /// Raise negotiation-needed, deferring the event until Stable
    fn mark_negotiation_needed(&self, st: &mut SessionState) {
        if st.closed || st.negotiation_needed {
            return;
        }
        st.negotiation_needed = true;
        if st.signaling.is_stable() {
            self.events.emit(SessionEvent::NegotiationNeeded);
        } else {
            debug!("Session {}: negotiation needed once stable", self.id);
        }
    }

    /// Find or create the transceiver for a remote media section
    fn associate_section(&self, st: &mut SessionState, mid: &str, kind: MediaKind, create: bool) -> Option<usize> {
        if let Some(pos) = st.position_by_mid(mid) {
            if st.transceivers[pos].kind == kind {
                return Some(pos);
            }
            // Our mid was never negotiated for that kind; give it up
            st.transceivers[pos].mid = None;
        }
        if let Some(pos) = st.transceivers.iter().position(|t| t.mid.is_none() && t.kind == kind) {
            st.transceivers[pos].mid = Some(mid.to_string());
            st.remote_changes.push(RemoteChange::Claimed(st.transceivers[pos].handle));
            return Some(pos);
        }
        if !create {
            return None;
        }
        let mut entry = self.new_transceiver_entry(kind, None, TransceiverDirection::RecvOnly);
        entry.mid = Some(mid.to_string());
        debug!("Session {}: new {} transceiver for remote mid {}", self.id, kind, mid);
        st.remote_changes.push(RemoteChange::Created(entry.handle));
        st.transceivers.push(entry);
        Some(st.transceivers.len() - 1)
    }

    fn apply_remote_sections(&self, st: &mut SessionState, sections: &[MediaSectionInfo], sdp_type: SdpType) {
        for section in sections {
            let create = sdp_type == SdpType::Offer;
            if let Some(pos) = self.associate_section(st, &section.mid, section.kind, create) {
                let entry = &mut st.transceivers[pos];
                let previous = entry.remote_direction.replace(section.direction);
                let handle = entry.handle;
                st.remote_changes.push(RemoteChange::Direction(handle, previous));
            }
        }
    }

    /// Undo what a rolled-back remote offer did to the transceivers.
    /// Transceivers it created that have nothing to send are dropped.
    fn undo_remote_changes(&self, st: &mut SessionState) {
        for change in std::mem::take(&mut st.remote_changes).into_iter().rev() {
            match change {
                RemoteChange::TrackAdopted(handle) => {
                    let Some(entry) = st.transceiver(handle) else {
                        continue;
                    };
                    let track = entry.receiver.track();
                    if track.stop() {
                        self.events.emit(SessionEvent::TrackRemoved {
                            mid: entry.mid.clone(),
                            track,
                        });
                    }
                }
                RemoteChange::Direction(handle, previous) => {
                    if let Some(entry) = st.transceiver_mut(handle) {
                        entry.remote_direction = previous;
                    }
                }
                RemoteChange::Claimed(handle) => {
                    if let Some(entry) = st.transceiver_mut(handle) {
                        entry.mid = None;
                        entry.remote_direction = None;
                    }
                }
                RemoteChange::Created(handle) => {
                    let Some(pos) = st.transceivers.iter().position(|t| t.handle == handle) else {
                        continue;
                    };
                    if st.transceivers[pos].sender.track().is_some() {
                        let entry = &mut st.transceivers[pos];
                        entry.mid = None;
                        entry.remote_direction = None;
                        continue;
                    }
                    let entry = st.transceivers.remove(pos);
                    entry.receiver.track().stop();
                    self.transceivers.remove(handle);
                    debug!("Session {}: dropped transceiver {} of the rolled back offer", self.id, handle);
                }
            }
        }
    }

    fn handle_track_added(&self, st: &mut SessionState, info: RemoteTrackInfo) {
        let Some(pos) = self.associate_section(st, &info.mid, info.kind, true) else {
            return;
        };
        let entry = &st.transceivers[pos];
        let before = entry.receiver.track();
        let track = entry.receiver.adopt_remote_track(&info.track_id);
        let handle = entry.handle;
        if !Arc::ptr_eq(&before, &track) {
            st.remote_changes.push(RemoteChange::TrackAdopted(handle));
        }
        let entry = &st.transceivers[pos];
        match self.transceiver_wrapper(entry) {
            Ok(transceiver) => {
                debug!("Session {}: remote track {} on mid {}", self.id, info.track_id, info.mid);
                self.events.emit(SessionEvent::TrackAdded { transceiver, track });
            }
            Err(err) => trace!("Session {}: no wrapper for remote track: {}", self.id, err),
        }
    }

    fn handle_track_removed(&self, st: &mut SessionState, mid: String) {
        let Some(pos) = st.position_by_mid(&mid) else {
            return;
        };
        let track = st.transceivers[pos].receiver.track();
        if track.stop() {
            self.events.emit(SessionEvent::TrackRemoved { mid: Some(mid), track });
        }
    }

    fn handle_remote_channel(&self, st: &mut SessionState, spec: ChannelSpec) {
        if st.channels.contains_key(&spec.id) {
            warn!("Session {}: peer announced channel {} which is already in use", self.id, spec.id);
            return;
        }
        let mut init = spec.init;
        init.id = Some(spec.id);
        let entry = ChannelEntry::new(spec.label, init, true);
        match self.channel_wrapper(spec.id, &entry) {
            Ok(channel) => {
                info!("Session {}: remote DataChannel '{}' ({})", self.id, entry.label, spec.id);
                st.data_requested = true;
                st.channels.insert(spec.id, entry);
                self.events.emit(SessionEvent::DataChannel(channel));
            }
            Err(err) => trace!("Session {}: dropping remote channel: {}", self.id, err),
        }
    }

    fn session_record(&self, st: &SessionState) -> StatsRecord {
        StatsRecord::new(format!("P{}", self.handle.as_u64()), "peer-connection")
            .with("sessionId", self.id.as_str())
            .with("signalingState", st.signaling.as_str())
            .with("iceConnectionState", st.ice.as_str())
            .with("dataChannelsOpened", st.channels_opened)
            .with("dataChannelsClosed", st.channels_closed)
            .with("transceivers", st.transceivers.len() as u64)
            .with("outstandingReports", st.stats.outstanding_reports() as u64)
            .with("eventsDropped", self.events.dropped())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn transceiver_mid(&self, handle: HandleId) -> Option<String> {
        self.state.lock().transceiver(handle).and_then(|t| t.mid.clone())
    }

    /// Mid for media and stats calls; `SessionClosed` once the session is gone
    pub(crate) fn negotiated_mid(&self, handle: HandleId) -> Result<Option<String>, WebRTCError> {
        let st = self.state.lock();
        st.ensure_open()?;
        Ok(st.transceiver(handle).and_then(|t| t.mid.clone()))
    }

    pub(crate) fn transceiver_direction(&self, handle: HandleId) -> Option<TransceiverDirection> {
        self.state.lock().transceiver(handle).map(|t| t.direction)
    }

    pub(crate) fn transceiver_current_direction(&self, handle: HandleId) -> Option<TransceiverDirection> {
        self.state.lock().transceiver(handle).and_then(|t| t.current_direction)
    }

    pub(crate) fn ensure_transceiver_active(&self, handle: HandleId) -> Result<(), WebRTCError> {
        let st = self.state.lock();
        st.ensure_open()?;
        match st.transceiver(handle) {
            Some(_) => Ok(()),
            None => Err(WebRTCError::InvalidStateTransition(format!("transceiver {} is stopped", handle))),
        }
    }

    pub(crate) fn set_transceiver_direction(
        &self,
        handle: HandleId,
        direction: TransceiverDirection,
    ) -> Result<(), WebRTCError> {
        let mut st = self.state.lock();
        st.ensure_open()?;
        let entry = st
            .transceiver_mut(handle)
            .ok_or_else(|| WebRTCError::InvalidStateTransition(format!("transceiver {} is stopped", handle)))?;
        if entry.direction == direction {
            return Ok(());
        }
        entry.direction = direction;
        self.mark_negotiation_needed(&mut st);
        Ok(())
    }

    pub(crate) fn stop_transceiver(&self, handle: HandleId) -> Result<(), WebRTCError> {
        let entry = {
            let mut st = self.state.lock();
            if st.closed {
                return Ok(());
            }
            let Some(pos) = st.transceivers.iter().position(|t| t.handle == handle) else {
                return Ok(());
            };
            let entry = st.transceivers.remove(pos);
            let track = entry.receiver.track();
            if track.stop() {
                self.events.emit(SessionEvent::TrackRemoved {
                    mid: entry.mid.clone(),
                    track,
                });
            }
            if entry.mid.is_some() {
                self.mark_negotiation_needed(&mut st);
            }
            entry
        };
        entry.sender.detach_track();
        self.transceivers.remove(handle);
        debug!("Session {}: transceiver {} stopped", self.id, handle);
        Ok(())
    }

    pub(crate) fn push_media(&self, frame: MediaFrame) -> Result<(), WebRTCError> {
        self.media.push(frame)
    }

    pub(crate) fn request_stats(&self, target: StatsTarget) -> PendingStats {
        let (request_id, pending) = {
            let mut st = self.state.lock();
            if st.closed {
                return PendingStats::failed(WebRTCError::SessionClosed);
            }
            st.stats.begin()
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.state.lock().stats.complete(
                    request_id,
                    Err(WebRTCError::TransportError("stats need a Tokio runtime".to_string())),
                );
                return pending;
            }
        };
        let transport = self.transport.clone();
        let session = self.weak_self.clone();
        runtime.spawn(async move {
            let result = transport.collect_stats(target.clone()).await;
            if let Some(inner) = session.upgrade() {
                inner.finish_stats(request_id, &target, result);
            }
        });
        pending
    }

    fn finish_stats(&self, request_id: u64, target: &StatsTarget, result: Result<Vec<StatsRecord>, WebRTCError>) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        let result = result.map(|mut records| {
            if *target == StatsTarget::Session {
                records.push(self.session_record(&st));
            }
            records
        });
        st.stats.complete(request_id, result);
    }

    pub(crate) fn channel_state(&self, id: u16, handle: HandleId) -> Option<DataChannelState> {
        self.state
            .lock()
            .channels
            .get(&id)
            .filter(|entry| entry.handle == handle)
            .map(|entry| entry.state)
    }

    pub(crate) fn send_on_channel(&self, id: u16, handle: HandleId, message: ChannelMessage) -> Result<(), WebRTCError> {
        let mut st = self.state.lock();
        st.ensure_open()?;
        let entry = st
            .channels
            .get_mut(&id)
            .filter(|entry| entry.handle == handle)
            .ok_or_else(|| WebRTCError::ChannelNotOpen(format!("channel {}", id)))?;
        if entry.state != DataChannelState::Open {
            return Err(WebRTCError::ChannelNotOpen(format!("'{}' is {}", entry.label, entry.state)));
        }
        let size = message.len();
        if size > self.config.max_message_size {
            return Err(WebRTCError::InvalidParameter(format!(
                "message of {} bytes exceeds the {} byte limit",
                size, self.config.max_message_size
            )));
        }
        self.transport.send_data(id, message)?;
        entry.messages_sent += 1;
        entry.bytes_sent += size as u64;
        Ok(())
    }

    pub(crate) fn close_channel(&self, id: u16, handle: HandleId) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        let Some(entry) = st.channels.get_mut(&id).filter(|entry| entry.handle == handle) else {
            return;
        };
        match entry.state {
            DataChannelState::Connecting | DataChannelState::Open => {
                entry.state = DataChannelState::Closing;
                debug!("Session {}: closing DataChannel '{}' ({})", self.id, entry.label, id);
                self.events.emit(SessionEvent::ChannelClosing { channel_id: id });
                self.transport.close_data_channel(id);
            }
            DataChannelState::Closing | DataChannelState::Closed => {}
        }
    }

    async fn generate_offer(&self, options: OfferOptions) -> Result<SessionDescription, WebRTCError> {
        let snapshot = {
            let mut st = self.state.lock();
            st.ensure_open()?;
            if !matches!(st.signaling, SignalingState::Stable | SignalingState::HaveLocalOffer) {
                return Err(WebRTCError::InvalidStateTransition(format!(
                    "cannot create an offer in {}",
                    st.signaling
                )));
            }
            st.assign_mids();
            st.snapshot(&self.id)
        };
        let offer = self
            .transport
            .create_offer(snapshot, options)
            .await
            .map_err(into_negotiation_error)?;
        self.state.lock().ensure_open()?;
        Ok(offer)
    }

    async fn generate_answer(&self, options: AnswerOptions) -> Result<SessionDescription, WebRTCError> {
        let snapshot = {
            let st = self.state.lock();
            st.ensure_open()?;
            if !matches!(st.signaling, SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer) {
                return Err(WebRTCError::InvalidStateTransition(format!(
                    "cannot create an answer in {}",
                    st.signaling
                )));
            }
            st.snapshot(&self.id)
        };
        let answer = self
            .transport
            .create_answer(snapshot, options)
            .await
            .map_err(into_negotiation_error)?;
        self.state.lock().ensure_open()?;
        Ok(answer)
    }

    async fn apply_description(&self, side: DescriptionSide, desc: SessionDescription) -> Result<(), WebRTCError> {
        let sdp_type = desc.sdp_type();
        {
            let st = self.state.lock();
            next_state(st.signaling, side, sdp_type)?;
        }

        let result = match side {
            DescriptionSide::Local => self.transport.set_local_description(desc.clone()).await.map(|_| Vec::new()),
            DescriptionSide::Remote => self.transport.set_remote_description(desc.clone()).await,
        };

        let mut st = self.state.lock();
        st.ensure_open()?;
        let sections = match result {
            Ok(sections) => sections,
            Err(err) => {
                let err = into_negotiation_error(err);
                warn!("Session {}: {} {} rejected: {}", self.id, side, sdp_type, err);
                self.events.emit(SessionEvent::SetDescriptionFailure {
                    side,
                    sdp_type,
                    error: ErrorRecord::from(&err),
                });
                return Err(err);
            }
        };

        let next = next_state(st.signaling, side, sdp_type)?;
        st.commit_description(side, desc);
        match (side, sdp_type) {
            (DescriptionSide::Remote, SdpType::Rollback) => self.undo_remote_changes(&mut st),
            (DescriptionSide::Remote, _) => self.apply_remote_sections(&mut st, &sections, sdp_type),
            (DescriptionSide::Local, _) => {}
        }
        if next.is_stable() {
            st.remote_changes.clear();
        }
        if sdp_type == SdpType::Answer {
            st.update_current_directions(side);
        }
        if side == DescriptionSide::Local && sdp_type == SdpType::Offer {
            st.negotiation_needed = false;
        }

        let previous = std::mem::replace(&mut st.signaling, next);
        if previous != next {
            debug!("Session {}: signaling {} -> {}", self.id, previous, next);
            self.events.emit(SessionEvent::SignalingStateChange(next));
        }
        self.events.emit(SessionEvent::SetDescriptionSuccess { side, sdp_type });
        if next.is_stable() && st.negotiation_needed {
            self.events.emit(SessionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn close(&self) {
        let transceivers = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            info!("Closing session {}", self.id);

            for (channel_id, entry) in std::mem::take(&mut st.channels) {
                st.channels_closed += 1;
                self.events.emit(SessionEvent::ChannelClosed {
                    channel_id,
                    label: entry.label,
                });
            }
            if st.signaling != SignalingState::Closed {
                st.signaling = SignalingState::Closed;
                self.events.emit(SessionEvent::SignalingStateChange(SignalingState::Closed));
            }
            st.ice = IceConnectionState::Closed;

            let transceivers = std::mem::take(&mut st.transceivers);
            for entry in &transceivers {
                entry.receiver.track().stop();
            }
            let failed = st.stats.fail_all(WebRTCError::SessionClosed);
            if failed > 0 {
                debug!("Session {}: failed {} pending stats requests", self.id, failed);
            }
            transceivers
        };

        for entry in &transceivers {
            entry.sender.detach_track();
        }
        let flushed = self.media.shutdown();
        self.transport.close();
        self.channels.dispose();
        self.transceivers.dispose();
        info!("Session {} closed ({} queued frames flushed)", self.id, flushed);
    }
}

impl TransportEventSink for SessionInner {
    fn on_transport_event(&self, event: TransportEvent) {
        let mut st = self.state.lock();
        if st.closed {
            trace!("Session {}: dropping {:?} after close", self.id, event);
            return;
        }
        match event {
            TransportEvent::NegotiationNeeded => self.mark_negotiation_needed(&mut st),
            TransportEvent::IceConnectionStateChange(state) => {
                if st.ice != state {
                    info!("Session {}: ICE {} -> {}", self.id, st.ice.as_str(), state.as_str());
                    st.ice = state;
                    self.events.emit(SessionEvent::IceConnectionStateChange(state));
                }
            }
            TransportEvent::IceCandidate(candidate) => self.events.emit(SessionEvent::IceCandidate(candidate)),
            TransportEvent::TrackAdded(info) => self.handle_track_added(&mut st, info),
            TransportEvent::TrackRemoved { mid } => self.handle_track_removed(&mut st, mid),
            TransportEvent::DataChannel(spec) => self.handle_remote_channel(&mut st, spec),
            TransportEvent::ChannelOpen(channel_id) => {
                let Some(entry) = st.channels.get_mut(&channel_id) else {
                    return;
                };
                if entry.state != DataChannelState::Connecting {
                    return;
                }
                entry.state = DataChannelState::Open;
                let label = entry.label.clone();
                st.channels_opened += 1;
                info!("Session {}: DataChannel '{}' ({}) open", self.id, label, channel_id);
                self.events.emit(SessionEvent::ChannelOpen { channel_id, label });
            }
            TransportEvent::ChannelMessage(channel_id, message) => {
                let Some(entry) = st.channels.get_mut(&channel_id) else {
                    return;
                };
                if !matches!(entry.state, DataChannelState::Open | DataChannelState::Closing) {
                    return;
                }
                entry.messages_received += 1;
                entry.bytes_received += message.len() as u64;
                self.events.emit(SessionEvent::ChannelMessage { channel_id, message });
            }
            TransportEvent::ChannelClosed(channel_id) => {
                let Some(entry) = st.channels.remove(&channel_id) else {
                    return;
                };
                st.channels_closed += 1;
                self.channels.remove(entry.handle);
                info!("Session {}: DataChannel '{}' ({}) closed", self.id, entry.label, channel_id);
                self.events.emit(SessionEvent::ChannelClosed {
                    channel_id,
                    label: entry.label,
                });
            }
        }
    }
}

/// One peer connection
pub struct PeerConnectionSession {
    inner: Arc<SessionInner>,
}

impl PeerConnectionSession {
    /// Create a session on top of `transport` and bind the transport to it
    pub fn new(config: SessionConfig, transport: Arc<dyn MediaTransport>) -> Self {
        let handle = HandleId::next();
        let id = uuid::Uuid::new_v4().to_string();
        let parity = transport.channel_id_parity() & 1;
        let media_transport = transport.clone();

        let inner = Arc::new_cyclic(|weak_self| SessionInner {
            handle,
            events: EventDispatch::new(&id, config.event_queue_warn_depth, config.event_queue_limit),
            id,
            config,
            state: Mutex::new(SessionState::new(parity)),
            negotiation: tokio::sync::Mutex::new(()),
            transport,
            channels: HandleTable::new(),
            transceivers: HandleTable::new(),
            media: UpdateBatcher::new(Box::new(move |frames| media_transport.write_media(frames))),
            weak_self: weak_self.clone(),
        });

        let sink: Weak<SessionInner> = Arc::downgrade(&inner);
        let sink: Weak<dyn TransportEventSink> = sink;
        inner.transport.bind(TransportObserver::new(sink));
        info!("Created session {} ({})", inner.id, handle);
        Self { inner }
    }

    pub fn handle(&self) -> HandleId {
        self.inner.handle
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Channel options with the configured ordering
    pub fn default_channel_init(&self) -> DataChannelInit {
        DataChannelInit {
            ordered: self.inner.config.default_ordered,
            ..Default::default()
        }
    }

    /// Consumer end of the event queue. Only the first call returns a stream.
    pub fn take_events(&self) -> Option<EventStream> {
        self.inner.events.take_stream()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.state.lock().signaling
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.inner.state.lock().ice
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        let st = self.inner.state.lock();
        st.pending_local.clone().or_else(|| st.current_local.clone())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        let st = self.inner.state.lock();
        st.pending_remote.clone().or_else(|| st.current_remote.clone())
    }

    pub fn pending_local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().pending_local.clone()
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().current_local.clone()
    }

    pub fn pending_remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().pending_remote.clone()
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().current_remote.clone()
    }

    pub async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, WebRTCError> {
        let _chain = self.inner.negotiation.lock().await;
        self.inner.generate_offer(options).await
    }

    pub async fn create_answer(&self, options: AnswerOptions) -> Result<SessionDescription, WebRTCError> {
        let _chain = self.inner.negotiation.lock().await;
        self.inner.generate_answer(options).await
    }

    /// Apply a local description. `None` generates the offer or answer the
    /// current signaling state calls for.
    pub async fn set_local_description(&self, desc: Option<SessionDescription>) -> Result<(), WebRTCError> {
        let _chain = self.inner.negotiation.lock().await;
        let desc = match desc {
            Some(desc) => desc,
            None => {
                let implicit = {
                    let st = self.inner.state.lock();
                    st.ensure_open()?;
                    st.signaling.implicit_local_type().ok_or_else(|| {
                        WebRTCError::InvalidStateTransition(format!(
                            "no description to generate in {}",
                            st.signaling
                        ))
                    })?
                };
                match implicit {
                    SdpType::Offer => self.inner.generate_offer(OfferOptions::default()).await?,
                    _ => self.inner.generate_answer(AnswerOptions::default()).await?,
                }
            }
        };
        self.inner.apply_description(DescriptionSide::Local, desc).await
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        let _chain = self.inner.negotiation.lock().await;
        self.inner.apply_description(DescriptionSide::Remote, desc).await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        let _chain = self.inner.negotiation.lock().await;
        {
            let st = self.inner.state.lock();
            st.ensure_open()?;
            if st.pending_remote.is_none() && st.current_remote.is_none() {
                return Err(WebRTCError::InvalidStateTransition(
                    "candidate received before a remote description".to_string(),
                ));
            }
        }
        self.inner
            .transport
            .add_ice_candidate(candidate)
            .await
            .map_err(into_negotiation_error)?;
        self.inner.state.lock().ensure_open()
    }

    /// Add a transceiver for a media kind or an existing track
    pub fn add_transceiver(
        &self,
        source: impl Into<TransceiverSource>,
        direction: TransceiverDirection,
    ) -> Result<Arc<RtpTransceiver>, WebRTCError> {
        self.add_transceiver_inner(source.into(), direction, false)
    }

    /// Send `track` on a new send/receive transceiver. A track can be added
    /// to a session only once.
    pub fn add_track(&self, track: Arc<MediaTrack>) -> Result<Arc<RtpSender>, WebRTCError> {
        let transceiver = self.add_transceiver_inner(TransceiverSource::Track(track), TransceiverDirection::SendRecv, true)?;
        Ok(transceiver.sender().clone())
    }

    fn add_transceiver_inner(
        &self,
        source: TransceiverSource,
        direction: TransceiverDirection,
        unique_track: bool,
    ) -> Result<Arc<RtpTransceiver>, WebRTCError> {
        let inner = &self.inner;
        let kind = source.kind();
        let track = source.into_track();

        let mut st = inner.state.lock();
        st.ensure_open()?;
        if let (true, Some(track)) = (unique_track, &track) {
            let duplicate = st
                .transceivers
                .iter()
                .any(|t| t.sender.track().map(|attached| attached.handle()) == Some(track.handle()));
            if duplicate {
                return Err(WebRTCError::InvalidParameter(format!(
                    "track {} is already being sent",
                    track.id()
                )));
            }
        }

        let entry = inner.new_transceiver_entry(kind, track, direction);
        let transceiver = inner.transceiver_wrapper(&entry)?;
        debug!("Session {}: added {} transceiver {} ({})", inner.id, kind, entry.handle, direction);
        st.transceivers.push(entry);
        inner.mark_negotiation_needed(&mut st);
        Ok(transceiver)
    }

    /// Stop sending `sender`'s track; the transceiver stays for receiving
    pub fn remove_track(&self, sender: &RtpSender) -> Result<(), WebRTCError> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.ensure_open()?;
        let entry = st
            .transceiver_mut(sender.transceiver_handle())
            .filter(|entry| entry.sender.handle() == sender.handle())
            .ok_or_else(|| WebRTCError::InvalidParameter(format!("sender {} is not part of this session", sender.handle())))?;

        let had_track = entry.sender.detach_track().is_some();
        let direction = entry.direction.without_send();
        if !had_track && direction == entry.direction {
            return Ok(());
        }
        entry.direction = direction;
        inner.mark_negotiation_needed(&mut st);
        Ok(())
    }

    pub fn transceivers(&self) -> Vec<Arc<RtpTransceiver>> {
        let st = self.inner.state.lock();
        st.transceivers
            .iter()
            .filter_map(|entry| self.inner.transceiver_wrapper(entry).ok())
            .collect()
    }

    pub fn senders(&self) -> Vec<Arc<RtpSender>> {
        self.inner.state.lock().transceivers.iter().map(|t| t.sender.clone()).collect()
    }

    pub fn receivers(&self) -> Vec<Arc<RtpReceiver>> {
        self.inner.state.lock().transceivers.iter().map(|t| t.receiver.clone()).collect()
    }

    pub fn create_data_channel(&self, label: &str, init: DataChannelInit) -> Result<Arc<DataChannel>, WebRTCError> {
        init.validate(label)?;
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.ensure_open()?;

        let id = match (init.negotiated, init.id) {
            (true, Some(id)) => {
                if st.channels.contains_key(&id) {
                    return Err(WebRTCError::InvalidParameter(format!("channel id {} is already in use", id)));
                }
                id
            }
            _ => st.allocate_channel_id()?,
        };

        let mut entry = ChannelEntry::new(label.to_string(), init, false);
        entry.init.id = Some(id);
        let channel = inner.channel_wrapper(id, &entry)?;
        let spec = ChannelSpec {
            id,
            label: entry.label.clone(),
            init: entry.init.clone(),
        };
        if let Err(err) = inner.transport.open_data_channel(spec) {
            inner.channels.remove(entry.handle);
            return Err(err);
        }

        let first = !st.data_requested;
        st.data_requested = true;
        st.channels.insert(id, entry);
        if first {
            inner.mark_negotiation_needed(&mut st);
        }
        info!("Session {}: created DataChannel '{}' ({})", inner.id, label, id);
        Ok(channel)
    }

    pub fn data_channel(&self, id: u16) -> Result<Arc<DataChannel>, WebRTCError> {
        let st = self.inner.state.lock();
        let entry = st
            .channels
            .get(&id)
            .ok_or_else(|| WebRTCError::NotFound(format!("DataChannel {}", id)))?;
        self.inner.channel_wrapper(id, entry)
    }

    pub fn data_channels(&self) -> Vec<Arc<DataChannel>> {
        let st = self.inner.state.lock();
        st.channels
            .iter()
            .filter_map(|(id, entry)| self.inner.channel_wrapper(*id, entry).ok())
            .collect()
    }

    /// Snapshot of the whole session
    pub fn get_stats(&self) -> PendingStats {
        self.inner.request_stats(StatsTarget::Session)
    }

    /// Reports handed out and not yet released
    pub fn outstanding_stats_reports(&self) -> usize {
        self.inner.state.lock().stats.outstanding_reports()
    }

    /// Hand frames queued since the last flush to the transport
    pub fn flush_media(&self) -> usize {
        self.inner.media.tick()
    }

    pub fn queued_media(&self) -> usize {
        self.inner.media.pending_len()
    }

    /// Events waiting for the consumer
    pub fn queued_events(&self) -> usize {
        self.inner.events.queued()
    }

    /// Events discarded because the queue hit `event_queue_limit`
    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped()
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for PeerConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnectionSession")
            .field("handle", &self.inner.handle)
            .field("id", &self.inner.id)
            .field("signaling", &self.signaling_state())
            .finish()
    }
}

impl Drop for PeerConnectionSession {
    fn drop(&mut self) {
        self.inner.close();
    }
}
