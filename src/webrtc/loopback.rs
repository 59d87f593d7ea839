//! In-process transport pair
//!
//! Two `LoopbackTransport`s wired back to back. Each end runs a small
//! engine task that owns all transport-side state and talks to its peer by
//! message passing, so callbacks reach the session from a different task
//! than the one calling into it, as they would with a real ICE/SCTP stack.
//!
//! The SDP written here is a minimal subset: one `m=` line per media
//! section with `a=mid`, direction and `a=msid`, plus an application
//! section when data channels are in use. It is enough to drive
//! offer/answer, track association and channel setup end to end.

use super::data_channel::{ChannelMessage, DataChannelInit};
use super::description::{IceCandidate, SdpType, SessionDescription};
use super::media_track::MediaKind;
use super::signaling::IceConnectionState;
use super::stats::{StatsRecord, StatsTarget};
use super::transceiver::{capabilities, TransceiverDirection};
use super::transport::{
    AnswerOptions, ChannelSpec, MediaFrame, MediaSectionInfo, MediaTransport, NegotiationSnapshot,
    OfferOptions, RemoteTrackInfo, TransportObserver,
};
use super::WebRTCError;
use async_trait::async_trait;
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

const DATA_MID: &str = "data";
const APPLICATION: &str = "application";

type Reply<T> = oneshot::Sender<Result<T, WebRTCError>>;

enum Command {
    CreateOffer {
        snapshot: NegotiationSnapshot,
        options: OfferOptions,
        reply: Reply<SessionDescription>,
    },
    CreateAnswer {
        snapshot: NegotiationSnapshot,
        reply: Reply<SessionDescription>,
    },
    SetLocal {
        desc: SessionDescription,
        reply: Reply<()>,
    },
    SetRemote {
        desc: SessionDescription,
        reply: Reply<Vec<MediaSectionInfo>>,
    },
    AddCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    CollectStats {
        target: StatsTarget,
        reply: Reply<Vec<StatsRecord>>,
    },
    OpenChannel(ChannelSpec),
    Send { channel_id: u16, message: ChannelMessage },
    CloseChannel(u16),
    WriteMedia(Vec<MediaFrame>),
    PeerChannel(ChannelSpec),
    PeerData { channel_id: u16, message: ChannelMessage },
    PeerChannelClosed(u16),
    PeerMedia(Vec<MediaFrame>),
    PeerClosed,
    Close,
}

struct Shared {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    parity: u16,
    observer: Mutex<Option<TransportObserver>>,
    peer: Mutex<Weak<Shared>>,
    closed: AtomicBool,
}

impl Shared {
    fn to_peer(&self, command: Command) {
        if let Some(peer) = self.peer.lock().upgrade() {
            let _ = peer.commands.send(command);
        }
    }

    fn notify<F: FnOnce(&TransportObserver)>(&self, f: F) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            f(&observer);
        }
    }
}

/// One end of an in-process transport pair
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create a connected pair. The first end allocates even channel ids,
    /// the second odd ones. Must be called from within a Tokio runtime.
    pub fn pair() -> (Self, Self) {
        let a = Self::spawn("loopback-a", 0);
        let b = Self::spawn("loopback-b", 1);
        *a.shared.peer.lock() = Arc::downgrade(&b.shared);
        *b.shared.peer.lock() = Arc::downgrade(&a.shared);
        (a, b)
    }

    /// An end with nobody on the other side
    pub fn unpaired() -> Self {
        Self::spawn("loopback", 0)
    }

    fn spawn(name: &str, parity: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            commands: tx,
            parity,
            observer: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            closed: AtomicBool::new(false),
        });
        let engine = Engine::new(Arc::downgrade(&shared), parity);
        tokio::spawn(engine.run(rx));
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn command(&self, command: Command) -> Result<(), WebRTCError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(transport_closed());
        }
        self.shared.commands.send(command).map_err(|_| transport_closed())
    }

    async fn request<T, F>(&self, build: F) -> Result<T, WebRTCError>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        rx.await.map_err(|_| transport_closed())?
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.shared.commands.send(Command::Close);
    }
}

fn transport_closed() -> WebRTCError {
    WebRTCError::TransportError("loopback transport is closed".to_string())
}

fn syntax_error(message: impl Into<String>) -> WebRTCError {
    WebRTCError::negotiation("SyntaxError", message)
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn bind(&self, observer: TransportObserver) {
        *self.shared.observer.lock() = Some(observer);
    }

    fn channel_id_parity(&self) -> u16 {
        self.shared.parity
    }

    async fn create_offer(
        &self,
        snapshot: NegotiationSnapshot,
        options: OfferOptions,
    ) -> Result<SessionDescription, WebRTCError> {
        self.request(|reply| Command::CreateOffer {
            snapshot,
            options,
            reply,
        })
        .await
    }

    async fn create_answer(
        &self,
        snapshot: NegotiationSnapshot,
        _options: AnswerOptions,
    ) -> Result<SessionDescription, WebRTCError> {
        self.request(|reply| Command::CreateAnswer { snapshot, reply }).await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), WebRTCError> {
        self.request(|reply| Command::SetLocal { desc, reply }).await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<Vec<MediaSectionInfo>, WebRTCError> {
        self.request(|reply| Command::SetRemote { desc, reply }).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        self.request(|reply| Command::AddCandidate { candidate, reply }).await
    }

    fn open_data_channel(&self, spec: ChannelSpec) -> Result<(), WebRTCError> {
        self.command(Command::OpenChannel(spec))
    }

    fn send_data(&self, channel_id: u16, message: ChannelMessage) -> Result<(), WebRTCError> {
        self.command(Command::Send { channel_id, message })
    }

    fn close_data_channel(&self, channel_id: u16) {
        let _ = self.command(Command::CloseChannel(channel_id));
    }

    fn write_media(&self, frames: Vec<MediaFrame>) {
        if frames.is_empty() {
            return;
        }
        let _ = self.command(Command::WriteMedia(frames));
    }

    async fn collect_stats(&self, target: StatsTarget) -> Result<Vec<StatsRecord>, WebRTCError> {
        self.request(|reply| Command::CollectStats { target, reply }).await
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.commands.send(Command::Close);
    }
}

/// One `m=` section of the SDP subset
#[derive(Debug, Clone, PartialEq)]
struct SdpSection {
    kind: String,
    mid: String,
    direction: TransceiverDirection,
    /// (stream id, track id)
    msid: Option<(String, String)>,
}

impl SdpSection {
    fn application() -> Self {
        Self {
            kind: APPLICATION.to_string(),
            mid: DATA_MID.to_string(),
            direction: TransceiverDirection::SendRecv,
            msid: None,
        }
    }

    fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::parse(&self.kind)
    }
}

fn parse_sdp(sdp: &str) -> Result<Vec<SdpSection>, WebRTCError> {
    let mut lines = sdp.lines().map(str::trim).filter(|line| !line.is_empty());
    if lines.next() != Some("v=0") {
        return Err(syntax_error("description does not start with v=0"));
    }

    let mut sections = Vec::new();
    let mut current: Option<SdpSection> = None;
    for line in lines {
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            let kind = media
                .split_whitespace()
                .next()
                .ok_or_else(|| syntax_error("empty m= line"))?;
            current = Some(SdpSection {
                kind: kind.to_string(),
                mid: String::new(),
                direction: TransceiverDirection::SendRecv,
                msid: None,
            });
        } else if let Some(section) = current.as_mut() {
            if let Some(mid) = line.strip_prefix("a=mid:") {
                section.mid = mid.to_string();
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                if let (Some(stream), Some(track)) = (parts.next(), parts.next()) {
                    section.msid = Some((stream.to_string(), track.to_string()));
                }
            } else if let Some(direction) = line.strip_prefix("a=").and_then(TransceiverDirection::parse) {
                section.direction = direction;
            }
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    if let Some(section) = sections.iter().find(|s| s.mid.is_empty()) {
        return Err(syntax_error(format!("{} section without a=mid", section.kind)));
    }
    Ok(sections)
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    packets: u64,
    bytes: u64,
}

impl Counter {
    fn add(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }
}

struct LoopChannel {
    label: String,
    init: DataChannelInit,
    /// Announced by the peer
    remote: bool,
    open: bool,
    sent: Counter,
    received: Counter,
}

/// Transport-side state, owned by the engine task
struct Engine {
    shared: Weak<Shared>,
    parity: u16,
    origin: u64,
    version: u64,
    ufrag: String,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    remote_tracks: BTreeMap<String, RemoteTrackInfo>,
    /// Remote tracks as of the last stable state, restored on rollback
    stable_remote_tracks: BTreeMap<String, RemoteTrackInfo>,
    ice: IceConnectionState,
    gathered: bool,
    candidates_added: u64,
    channels: BTreeMap<u16, LoopChannel>,
    outbound: BTreeMap<String, Counter>,
    inbound: BTreeMap<String, Counter>,
}

impl Engine {
    fn new(shared: Weak<Shared>, parity: u16) -> Self {
        Self {
            shared,
            parity,
            origin: uuid::Uuid::new_v4().as_u64_pair().0 >> 1,
            version: 0,
            ufrag: new_ufrag(),
            local: None,
            remote: None,
            stable_local: None,
            stable_remote: None,
            remote_tracks: BTreeMap::new(),
            stable_remote_tracks: BTreeMap::new(),
            ice: IceConnectionState::New,
            gathered: false,
            candidates_added: 0,
            channels: BTreeMap::new(),
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            if !self.handle(&shared, command) {
                break;
            }
        }
        trace!("Loopback engine stopped");
    }

    /// Returns false once the engine should stop
    fn handle(&mut self, shared: &Shared, command: Command) -> bool {
        match command {
            Command::CreateOffer {
                snapshot,
                options,
                reply,
            } => {
                if options.ice_restart {
                    self.ufrag = new_ufrag();
                }
                let _ = reply.send(Ok(self.create_offer(&snapshot)));
            }
            Command::CreateAnswer { snapshot, reply } => {
                let _ = reply.send(self.create_answer(&snapshot));
            }
            Command::SetLocal { desc, reply } => {
                let _ = reply.send(self.set_local(shared, desc));
            }
            Command::SetRemote { desc, reply } => {
                let _ = reply.send(self.set_remote(shared, desc));
            }
            Command::AddCandidate { candidate, reply } => {
                let result = if self.remote.is_none() {
                    Err(WebRTCError::negotiation(
                        "InvalidStateError",
                        "no remote description for candidate",
                    ))
                } else {
                    if !candidate.is_end_of_candidates() {
                        self.candidates_added += 1;
                    }
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::CollectStats { target, reply } => {
                let _ = reply.send(Ok(self.collect_stats(&target)));
            }
            Command::OpenChannel(spec) => {
                let id = spec.id;
                self.channels.insert(
                    id,
                    LoopChannel {
                        label: spec.label,
                        init: spec.init,
                        remote: false,
                        open: false,
                        sent: Counter::default(),
                        received: Counter::default(),
                    },
                );
                if self.ice.is_connected() {
                    self.open_channel(shared, id);
                }
            }
            Command::Send { channel_id, message } => match self.channels.get_mut(&channel_id) {
                Some(channel) if channel.open => {
                    channel.sent.add(message.len());
                    shared.to_peer(Command::PeerData { channel_id, message });
                }
                _ => debug!("{}: dropping send on channel {} that is not open", shared.name, channel_id),
            },
            Command::CloseChannel(channel_id) => {
                if self.channels.remove(&channel_id).is_some() {
                    shared.to_peer(Command::PeerChannelClosed(channel_id));
                }
                shared.notify(|o| o.on_channel_closed(channel_id));
            }
            Command::WriteMedia(frames) => {
                for frame in &frames {
                    self.outbound.entry(frame.mid.clone()).or_default().add(frame.payload.len());
                }
                shared.to_peer(Command::PeerMedia(frames));
            }
            Command::PeerChannel(spec) => {
                if self.channels.contains_key(&spec.id) {
                    debug!("{}: peer announced channel {} which is already in use", shared.name, spec.id);
                    return true;
                }
                let id = spec.id;
                self.channels.insert(
                    id,
                    LoopChannel {
                        label: spec.label.clone(),
                        init: spec.init.clone(),
                        remote: true,
                        open: true,
                        sent: Counter::default(),
                        received: Counter::default(),
                    },
                );
                shared.notify(|o| o.on_data_channel(spec));
                shared.notify(|o| o.on_channel_open(id));
            }
            Command::PeerData { channel_id, message } => match self.channels.get_mut(&channel_id) {
                Some(channel) if channel.open => {
                    channel.received.add(message.len());
                    shared.notify(|o| o.on_channel_message(channel_id, message));
                }
                _ => debug!("{}: dropping data for unknown channel {}", shared.name, channel_id),
            },
            Command::PeerChannelClosed(channel_id) => {
                if self.channels.remove(&channel_id).is_some() {
                    shared.notify(|o| o.on_channel_closed(channel_id));
                }
            }
            Command::PeerMedia(frames) => {
                for frame in &frames {
                    self.inbound.entry(frame.mid.clone()).or_default().add(frame.payload.len());
                }
            }
            Command::PeerClosed => {
                info!("{}: peer closed", shared.name);
                self.set_ice(shared, IceConnectionState::Disconnected);
                let ids: Vec<u16> = self.channels.keys().copied().collect();
                self.channels.clear();
                for id in ids {
                    shared.notify(|o| o.on_channel_closed(id));
                }
                let mids: Vec<String> = std::mem::take(&mut self.remote_tracks).into_keys().collect();
                for mid in mids {
                    shared.notify(|o| o.on_track_removed(mid));
                }
            }
            Command::Close => {
                shared.to_peer(Command::PeerClosed);
                self.ice = IceConnectionState::Closed;
                return false;
            }
        }
        true
    }

    fn set_ice(&mut self, shared: &Shared, state: IceConnectionState) {
        if self.ice == state {
            return;
        }
        self.ice = state;
        shared.notify(|o| o.on_ice_connection_state_change(state));
    }

    fn create_offer(&mut self, snapshot: &NegotiationSnapshot) -> SessionDescription {
        let mut sections: Vec<SdpSection> = snapshot
            .media
            .iter()
            .map(|m| SdpSection {
                kind: m.kind.as_str().to_string(),
                mid: m.mid.clone(),
                direction: m.direction,
                msid: msid_for(snapshot, m.direction, m.track_id.as_deref()),
            })
            .collect();
        if snapshot.data_channels {
            sections.push(SdpSection::application());
        }
        SessionDescription::offer(self.write_sdp(&sections))
    }

    fn create_answer(&mut self, snapshot: &NegotiationSnapshot) -> Result<SessionDescription, WebRTCError> {
        let offer = self
            .remote
            .as_ref()
            .filter(|d| d.sdp_type() == SdpType::Offer)
            .ok_or_else(|| WebRTCError::negotiation("InvalidStateError", "no remote offer to answer"))?;
        let offered = parse_sdp(offer.sdp())?;

        let sections: Vec<SdpSection> = offered
            .iter()
            .map(|section| {
                if section.media_kind().is_none() {
                    return SdpSection::application();
                }
                let local = snapshot.media.iter().find(|m| m.mid == section.mid);
                let direction = local
                    .map(|m| m.direction.answer_direction(section.direction))
                    .unwrap_or(TransceiverDirection::Inactive);
                SdpSection {
                    kind: section.kind.clone(),
                    mid: section.mid.clone(),
                    direction,
                    msid: local.and_then(|m| msid_for(snapshot, direction, m.track_id.as_deref())),
                }
            })
            .collect();
        Ok(SessionDescription::answer(self.write_sdp(&sections)))
    }

    fn write_sdp(&mut self, sections: &[SdpSection]) -> String {
        self.version += 1;
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!("o=- {} {} IN IP4 127.0.0.1\r\n", self.origin, self.version));
        sdp.push_str("s=-\r\nt=0 0\r\n");
        if !sections.is_empty() {
            let mids: Vec<&str> = sections.iter().map(|s| s.mid.as_str()).collect();
            sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
        }
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", self.ufrag));
        sdp.push_str(&format!("a=setup:{}\r\n", if self.parity == 0 { "actpass" } else { "active" }));

        for section in sections {
            match section.media_kind() {
                Some(kind) => {
                    let codecs = capabilities(kind).codecs;
                    let payload_types: Vec<String> = codecs.iter().map(|c| c.payload_type.to_string()).collect();
                    sdp.push_str(&format!(
                        "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n",
                        section.kind,
                        payload_types.join(" ")
                    ));
                    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                    sdp.push_str(&format!("a=mid:{}\r\n", section.mid));
                    sdp.push_str(&format!("a={}\r\n", section.direction));
                    if let Some((stream, track)) = &section.msid {
                        sdp.push_str(&format!("a=msid:{} {}\r\n", stream, track));
                    }
                    for codec in &codecs {
                        let name = codec.mime_type.split('/').nth(1).unwrap_or(&codec.mime_type);
                        match codec.channels {
                            Some(channels) if channels > 1 => sdp.push_str(&format!(
                                "a=rtpmap:{} {}/{}/{}\r\n",
                                codec.payload_type, name, codec.clock_rate, channels
                            )),
                            _ => sdp.push_str(&format!(
                                "a=rtpmap:{} {}/{}\r\n",
                                codec.payload_type, name, codec.clock_rate
                            )),
                        }
                        if let Some(fmtp) = &codec.sdp_fmtp_line {
                            sdp.push_str(&format!("a=fmtp:{} {}\r\n", codec.payload_type, fmtp));
                        }
                    }
                }
                None => {
                    sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
                    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                    sdp.push_str(&format!("a=mid:{}\r\n", section.mid));
                    sdp.push_str("a=sctp-port:5000\r\n");
                }
            }
        }
        sdp
    }

    fn set_local(&mut self, shared: &Shared, desc: SessionDescription) -> Result<(), WebRTCError> {
        if desc.sdp_type() == SdpType::Rollback {
            self.local = self.stable_local.clone();
            return Ok(());
        }
        let sections = parse_sdp(desc.sdp())?;
        let sdp_type = desc.sdp_type();
        self.local = Some(desc);

        if !self.gathered {
            self.gathered = true;
            let mid = sections.first().map(|s| s.mid.clone());
            let host = IceCandidate::new(
                format!(
                    "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                    50000 + self.parity
                ),
                mid.clone(),
                Some(0),
            );
            shared.notify(|o| o.on_ice_candidate(host));
            shared.notify(|o| o.on_ice_candidate(IceCandidate::new("", mid, Some(0))));
        }
        if sdp_type == SdpType::Answer {
            self.commit_stable(shared);
        }
        Ok(())
    }

    fn set_remote(
        &mut self,
        shared: &Shared,
        desc: SessionDescription,
    ) -> Result<Vec<MediaSectionInfo>, WebRTCError> {
        if desc.sdp_type() == SdpType::Rollback {
            self.remote = self.stable_remote.clone();
            self.remote_tracks = self.stable_remote_tracks.clone();
            return Ok(Vec::new());
        }
        let sections = parse_sdp(desc.sdp())?;
        let sdp_type = desc.sdp_type();
        self.remote = Some(desc);
        self.update_remote_tracks(shared, &sections);
        if sdp_type == SdpType::Answer {
            self.commit_stable(shared);
        }

        Ok(sections
            .into_iter()
            .filter_map(|s| {
                let kind = s.media_kind()?;
                Some(MediaSectionInfo {
                    mid: s.mid,
                    kind,
                    direction: s.direction,
                    track_id: s.msid.map(|(_, track)| track),
                })
            })
            .collect())
    }

    fn update_remote_tracks(&mut self, shared: &Shared, sections: &[SdpSection]) {
        let mut live = BTreeSet::new();
        for section in sections {
            let Some(kind) = section.media_kind() else {
                continue;
            };
            if !section.direction.sends() {
                continue;
            }
            let (stream_ids, track_id) = match &section.msid {
                Some((stream, track)) => (vec![stream.clone()], track.clone()),
                None => (Vec::new(), format!("{}-{}", section.kind, section.mid)),
            };
            let info = RemoteTrackInfo {
                mid: section.mid.clone(),
                kind,
                track_id,
                stream_ids,
            };
            live.insert(section.mid.clone());
            if self.remote_tracks.get(&section.mid) != Some(&info) {
                self.remote_tracks.insert(section.mid.clone(), info.clone());
                shared.notify(|o| o.on_track_added(info));
            }
        }

        let gone: Vec<String> = self
            .remote_tracks
            .keys()
            .filter(|mid| !live.contains(*mid))
            .cloned()
            .collect();
        for mid in gone {
            self.remote_tracks.remove(&mid);
            shared.notify(|o| o.on_track_removed(mid));
        }
    }

    /// An answer was applied: both descriptions are now current
    fn commit_stable(&mut self, shared: &Shared) {
        self.stable_local = self.local.clone();
        self.stable_remote = self.remote.clone();
        self.stable_remote_tracks = self.remote_tracks.clone();
        if self.ice.is_connected() || self.local.is_none() || self.remote.is_none() {
            return;
        }
        self.set_ice(shared, IceConnectionState::Checking);
        self.set_ice(shared, IceConnectionState::Connected);
        info!("{}: connected", shared.name);

        let pending: Vec<u16> = self
            .channels
            .iter()
            .filter(|(_, channel)| !channel.open)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.open_channel(shared, id);
        }
    }

    fn open_channel(&mut self, shared: &Shared, id: u16) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.open = true;
        if !channel.init.negotiated && !channel.remote {
            shared.to_peer(Command::PeerChannel(ChannelSpec {
                id,
                label: channel.label.clone(),
                init: channel.init.clone(),
            }));
        }
        shared.notify(|o| o.on_channel_open(id));
    }

    fn collect_stats(&self, target: &StatsTarget) -> Vec<StatsRecord> {
        let outbound = |mid: &str, counter: &Counter| {
            StatsRecord::new(format!("OT{}", mid), "outbound-rtp")
                .with("mid", mid)
                .with("packetsSent", counter.packets)
                .with("bytesSent", counter.bytes)
        };
        let inbound = |mid: &str, counter: &Counter| {
            StatsRecord::new(format!("IT{}", mid), "inbound-rtp")
                .with("mid", mid)
                .with("packetsReceived", counter.packets)
                .with("bytesReceived", counter.bytes)
        };

        match target {
            StatsTarget::Sender { mid } => {
                vec![outbound(mid.as_str(), &self.outbound.get(mid).copied().unwrap_or_default())]
            }
            StatsTarget::Receiver { mid } => {
                vec![inbound(mid.as_str(), &self.inbound.get(mid).copied().unwrap_or_default())]
            }
            StatsTarget::Session => {
                let mut records = Vec::new();
                let mut sent = 0u64;
                let mut received = 0u64;
                for (id, channel) in &self.channels {
                    sent += channel.sent.bytes;
                    received += channel.received.bytes;
                    records.push(
                        StatsRecord::new(format!("D{}", id), "data-channel")
                            .with("label", channel.label.as_str())
                            .with("protocol", channel.init.protocol.as_str())
                            .with("dataChannelIdentifier", *id)
                            .with("state", if channel.open { "open" } else { "connecting" })
                            .with("messagesSent", channel.sent.packets)
                            .with("bytesSent", channel.sent.bytes)
                            .with("messagesReceived", channel.received.packets)
                            .with("bytesReceived", channel.received.bytes),
                    );
                }
                for (mid, counter) in &self.outbound {
                    sent += counter.bytes;
                    records.push(outbound(mid.as_str(), counter));
                }
                for (mid, counter) in &self.inbound {
                    received += counter.bytes;
                    records.push(inbound(mid.as_str(), counter));
                }
                records.push(
                    StatsRecord::new("T01", "transport")
                        .with("iceState", self.ice.as_str())
                        .with("iceLocalUsernameFragment", self.ufrag.as_str())
                        .with("bytesSent", sent)
                        .with("bytesReceived", received)
                        .with("remoteCandidatesAdded", self.candidates_added),
                );
                records
            }
        }
    }
}

fn new_ufrag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn msid_for(
    snapshot: &NegotiationSnapshot,
    direction: TransceiverDirection,
    track_id: Option<&str>,
) -> Option<(String, String)> {
    if !direction.sends() {
        return None;
    }
    track_id.map(|track| (snapshot.session_id.clone(), track.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::transport::{TransportEvent, TransportEventSink};
    use std::time::Duration;

    struct Recorder(Mutex<Vec<TransportEvent>>);

    impl Recorder {
        fn bind(transport: &LoopbackTransport) -> (Arc<Recorder>, Arc<dyn TransportEventSink>) {
            let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
            let sink: Arc<dyn TransportEventSink> = recorder.clone();
            transport.bind(TransportObserver::new(Arc::downgrade(&sink)));
            (recorder, sink)
        }

        fn events(&self) -> Vec<TransportEvent> {
            self.0.lock().clone()
        }

        async fn wait_for<F: Fn(&TransportEvent) -> bool>(&self, predicate: F) {
            for _ in 0..200 {
                if self.0.lock().iter().any(&predicate) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("timed out waiting for transport event");
        }
    }

    impl TransportEventSink for Recorder {
        fn on_transport_event(&self, event: TransportEvent) {
            self.0.lock().push(event);
        }
    }

    fn snapshot(session_id: &str, direction: TransceiverDirection, track: Option<&str>) -> NegotiationSnapshot {
        NegotiationSnapshot {
            session_id: session_id.to_string(),
            media: vec![MediaSectionInfo {
                mid: "0".to_string(),
                kind: MediaKind::Audio,
                direction,
                track_id: track.map(str::to_string),
            }],
            data_channels: true,
        }
    }

    async fn connect(a: &LoopbackTransport, b: &LoopbackTransport) -> SessionDescription {
        let offer = a
            .create_offer(
                snapshot("A", TransceiverDirection::SendRecv, Some("mic")),
                OfferOptions::default(),
            )
            .await
            .unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b
            .create_answer(
                snapshot("B", TransceiverDirection::RecvOnly, None),
                AnswerOptions::default(),
            )
            .await
            .unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer.clone()).await.unwrap();
        answer
    }

    #[test]
    fn test_parse_sdp_sections() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:v1\r\na=sendonly\r\na=msid:s t\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:data\r\n";
        let sections = parse_sdp(sdp).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].mid, "v1");
        assert_eq!(sections[0].direction, TransceiverDirection::SendOnly);
        assert_eq!(sections[0].msid, Some(("s".to_string(), "t".to_string())));
        assert_eq!(sections[1].kind, APPLICATION);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        match parse_sdp("hello") {
            Err(WebRTCError::NegotiationFailed { error_type, .. }) => assert_eq!(error_type, "SyntaxError"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_sdp("v=0\r\nm=audio 9 RTP/AVP 0\r\n").is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_ends() {
        let (a, b) = LoopbackTransport::pair();
        let (rec_a, _sink_a) = Recorder::bind(&a);
        let (rec_b, _sink_b) = Recorder::bind(&b);

        let answer = connect(&a, &b).await;
        assert!(answer.sdp().contains("a=recvonly"));
        assert!(!answer.sdp().contains("a=msid"));

        let connected = |e: &TransportEvent| {
            matches!(e, TransportEvent::IceConnectionStateChange(IceConnectionState::Connected))
        };
        assert!(rec_a.events().iter().any(connected));
        assert!(rec_b.events().iter().any(connected));
        assert!(rec_b
            .events()
            .iter()
            .any(|e| matches!(e, TransportEvent::TrackAdded(info) if info.track_id == "mic")));
    }

    #[tokio::test]
    async fn test_remote_sections_reported() {
        let (a, b) = LoopbackTransport::pair();
        let offer = a
            .create_offer(
                snapshot("A", TransceiverDirection::SendOnly, Some("mic")),
                OfferOptions::default(),
            )
            .await
            .unwrap();
        let sections = b.set_remote_description(offer).await.unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].direction, TransceiverDirection::SendOnly);
        assert_eq!(sections[0].track_id.as_deref(), Some("mic"));
    }

    #[tokio::test]
    async fn test_remote_rollback_forgets_offered_tracks() {
        let (a, b) = LoopbackTransport::pair();
        let (rec_b, _sink_b) = Recorder::bind(&b);
        let offer = a
            .create_offer(
                snapshot("A", TransceiverDirection::SendOnly, Some("mic")),
                OfferOptions::default(),
            )
            .await
            .unwrap();
        let track_added = |e: &TransportEvent| matches!(e, TransportEvent::TrackAdded(info) if info.track_id == "mic");

        b.set_remote_description(offer.clone()).await.unwrap();
        b.set_remote_description(SessionDescription::rollback()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();

        assert_eq!(rec_b.events().iter().filter(|e| track_added(e)).count(), 2);
    }

    #[tokio::test]
    async fn test_in_band_channel_reaches_peer_in_order() {
        let (a, b) = LoopbackTransport::pair();
        let (rec_a, _sink_a) = Recorder::bind(&a);
        let (rec_b, _sink_b) = Recorder::bind(&b);
        connect(&a, &b).await;

        a.open_data_channel(ChannelSpec {
            id: 0,
            label: "chat".to_string(),
            init: DataChannelInit::default(),
        })
        .unwrap();
        rec_a.wait_for(|e| matches!(e, TransportEvent::ChannelOpen(0))).await;
        for text in ["m1", "m2", "m3"] {
            a.send_data(0, ChannelMessage::from(text)).unwrap();
        }
        rec_b
            .wait_for(|e| matches!(e, TransportEvent::ChannelMessage(0, m) if m.as_text() == Some("m3")))
            .await;

        let received: Vec<String> = rec_b
            .events()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::ChannelMessage(0, m) => m.as_text().map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec!["m1", "m2", "m3"]);
        assert!(rec_b
            .events()
            .iter()
            .any(|e| matches!(e, TransportEvent::DataChannel(spec) if spec.label == "chat")));
    }

    #[tokio::test]
    async fn test_close_channel_notifies_both_ends() {
        let (a, b) = LoopbackTransport::pair();
        let (rec_a, _sink_a) = Recorder::bind(&a);
        let (rec_b, _sink_b) = Recorder::bind(&b);
        connect(&a, &b).await;

        a.open_data_channel(ChannelSpec {
            id: 2,
            label: "ctl".to_string(),
            init: DataChannelInit::default(),
        })
        .unwrap();
        rec_b.wait_for(|e| matches!(e, TransportEvent::ChannelOpen(2))).await;

        a.close_data_channel(2);
        rec_a.wait_for(|e| matches!(e, TransportEvent::ChannelClosed(2))).await;
        rec_b.wait_for(|e| matches!(e, TransportEvent::ChannelClosed(2))).await;
    }

    #[tokio::test]
    async fn test_media_counters() {
        let (a, b) = LoopbackTransport::pair();
        connect(&a, &b).await;
        a.write_media(vec![
            MediaFrame {
                mid: "0".to_string(),
                track_id: "mic".to_string(),
                payload: vec![0u8; 160].into(),
            };
            3
        ]);

        let records = a.collect_stats(StatsTarget::Sender { mid: "0".to_string() }).await.unwrap();
        assert_eq!(records[0].get_u64("packetsSent"), Some(3));
        assert_eq!(records[0].get_u64("bytesSent"), Some(480));

        for _ in 0..200 {
            let records = b
                .collect_stats(StatsTarget::Receiver { mid: "0".to_string() })
                .await
                .unwrap();
            if records[0].get_u64("packetsReceived") == Some(3) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("peer never counted the frames");
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let transport = LoopbackTransport::unpaired();
        transport.close();
        transport.close();
        assert!(transport.send_data(0, ChannelMessage::from("x")).is_err());
        assert!(matches!(
            transport.collect_stats(StatsTarget::Session).await,
            Err(WebRTCError::TransportError(_))
        ));
    }
}
