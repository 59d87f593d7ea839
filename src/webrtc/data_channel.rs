//! DataChannel state machine
//!
//! Connecting -> Open -> Closing -> Closed, with an abrupt transport close
//! allowed to jump straight to Closed. The state itself lives in the
//! session so that it changes under the same lock as every other session
//! event; `DataChannel` is the application handle onto it.

use super::peer_connection::SessionInner;
use super::WebRTCError;
use crate::handle_table::HandleId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;

/// Largest label or protocol string the SCTP open message can carry
const MAX_LABEL_BYTES: usize = 65535;
/// Stream id 65535 is reserved
pub(crate) const MAX_CHANNEL_ID: u16 = 65534;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl DataChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataChannelState::Connecting => "connecting",
            DataChannelState::Open => "open",
            DataChannelState::Closing => "closing",
            DataChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel creation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    pub negotiated: bool,
    pub id: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: None,
        }
    }
}

impl DataChannelInit {
    /// Out-of-band channel with a fixed stream id on both ends
    pub fn negotiated(id: u16) -> Self {
        Self {
            negotiated: true,
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn unordered() -> Self {
        Self {
            ordered: false,
            ..Default::default()
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.max_packet_life_time.is_none() && self.max_retransmits.is_none()
    }

    pub fn validate(&self, label: &str) -> Result<(), WebRTCError> {
        if label.len() > MAX_LABEL_BYTES {
            return Err(WebRTCError::InvalidParameter(format!(
                "label is {} bytes, limit is {}",
                label.len(),
                MAX_LABEL_BYTES
            )));
        }
        if self.protocol.len() > MAX_LABEL_BYTES {
            return Err(WebRTCError::InvalidParameter(format!(
                "protocol is {} bytes, limit is {}",
                self.protocol.len(),
                MAX_LABEL_BYTES
            )));
        }
        if self.max_packet_life_time.is_some() && self.max_retransmits.is_some() {
            return Err(WebRTCError::InvalidParameter(
                "maxPacketLifeTime and maxRetransmits are mutually exclusive".to_string(),
            ));
        }
        match (self.negotiated, self.id) {
            (true, None) => Err(WebRTCError::InvalidParameter(
                "negotiated channels need an explicit id".to_string(),
            )),
            (_, Some(id)) if id > MAX_CHANNEL_ID => Err(WebRTCError::InvalidParameter(format!(
                "channel id {} out of range",
                id
            ))),
            _ => Ok(()),
        }
    }
}

/// A single DataChannel payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ChannelMessage::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChannelMessage::Text(text) => Some(text),
            ChannelMessage::Binary(_) => None,
        }
    }
}

impl From<String> for ChannelMessage {
    fn from(text: String) -> Self {
        ChannelMessage::Text(text)
    }
}

impl From<&str> for ChannelMessage {
    fn from(text: &str) -> Self {
        ChannelMessage::Text(text.to_string())
    }
}

impl From<Bytes> for ChannelMessage {
    fn from(data: Bytes) -> Self {
        ChannelMessage::Binary(data)
    }
}

impl From<Vec<u8>> for ChannelMessage {
    fn from(data: Vec<u8>) -> Self {
        ChannelMessage::Binary(Bytes::from(data))
    }
}

/// Session-side record of a channel
#[derive(Debug, Clone)]
pub(crate) struct ChannelEntry {
    pub handle: HandleId,
    pub label: String,
    pub init: DataChannelInit,
    pub state: DataChannelState,
    /// Announced by the peer rather than created locally
    pub remote: bool,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl ChannelEntry {
    pub fn new(label: String, init: DataChannelInit, remote: bool) -> Self {
        Self {
            handle: HandleId::next(),
            label,
            init,
            state: DataChannelState::Connecting,
            remote,
            messages_sent: 0,
            bytes_sent: 0,
            messages_received: 0,
            bytes_received: 0,
        }
    }
}

/// Application handle onto a session's DataChannel
pub struct DataChannel {
    handle: HandleId,
    id: u16,
    label: String,
    init: DataChannelInit,
    session: Weak<SessionInner>,
}

impl DataChannel {
    pub(crate) fn new(handle: HandleId, id: u16, entry: &ChannelEntry, session: Weak<SessionInner>) -> Self {
        Self {
            handle,
            id,
            label: entry.label.clone(),
            init: entry.init.clone(),
            session,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// SCTP stream id
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.init.protocol
    }

    pub fn ordered(&self) -> bool {
        self.init.ordered
    }

    pub fn negotiated(&self) -> bool {
        self.init.negotiated
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        self.init.max_retransmits
    }

    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.init.max_packet_life_time
    }

    /// Closed once the owning session is gone
    pub fn ready_state(&self) -> DataChannelState {
        self.session
            .upgrade()
            .and_then(|inner| inner.channel_state(self.id, self.handle))
            .unwrap_or(DataChannelState::Closed)
    }

    /// Send a message. Fails with `ChannelNotOpen` unless the channel is Open.
    pub fn send(&self, message: impl Into<ChannelMessage>) -> Result<(), WebRTCError> {
        let inner = self.session.upgrade().ok_or(WebRTCError::SessionClosed)?;
        inner.send_on_channel(self.id, self.handle, message.into())
    }

    pub fn send_text(&self, text: &str) -> Result<(), WebRTCError> {
        self.send(ChannelMessage::from(text))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WebRTCError> {
        self.send(ChannelMessage::Binary(data.into()))
    }

    /// Start closing the channel. Repeated calls are no-ops.
    pub fn close(&self) {
        if let Some(inner) = self.session.upgrade() {
            inner.close_channel(self.id, self.handle);
        }
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.ready_state())
            .finish()
    }
}
