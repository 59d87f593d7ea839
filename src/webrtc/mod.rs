//! Peer-connection session engine
//!
//! This module provides the session-side half of a WebRTC stack:
//! - Signaling state machine and offer/answer negotiation
//! - Transceiver / sender / receiver and media track lifecycle
//! - DataChannel state machine
//! - Stats snapshots and ordered event delivery
//!
//! Media transport (ICE, DTLS, SCTP, RTP) is delegated to a
//! [`transport::MediaTransport`] implementation.

pub mod description;
pub mod signaling;
pub mod media_track;
pub mod transceiver;
pub mod data_channel;
pub mod stats;
pub mod events;
pub mod transport;
pub mod loopback;
pub mod peer_connection;
pub mod session;

pub use data_channel::{ChannelMessage, DataChannel, DataChannelInit, DataChannelState};
pub use description::{IceCandidate, SdpType, SessionDescription};
pub use events::{EventStream, SessionEvent};
pub use loopback::LoopbackTransport;
pub use media_track::{MediaKind, MediaTrack, TrackState};
pub use peer_connection::PeerConnectionSession;
pub use session::SessionManager;
pub use signaling::{IceConnectionState, SignalingMessage, SignalingState};
pub use stats::{PendingStats, StatsReport};
pub use transceiver::{RtpReceiver, RtpSender, RtpTransceiver, TransceiverDirection};
pub use transport::{AnswerOptions, MediaTransport, OfferOptions};

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// WebRTC session errors
#[derive(Debug, Clone, PartialEq)]
pub enum WebRTCError {
    /// Negotiation call not valid for the current signaling state
    InvalidStateTransition(String),
    /// Operation on a closed (or closing) session
    SessionClosed,
    /// send() on a channel that is not open
    ChannelNotOpen(String),
    /// setParameters with an out-of-date version token
    StaleParameters,
    /// Negotiation rejected by the transport
    NegotiationFailed { error_type: String, message: String },
    /// Handle lookup miss
    NotFound(String),
    /// Argument rejected before reaching the transport
    InvalidParameter(String),
    /// Transport failure outside of negotiation
    TransportError(String),
}

impl WebRTCError {
    pub fn negotiation(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        WebRTCError::NegotiationFailed {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Local errors the caller is expected to handle and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WebRTCError::ChannelNotOpen(_)
                | WebRTCError::StaleParameters
                | WebRTCError::NotFound(_)
                | WebRTCError::InvalidParameter(_)
        )
    }

    /// Stable error-type tag used in boundary records
    pub fn error_type(&self) -> &str {
        match self {
            WebRTCError::InvalidStateTransition(_) => "InvalidStateTransition",
            WebRTCError::SessionClosed => "SessionClosed",
            WebRTCError::ChannelNotOpen(_) => "ChannelNotOpen",
            WebRTCError::StaleParameters => "StaleParameters",
            WebRTCError::NegotiationFailed { error_type, .. } => error_type.as_str(),
            WebRTCError::NotFound(_) => "NotFound",
            WebRTCError::InvalidParameter(_) => "InvalidParameter",
            WebRTCError::TransportError(_) => "TransportError",
        }
    }
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::InvalidStateTransition(msg) => write!(f, "Invalid state transition: {}", msg),
            WebRTCError::SessionClosed => write!(f, "Session is closed"),
            WebRTCError::ChannelNotOpen(label) => write!(f, "DataChannel not open: {}", label),
            WebRTCError::StaleParameters => write!(f, "Stale sender parameters"),
            WebRTCError::NegotiationFailed { error_type, message } => {
                write!(f, "Negotiation failed ({}): {}", error_type, message)
            }
            WebRTCError::NotFound(what) => write!(f, "Not found: {}", what),
            WebRTCError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            WebRTCError::TransportError(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

/// Serializable error record (`RTCError` at the boundary)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "errorType")]
    pub error_type: String,
    pub message: String,
}

impl From<&WebRTCError> for ErrorRecord {
    fn from(err: &WebRTCError) -> Self {
        let message = match err {
            WebRTCError::InvalidStateTransition(msg)
            | WebRTCError::ChannelNotOpen(msg)
            | WebRTCError::NotFound(msg)
            | WebRTCError::InvalidParameter(msg)
            | WebRTCError::TransportError(msg) => msg.clone(),
            WebRTCError::NegotiationFailed { message, .. } => message.clone(),
            WebRTCError::SessionClosed | WebRTCError::StaleParameters => err.to_string(),
        };
        ErrorRecord {
            error_type: err.error_type().to_string(),
            message,
        }
    }
}

impl From<ErrorRecord> for WebRTCError {
    fn from(record: ErrorRecord) -> Self {
        match record.error_type.as_str() {
            "InvalidStateTransition" => WebRTCError::InvalidStateTransition(record.message),
            "SessionClosed" => WebRTCError::SessionClosed,
            "ChannelNotOpen" => WebRTCError::ChannelNotOpen(record.message),
            "StaleParameters" => WebRTCError::StaleParameters,
            "NotFound" => WebRTCError::NotFound(record.message),
            "InvalidParameter" => WebRTCError::InvalidParameter(record.message),
            "TransportError" => WebRTCError::TransportError(record.message),
            _ => WebRTCError::NegotiationFailed {
                error_type: record.error_type,
                message: record.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(WebRTCError::ChannelNotOpen("chat".into()).is_recoverable());
        assert!(WebRTCError::StaleParameters.is_recoverable());
        assert!(WebRTCError::NotFound("#4".into()).is_recoverable());
        assert!(!WebRTCError::SessionClosed.is_recoverable());
        assert!(!WebRTCError::negotiation("OperationError", "bad sdp").is_recoverable());
    }

    #[test]
    fn test_error_record_keeps_negotiation_type() {
        let err = WebRTCError::negotiation("SyntaxError", "missing v= line");
        let record = ErrorRecord::from(&err);
        assert_eq!(record.error_type, "SyntaxError");
        assert_eq!(record.message, "missing v= line");

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"errorType\":\"SyntaxError\""));
    }

    #[test]
    fn test_error_record_restores_local_kinds() {
        let record = ErrorRecord::from(&WebRTCError::NotFound("#4".into()));
        assert_eq!(record.message, "#4");
        assert_eq!(WebRTCError::from(record), WebRTCError::NotFound("#4".into()));

        let record = ErrorRecord::from(&WebRTCError::SessionClosed);
        assert_eq!(WebRTCError::from(record), WebRTCError::SessionClosed);
    }
}
