//! Signaling state machine and signaling messages
//!
//! The offer/answer transition table lives here as a pure function so every
//! caller (session, tests, benches) applies exactly the same rules. The
//! `SignalingMessage` type is the JSON record used to carry descriptions,
//! candidates and errors between peers.

use super::description::{IceCandidate, SdpType, SessionDescription};
use super::{ErrorRecord, WebRTCError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Negotiation phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveLocalPrAnswer,
    HaveRemoteOffer,
    HaveRemotePrAnswer,
    /// Terminal
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        }
    }

    pub fn is_stable(&self) -> bool {
        *self == SignalingState::Stable
    }

    /// Description type an argument-less setLocalDescription() generates
    pub fn implicit_local_type(&self) -> Option<SdpType> {
        match self {
            SignalingState::Stable => Some(SdpType::Offer),
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer => Some(SdpType::Answer),
            _ => None,
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

/// Which side a description is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptionSide {
    Local,
    Remote,
}

impl fmt::Display for DescriptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionSide::Local => write!(f, "Local"),
            DescriptionSide::Remote => write!(f, "Remote"),
        }
    }
}

/// Apply the offer/answer transition table.
///
/// Returns the state reached by applying a description of `sdp_type` on
/// `side`, `InvalidStateTransition` if that description is not allowed in
/// `current`, or `SessionClosed` once the session is closed.
pub fn next_state(
    current: SignalingState,
    side: DescriptionSide,
    sdp_type: SdpType,
) -> Result<SignalingState, WebRTCError> {
    use DescriptionSide::{Local, Remote};
    use SignalingState::*;

    let next = match (side, sdp_type, current) {
        (_, _, Closed) => return Err(WebRTCError::SessionClosed),

        (Local, SdpType::Offer, Stable) => HaveLocalOffer,
        (Local, SdpType::Answer, HaveRemoteOffer | HaveLocalPrAnswer) => Stable,
        (Local, SdpType::Pranswer, HaveRemoteOffer | HaveLocalPrAnswer) => HaveLocalPrAnswer,
        (Local, SdpType::Rollback, HaveLocalOffer) => Stable,

        (Remote, SdpType::Offer, Stable) => HaveRemoteOffer,
        (Remote, SdpType::Answer, HaveLocalOffer | HaveRemotePrAnswer) => Stable,
        (Remote, SdpType::Pranswer, HaveLocalOffer | HaveRemotePrAnswer) => HaveRemotePrAnswer,
        (Remote, SdpType::Rollback, HaveRemoteOffer) => Stable,

        (side, sdp_type, state) => {
            return Err(WebRTCError::InvalidStateTransition(format!(
                "set{}Description({}) is not valid in state {}",
                side, sdp_type, state
            )))
        }
    };

    Ok(next)
}

/// Signaling message types exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer
    Offer {
        sdp: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// SDP answer
    Answer {
        sdp: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Provisional SDP answer
    Pranswer {
        sdp: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Roll back a pending offer
    Rollback {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// ICE candidate
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidate,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Error report
    Error {
        #[serde(flatten)]
        error: ErrorRecord,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Close session
    Close {
        session_id: String,
        reason: Option<String>,
    },
}

impl SignalingMessage {
    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        serde_json::from_str(json)
            .map_err(|e| WebRTCError::InvalidParameter(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, WebRTCError> {
        serde_json::to_string(self)
            .map_err(|e| WebRTCError::InvalidParameter(format!("Failed to serialize message: {}", e)))
    }

    /// Wrap a session description
    pub fn description(desc: &SessionDescription, session_id: Option<String>) -> Self {
        let sdp = desc.sdp().to_string();
        match desc.sdp_type() {
            SdpType::Offer => SignalingMessage::Offer { sdp, session_id },
            SdpType::Answer => SignalingMessage::Answer { sdp, session_id },
            SdpType::Pranswer => SignalingMessage::Pranswer { sdp, session_id },
            SdpType::Rollback => SignalingMessage::Rollback { session_id },
        }
    }

    /// Wrap an ICE candidate
    pub fn ice_candidate(candidate: IceCandidate, session_id: Option<String>) -> Self {
        SignalingMessage::IceCandidate { candidate, session_id }
    }

    /// Create an error report
    pub fn error(err: &WebRTCError, session_id: Option<String>) -> Self {
        SignalingMessage::Error {
            error: ErrorRecord::from(err),
            session_id,
        }
    }

    /// Extract the session description, if this message carries one
    pub fn to_description(&self) -> Option<SessionDescription> {
        match self {
            SignalingMessage::Offer { sdp, .. } => Some(SessionDescription::offer(sdp.clone())),
            SignalingMessage::Answer { sdp, .. } => Some(SessionDescription::answer(sdp.clone())),
            SignalingMessage::Pranswer { sdp, .. } => Some(SessionDescription::pranswer(sdp.clone())),
            SignalingMessage::Rollback { .. } => Some(SessionDescription::rollback()),
            _ => None,
        }
    }

    /// Get the session ID if present
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::Pranswer { session_id, .. }
            | SignalingMessage::Rollback { session_id }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::Error { session_id, .. } => session_id.as_deref(),
            SignalingMessage::Close { session_id, .. } => Some(session_id),
        }
    }
}

/// Signaling message parser for text frames
pub struct SignalingParser;

impl SignalingParser {
    /// Parse a text message into a signaling message
    ///
    /// Supports both JSON format and legacy format:
    /// - JSON: `{"type": "offer", "sdp": "..."}`
    /// - Legacy: `webrtc,offer,<sdp>`
    pub fn parse(text: &str) -> Result<SignalingMessage, WebRTCError> {
        let text = text.trim();

        if text.starts_with('{') {
            return SignalingMessage::from_json(text);
        }

        if text.starts_with("webrtc,") {
            return Self::parse_legacy(text);
        }

        let preview: String = text.chars().take(50).collect();
        Err(WebRTCError::InvalidParameter(format!("Unknown message format: {}", preview)))
    }

    /// Parse legacy comma-separated format
    fn parse_legacy(text: &str) -> Result<SignalingMessage, WebRTCError> {
        let parts: Vec<&str> = text.splitn(4, ',').collect();

        if parts.len() < 2 {
            return Err(WebRTCError::InvalidParameter("Invalid legacy message format".to_string()));
        }

        match parts[1] {
            "offer" | "answer" | "pranswer" => {
                let sdp = parts
                    .get(2)
                    .ok_or_else(|| WebRTCError::InvalidParameter(format!("Missing SDP in {}", parts[1])))?
                    .to_string();
                let session_id = parts.get(3).map(|s| s.to_string());
                Ok(match parts[1] {
                    "offer" => SignalingMessage::Offer { sdp, session_id },
                    "answer" => SignalingMessage::Answer { sdp, session_id },
                    _ => SignalingMessage::Pranswer { sdp, session_id },
                })
            }

            "rollback" => Ok(SignalingMessage::Rollback {
                session_id: parts.get(2).map(|s| s.to_string()),
            }),

            "ice" => {
                if parts.len() < 3 {
                    return Err(WebRTCError::InvalidParameter("Missing ICE candidate data".to_string()));
                }
                Ok(SignalingMessage::IceCandidate {
                    candidate: IceCandidate::new(parts[2], Some("0".to_string()), Some(0)),
                    session_id: parts.get(3).map(|s| s.to_string()),
                })
            }

            "close" => {
                if parts.len() < 3 {
                    return Err(WebRTCError::InvalidParameter("Missing session_id in close".to_string()));
                }
                Ok(SignalingMessage::Close {
                    session_id: parts[2].to_string(),
                    reason: parts.get(3).map(|s| s.to_string()),
                })
            }

            cmd => Err(WebRTCError::InvalidParameter(format!("Unknown legacy command: {}", cmd))),
        }
    }

    /// Format a signaling message for transmission
    pub fn format(message: &SignalingMessage) -> Result<String, WebRTCError> {
        // Always use JSON format for outgoing messages
        message.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DescriptionSide::{Local, Remote};
    use SignalingState::*;

    const ALL_STATES: [SignalingState; 6] = [
        Stable,
        HaveLocalOffer,
        HaveLocalPrAnswer,
        HaveRemoteOffer,
        HaveRemotePrAnswer,
        Closed,
    ];
    const ALL_TYPES: [SdpType; 4] = [SdpType::Offer, SdpType::Answer, SdpType::Pranswer, SdpType::Rollback];

    fn expected(state: SignalingState, side: DescriptionSide, ty: SdpType) -> Option<SignalingState> {
        match (side, ty, state) {
            (Local, SdpType::Offer, Stable) => Some(HaveLocalOffer),
            (Local, SdpType::Answer, HaveRemoteOffer) => Some(Stable),
            (Local, SdpType::Answer, HaveLocalPrAnswer) => Some(Stable),
            (Local, SdpType::Pranswer, HaveRemoteOffer) => Some(HaveLocalPrAnswer),
            (Local, SdpType::Pranswer, HaveLocalPrAnswer) => Some(HaveLocalPrAnswer),
            (Local, SdpType::Rollback, HaveLocalOffer) => Some(Stable),
            (Remote, SdpType::Offer, Stable) => Some(HaveRemoteOffer),
            (Remote, SdpType::Answer, HaveLocalOffer) => Some(Stable),
            (Remote, SdpType::Answer, HaveRemotePrAnswer) => Some(Stable),
            (Remote, SdpType::Pranswer, HaveLocalOffer) => Some(HaveRemotePrAnswer),
            (Remote, SdpType::Pranswer, HaveRemotePrAnswer) => Some(HaveRemotePrAnswer),
            (Remote, SdpType::Rollback, HaveRemoteOffer) => Some(Stable),
            _ => None,
        }
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        for state in ALL_STATES {
            for side in [Local, Remote] {
                for ty in ALL_TYPES {
                    let result = next_state(state, side, ty);
                    match (expected(state, side, ty), state) {
                        (Some(next), _) => assert_eq!(result, Ok(next), "{:?} {:?} {:?}", state, side, ty),
                        (None, Closed) => assert_eq!(result, Err(WebRTCError::SessionClosed)),
                        (None, _) => assert!(
                            matches!(result, Err(WebRTCError::InvalidStateTransition(_))),
                            "{:?} {:?} {:?} should be rejected",
                            state,
                            side,
                            ty
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_offer_answer_cycle() {
        let caller = next_state(Stable, Local, SdpType::Offer).unwrap();
        let callee = next_state(Stable, Remote, SdpType::Offer).unwrap();
        assert_eq!(caller, HaveLocalOffer);
        assert_eq!(callee, HaveRemoteOffer);
        assert_eq!(next_state(callee, Local, SdpType::Answer).unwrap(), Stable);
        assert_eq!(next_state(caller, Remote, SdpType::Answer).unwrap(), Stable);
    }

    #[test]
    fn test_implicit_local_type() {
        assert_eq!(Stable.implicit_local_type(), Some(SdpType::Offer));
        assert_eq!(HaveRemoteOffer.implicit_local_type(), Some(SdpType::Answer));
        assert_eq!(HaveLocalOffer.implicit_local_type(), None);
        assert_eq!(Closed.implicit_local_type(), None);
    }

    #[test]
    fn test_parse_json_offer() {
        let json = r#"{"type": "offer", "sdp": "v=0\r\n..."}"#;
        let msg = SignalingParser::parse(json).unwrap();
        match msg.to_description() {
            Some(desc) => {
                assert_eq!(desc.sdp_type(), SdpType::Offer);
                assert!(desc.sdp().starts_with("v=0"));
            }
            None => panic!("Expected description"),
        }
    }

    #[test]
    fn test_parse_legacy_answer() {
        let msg = SignalingParser::parse("webrtc,answer,v=0...,sess1").unwrap();
        match msg {
            SignalingMessage::Answer { sdp, session_id } => {
                assert_eq!(sdp, "v=0...");
                assert_eq!(session_id.as_deref(), Some("sess1"));
            }
            _ => panic!("Expected Answer"),
        }
    }

    #[test]
    fn test_candidate_message_is_flat() {
        let cand = IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host", Some("0".into()), Some(0));
        let json = SignalingMessage::ice_candidate(cand.clone(), Some("s".into())).to_json().unwrap();
        assert!(json.contains(r#""type":"icecandidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));

        match SignalingMessage::from_json(&json).unwrap() {
            SignalingMessage::IceCandidate { candidate, .. } => assert_eq!(candidate, cand),
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn test_error_message() {
        let err = WebRTCError::negotiation("SyntaxError", "SDP parsing failed");
        let json = SignalingMessage::error(&err, Some("sess1".to_string())).to_json().unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("SyntaxError"));
    }
}
