//! rtc-session-core - peer-connection session engine
//!
//! Signaling state machine, transceivers, DataChannels, stats and ordered
//! event delivery for one or more peer connections. The wire side is
//! pluggable through [`webrtc::transport::MediaTransport`].

pub mod config;
pub mod handle_table;
pub mod batch;
pub mod webrtc;

// Re-exports
pub use config::{Config, SessionConfig};
pub use handle_table::{HandleId, HandleTable};
pub use webrtc::{PeerConnectionSession, SessionManager, SignalingMessage, WebRTCError};
