//! Session management
//!
//! Keeps the registry of live peer connection sessions:
//! - Session creation against a configurable limit
//! - Lookup and removal by handle
//! - Routing of signaling messages to the addressed session
//! - A periodic tick that flushes every session's media queue

use super::description::SessionDescription;
use super::peer_connection::PeerConnectionSession;
use super::signaling::{IceConnectionState, SignalingMessage};
use super::transport::{AnswerOptions, MediaTransport};
use super::WebRTCError;
use crate::config::{Config, SessionConfig};
use crate::handle_table::HandleId;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Session manager for handling multiple peer connection sessions
pub struct SessionManager {
    /// Active sessions
    sessions: RwLock<HashMap<HandleId, Arc<PeerConnectionSession>>>,
    /// Per-session configuration
    session_config: SessionConfig,
    /// Maximum concurrent sessions
    max_sessions: usize,
    /// Media flush tick
    flush_interval: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_config: config.session(),
            max_sessions: config.engine.max_sessions,
            flush_interval: Duration::from_millis(config.engine.flush_interval_ms.max(1)),
            flush_task: Mutex::new(None),
        }
    }

    /// Create a session on top of `transport`
    pub fn create_session(&self, transport: Arc<dyn MediaTransport>) -> Result<Arc<PeerConnectionSession>, WebRTCError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(WebRTCError::InvalidParameter(format!(
                "maximum sessions reached ({})",
                self.max_sessions
            )));
        }

        let session = Arc::new(PeerConnectionSession::new(self.session_config.clone(), transport));
        sessions.insert(session.handle(), session.clone());
        info!("Registered session {} ({} active)", session.id(), sessions.len());
        Ok(session)
    }

    /// Get a session by handle
    pub fn get(&self, handle: HandleId) -> Result<Arc<PeerConnectionSession>, WebRTCError> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| WebRTCError::NotFound(format!("session {}", handle)))
    }

    /// Find a session by its string id
    pub fn find(&self, session_id: &str) -> Option<Arc<PeerConnectionSession>> {
        self.sessions.read().values().find(|s| s.id() == session_id).cloned()
    }

    /// Close and unregister a session
    pub fn close_session(&self, handle: HandleId) -> bool {
        let session = self.sessions.write().remove(&handle);
        match session {
            Some(session) => {
                session.close();
                info!("Removed session {}", session.id());
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<PeerConnectionSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop closed and failed sessions
    pub fn cleanup_stale_sessions(&self) -> usize {
        let stale: Vec<HandleId> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_closed() || s.ice_connection_state() == IceConnectionState::Failed)
            .map(|s| s.handle())
            .collect();

        for handle in &stale {
            self.close_session(*handle);
        }
        if !stale.is_empty() {
            info!("Cleaned up {} stale sessions", stale.len());
        }
        stale.len()
    }

    /// Flush every session's media queue. Returns the number of frames handed
    /// to transports.
    pub fn flush_all(&self) -> usize {
        let sessions = self.sessions();
        sessions.iter().map(|s| s.flush_media()).sum()
    }

    /// Start the periodic media flush. Holds the manager weakly, so the loop
    /// ends on its own once the manager is dropped.
    pub fn start_flush_loop(self: &Arc<Self>) {
        let mut task = self.flush_task.lock();
        if task.is_some() {
            return;
        }
        let manager: Weak<SessionManager> = Arc::downgrade(self);
        let period = self.flush_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.flush_all();
            }
            debug!("Flush loop stopped");
        }));
        info!("Media flush loop started ({:?} tick)", period);
    }

    /// Stop the flush loop and close every session. Each close runs the
    /// session's final flush.
    pub fn shutdown(&self) -> usize {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        let closed = self.close_all();
        info!("Session manager shut down ({} sessions closed)", closed);
        closed
    }

    /// Apply a signaling message addressed to `handle`. Returns the reply to
    /// send back to the peer, if the message calls for one.
    pub async fn handle_signaling(
        &self,
        handle: HandleId,
        message: SignalingMessage,
    ) -> Result<Option<SignalingMessage>, WebRTCError> {
        let session = self.get(handle)?;
        let reply_id = Some(session.id().to_string());

        match message {
            SignalingMessage::Offer { sdp, .. } => {
                session.set_remote_description(SessionDescription::offer(sdp)).await?;
                let answer = session.create_answer(AnswerOptions::default()).await?;
                session.set_local_description(Some(answer.clone())).await?;
                Ok(Some(SignalingMessage::description(&answer, reply_id)))
            }
            SignalingMessage::Answer { sdp, .. } => {
                session.set_remote_description(SessionDescription::answer(sdp)).await?;
                Ok(None)
            }
            SignalingMessage::Pranswer { sdp, .. } => {
                session.set_remote_description(SessionDescription::pranswer(sdp)).await?;
                Ok(None)
            }
            SignalingMessage::Rollback { .. } => {
                session.set_remote_description(SessionDescription::rollback()).await?;
                Ok(None)
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                session.add_ice_candidate(candidate).await?;
                Ok(None)
            }
            SignalingMessage::Error { error, .. } => {
                warn!("Session {}: peer reported {}: {}", session.id(), error.error_type, error.message);
                Ok(None)
            }
            SignalingMessage::Close { reason, .. } => {
                info!(
                    "Session {}: peer closed ({})",
                    session.id(),
                    reason.as_deref().unwrap_or("no reason")
                );
                self.close_session(handle);
                Ok(None)
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::loopback::LoopbackTransport;
    use crate::webrtc::media_track::{MediaKind, MediaTrack};
    use crate::webrtc::signaling::SignalingState;
    use crate::webrtc::transport::OfferOptions;

    fn manager(max_sessions: usize) -> Arc<SessionManager> {
        let mut config = Config::default();
        config.engine.max_sessions = max_sessions;
        config.engine.flush_interval_ms = 5;
        Arc::new(SessionManager::new(&config))
    }

    #[tokio::test]
    async fn test_session_limit() {
        let manager = manager(1);
        let first = manager.create_session(Arc::new(LoopbackTransport::unpaired())).unwrap();
        let err = manager
            .create_session(Arc::new(LoopbackTransport::unpaired()))
            .unwrap_err();
        assert!(matches!(err, WebRTCError::InvalidParameter(_)));

        assert!(manager.close_session(first.handle()));
        assert!(first.is_closed());
        assert!(!manager.close_session(first.handle()));
        assert!(manager.create_session(Arc::new(LoopbackTransport::unpaired())).is_ok());
    }

    #[tokio::test]
    async fn test_lookup_by_handle_and_id() {
        let manager = manager(4);
        let session = manager.create_session(Arc::new(LoopbackTransport::unpaired())).unwrap();

        assert!(Arc::ptr_eq(&manager.get(session.handle()).unwrap(), &session));
        assert!(Arc::ptr_eq(&manager.find(session.id()).unwrap(), &session));
        assert!(matches!(manager.get(HandleId::next()), Err(WebRTCError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_signaling_round_trip() {
        let manager = manager(4);
        let (ta, tb) = LoopbackTransport::pair();
        let a = manager.create_session(Arc::new(ta)).unwrap();
        let b = manager.create_session(Arc::new(tb)).unwrap();
        a.add_transceiver(MediaKind::Audio, crate::webrtc::TransceiverDirection::SendRecv)
            .unwrap();

        let offer = a.create_offer(OfferOptions::default()).await.unwrap();
        a.set_local_description(Some(offer.clone())).await.unwrap();
        let wire = SignalingMessage::description(&offer, Some(a.id().to_string()))
            .to_json()
            .unwrap();

        let reply = manager
            .handle_signaling(b.handle(), SignalingMessage::from_json(&wire).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.session_id(), Some(b.id()));
        manager.handle_signaling(a.handle(), reply).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_close_message_unregisters() {
        let manager = manager(4);
        let session = manager.create_session(Arc::new(LoopbackTransport::unpaired())).unwrap();
        let close = SignalingMessage::Close {
            session_id: session.id().to_string(),
            reason: Some("bye".to_string()),
        };
        manager.handle_signaling(session.handle(), close).await.unwrap();
        assert_eq!(manager.session_count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_cleanup_drops_closed_sessions() {
        let manager = manager(4);
        let live = manager.create_session(Arc::new(LoopbackTransport::unpaired())).unwrap();
        let dead = manager.create_session(Arc::new(LoopbackTransport::unpaired())).unwrap();
        dead.close();

        assert_eq!(manager.cleanup_stale_sessions(), 1);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.get(live.handle()).is_ok());
    }

    #[tokio::test]
    async fn test_flush_loop_drains_media() {
        let manager = manager(4);
        let (ta, tb) = LoopbackTransport::pair();
        let a = manager.create_session(Arc::new(ta)).unwrap();
        let b = manager.create_session(Arc::new(tb)).unwrap();
        let sender = a.add_track(MediaTrack::new_local(MediaKind::Video, "cam")).unwrap();

        let offer = a.create_offer(OfferOptions::default()).await.unwrap();
        a.set_local_description(Some(offer.clone())).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        b.set_local_description(None).await.unwrap();
        a.set_remote_description(b.current_local_description().unwrap())
            .await
            .unwrap();

        sender.write_frame(vec![1u8; 64]).unwrap();
        sender.write_frame(vec![2u8; 64]).unwrap();
        assert_eq!(a.queued_media(), 2);

        manager.start_flush_loop();
        tokio::time::timeout(Duration::from_secs(2), async {
            while a.queued_media() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(manager.shutdown(), 2);
        assert_eq!(manager.session_count(), 0);
        assert!(a.is_closed() && b.is_closed());
    }
}
