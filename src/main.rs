//! rtc-session-core - loopback demo
//!
//! Pairs two sessions over the in-process transport, negotiates them through
//! JSON signaling messages, opens a DataChannel and exchanges messages.

mod args;

use args::Args;
use base64::Engine;
use clap::Parser;
use log::{debug, error, info, warn};
use rtc_session_core::config::Config;
use rtc_session_core::webrtc::loopback::LoopbackTransport;
use rtc_session_core::webrtc::signaling::SignalingParser;
use rtc_session_core::webrtc::transport::OfferOptions;
use rtc_session_core::webrtc::{
    ChannelMessage, EventStream, MediaKind, MediaTrack, PeerConnectionSession, SessionEvent, SignalingMessage,
};
use rtc_session_core::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        loaded
            .as_ref()
            .map(|cfg| cfg.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string())
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTC_SESSION_LOG").unwrap_or(log_level))
        .init();

    info!("rtc-session-core v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let manager = Arc::new(SessionManager::new(&config));
    manager.start_flush_loop();

    let (transport_a, transport_b) = LoopbackTransport::pair();
    let offerer = manager.create_session(Arc::new(transport_a))?;
    let answerer = manager.create_session(Arc::new(transport_b))?;
    let offerer_events = offerer.take_events().ok_or("offerer event stream already taken")?;
    let answerer_events = answerer.take_events().ok_or("answerer event stream already taken")?;

    let mic = offerer.add_track(MediaTrack::new_local(MediaKind::Audio, "demo-mic"))?;
    let channel = offerer.create_data_channel(&args.label, offerer.default_channel_init())?;

    // Offer/answer through the wire format
    let offer = offerer.create_offer(OfferOptions::default()).await?;
    offerer.set_local_description(Some(offer.clone())).await?;
    let wire = SignalingParser::format(&SignalingMessage::description(&offer, Some(offerer.id().to_string())))?;
    debug!("Offer on the wire: {} bytes", wire.len());

    let reply = manager
        .handle_signaling(answerer.handle(), SignalingParser::parse(&wire)?)
        .await?
        .ok_or("answerer produced no answer")?;
    let wire = SignalingParser::format(&reply)?;
    manager
        .handle_signaling(offerer.handle(), SignalingParser::parse(&wire)?)
        .await?;
    info!(
        "Negotiated: offerer {}, answerer {}",
        offerer.signaling_state(),
        answerer.signaling_state()
    );

    let (open_tx, open_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(forward_offerer_events(
        offerer_events,
        manager.clone(),
        answerer.clone(),
        open_tx,
    ));
    tokio::spawn(collect_answerer_events(answerer_events, args.messages, done_tx));

    tokio::time::timeout(Duration::from_secs(5), open_rx)
        .await
        .map_err(|_| "DataChannel did not open")??;

    for n in 0..args.messages {
        if args.binary {
            channel.send_binary(format!("frame-{}", n).into_bytes())?;
        } else {
            channel.send_text(&format!("message {}", n))?;
        }
        mic.write_frame(vec![0u8; 160])?;
    }

    match tokio::time::timeout(Duration::from_secs(5), done_rx).await {
        Ok(Ok(received)) => info!("Answerer received {} messages", received),
        _ => warn!("Timed out waiting for {} messages", args.messages),
    }

    if args.stats {
        for session in [&offerer, &answerer] {
            manager.flush_all();
            let report = session.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        }
    }

    channel.close();
    let closed = manager.shutdown();
    info!("Done ({} sessions closed)", closed);
    Ok(())
}

/// Trickle the offerer's candidates to the answerer and report channel open
async fn forward_offerer_events(
    mut events: EventStream,
    manager: Arc<SessionManager>,
    answerer: Arc<PeerConnectionSession>,
    open_tx: oneshot::Sender<()>,
) {
    let mut open_tx = Some(open_tx);
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::IceCandidate(candidate) if !candidate.is_end_of_candidates() => {
                let message = SignalingMessage::ice_candidate(candidate, Some(answerer.id().to_string()));
                if let Err(e) = manager.handle_signaling(answerer.handle(), message).await {
                    warn!("Candidate not applied: {}", e);
                }
            }
            SessionEvent::ChannelOpen { channel_id, label } => {
                info!("Channel '{}' ({}) open", label, channel_id);
                if let Some(tx) = open_tx.take() {
                    let _ = tx.send(());
                }
            }
            other => debug!("offerer: {}", other.name()),
        }
    }
}

async fn collect_answerer_events(mut events: EventStream, expected: usize, done_tx: oneshot::Sender<usize>) {
    let mut done_tx = Some(done_tx);
    let mut received = 0;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::DataChannel(channel) => info!("Peer opened channel '{}' ({})", channel.label(), channel.id()),
            SessionEvent::TrackAdded { track, .. } => info!("Remote {} track {}", track.kind(), track.id()),
            SessionEvent::ChannelMessage { message, .. } => {
                match &message {
                    ChannelMessage::Text(text) => info!("<- {}", text),
                    ChannelMessage::Binary(data) => {
                        info!("<- [{}]", base64::engine::general_purpose::STANDARD.encode(data))
                    }
                }
                received += 1;
                if received >= expected {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(received);
                    }
                }
            }
            other => debug!("answerer: {}", other.name()),
        }
    }
}
