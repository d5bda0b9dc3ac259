//! Peer connection factory
//!
//! The only place that talks to the WebRTC engine's construction and
//! negotiation APIs. Everything past negotiation (ICE, DTLS, SRTP) is left
//! to the engine.

use crate::error::{AppError, Result};
use crate::state::Config;
use std::sync::Arc;
use std::time::Duration;
use tinywhip_media::CodecInfo;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub struct PeerConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl PeerConnectionFactory {
    pub fn new(config: &Config) -> Self {
        let mut ice_servers = vec![];

        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Self { ice_servers }
    }

    /// Create a peer connection that negotiates exactly `codecs`.
    ///
    /// Codec order is SDP preference order. The default interceptors are
    /// required for NACK retransmission and RTCP reports to work.
    pub async fn create(&self, codecs: &[CodecInfo]) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        for codec in codecs {
            media_engine.register_codec(codec.parameters.clone(), codec.kind)?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        tracing::debug!("Created peer connection with {} codecs", codecs.len());

        Ok(peer_connection)
    }
}

/// Run one round of offer/answer and return the local SDP once ICE gathering
/// has finished.
///
/// With a remote offer the connection answers it; without one it produces its
/// own offer and expects the answer later through [`apply_answer`].
pub async fn negotiate(
    peer_connection: &RTCPeerConnection,
    remote_offer: Option<String>,
    gathering_timeout: Duration,
) -> Result<String> {
    let mut gather_complete = peer_connection.gathering_complete_promise().await;

    let local = match remote_offer {
        Some(sdp) => {
            let m_line_count = sdp.lines().filter(|l| l.starts_with("m=")).count();
            tracing::debug!("Processing SDP offer with {} m-lines", m_line_count);

            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| AppError::BadRequest(format!("Invalid SDP offer: {}", e)))?;
            peer_connection
                .set_remote_description(offer)
                .await
                .map_err(|e| {
                    AppError::Negotiation(format!("Failed to set remote description: {}", e))
                })?;

            peer_connection
                .create_answer(None)
                .await
                .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?
        }
        None => peer_connection
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?,
    };

    peer_connection
        .set_local_description(local)
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))?;

    if tokio::time::timeout(gathering_timeout, gather_complete.recv())
        .await
        .is_err()
    {
        tracing::warn!(
            "ICE gathering did not complete within {:?}, answering with partial candidates",
            gathering_timeout
        );
    }

    let description = peer_connection
        .local_description()
        .await
        .ok_or_else(|| AppError::Negotiation("No local description after negotiation".into()))?;

    let candidate_count = description.sdp.matches("a=candidate:").count();
    tracing::debug!("Local description ready with {} ICE candidates", candidate_count);

    Ok(description.sdp)
}

/// Complete a server-initiated negotiation with the remote answer.
pub async fn apply_answer(peer_connection: &RTCPeerConnection, sdp: String) -> Result<()> {
    let answer = RTCSessionDescription::answer(sdp)
        .map_err(|e| AppError::BadRequest(format!("Invalid SDP answer: {}", e)))?;

    peer_connection
        .set_remote_description(answer)
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
}
