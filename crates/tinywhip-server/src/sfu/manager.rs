//! SFU manager
//!
//! Owns the stream and session registries and implements the WHIP/WHEP
//! operations on top of them: publish, subscribe, apply a late answer, and
//! tear a session down.

use super::session::{Session, SessionRegistry, SessionRole, SessionState};
use super::stream::{PublishedTrack, StreamEntry, StreamRegistry};
use super::track_router::{RelayConfig, TrackRouter};
use crate::error::{AppError, Result};
use crate::state::Config;
use crate::webrtc::{self as rtc, PeerConnectionFactory};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tinywhip_media::{build_codecs, codecs_from_tracks, CodecInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Result of a successful POST: the session and the local SDP to return
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub session_id: Uuid,
    pub sdp: String,
}

/// A remote track announced by the engine's on-track callback
struct IncomingTrack {
    track: Arc<TrackRemote>,
}

pub struct SfuManager {
    factory: PeerConnectionFactory,
    /// Codecs offered to publishers
    ingest_codecs: Vec<CodecInfo>,
    streams: StreamRegistry,
    sessions: SessionRegistry,
    relay_config: RelayConfig,
    gathering_timeout: Duration,
}

impl SfuManager {
    pub fn new(config: &Config) -> Self {
        let ingest_codecs = build_codecs(&config.codecs);
        tracing::info!(
            "Ingest codecs: {}",
            config
                .codecs
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            factory: PeerConnectionFactory::new(config),
            ingest_codecs,
            streams: StreamRegistry::new(),
            sessions: SessionRegistry::new(),
            relay_config: RelayConfig {
                feedback_interval: config.feedback_interval,
                remb_bitrate: config.remb_bitrate,
            },
            gathering_timeout: config.gathering_timeout,
        }
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// WHIP: accept a publisher for `stream_id`.
    ///
    /// Without an offer the server offers receive-only media and waits for
    /// the answer through [`SfuManager::apply_answer`].
    pub async fn publish(
        self: &Arc<Self>,
        stream_id: &str,
        offer: Option<String>,
    ) -> Result<Negotiated> {
        let peer_connection = self.factory.create(&self.ingest_codecs).await?;
        let session = Arc::new(Session::new(
            Uuid::new_v4(),
            stream_id.to_string(),
            SessionRole::Publisher,
            peer_connection.clone(),
        ));

        // Registered only once negotiation succeeds, so a rejected POST
        // never replaces a live publisher
        let entry = Arc::new(StreamEntry::new(stream_id.to_string(), session.id));

        // The callback only hands tracks over; the ingest task does the work
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracing::info!(
                "on_track fired: kind={}, id={}, ssrc={}",
                track.kind(),
                track.id(),
                track.ssrc()
            );
            if track_tx.send(IncomingTrack { track }).is_err() {
                tracing::debug!("Ingest task already stopped, dropping track");
            }
            Box::pin(async {})
        }));

        tokio::spawn(run_ingest(
            entry.clone(),
            peer_connection.clone(),
            track_rx,
            self.relay_config,
            session.cancel_token().clone(),
        ));

        self.watch_connection_state(&session);

        if offer.is_none() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                if !self.ingest_codecs.iter().any(|c| c.kind == kind) {
                    continue;
                }
                if let Err(e) = peer_connection
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                {
                    self.discard(&session).await;
                    return Err(e.into());
                }
            }
        }

        self.finish_negotiation(session, offer, Some(entry)).await
    }

    /// WHEP: attach a subscriber to every live track of `stream_id`.
    pub async fn subscribe(
        self: &Arc<Self>,
        stream_id: &str,
        offer: Option<String>,
    ) -> Result<Negotiated> {
        let entry = self.streams.get(stream_id).await?;
        let tracks = entry.tracks().await;
        if tracks.is_empty() {
            return Err(AppError::NotFound(format!(
                "Stream {} has no live tracks",
                stream_id
            )));
        }

        // Never offer a codec the publisher did not send
        let codecs = codecs_from_tracks(tracks.iter().map(|t| &t.codec));
        let peer_connection = self.factory.create(&codecs).await?;
        let session = Arc::new(
            Session::new(
                Uuid::new_v4(),
                stream_id.to_string(),
                SessionRole::Subscriber,
                peer_connection.clone(),
            )
            .with_upstream(entry.publisher()),
        );

        self.watch_connection_state(&session);

        for track in &tracks {
            if let Err(e) = self.attach_track(&session, track).await {
                self.discard(&session).await;
                return Err(e);
            }
        }

        tracing::info!(
            "Subscriber session {} attached to {} tracks of stream {}",
            session.id,
            tracks.len(),
            stream_id
        );

        self.finish_negotiation(session, offer, None).await
    }

    /// PATCH: complete a server-offered negotiation with the remote answer.
    pub async fn apply_answer(&self, session_id: Uuid, sdp: String) -> Result<()> {
        let session = self.sessions.get(session_id).await?;
        rtc::apply_answer(&session.peer_connection, sdp).await?;
        tracing::info!("Applied remote answer to session {}", session_id);
        Ok(())
    }

    /// DELETE: close the peer connection, then forget the session.
    ///
    /// Closing a publisher also closes every subscriber it was feeding.
    pub async fn close_session(&self, session_id: Uuid) -> Result<()> {
        let session = self.sessions.get(session_id).await?;

        session.close().await;
        self.sessions.remove(session_id).await;

        if session.role == SessionRole::Publisher {
            self.streams.unpublish(&session.stream_id, session.id).await;

            for subscriber in self.sessions.subscribers_of(session.id).await {
                subscriber.close().await;
                self.sessions.remove(subscriber.id).await;
                tracing::info!(
                    "Closed subscriber session {} after publisher {} left stream {}",
                    subscriber.id,
                    session.id,
                    session.stream_id
                );
            }
        }

        Ok(())
    }

    async fn attach_track(&self, session: &Session, track: &PublishedTrack) -> Result<()> {
        let local_track: Arc<dyn TrackLocal + Send + Sync> = track.local_track.clone();
        let transceiver = session
            .peer_connection
            .add_transceiver_from_track(
                local_track,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;

        let sender = transceiver.sender().await;
        tokio::spawn(drain_rtcp(sender, session.cancel_token().clone()));

        tracing::debug!(
            "Attached track {} ({}) to session {}",
            track.id,
            track.codec.mime_type(),
            session.id
        );
        Ok(())
    }

    /// Negotiate, then register the session (and a publisher's entry).
    async fn finish_negotiation(
        &self,
        session: Arc<Session>,
        offer: Option<String>,
        entry: Option<Arc<StreamEntry>>,
    ) -> Result<Negotiated> {
        session.set_state(SessionState::Negotiating).await;

        match rtc::negotiate(&session.peer_connection, offer, self.gathering_timeout).await {
            Ok(sdp) => {
                if let Some(entry) = entry {
                    self.streams.publish(entry).await;
                }
                self.sessions.insert(session.clone()).await;
                tracing::info!(
                    "Created {} session {} for stream {}",
                    session.role,
                    session.id,
                    session.stream_id
                );
                Ok(Negotiated {
                    session_id: session.id,
                    sdp,
                })
            }
            Err(e) => {
                self.discard(&session).await;
                Err(e)
            }
        }
    }

    /// Tear down a session that never made it into the registries
    async fn discard(&self, session: &Session) {
        session.close().await;
    }

    fn watch_connection_state(self: &Arc<Self>, session: &Arc<Session>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let session_ref = Arc::downgrade(session);
        let session_id = session.id;

        session
            .peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let manager = manager.clone();
                let session_ref = session_ref.clone();

                Box::pin(async move {
                    tracing::info!("Session {} connection state: {}", session_id, state);

                    match state {
                        RTCPeerConnectionState::Connected => {
                            if let Some(session) = session_ref.upgrade() {
                                session.set_state(SessionState::Connected).await;
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            let Some(manager) = manager.upgrade() else {
                                return;
                            };
                            // Off the engine's callback path: closing the
                            // connection from here would re-enter it
                            tokio::spawn(async move {
                                match manager.close_session(session_id).await {
                                    Ok(()) => tracing::info!(
                                        "Session {} torn down after transport {}",
                                        session_id,
                                        state
                                    ),
                                    Err(AppError::NotFound(_)) => {}
                                    Err(e) => tracing::warn!(
                                        "Failed to tear down session {}: {}",
                                        session_id,
                                        e
                                    ),
                                }
                            });
                        }
                        _ => {}
                    }
                })
            }));
    }
}

/// Single writer for a publisher's stream entry: turns announced remote
/// tracks into published tracks and starts a relay for each.
async fn run_ingest(
    entry: Arc<StreamEntry>,
    peer_connection: Arc<RTCPeerConnection>,
    mut tracks: mpsc::UnboundedReceiver<IncomingTrack>,
    relay_config: RelayConfig,
    cancel: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            incoming = tracks.recv() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let remote = incoming.track;
        let parameters = remote.codec();
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            parameters.capability.clone(),
            remote.id().to_string(),
            remote.stream_id().to_string(),
        ));
        let published = PublishedTrack::new(
            CodecInfo::new(remote.kind(), parameters),
            local_track.clone(),
        );

        tracing::info!(
            "Publishing {} track {} on stream {}",
            published.codec.mime_type(),
            published.id,
            entry.stream_id()
        );

        let router = Arc::new(TrackRouter::new(
            published.id,
            remote.kind(),
            entry.clone(),
            remote,
            local_track,
            peer_connection.clone(),
            relay_config,
            cancel.child_token(),
        ));
        entry.push(published).await;

        tokio::spawn(async move {
            let exit = router.clone().run().await;
            tracing::info!("Relay for track {} exited: {:?}", router.track_id(), exit);
        });
    }

    tracing::debug!("Ingest for stream {} stopped", entry.stream_id());
}

/// Read RTCP from a subscriber's sender so the interceptors (NACK responder,
/// receiver reports) see it.
async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = sender.read_rtcp() => {
                if read.is_err() {
                    break;
                }
            }
        }
    }
}
