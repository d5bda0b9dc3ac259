//! Track Router for RTP forwarding
//!
//! Routes RTP packets from one publisher track into its fan-out sink, and
//! keeps asking the publisher for keyframes while it does so.
//! Uses TrackLocalStaticRTP as the sink so packets are forwarded verbatim,
//! preserving the publisher's packetization.

use super::stream::StreamEntry;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

pub type FeedbackPackets = [Box<dyn RtcpPacket + Send + Sync>];

/// Where a relay reads packets from
#[async_trait]
pub trait RtpSource: Send + Sync {
    fn ssrc(&self) -> u32;

    async fn read_packet(&self) -> Result<Packet>;
}

/// Where a relay writes packets to
#[async_trait]
pub trait RtpSink: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<()>;
}

/// Upstream RTCP channel towards the publisher
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn send_feedback(&self, packets: &FeedbackPackets) -> Result<()>;
}

#[async_trait]
impl RtpSource for TrackRemote {
    fn ssrc(&self) -> u32 {
        TrackRemote::ssrc(self)
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _attributes) = self.read_rtp().await?;
        Ok(packet)
    }
}

#[async_trait]
impl RtpSink for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.write_rtp(packet).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedbackSink for RTCPeerConnection {
    async fn send_feedback(&self, packets: &FeedbackPackets) -> Result<()> {
        self.write_rtcp(packets).await?;
        Ok(())
    }
}

/// Timing of the upstream feedback a relay emits
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub feedback_interval: Duration,
    /// REMB bitrate in bits per second; no REMB is sent when unset
    pub remb_bitrate: Option<u64>,
}

/// Why a forwarding loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The session (or the router) was cancelled
    Cancelled,
    /// Reading from the publisher failed; the track is over
    SourceEnded,
}

/// Sink errors are logged once, then once per this many failures
const SINK_ERROR_LOG_EVERY: u64 = 100;

/// Routes RTP packets from a source track into one fan-out sink
pub struct TrackRouter {
    /// Published track this router feeds (removed from `entry` on exit)
    track_id: Uuid,
    kind: RTPCodecType,
    entry: Arc<StreamEntry>,
    source: Arc<dyn RtpSource>,
    sink: Arc<dyn RtpSink>,
    feedback: Arc<dyn FeedbackSink>,
    config: RelayConfig,
    cancel: CancellationToken,
}

impl TrackRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track_id: Uuid,
        kind: RTPCodecType,
        entry: Arc<StreamEntry>,
        source: Arc<dyn RtpSource>,
        sink: Arc<dyn RtpSink>,
        feedback: Arc<dyn FeedbackSink>,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            track_id,
            kind,
            entry,
            source,
            sink,
            feedback,
            config,
            cancel,
        }
    }

    pub fn track_id(&self) -> Uuid {
        self.track_id
    }

    /// Stop forwarding and feedback
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the relay until the source ends or the router is cancelled, then
    /// prune the track from its stream.
    pub async fn run(self: Arc<Self>) -> RelayExit {
        tracing::info!(
            "Starting RTP forwarding for {:?} track {} (ssrc {}) on stream {}",
            self.kind,
            self.track_id,
            self.source.ssrc(),
            self.entry.stream_id()
        );

        // PLI/REMB only make sense for video
        let feedback = (self.kind == RTPCodecType::Video)
            .then(|| tokio::spawn(self.clone().run_feedback()));

        let exit = self.forward().await;

        self.cancel.cancel();
        if self.entry.remove_track(self.track_id).await {
            tracing::info!(
                "Removed track {} from stream {}",
                self.track_id,
                self.entry.stream_id()
            );
        }

        if let Some(handle) = feedback {
            let _ = handle.await;
        }

        exit
    }

    async fn forward(&self) -> RelayExit {
        let mut packet_count = 0u64;
        let mut sink_errors = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("Track router {} stopped after {} packets", self.track_id, packet_count);
                    return RelayExit::Cancelled;
                }
                read = self.source.read_packet() => read,
            };

            let packet = match read {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::info!(
                        "Source track {} ended after {} packets: {}",
                        self.track_id,
                        packet_count,
                        e
                    );
                    return RelayExit::SourceEnded;
                }
            };

            packet_count += 1;
            if packet_count == 1 {
                tracing::info!(
                    "Track {} ready - received first RTP packet (payload: {} bytes)",
                    self.track_id,
                    packet.payload.len()
                );
            } else if packet_count % 1000 == 0 {
                tracing::trace!(
                    "Forwarded {} packets on track {} (seq: {}, ts: {})",
                    packet_count,
                    self.track_id,
                    packet.header.sequence_number,
                    packet.header.timestamp
                );
            }

            // The fan-out sink still delivers to healthy subscribers when
            // one of them fails, so a write error never ends the track
            if let Err(e) = self.sink.write_packet(&packet).await {
                sink_errors += 1;
                if sink_errors % SINK_ERROR_LOG_EVERY == 1 {
                    tracing::warn!(
                        "Failed to forward RTP on track {} ({} errors so far): {}",
                        self.track_id,
                        sink_errors,
                        e
                    );
                }
            }
        }
    }

    fn feedback_packets(&self) -> Vec<Box<dyn RtcpPacket + Send + Sync>> {
        let ssrc = self.source.ssrc();
        let mut packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(
            PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc,
            },
        )];

        if let Some(bitrate) = self.config.remb_bitrate {
            packets.push(Box::new(ReceiverEstimatedMaximumBitrate {
                sender_ssrc: 0,
                bitrate: bitrate as f32,
                ssrcs: vec![ssrc],
            }));
        }

        packets
    }

    async fn run_feedback(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.feedback_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full period before asking
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let packets = self.feedback_packets();
            if let Err(e) = self.feedback.send_feedback(&packets).await {
                tracing::warn!("RTCP feedback error on track {}: {}", self.track_id, e);
            }
        }
    }
}
