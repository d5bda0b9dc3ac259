//! Codec catalog
//!
//! Builds the set of codecs the relay negotiates. Payload types are fixed per
//! codec/profile so the generated SDP is identical across restarts.

use std::collections::HashSet;
use std::fmt;

use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::{PayloadType, RTCPFeedback};

pub const MIME_TYPE_RTX: &str = "video/rtx";

const VIDEO_CLOCK_RATE: u32 = 90000;

/// Codec families the relay can be configured to accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SupportedCodec {
    Opus,
    Vp8,
    Vp9,
    H264,
}

impl SupportedCodec {
    /// All codec families, in SDP preference order
    pub const ALL: [SupportedCodec; 4] = [
        SupportedCodec::Opus,
        SupportedCodec::Vp8,
        SupportedCodec::Vp9,
        SupportedCodec::H264,
    ];

    /// Environment flag whose presence enables this codec
    pub fn env_var(self) -> &'static str {
        match self {
            SupportedCodec::Opus => "SUPPORT_OPUS",
            SupportedCodec::Vp8 => "SUPPORT_VP8",
            SupportedCodec::Vp9 => "SUPPORT_VP9",
            SupportedCodec::H264 => "SUPPORT_H264",
        }
    }
}

impl fmt::Display for SupportedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupportedCodec::Opus => "opus",
            SupportedCodec::Vp8 => "vp8",
            SupportedCodec::Vp9 => "vp9",
            SupportedCodec::H264 => "h264",
        };
        f.write_str(name)
    }
}

/// A codec as registered with the media engine: its media kind plus the
/// negotiated RTP parameters (MIME type, clock rate, channels, fmtp,
/// feedback and payload type).
#[derive(Debug, Clone)]
pub struct CodecInfo {
    pub kind: RTPCodecType,
    pub parameters: RTCRtpCodecParameters,
}

impl CodecInfo {
    pub fn new(kind: RTPCodecType, parameters: RTCRtpCodecParameters) -> Self {
        Self { kind, parameters }
    }

    pub fn mime_type(&self) -> &str {
        &self.parameters.capability.mime_type
    }

    pub fn payload_type(&self) -> PayloadType {
        self.parameters.payload_type
    }

    pub fn is_rtx(&self) -> bool {
        self.mime_type().eq_ignore_ascii_case(MIME_TYPE_RTX)
    }
}

/// One row of the video payload-type table
struct VideoProfile {
    mime_type: &'static str,
    sdp_fmtp_line: &'static str,
    payload_type: PayloadType,
    rtx_payload_type: PayloadType,
}

const VP8_PROFILES: &[VideoProfile] = &[VideoProfile {
    mime_type: MIME_TYPE_VP8,
    sdp_fmtp_line: "",
    payload_type: 96,
    rtx_payload_type: 97,
}];

const VP9_PROFILES: &[VideoProfile] = &[
    VideoProfile {
        mime_type: MIME_TYPE_VP9,
        sdp_fmtp_line: "profile-id=0",
        payload_type: 98,
        rtx_payload_type: 99,
    },
    VideoProfile {
        mime_type: MIME_TYPE_VP9,
        sdp_fmtp_line: "profile-id=1",
        payload_type: 100,
        rtx_payload_type: 101,
    },
];

const H264_PROFILES: &[VideoProfile] = &[
    // Constrained baseline, level 3.1
    VideoProfile {
        mime_type: MIME_TYPE_H264,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
        payload_type: 102,
        rtx_payload_type: 121,
    },
    VideoProfile {
        mime_type: MIME_TYPE_H264,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f",
        payload_type: 127,
        rtx_payload_type: 120,
    },
    // Baseline, level 3.1
    VideoProfile {
        mime_type: MIME_TYPE_H264,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        payload_type: 125,
        rtx_payload_type: 107,
    },
    VideoProfile {
        mime_type: MIME_TYPE_H264,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
        payload_type: 108,
        rtx_payload_type: 109,
    },
    // High, level 5
    VideoProfile {
        mime_type: MIME_TYPE_H264,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032",
        payload_type: 123,
        rtx_payload_type: 118,
    },
];

fn opus() -> CodecInfo {
    CodecInfo::new(
        RTPCodecType::Audio,
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
    )
}

/// Feedback advertised on every primary video codec
pub fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn video_codecs(profiles: &[VideoProfile], out: &mut Vec<CodecInfo>) {
    for profile in profiles {
        out.push(CodecInfo::new(
            RTPCodecType::Video,
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: profile.mime_type.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: profile.sdp_fmtp_line.to_string(),
                    rtcp_feedback: video_rtcp_feedback(),
                },
                payload_type: profile.payload_type,
                ..Default::default()
            },
        ));
        out.push(CodecInfo::new(
            RTPCodecType::Video,
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_RTX.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: format!("apt={}", profile.payload_type),
                    rtcp_feedback: vec![],
                },
                payload_type: profile.rtx_payload_type,
                ..Default::default()
            },
        ));
    }
}

/// Build the ingest catalog for the enabled codec families.
///
/// The result is always ordered Opus, VP8, VP9, H.264 no matter how
/// `enabled` is ordered; that order is the SDP preference order.
pub fn build_codecs(enabled: &[SupportedCodec]) -> Vec<CodecInfo> {
    let mut codecs = Vec::new();

    for codec in SupportedCodec::ALL {
        if !enabled.contains(&codec) {
            continue;
        }
        match codec {
            SupportedCodec::Opus => codecs.push(opus()),
            SupportedCodec::Vp8 => video_codecs(VP8_PROFILES, &mut codecs),
            SupportedCodec::Vp9 => video_codecs(VP9_PROFILES, &mut codecs),
            SupportedCodec::H264 => video_codecs(H264_PROFILES, &mut codecs),
        }
    }

    codecs
}

/// Build the egress catalog from the codecs of a stream's published tracks.
///
/// A subscriber is only ever offered what the publisher sent, so this keeps
/// exactly those codecs, once per payload type, in track order.
pub fn codecs_from_tracks<'a, I>(tracks: I) -> Vec<CodecInfo>
where
    I: IntoIterator<Item = &'a CodecInfo>,
{
    let mut seen = HashSet::new();
    tracks
        .into_iter()
        .filter(|codec| seen.insert(codec.payload_type()))
        .cloned()
        .collect()
}
