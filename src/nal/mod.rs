//! NAL unit model shared by every stage of the pipeline
//!
//! Ingesters produce [`AccessUnit`]s of raw NAL units (no start codes);
//! the hub prepends the Annex-B start code on delivery.

pub mod annexb;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// The 4-byte Annex-B start code prepended to every delivered NAL unit
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Default presentation duration when the source advertises no frame rate
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// Video codec carried by a stream or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC
    H264,
    /// H.265/HEVC
    H265,
}

impl VideoCodec {
    /// MIME type for SDP codec registration
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::H265 => "video/H265",
        }
    }

    /// RTP clock rate (90 kHz for video)
    pub fn clock_rate(&self) -> u32 {
        90_000
    }

    /// RTP payload type offered to WebRTC peers
    pub fn payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::H265 => 97,
        }
    }

    /// SDP fmtp parameters for the offered payload
    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::H265 => "profile-id=1",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::H265 => write!(f, "h265"),
        }
    }
}

/// One coded picture: the NAL units sharing a single RTP timestamp
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Raw NAL units in decode order, without start codes
    pub nals: Vec<Bytes>,
    /// Presentation duration hint for downstream pacing
    pub duration: Duration,
}

impl AccessUnit {
    pub fn new(nals: Vec<Bytes>, duration: Duration) -> Self {
        Self { nals, duration }
    }

    /// Single-NAL access unit, the shape produced by byte-stream framing
    pub fn single(nal: Bytes, duration: Duration) -> Self {
        Self {
            nals: vec![nal],
            duration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nals.iter().all(|n| n.is_empty())
    }

    /// Whether any contained NAL is a random access point for `codec`
    pub fn is_keyframe(&self, codec: VideoCodec) -> bool {
        self.nals.iter().any(|nal| is_keyframe_nal(nal, codec))
    }
}

/// H.264 NAL unit type (low 5 bits of the header byte)
pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// H.265 NAL unit type (bits 1-6 of the first header byte)
pub fn h265_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

/// Whether a NAL unit starts a decodable random access point
pub fn is_keyframe_nal(nal: &[u8], codec: VideoCodec) -> bool {
    match codec {
        VideoCodec::H264 => h264_nal_type(nal) == Some(5),
        // BLA/IDR/CRA range of RFC 7798
        VideoCodec::H265 => matches!(h265_nal_type(nal), Some(16..=21)),
    }
}

/// Whether a NAL unit is a parameter set (VPS/SPS/PPS)
pub fn is_parameter_set_nal(nal: &[u8], codec: VideoCodec) -> bool {
    match codec {
        VideoCodec::H264 => matches!(h264_nal_type(nal), Some(7) | Some(8)),
        VideoCodec::H265 => matches!(h265_nal_type(nal), Some(32..=34)),
    }
}

/// Prefix a raw NAL unit with the 4-byte Annex-B start code
pub fn annexb_prefixed(nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(START_CODE.len() + nal.len());
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(nal);
    out.freeze()
}

/// Envelope label of the WebSocket NAL mode, derived from the H.264 NAL type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    Sps,
    Pps,
    Key,
    Delta,
}

impl NalKind {
    pub fn classify_h264(nal: &[u8]) -> Self {
        match h264_nal_type(nal) {
            Some(7) => NalKind::Sps,
            Some(8) => NalKind::Pps,
            Some(5) => NalKind::Key,
            _ => NalKind::Delta,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NalKind::Sps => "sps",
            NalKind::Pps => "pps",
            NalKind::Key => "key",
            NalKind::Delta => "delta",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_properties() {
        assert_eq!(VideoCodec::H264.mime_type(), "video/H264");
        assert_eq!(VideoCodec::H265.mime_type(), "video/H265");
        assert_eq!(VideoCodec::H264.payload_type(), 96);
        assert_eq!(VideoCodec::H265.payload_type(), 97);
        assert_eq!(VideoCodec::H264.clock_rate(), 90_000);
        assert!(VideoCodec::H264.sdp_fmtp().contains("profile-level-id=42e01f"));
        assert!(VideoCodec::H264.sdp_fmtp().contains("packetization-mode=1"));
        assert!(VideoCodec::H265.sdp_fmtp().contains("profile-id=1"));
    }

    #[test]
    fn nal_type_extraction() {
        // H.264: 0x65 = IDR (type 5), 0x67 = SPS (7), 0x68 = PPS (8)
        assert_eq!(h264_nal_type(&[0x65]), Some(5));
        assert_eq!(h264_nal_type(&[0x67]), Some(7));
        assert_eq!(h264_nal_type(&[0x68]), Some(8));
        // H.265: 0x40 = VPS (32), 0x42 = SPS (33), 0x44 = PPS (34), 0x26 = IDR_W_RADL (19)
        assert_eq!(h265_nal_type(&[0x40, 0x01]), Some(32));
        assert_eq!(h265_nal_type(&[0x42, 0x01]), Some(33));
        assert_eq!(h265_nal_type(&[0x44, 0x01]), Some(34));
        assert_eq!(h265_nal_type(&[0x26, 0x01]), Some(19));
    }

    #[test]
    fn keyframe_detection() {
        assert!(is_keyframe_nal(&[0x65], VideoCodec::H264));
        assert!(!is_keyframe_nal(&[0x41], VideoCodec::H264));
        assert!(is_keyframe_nal(&[0x26, 0x01], VideoCodec::H265));
        assert!(is_keyframe_nal(&[0x28, 0x01], VideoCodec::H265)); // IDR_N_LP (20)
        assert!(!is_keyframe_nal(&[0x02, 0x01], VideoCodec::H265));
    }

    #[test]
    fn access_unit_keyframe_flag() {
        let au = AccessUnit::new(
            vec![Bytes::from_static(&[0x67, 0x42]), Bytes::from_static(&[0x65, 0x00])],
            DEFAULT_FRAME_DURATION,
        );
        assert!(au.is_keyframe(VideoCodec::H264));
        assert!(!au.is_keyframe(VideoCodec::H265));
    }

    #[test]
    fn annexb_prefix() {
        let out = annexb_prefixed(&[0x65, 0xaa]);
        assert_eq!(out.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x65, 0xaa]);
    }

    #[test]
    fn nal_kind_classification() {
        assert_eq!(NalKind::classify_h264(&[0x67]), NalKind::Sps);
        assert_eq!(NalKind::classify_h264(&[0x68]), NalKind::Pps);
        assert_eq!(NalKind::classify_h264(&[0x65]), NalKind::Key);
        assert_eq!(NalKind::classify_h264(&[0x41]), NalKind::Delta);
        assert_eq!(NalKind::Key.as_str(), "key");
    }
}
