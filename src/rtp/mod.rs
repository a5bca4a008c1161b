//! RTP payload handling for the ingest side
//!
//! The depacketizers undo the RFC 6184 (H.264) and RFC 7798 (H.265) payload
//! formats, yielding raw NAL units; [`AccessUnitAssembler`] groups them into
//! access units on RTP timestamp change or marker bit.

pub mod h264;
pub mod h265;

use std::time::Duration;

use bytes::Bytes;

use crate::nal::{AccessUnit, VideoCodec};

pub use h264::H264Depacketizer;
pub use h265::H265Depacketizer;

/// Minimum length of a valid RTP packet (fixed header)
pub const RTP_HEADER_LEN: usize = 12;

/// Quick validation used before handing a datagram to the full parser:
/// version must be 2 and the fixed header must be present.
pub fn is_valid_rtp(datagram: &[u8]) -> bool {
    datagram.len() >= RTP_HEADER_LEN && (datagram[0] >> 6) == 2
}

/// Payload type of a raw datagram (only meaningful after [`is_valid_rtp`])
pub fn payload_type(datagram: &[u8]) -> u8 {
    datagram[1] & 0x7f
}

/// Groups depacketized NAL units into access units.
///
/// All NALs sharing one RTP timestamp form a single access unit; a boundary
/// is declared when the timestamp changes or the marker bit is set.
#[derive(Debug)]
pub struct AccessUnitAssembler {
    timestamp: Option<u32>,
    pending: Vec<Bytes>,
    duration: Duration,
}

impl AccessUnitAssembler {
    pub fn new(duration: Duration) -> Self {
        Self {
            timestamp: None,
            pending: Vec::new(),
            duration,
        }
    }

    /// Feed the NALs of one RTP packet. Returns zero, one or two complete
    /// access units (two when a timestamp change and a marker coincide).
    pub fn push(&mut self, nals: Vec<Bytes>, timestamp: u32, marker: bool) -> Vec<AccessUnit> {
        let mut complete = Vec::new();

        if self.timestamp.is_some_and(|ts| ts != timestamp) && !self.pending.is_empty() {
            complete.push(AccessUnit::new(
                std::mem::take(&mut self.pending),
                self.duration,
            ));
        }

        self.timestamp = Some(timestamp);
        self.pending.extend(nals);

        if marker && !self.pending.is_empty() {
            complete.push(AccessUnit::new(
                std::mem::take(&mut self.pending),
                self.duration,
            ));
            self.timestamp = None;
        }

        complete
    }
}

/// Codec-dispatching depacketizer plus access-unit assembly, the full
/// packet-to-access-unit path shared by every RTP ingester.
#[derive(Debug)]
pub struct Depacketizer {
    inner: CodecDepacketizer,
    assembler: AccessUnitAssembler,
}

#[derive(Debug)]
enum CodecDepacketizer {
    H264(H264Depacketizer),
    H265(H265Depacketizer),
}

impl Depacketizer {
    pub fn new(codec: VideoCodec, duration: Duration) -> Self {
        let inner = match codec {
            VideoCodec::H264 => CodecDepacketizer::H264(H264Depacketizer::default()),
            VideoCodec::H265 => CodecDepacketizer::H265(H265Depacketizer::default()),
        };
        Self {
            inner,
            assembler: AccessUnitAssembler::new(duration),
        }
    }

    /// Validate and parse one raw datagram, then depacketize it.
    ///
    /// Malformed packets (bad version, truncated, undecodable header) are
    /// dropped with a debug log, per the packet-granularity error policy.
    pub fn push_datagram(&mut self, datagram: &[u8]) -> Vec<AccessUnit> {
        use webrtc::util::Unmarshal;

        if !is_valid_rtp(datagram) {
            tracing::debug!("dropping malformed RTP datagram ({} bytes)", datagram.len());
            return Vec::new();
        }

        let mut cursor = datagram;
        match rtp::packet::Packet::unmarshal(&mut cursor) {
            Ok(packet) => self.push(&packet),
            Err(e) => {
                tracing::debug!("dropping undecodable RTP packet: {}", e);
                Vec::new()
            }
        }
    }

    /// Process one parsed RTP packet; returns completed access units.
    pub fn push(&mut self, packet: &rtp::packet::Packet) -> Vec<AccessUnit> {
        let header = &packet.header;
        let nals = match &mut self.inner {
            CodecDepacketizer::H264(d) => {
                d.depacketize(&packet.payload, header.sequence_number, header.marker)
            }
            CodecDepacketizer::H265(d) => {
                d.depacketize(&packet.payload, header.sequence_number, header.marker)
            }
        };

        if nals.is_empty() && !header.marker {
            return Vec::new();
        }

        self.assembler.push(nals, header.timestamp, header.marker)
    }
}
