//! H.264 RTP depacketizer (RFC 6184)
//!
//! Handles the three payload structures produced by common packetizers:
//! single NAL unit packets (types 1-23), STAP-A aggregation (type 24) and
//! FU-A fragmentation (type 28). Other aggregation/fragmentation variants
//! (STAP-B, MTAP, FU-B) are not interoperable targets here and are dropped.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// Reassembly state of an in-progress FU-A fragment sequence
#[derive(Debug)]
struct FragmentState {
    /// Reconstructed NAL header: FU indicator F/NRI bits + FU type bits
    header: u8,
    buf: BytesMut,
    last_seq: u16,
}

/// Stateful H.264 depacketizer; one instance per RTP stream.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    fragment: Option<FragmentState>,
}

impl H264Depacketizer {
    /// Extract the NAL units carried by one RTP payload.
    ///
    /// `seq` and `marker` come from the RTP header; a sequence gap while a
    /// fragmented unit is in flight discards the partial unit.
    pub fn depacketize(&mut self, payload: &[u8], seq: u16, marker: bool) -> Vec<Bytes> {
        if payload.is_empty() {
            return Vec::new();
        }

        let nal_type = payload[0] & 0x1f;
        match nal_type {
            1..=23 => {
                // A single NAL amid fragmentation implies the tail was lost.
                if self.fragment.take().is_some() {
                    debug!("h264: dropping partial FU-A, interrupted by single NAL");
                }
                vec![Bytes::copy_from_slice(payload)]
            }
            NAL_TYPE_STAP_A => {
                if self.fragment.take().is_some() {
                    debug!("h264: dropping partial FU-A, interrupted by STAP-A");
                }
                parse_stap_a(&payload[1..])
            }
            NAL_TYPE_FU_A => self.parse_fu_a(payload, seq, marker),
            other => {
                debug!("h264: unsupported payload structure type {}", other);
                Vec::new()
            }
        }
    }

    fn parse_fu_a(&mut self, payload: &[u8], seq: u16, marker: bool) -> Vec<Bytes> {
        if payload.len() < 2 {
            return Vec::new();
        }

        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let nal_type = fu_header & 0x1f;

        if start {
            // Original NAL header: F and NRI from the indicator, type from
            // the FU header.
            let header = (fu_indicator & 0xe0) | nal_type;
            let mut buf = BytesMut::with_capacity(payload.len());
            buf.put_u8(header);
            buf.extend_from_slice(&payload[2..]);
            self.fragment = Some(FragmentState {
                header,
                buf,
                last_seq: seq,
            });
        } else {
            match &mut self.fragment {
                Some(state) => {
                    if seq != state.last_seq.wrapping_add(1) {
                        debug!(
                            "h264: sequence gap during FU-A ({} -> {}), discarding fragment",
                            state.last_seq, seq
                        );
                        self.fragment = None;
                        return Vec::new();
                    }
                    state.last_seq = seq;
                    state.buf.extend_from_slice(&payload[2..]);
                }
                None => {
                    debug!("h264: FU-A continuation without start, dropping");
                    return Vec::new();
                }
            }
        }

        if end || marker {
            if let Some(state) = self.fragment.take() {
                debug_assert_eq!(state.buf[0], state.header);
                return vec![state.buf.freeze()];
            }
        }

        Vec::new()
    }
}

/// Split a STAP-A payload (after the STAP-A NAL header) by its 16-bit
/// length prefixes. A truncated trailing entry is dropped.
fn parse_stap_a(mut payload: &[u8]) -> Vec<Bytes> {
    let mut nals = Vec::new();

    while payload.len() >= 2 {
        let size = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        payload = &payload[2..];
        if size == 0 || size > payload.len() {
            break;
        }
        nals.push(Bytes::copy_from_slice(&payload[..size]));
        payload = &payload[size..];
    }

    nals
}
