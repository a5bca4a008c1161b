//! H.265 RTP depacketizer (RFC 7798)
//!
//! Single NAL unit packets (types 0-47), Aggregation Packets (type 48) and
//! Fragmentation Units (type 49). PACI (type 50) is not supported.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

/// H.265 NAL unit header length
const NAL_HEADER_LEN: usize = 2;

#[derive(Debug)]
struct FragmentState {
    /// Reconstructed 2-byte NAL header
    header: [u8; 2],
    buf: BytesMut,
    last_seq: u16,
}

/// Stateful H.265 depacketizer; one instance per RTP stream.
#[derive(Debug, Default)]
pub struct H265Depacketizer {
    fragment: Option<FragmentState>,
}

impl H265Depacketizer {
    /// Extract the NAL units carried by one RTP payload.
    pub fn depacketize(&mut self, payload: &[u8], seq: u16, marker: bool) -> Vec<Bytes> {
        if payload.len() < NAL_HEADER_LEN {
            return Vec::new();
        }

        let nal_type = (payload[0] >> 1) & 0x3f;
        match nal_type {
            NAL_TYPE_AP => {
                if self.fragment.take().is_some() {
                    debug!("h265: dropping partial FU, interrupted by AP");
                }
                parse_ap(&payload[NAL_HEADER_LEN..])
            }
            NAL_TYPE_FU => self.parse_fu(payload, seq, marker),
            0..=47 => {
                if self.fragment.take().is_some() {
                    debug!("h265: dropping partial FU, interrupted by single NAL");
                }
                vec![Bytes::copy_from_slice(payload)]
            }
            other => {
                debug!("h265: unsupported payload structure type {}", other);
                Vec::new()
            }
        }
    }

    fn parse_fu(&mut self, payload: &[u8], seq: u16, marker: bool) -> Vec<Bytes> {
        if payload.len() < 3 {
            return Vec::new();
        }

        let fu_header = payload[2];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let fu_type = fu_header & 0x3f;

        if start {
            // Rebuild the original header: F bit and LayerId MSB from the
            // payload header, type from the FU header, byte 1 unchanged.
            let header = [(payload[0] & 0x81) | (fu_type << 1), payload[1]];
            let mut buf = BytesMut::with_capacity(payload.len());
            buf.put_u8(header[0]);
            buf.put_u8(header[1]);
            buf.extend_from_slice(&payload[3..]);
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
                            "h265: sequence gap during FU ({} -> {}), discarding fragment",
                            state.last_seq, seq
                        );
                        self.fragment = None;
                        return Vec::new();
                    }
                    state.last_seq = seq;
                    state.buf.extend_from_slice(&payload[3..]);
                }
                None => {
                    debug!("h265: FU continuation without start, dropping");
                    return Vec::new();
                }
            }
        }

        if end || marker {
            if let Some(state) = self.fragment.take() {
                debug_assert_eq!(&state.buf[..2], &state.header[..]);
                return vec![state.buf.freeze()];
            }
        }

        Vec::new()
    }
}

/// Split an Aggregation Packet body (after the 2-byte payload header) by
/// its 16-bit length prefixes.
fn parse_ap(mut payload: &[u8]) -> Vec<Bytes> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_nal() {
        let mut d = H265Depacketizer::default();
        // IDR_W_RADL (type 19): header 0x26 0x01
        let nals = d.depacketize(&[0x26, 0x01, 0xaa, 0xbb], 1, true);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].as_ref(), &[0x26, 0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn ap_splits_parameter_sets() {
        // AP header (type 48): 0x60 0x01, then VPS + SPS + PPS entries.
        let vps = [0x40, 0x01, 0x0c];
        let sps = [0x42, 0x01, 0x01, 0x60];
        let pps = [0x44, 0x01, 0xc0];

        let mut payload = vec![0x60, 0x01];
        for nal in [&vps[..], &sps[..], &pps[..]] {
            payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            payload.extend_from_slice(nal);
        }

        let mut d = H265Depacketizer::default();
        let nals = d.depacketize(&payload, 1, false);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0].as_ref(), &vps);
        assert_eq!(nals[1].as_ref(), &sps);
        assert_eq!(nals[2].as_ref(), &pps);
    }

    fn fu(orig_header: [u8; 2], fu_type: u8, start: bool, end: bool, data: &[u8]) -> Vec<u8> {
        let mut pkt = vec![
            (orig_header[0] & 0x81) | (NAL_TYPE_FU << 1),
            orig_header[1],
            (if start { 0x80 } else { 0 }) | (if end { 0x40 } else { 0 }) | fu_type,
        ];
        pkt.extend_from_slice(data);
        pkt
    }

    #[test]
    fn fu_reassembles_with_rebuilt_header() {
        // IDR_W_RADL: type 19, header 0x26 0x01.
        let mut d = H265Depacketizer::default();

        assert!(d.depacketize(&fu([0x26, 0x01], 19, true, false, &[0x11; 8]), 20, false).is_empty());
        assert!(d.depacketize(&fu([0x26, 0x01], 19, false, false, &[0x22; 8]), 21, false).is_empty());
        let nals = d.depacketize(&fu([0x26, 0x01], 19, false, true, &[0x33; 2]), 22, true);

        assert_eq!(nals.len(), 1);
        let mut expected = vec![0x26, 0x01];
        expected.extend_from_slice(&[0x11; 8]);
        expected.extend_from_slice(&[0x22; 8]);
        expected.extend_from_slice(&[0x33; 2]);
        assert_eq!(nals[0].as_ref(), expected.as_slice());
    }

    #[test]
    fn fu_sequence_gap_discards() {
        let mut d = H265Depacketizer::default();
        assert!(d.depacketize(&fu([0x26, 0x01], 19, true, false, &[0x11]), 5, false).is_empty());
        assert!(d.depacketize(&fu([0x26, 0x01], 19, false, true, &[0x33]), 7, true).is_empty());
    }

    #[test]
    fn fu_sequence_wraps_at_u16_boundary() {
        let mut d = H265Depacketizer::default();
        assert!(d.depacketize(&fu([0x02, 0x01], 1, true, false, &[0x11]), u16::MAX, false).is_empty());
        let nals = d.depacketize(&fu([0x02, 0x01], 1, false, true, &[0x22]), 0, true);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].as_ref(), &[0x02, 0x01, 0x11, 0x22]);
    }

    #[test]
    fn truncated_payload_dropped() {
        let mut d = H265Depacketizer::default();
        assert!(d.depacketize(&[0x62], 1, false).is_empty());
        assert!(d.depacketize(&[0x62, 0x01], 1, false).is_empty());
    }
}
