//! Annex-B byte-stream framing
//!
//! Splits a stream of bytes into NAL units delimited by `00 00 00 01` or
//! `00 00 01` start codes. [`AnnexBSplitter`] is incremental (fed from a
//! subprocess stdout in arbitrary chunks); [`split_annex_b`] is the one-shot
//! variant for buffers already held in memory.

use bytes::{Bytes, BytesMut};

/// Find the next Annex-B start code at or after `from`.
///
/// Returns `(offset, start_code_len)`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if from >= data.len() {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            return Some((i, 4));
        }

        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, 3));
        }

        i += 1;
    }

    None
}

/// Split a complete Annex-B buffer into raw NAL units (no start codes).
///
/// Trailing zero bytes before the next start code are trimmed; they belong
/// to the start code, not the NAL.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut cursor = 0usize;

    while let Some((start, start_code_len)) = find_start_code(data, cursor) {
        let nal_start = start + start_code_len;
        if nal_start >= data.len() {
            break;
        }

        let next_start = find_start_code(data, nal_start)
            .map(|(idx, _)| idx)
            .unwrap_or(data.len());

        let mut nal_end = next_start;
        while nal_end > nal_start && data[nal_end - 1] == 0 {
            nal_end -= 1;
        }

        if nal_end > nal_start {
            nal_units.push(&data[nal_start..nal_end]);
        }

        cursor = next_start;
    }

    nal_units
}

/// Incremental Annex-B splitter.
///
/// A NAL unit is only emitted once the start code of the *next* unit has
/// been seen, so partially received units are never surfaced; `finish`
/// flushes the final unit at end of stream.
#[derive(Debug, Default)]
pub struct AnnexBSplitter {
    buf: BytesMut,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete NAL unit, if one is delimited in the buffer.
    pub fn next_nal(&mut self) -> Option<Bytes> {
        loop {
            let (start, code_len) = find_start_code(&self.buf, 0)?;
            let nal_start = start + code_len;
            let (next_start, _) = find_start_code(&self.buf, nal_start)?;

            let mut nal_end = next_start;
            while nal_end > nal_start && self.buf[nal_end - 1] == 0 {
                nal_end -= 1;
            }

            // Drop garbage before the first start code, keep the next unit's
            // start code in the buffer.
            let frame = self.buf.split_to(next_start);
            if nal_end > nal_start {
                return Some(Bytes::copy_from_slice(&frame[nal_start..nal_end]));
            }
            // Zero-length unit (back-to-back start codes): keep scanning.
        }
    }

    /// Flush the trailing NAL unit at end of stream.
    pub fn finish(&mut self) -> Option<Bytes> {
        let (start, code_len) = find_start_code(&self.buf, 0)?;
        let nal_start = start + code_len;

        let mut nal_end = self.buf.len();
        while nal_end > nal_start && self.buf[nal_end - 1] == 0 {
            nal_end -= 1;
        }

        let buf = std::mem::take(&mut self.buf);
        if nal_end > nal_start {
            Some(buf.freeze().slice(nal_start..nal_end))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb_encode(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn one_shot_round_trip() {
        let nals: Vec<&[u8]> = vec![&[0x67, 0x42, 0xe0], &[0x68, 0xce], &[0x65, 0x88, 0x80, 0x10]];
        let encoded = annexb_encode(&nals);
        assert_eq!(split_annex_b(&encoded), nals);
    }

    #[test]
    fn one_shot_short_start_codes() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 1, 0x67, 0x42]);
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xce]);
        assert_eq!(split_annex_b(&data), vec![&[0x67, 0x42][..], &[0x68, 0xce][..]]);
    }

    #[test]
    fn one_shot_ignores_leading_garbage() {
        let mut data = vec![0xff, 0x00];
        data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9a]);
        assert_eq!(split_annex_b(&data), vec![&[0x41, 0x9a][..]]);
    }

    #[test]
    fn incremental_round_trip() {
        let nals: Vec<&[u8]> = vec![&[0x67, 0x42, 0xe0, 0x1f], &[0x68, 0xce], &[0x65; 32], &[0x41; 7]];
        let encoded = annexb_encode(&nals);

        let mut splitter = AnnexBSplitter::new();
        let mut out = Vec::new();
        // Feed in deliberately awkward chunk sizes.
        for chunk in encoded.chunks(3) {
            splitter.push(chunk);
            while let Some(nal) = splitter.next_nal() {
                out.push(nal);
            }
        }
        if let Some(nal) = splitter.finish() {
            out.push(nal);
        }

        let expected: Vec<Bytes> = nals.iter().map(|n| Bytes::copy_from_slice(n)).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn incremental_holds_partial_unit() {
        let mut splitter = AnnexBSplitter::new();
        splitter.push(&[0, 0, 0, 1, 0x65, 0xaa, 0xbb]);
        // No next start code yet: nothing to emit.
        assert!(splitter.next_nal().is_none());

        splitter.push(&[0, 0, 0, 1, 0x41]);
        assert_eq!(splitter.next_nal().unwrap().as_ref(), &[0x65, 0xaa, 0xbb]);
        assert!(splitter.next_nal().is_none());
        assert_eq!(splitter.finish().unwrap().as_ref(), &[0x41]);
    }

    #[test]
    fn incremental_trims_start_code_zeros() {
        // A 4-byte start code following the NAL must not leave its leading
        // zero attached to the previous unit.
        let mut splitter = AnnexBSplitter::new();
        splitter.push(&[0, 0, 1, 0x41, 0x9a, 0, 0, 0, 1, 0x41]);
        assert_eq!(splitter.next_nal().unwrap().as_ref(), &[0x41, 0x9a]);
    }

    #[test]
    fn finish_on_empty_is_none() {
        let mut splitter = AnnexBSplitter::new();
        assert!(splitter.finish().is_none());
        splitter.push(&[0, 0, 0, 1]);
        assert!(splitter.finish().is_none());
    }
}
