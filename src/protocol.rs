//! On-disk record framing.
//!
//! Every record in a partition log is stored as a fixed-width header followed
//! by the raw payload:
//!
//! ```text
//! +----------------+----------------------+------------------+
//! | length: u32 LE | reserved: 6 zero B   | payload (length) |
//! +----------------+----------------------+------------------+
//! ```
//!
//! Record boundaries are found purely by walking headers from the start of a
//! read window. There is no per-record checksum, so a half-written frame
//! would corrupt every later read. The log store therefore truncates on a
//! failed append, and the splitter stops at the first header it can't trust.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_HEADER_SIZE, FRAME_LENGTH_FIELD_SIZE, MAX_FRAME_PAYLOAD};

/// Why [`split_frames`] stopped walking the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStop {
    /// Every byte of the buffer was consumed by complete frames.
    EndOfBuffer,
    /// Fewer than a header's worth of bytes remain.
    PartialHeader,
    /// A header claims more payload than the buffer holds.
    Overrun,
    /// A header with a zero length was found.
    ZeroLength,
}

impl FrameStop {
    /// A stop that indicates damaged or torn data rather than a read window
    /// that simply ended mid-frame.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, FrameStop::ZeroLength)
    }
}

/// Result of splitting a raw read window into records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitFrames {
    /// Complete record payloads, in log order.
    pub records: Vec<Bytes>,
    /// Bytes covered by the complete frames in `records`.
    pub consumed: usize,
    /// Why splitting stopped.
    pub stop: FrameStop,
}

/// Total on-disk size of a frame carrying `payload_len` bytes.
#[inline]
pub fn framed_len(payload_len: usize) -> usize {
    FRAME_HEADER_SIZE + payload_len
}

/// Write the frame header for a payload of `payload_len` bytes.
pub fn put_frame_header<B: BufMut>(buf: &mut B, payload_len: usize) {
    debug_assert!(payload_len <= MAX_FRAME_PAYLOAD);
    buf.put_u32_le(payload_len as u32);
    buf.put_bytes(0, FRAME_HEADER_SIZE - FRAME_LENGTH_FIELD_SIZE);
}

/// Encode one payload as a complete frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(framed_len(payload.len()));
    put_frame_header(&mut buf, payload.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// Read the payload length from the start of `header`.
///
/// Returns `None` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
/// The reserved bytes are ignored.
pub fn read_frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let mut len = &header[..FRAME_LENGTH_FIELD_SIZE];
    Some(len.get_u32_le() as usize)
}

/// Split a raw read window into complete records.
///
/// Walking stops at the first zero-length header, the first header whose
/// payload would overrun the window, or the end of the window. `consumed`
/// only ever counts complete frames, so a caller can add it to its offset
/// and land exactly on the next unread frame.
pub fn split_frames(window: Bytes) -> SplitFrames {
    let mut records = Vec::new();
    let mut pos = 0usize;

    let stop = loop {
        let remaining = window.len() - pos;
        if remaining == 0 {
            break FrameStop::EndOfBuffer;
        }
        let Some(len) = read_frame_len(&window[pos..]) else {
            break FrameStop::PartialHeader;
        };
        if len == 0 {
            break FrameStop::ZeroLength;
        }
        if framed_len(len) > remaining {
            break FrameStop::Overrun;
        }

        let start = pos + FRAME_HEADER_SIZE;
        records.push(window.slice(start..start + len));
        pos = start + len;
    };

    SplitFrames {
        records,
        consumed: pos,
        stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(payloads: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for p in payloads {
            buf.put_slice(&encode_frame(p));
        }
        buf.freeze()
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_frame(b"abc");
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(&frame[..4], &3u32.to_le_bytes());
        assert!(frame[4..FRAME_HEADER_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&frame[FRAME_HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_split_complete_window() {
        let buf = window(&[b"one", b"two", b"three"]);
        let total = buf.len();
        let split = split_frames(buf);
        assert_eq!(
            split.records,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three")
            ]
        );
        assert_eq!(split.consumed, total);
        assert_eq!(split.stop, FrameStop::EndOfBuffer);
    }

    #[test]
    fn test_split_stops_before_partial_frame() {
        let mut buf = BytesMut::from(&window(&[b"first"])[..]);
        let first_len = buf.len();
        buf.put_slice(&encode_frame(b"second")[..12]);

        let split = split_frames(buf.freeze());
        assert_eq!(split.records, vec![Bytes::from_static(b"first")]);
        assert_eq!(split.consumed, first_len);
        assert_eq!(split.stop, FrameStop::Overrun);
        assert!(!split.stop.is_corrupt());
    }

    #[test]
    fn test_split_stops_on_partial_header() {
        let mut buf = BytesMut::from(&window(&[b"x"])[..]);
        buf.put_slice(&[5, 0, 0]);
        let split = split_frames(buf.freeze());
        assert_eq!(split.records.len(), 1);
        assert_eq!(split.consumed, framed_len(1));
        assert_eq!(split.stop, FrameStop::PartialHeader);
    }

    #[test]
    fn test_split_stops_on_zero_length() {
        let mut buf = BytesMut::from(&window(&[b"ok"])[..]);
        buf.put_bytes(0, FRAME_HEADER_SIZE);
        buf.put_slice(&encode_frame(b"unreachable"));

        let split = split_frames(buf.freeze());
        assert_eq!(split.records, vec![Bytes::from_static(b"ok")]);
        assert_eq!(split.consumed, framed_len(2));
        assert!(split.stop.is_corrupt());
    }

    #[test]
    fn test_split_empty_window() {
        let split = split_frames(Bytes::new());
        assert!(split.records.is_empty());
        assert_eq!(split.consumed, 0);
        assert_eq!(split.stop, FrameStop::EndOfBuffer);
    }

    #[test]
    fn test_reserved_bytes_ignored_on_read() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(&[9, 9, 9, 9, 9, 9]);
        buf.put_slice(b"hi");
        let split = split_frames(buf.freeze());
        assert_eq!(split.records, vec![Bytes::from_static(b"hi")]);
    }
}
