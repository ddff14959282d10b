//! Frame struct and START/END marker encoding.
//!
//! Every message on the wire is wrapped as:
//!
//! ```text
//! [START: <tag>]<payload>[END: <tag>]
//! ```
//!
//! The tag is a decimal integer picked at random per frame. It is not an
//! identifier: the decoder only uses it to pair a START marker with its END.
//!
//! # Example
//!
//! ```
//! use nodelink::protocol::encode_frame_with_tag;
//!
//! let bytes = encode_frame_with_tag(7, br#"{"method":"ping"}"#);
//! assert_eq!(&bytes[..], br#"[START: 7]{"method":"ping"}[END: 7]"#);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Opening marker prefix, followed by the decimal tag and `]`.
pub const START_PREFIX: &[u8] = b"[START: ";

/// Closing marker prefix, followed by the decimal tag and `]`.
pub const END_PREFIX: &[u8] = b"[END: ";

/// Closing bracket shared by both markers.
pub const MARKER_SUFFIX: u8 = b']';

/// Upper bound (exclusive) for randomly chosen tags.
pub const TAG_LIMIT: u32 = 10_000;

/// A complete frame extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tag that opened and closed this frame.
    pub tag: u32,
    /// Inner payload (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from a tag and payload.
    pub fn new(tag: u32, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Payload as UTF-8 text, if valid.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Encode this frame back into wire bytes using its own tag.
    pub fn encode(&self) -> Bytes {
        encode_frame_with_tag(self.tag, &self.payload)
    }
}

/// Pick a fresh tag in `0..TAG_LIMIT`.
#[inline]
pub fn random_tag() -> u32 {
    rand::random_range(0..TAG_LIMIT)
}

/// Wrap a payload in START/END markers with a random tag.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    encode_frame_with_tag(random_tag(), payload)
}

/// Wrap a payload in START/END markers with the given tag.
pub fn encode_frame_with_tag(tag: u32, payload: &[u8]) -> Bytes {
    let tag = tag.to_string();
    let marker_len = START_PREFIX.len() + END_PREFIX.len() + 2 * (tag.len() + 1);

    let mut buf = BytesMut::with_capacity(marker_len + payload.len());
    buf.put_slice(START_PREFIX);
    buf.put_slice(tag.as_bytes());
    buf.put_u8(MARKER_SUFFIX);
    buf.put_slice(payload);
    buf.put_slice(END_PREFIX);
    buf.put_slice(tag.as_bytes());
    buf.put_u8(MARKER_SUFFIX);
    buf.freeze()
}

/// Build the `[END: <tag>]` marker for a tag.
pub(crate) fn end_marker(tag: &[u8]) -> Vec<u8> {
    let mut marker = Vec::with_capacity(END_PREFIX.len() + tag.len() + 1);
    marker.extend_from_slice(END_PREFIX);
    marker.extend_from_slice(tag);
    marker.push(MARKER_SUFFIX);
    marker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(42, Bytes::from_static(b"hello"));

        assert_eq!(frame.tag, 42);
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
        assert_eq!(frame.as_str(), Some("hello"));
    }

    #[test]
    fn test_encode_with_tag() {
        let bytes = encode_frame_with_tag(1234, b"{}");
        assert_eq!(&bytes[..], b"[START: 1234]{}[END: 1234]");
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = encode_frame_with_tag(0, b"");
        assert_eq!(&bytes[..], b"[START: 0][END: 0]");
    }

    #[test]
    fn test_random_tag_in_range() {
        for _ in 0..1000 {
            assert!(random_tag() < TAG_LIMIT);
        }
    }

    #[test]
    fn test_encode_frame_uses_matching_tags() {
        let bytes = encode_frame(b"payload");
        let text = std::str::from_utf8(&bytes).unwrap();

        let open_end = text.find(']').unwrap();
        let tag = &text[START_PREFIX.len()..open_end];
        assert!(tag.parse::<u32>().unwrap() < TAG_LIMIT);
        assert!(text.ends_with(&format!("[END: {}]", tag)));
    }

    #[test]
    fn test_frame_encode_uses_own_tag() {
        let frame = Frame::new(9, Bytes::from_static(b"x"));
        assert_eq!(&frame.encode()[..], b"[START: 9]x[END: 9]");
    }

    #[test]
    fn test_end_marker() {
        assert_eq!(end_marker(b"77"), b"[END: 77]".to_vec());
    }
}
