//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Incoming bytes
//! are appended and scanned for `[START: n]` ... `[END: n]` spans:
//!
//! - the first complete span wins: the earliest well-formed START that has a
//!   matching END after it, paired with the first such END
//! - everything up to the end of that span is consumed; later bytes stay
//! - malformed markers are skipped silently
//!
//! Scanning is incremental. Each push only looks at bytes that could not
//! have been checked before, so a large payload arriving in small reads is
//! scanned once.
//!
//! # Example
//!
//! ```
//! use nodelink::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(b"[START: 12]{\"id\"").is_empty());
//! let frames = buffer.push(b":\"x\"}[END: 12]");
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0].payload[..], b"{\"id\":\"x\"}");
//! ```

use bytes::BytesMut;
use tracing::warn;

use super::frame::{end_marker, Frame, MARKER_SUFFIX, START_PREFIX};

/// Default ceiling on buffered bytes (64 MiB).
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024 * 1024;

/// Longest tag accepted in a START marker. Nine digits always fit a `u32`.
const MAX_TAG_DIGITS: usize = 9;

/// A well-formed START marker whose END has not been seen yet.
#[derive(Debug, Clone)]
struct OpenMarker {
    /// Offset of the `[` that opens the marker.
    start: usize,
    /// Offset of the first payload byte.
    payload_begin: usize,
    /// END search resumes here on the next push.
    searched_to: usize,
    /// Exact `[END: <tag>]` bytes, with the tag spelled as the peer sent it.
    end_marker: Vec<u8>,
    tag: u32,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Open markers in stream order.
    opens: Vec<OpenMarker>,
    /// Bytes before this offset have been scanned for START markers.
    scanned: usize,
    /// Buffered bytes above this are discarded.
    max_buffered: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max buffered: 64MB.
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Create a new frame buffer with a custom ceiling on buffered bytes.
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            opens: Vec::new(),
            scanned: 0,
            max_buffered,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial frames stay buffered until later pushes complete them. Bytes
    /// that can never become part of a frame are dropped.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }

        // Noise with no START marker in it can be released right away.
        if self.opens.is_empty() && self.scanned > 0 {
            let _ = self.buffer.split_to(self.scanned);
            self.scanned = 0;
        }

        if self.buffer.len() > self.max_buffered {
            warn!(
                buffered = self.buffer.len(),
                max = self.max_buffered,
                "Incomplete frame exceeds buffer limit, discarding"
            );
            self.clear();
        }

        frames
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        self.scan_markers();

        let (index, end_at) = self.find_complete()?;
        let open = self.opens.remove(index);
        let consumed = end_at + open.end_marker.len();

        let mut span = self.buffer.split_to(consumed);
        let mut payload = span.split_off(open.payload_begin);
        payload.truncate(end_at - open.payload_begin);

        // Everything before the end of the span is gone, including any
        // markers that opened inside it.
        self.opens.retain(|o| o.start >= consumed);
        for o in &mut self.opens {
            o.start -= consumed;
            o.payload_begin -= consumed;
            o.searched_to -= consumed;
        }
        self.scanned = self.scanned.saturating_sub(consumed);

        Some(Frame::new(open.tag, payload.freeze()))
    }

    /// Record every well-formed START marker past `scanned`.
    fn scan_markers(&mut self) {
        loop {
            let Some(rel) = find(&self.buffer[self.scanned..], START_PREFIX) else {
                // A START prefix may be split across reads.
                let tail = self.buffer.len().saturating_sub(START_PREFIX.len() - 1);
                self.scanned = self.scanned.max(tail);
                return;
            };

            let start = self.scanned + rel;
            let digits_begin = start + START_PREFIX.len();
            let digits = self.buffer[digits_begin..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            let close = digits_begin + digits;

            if close == self.buffer.len() && digits <= MAX_TAG_DIGITS {
                // Marker not finished yet.
                self.scanned = start;
                return;
            }

            if digits == 0 || digits > MAX_TAG_DIGITS || self.buffer[close] != MARKER_SUFFIX {
                self.scanned = start + 1;
                continue;
            }

            let tag_text = &self.buffer[digits_begin..close];
            let tag = tag_text
                .iter()
                .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));

            self.opens.push(OpenMarker {
                start,
                payload_begin: close + 1,
                searched_to: close + 1,
                end_marker: end_marker(tag_text),
                tag,
            });
            self.scanned = close + 1;
        }
    }

    /// Find the earliest open marker whose END is now buffered.
    ///
    /// Returns the marker index and the offset of its END marker.
    fn find_complete(&mut self) -> Option<(usize, usize)> {
        let len = self.buffer.len();
        for (index, open) in self.opens.iter_mut().enumerate() {
            if let Some(rel) = find(&self.buffer[open.searched_to..], &open.end_marker) {
                return Some((index, open.searched_to + rel));
            }
            open.searched_to = len
                .saturating_sub(open.end_marker.len() - 1)
                .max(open.payload_begin);
        }
        None
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and forget all open markers.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.opens.clear();
        self.scanned = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let first = *needle.first()?;
    let mut from = 0;
    while let Some(rel) = haystack[from..].iter().position(|&b| b == first) {
        let at = from + rel;
        if haystack[at..].starts_with(needle) {
            return Some(at);
        }
        from = at + 1;
    }
    None
}
