//! Streaming end-of-message detection for HTTP/1.x traffic.
//!
//! The forwarder cannot know in advance where one request/response ends and
//! the next begins, so the detector watches the outbound byte stream and,
//! after each chunk, answers "is one complete HTTP message behind us?".
//! It works on byte offsets rather than re-reading buffered data, so memory
//! stays bounded: the only allocation is a pre-header scratch buffer capped
//! at [`HEADER_SCAN_LIMIT`].
//!
//! The detector is deliberately permissive. A stream that never presents a
//! proper head (non-HTTP traffic riding the tunnel) falls back to per-chunk
//! terminator heuristics instead of stalling. Known imprecision: `chunked`
//! framing is not verified beyond a single terminator match, and a
//! terminator landing at in-chunk offset 0 is not recorded, so pathological
//! payloads can end a forward early or late.

use std::collections::HashMap;

use tracing::debug;

/// Byte pattern that ends an HTTP head (and a bare message).
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Byte pattern that ends a chunked body.
pub const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n";

/// Pre-header accumulation cap. A head that has not terminated within this
/// many bytes is assumed to never terminate.
pub const HEADER_SCAN_LIMIT: usize = 2 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";
const TRANSFER_ENCODING: &str = "Transfer-Encoding";

/// Per-direction state of one forwarded message. Allocate a fresh detector
/// for every [`forward`](crate::exchange::forward) invocation; no state
/// carries over between messages.
#[derive(Debug, Default)]
pub struct HttpDetector {
    /// Offset of the head terminator, 0 while unknown. Set at most once.
    header_end: u64,
    /// Absolute offset of the detected body terminator, <= 0 while none.
    body_end: i64,
    /// Header name -> value as received (values keep their leading space).
    headers: HashMap<String, String>,
    /// Total bytes observed since the exchange started.
    received: u64,
    /// Pre-header accumulation, released once the head is found or capped.
    scratch: Vec<u8>,
    /// Head scan gave up; only per-chunk heuristics from here on.
    head_overflowed: bool,
}

impl HttpDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of the stream, in arrival order.
    pub fn observe(&mut self, chunk: &[u8]) {
        let chunk_len = chunk.len() as u64;
        self.received += chunk_len;

        if self.header_end == 0 {
            if self.head_overflowed {
                self.scan_unframed(chunk, chunk_len);
            } else {
                self.scratch.extend_from_slice(chunk);
                if let Some(pos) = find(&self.scratch, HEAD_TERMINATOR) {
                    self.header_end = pos as u64;
                    self.headers = parse_headers(&self.scratch[..pos]);
                    self.scratch = Vec::new();
                } else if self.scratch.len() >= HEADER_SCAN_LIMIT {
                    debug!(
                        received = self.received,
                        "no head terminator within scan limit, falling back to terminator heuristics"
                    );
                    self.scratch = Vec::new();
                    self.head_overflowed = true;
                    self.scan_unframed(chunk, chunk_len);
                }
            }
        }

        if self.header_end > 0 {
            let idx = if self.is_chunked() {
                find(chunk, CHUNKED_TERMINATOR)
            } else {
                rfind(chunk, HEAD_TERMINATOR)
            };
            self.record_body_end(idx, chunk_len);
        }
    }

    /// Is one complete HTTP message behind us?
    pub fn is_complete(&self) -> bool {
        if let Some(value) = self.headers.get(CONTENT_LENGTH) {
            return match value.replace(' ', "").parse::<u64>() {
                Ok(length) => self.received >= self.header_end + 4 + length,
                Err(err) => {
                    // A value we cannot trust must not hang the tunnel.
                    debug!(%value, error = %err, "malformed Content-Length, treating message as complete");
                    true
                }
            };
        }
        if self.body_end > 0 {
            let body_end = self.body_end as u64;
            if body_end > self.header_end {
                return true;
            }
            if body_end == self.header_end {
                // Head-only message: the terminator we found is the head's.
                return self.received == self.header_end + 4;
            }
        }
        false
    }

    /// No head was framed; look for a terminator in the current chunk only.
    fn scan_unframed(&mut self, chunk: &[u8], chunk_len: u64) {
        let idx = find(chunk, CHUNKED_TERMINATOR).or_else(|| rfind(chunk, HEAD_TERMINATOR));
        self.record_body_end(idx, chunk_len);
    }

    /// Translate an in-chunk offset into an absolute stream offset.
    fn record_body_end(&mut self, idx: Option<usize>, chunk_len: u64) {
        self.body_end = idx.map(|i| i as i64).unwrap_or(-1);
        if self.body_end > 0 && self.received > chunk_len {
            self.body_end += (self.received - chunk_len) as i64;
        }
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get(TRANSFER_ENCODING)
            .is_some_and(|v| v.replace(' ', "") == "chunked")
    }
}

/// Split head lines on CRLF, then each line on its first `:`. The name is
/// kept case-sensitive as received and the value verbatim, leading space
/// included.
fn parse_headers(head: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in String::from_utf8_lossy(head).split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    headers
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
