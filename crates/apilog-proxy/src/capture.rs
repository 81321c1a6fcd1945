//! Bounded copy of a streamed body, kept for the log
//!
//! The live stream is never held back by the capture: bytes past the cap
//! are counted but not stored.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};
use tracing::debug;

#[derive(Debug)]
pub struct BodyCapture {
    data: Vec<u8>,
    limit: usize,
    total: u64,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.data.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.data.extend_from_slice(&chunk[..take]);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }

    #[cfg(test)]
    fn total_bytes(&self) -> u64 {
        self.total
    }

    #[cfg(test)]
    fn captured(&self) -> &[u8] {
        &self.data
    }

    /// Render the capture as log text.
    ///
    /// `content_encoding` applies to the captured copy only; gzip and
    /// deflate are decoded (bounded by the same cap), anything else is kept
    /// as is. Non-UTF-8 data becomes a `<binary data, N bytes>` placeholder.
    /// A cut at the cap, raw or after decoding, ends with a marker line.
    pub fn render(&self, content_encoding: Option<&str>) -> String {
        let decoded = decode(&self.data, content_encoding, self.limit);
        let raw_truncated = self.is_truncated();
        let truncated = raw_truncated || decoded.truncated;

        let mut text = match String::from_utf8(decoded.bytes) {
            Ok(text) => text,
            Err(e) => {
                let utf8_error = e.utf8_error();
                // A cut at the cap can split a multi-byte character
                if truncated && utf8_error.error_len().is_none() {
                    let valid = utf8_error.valid_up_to();
                    let mut bytes = e.into_bytes();
                    bytes.truncate(valid);
                    String::from_utf8(bytes).unwrap_or_default()
                } else {
                    format!("<binary data, {} bytes>", self.total)
                }
            }
        };

        if decoded.truncated {
            text.push_str(&format!(
                "\n[truncated: decoded output capped at {} bytes; captured {} of {} bytes]",
                self.limit,
                self.data.len(),
                self.total
            ));
        } else if raw_truncated {
            text.push_str(&format!(
                "\n[truncated: captured {} of {} bytes]",
                self.data.len(),
                self.total
            ));
        }

        text
    }
}

struct Decoded {
    bytes: Vec<u8>,
    /// Decompressed output ran past the cap
    truncated: bool,
}

fn decode(data: &[u8], content_encoding: Option<&str>, limit: usize) -> Decoded {
    let raw = || Decoded {
        bytes: data.to_vec(),
        truncated: false,
    };

    // One byte past the cap tells a full-length body from a cut one
    let read_limit = (limit as u64).saturating_add(1);
    let mut bytes = Vec::new();

    let result = match content_encoding {
        Some("gzip") | Some("x-gzip") => {
            GzDecoder::new(data).take(read_limit).read_to_end(&mut bytes)
        }
        Some("deflate") => DeflateDecoder::new(data).take(read_limit).read_to_end(&mut bytes),
        _ => return raw(),
    };

    match result {
        Ok(_) => {}
        // A truncated capture ends mid-stream; keep whatever decoded cleanly
        Err(e) if !bytes.is_empty() => {
            debug!("Partial decompression of captured body: {}", e);
        }
        Err(e) => {
            debug!("Captured body decompression failed: {}", e);
            return raw();
        }
    }

    let truncated = bytes.len() > limit;
    bytes.truncate(limit);
    Decoded { bytes, truncated }
}
