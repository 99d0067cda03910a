/// Newline framing for the pool side of a session
///
/// TCP hands us arbitrary chunks. `feed` appends them to a carry-over buffer
/// and returns every complete line that parses as JSON-RPC; the trailing
/// partial line waits for the next call.

use bytes::{Buf, BytesMut};

use super::protocol::RpcMessage;

/// A reassembled line and its parsed form.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Line text without the terminator, as the pool sent it.
    pub text: String,
    pub message: RpcMessage,
}

pub struct Framer {
    buf: BytesMut,
    max_line: usize,
}

impl Framer {
    pub fn new(max_line: usize) -> Self {
        Self { buf: BytesMut::with_capacity(4096), max_line }
    }

    /// Bytes waiting for their newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            if let Some(frame) = Self::decode(&line) {
                frames.push(frame);
            }
        }

        if self.buf.len() > self.max_line {
            tracing::warn!(
                "[Pool] Dropping {} bytes without newline (limit {})",
                self.buf.len(),
                self.max_line
            );
            self.buf.clear();
        }

        frames
    }

    fn decode(line: &[u8]) -> Option<Frame> {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t.trim_end_matches('\r'),
            Err(_) => {
                tracing::warn!("[Pool] Non-UTF8 line ({} bytes) dropped", line.len());
                return None;
            }
        };
        if text.trim().is_empty() {
            return None;
        }

        match RpcMessage::parse(text) {
            Ok(message) => Some(Frame { text: text.to_string(), message }),
            Err(e) => {
                tracing::warn!("[Pool] Invalid JSON ({}): {}", e, truncate(text, 120));
                None
            }
        }
    }
}

/// Char-safe prefix for log lines.
pub fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
