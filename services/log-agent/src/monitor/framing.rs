//! Newline framing of raw log bytes.
//!
//! The engine delivers log output in arbitrary chunks, so a line can be split
//! across chunks and a multi-byte character can be split across a chunk
//! boundary. The framer buffers bytes until a newline arrives and only then
//! decodes the line.

/// Hard cap on bytes buffered without a newline.
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// A complete, decoded log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Decoded text without trailing whitespace. Leading indentation is
    /// kept so continuation lines of a multi-line entry stay recognizable.
    pub text: String,

    /// Invalid UTF-8 was replaced with U+FFFD while decoding.
    pub lossy: bool,
}

/// Result of feeding one chunk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Framed {
    /// Non-empty lines completed by this chunk, in stream order.
    pub lines: Vec<Line>,

    /// Bytes discarded because the partial line outgrew the cap.
    pub discarded: usize,
}

/// Incremental newline framer.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_buffer: usize,
}

impl LineFramer {
    /// Create a framer with the default cap.
    pub fn new() -> Self {
        Self::with_capacity_limit(MAX_BUFFER_SIZE)
    }

    /// Create a framer that discards partial lines longer than `max_buffer`.
    pub fn with_capacity_limit(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer,
        }
    }

    /// Feed a chunk and collect every line it completes.
    ///
    /// The buffer never holds a newline, so only `chunk` is scanned. A
    /// partial line that would grow past the cap is dropped before it is
    /// copied.
    pub fn push(&mut self, chunk: &[u8]) -> Framed {
        let mut framed = Framed::default();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let line = if self.buffer.is_empty() {
                decode_line(&rest[..pos])
            } else {
                self.buffer.extend_from_slice(&rest[..pos]);
                let line = decode_line(&self.buffer);
                self.buffer.clear();
                line
            };
            if let Some(line) = line {
                framed.lines.push(line);
            }
            rest = &rest[pos + 1..];
        }

        let pending = self.buffer.len() + rest.len();
        if pending > self.max_buffer {
            framed.discarded = pending;
            self.buffer.clear();
        } else {
            self.buffer.extend_from_slice(rest);
        }

        framed
    }

    /// Bytes currently held for an incomplete line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line (used when a stream is reopened).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(raw: &[u8]) -> Option<Line> {
    let (text, lossy) = match std::str::from_utf8(raw) {
        Ok(text) => (text.trim_end().to_string(), false),
        Err(_) => (String::from_utf8_lossy(raw).trim_end().to_string(), true),
    };

    if text.trim_start().is_empty() {
        return None;
    }

    Some(Line { text, lossy })
}
