//! Incremental text/event-stream frame parser.
//!
//! Stream chunks may split a frame anywhere, including inside a multi-byte
//! UTF-8 sequence. The parser keeps the undecoded byte tail and the
//! incomplete text tail between reads, so a frame straddling reads is
//! emitted exactly once, in order.

/// One complete frame with a non-empty `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    /// Decoded text after the last complete frame
    buffer: String,
    /// Bytes of an incomplete UTF-8 sequence from the previous read
    pending: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the stream, returning every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        let text = self.decode(bytes);
        self.feed_str(&text)
    }

    /// Feed already-decoded text.
    pub fn feed_str(&mut self, text: &str) -> Vec<SseFrame> {
        self.buffer.extend(text.chars().filter(|c| *c != '\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_frame(&block[..end]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Text carried into the next read (an incomplete frame).
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Truncated sequence at the end: wait for the next read
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }
}

fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim();
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
        // Comments (":") and other fields (id:, retry:) are ignored
    }

    let data = data.filter(|d| !d.is_empty())?;
    Some(SseFrame {
        event: event.filter(|e| !e.is_empty()),
        data,
    })
}
