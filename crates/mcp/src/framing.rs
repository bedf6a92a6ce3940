//! Reassembly of JSON-RPC messages from fragmented text.
//!
//! Transports may deliver a message split across several frames or several
//! messages in one frame. The assembler buffers text until it holds complete
//! JSON values and rejects malformed input, so the protocol handler only ever
//! sees whole, well-formed messages.

use serde_json::Value;

/// Default cap on a single buffered message
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Outcome of feeding text into the assembler
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Message(Value),
    Malformed(String),
}

/// Per-connection JSON message assembler
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: String,
    max_len: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl MessageAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len,
        }
    }

    /// Feed a chunk and return every message it completes
    pub fn push(&mut self, chunk: &str) -> Vec<Assembled> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let start = self.buffer.len() - self.buffer.trim_start().len();
            if start == self.buffer.len() {
                self.buffer.clear();
                break;
            }

            let mut stream =
                serde_json::Deserializer::from_str(&self.buffer[start..]).into_iter::<Value>();

            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = start + stream.byte_offset();
                    self.buffer.drain(..consumed);
                    if value.is_object() || value.is_array() {
                        out.push(Assembled::Message(value));
                    } else {
                        out.push(Assembled::Malformed(
                            "expected a JSON object or array".to_string(),
                        ));
                    }
                }
                Some(Err(e)) if e.is_eof() => {
                    if self.buffer.len() > self.max_len {
                        self.buffer.clear();
                        out.push(Assembled::Malformed(format!(
                            "message exceeds {} bytes",
                            self.max_len
                        )));
                    }
                    break;
                }
                Some(Err(e)) => {
                    self.buffer.clear();
                    out.push(Assembled::Malformed(e.to_string()));
                    break;
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }
        }

        out
    }

    /// Whether a partial message is buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.trim().is_empty()
    }

    /// Parse a chunk that must be exactly one complete message
    pub fn parse_complete(text: &str) -> Assembled {
        let mut assembler = Self::default();
        let mut messages = assembler.push(text);
        if assembler.has_partial() {
            return Assembled::Malformed("truncated JSON message".to_string());
        }
        match messages.len() {
            0 => Assembled::Malformed("empty message".to_string()),
            1 => messages.remove(0),
            _ => Assembled::Malformed("expected a single JSON message".to_string()),
        }
    }
}
