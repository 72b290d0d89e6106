//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`MessageFramer`] turns an arbitrary chunked byte stream into messages;
//! [`encode`] produces the bytes for one outgoing message.
//!
//! A bad frame never stops the stream: the framer reports a
//! [`FramingError`] for it and carries on with the next frame.

use crate::error::FramingError;
use crate::protocol::Message;

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Longest header block accepted before the framer gives up on it.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Consumed prefix size above which the buffer is compacted even when
/// unconsumed bytes remain.
const COMPACT_THRESHOLD: usize = 64 * 1024;

const CONTENT_LENGTH: &[u8] = b"content-length";

pub type FrameResult = Result<Message, FramingError>;

/// Serialize one message with its `Content-Length` header.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    let body = message.to_value().to_string();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Waiting for a complete header block.
    Header,
    /// Header parsed; waiting for `length` body bytes.
    Body { length: usize },
    /// Discarding the body of a rejected frame.
    Skip { remaining: usize },
}

enum HeaderOutcome {
    Incomplete,
    Parsed { length: usize, consumed: usize },
    /// Header block rejected but its body length is known, so the body can
    /// be skipped precisely.
    RejectedWithLength {
        error: FramingError,
        length: usize,
        consumed: usize,
    },
    /// Header block rejected with no usable length; resynchronize on the
    /// next `Content-Length` header.
    Rejected { error: FramingError, consumed: usize },
}

/// Incremental decoder from raw bytes to JSON-RPC messages.
///
/// Bytes are appended to a growable buffer; a read cursor marks how far
/// complete frames have been consumed. Incomplete headers or bodies are
/// never consumed, so any split of the input across [`feed`](Self::feed)
/// calls yields the same messages.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: Vec<u8>,
    cursor: usize,
    state: FrameState,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            state: FrameState::Header,
        }
    }

    /// Append bytes and return every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameResult> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            out.push(frame);
        }
        self.compact();
        out
    }

    /// Drop all buffered bytes, e.g. when the transport restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.state = FrameState::Header;
    }

    /// Bytes received but not yet consumed as part of a frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn next_frame(&mut self) -> Option<FrameResult> {
        loop {
            match self.state {
                FrameState::Skip { remaining } => {
                    let available = self.buffered_len();
                    let step = remaining.min(available);
                    self.cursor += step;
                    if step < remaining {
                        self.state = FrameState::Skip {
                            remaining: remaining - step,
                        };
                        return None;
                    }
                    self.state = FrameState::Header;
                }
                FrameState::Header => match self.parse_header() {
                    HeaderOutcome::Incomplete => return None,
                    HeaderOutcome::Parsed { length, consumed } => {
                        self.cursor += consumed;
                        if length > MAX_FRAME_BYTES {
                            self.state = FrameState::Skip { remaining: length };
                            return Some(Err(FramingError::FrameTooLarge {
                                length,
                                max: MAX_FRAME_BYTES,
                            }));
                        }
                        self.state = FrameState::Body { length };
                    }
                    HeaderOutcome::RejectedWithLength {
                        error,
                        length,
                        consumed,
                    } => {
                        self.cursor += consumed;
                        self.state = FrameState::Skip { remaining: length };
                        return Some(Err(error));
                    }
                    HeaderOutcome::Rejected { error, consumed } => {
                        self.cursor += consumed;
                        self.resync();
                        return Some(Err(error));
                    }
                },
                FrameState::Body { length } => {
                    if self.buffered_len() < length {
                        return None;
                    }
                    let body = &self.buffer[self.cursor..self.cursor + length];
                    let result = decode_body(body);
                    self.cursor += length;
                    self.state = FrameState::Header;
                    return Some(result);
                }
            }
        }
    }

    /// Parse the header block at the cursor without consuming it.
    fn parse_header(&self) -> HeaderOutcome {
        let data = &self.buffer[self.cursor..];
        let mut pos = 0;
        let mut content_length: Option<Result<usize, String>> = None;
        let mut first_error: Option<FramingError> = None;

        loop {
            if pos > MAX_HEADER_BYTES {
                return oversized_header();
            }
            let Some(nl) = data[pos..].iter().position(|&b| b == b'\n') else {
                if data.len() > MAX_HEADER_BYTES {
                    return oversized_header();
                }
                return HeaderOutcome::Incomplete;
            };
            let mut line = &data[pos..pos + nl];
            pos += nl + 1;
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            if line.is_empty() {
                break;
            }

            let text = String::from_utf8_lossy(line);
            let Some((key, value)) = text.split_once(':') else {
                tracing::debug!(line = %text, "Skipping non-header line from server");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.parse::<usize>().map_err(|_| value.to_string()));
            } else if key.eq_ignore_ascii_case("Content-Type")
                && let Err(e) = check_content_type(value)
            {
                first_error.get_or_insert(e);
            }
        }

        match (content_length, first_error) {
            (Some(Ok(length)), None) => HeaderOutcome::Parsed {
                length,
                consumed: pos,
            },
            (Some(Ok(length)), Some(error)) => HeaderOutcome::RejectedWithLength {
                error,
                length,
                consumed: pos,
            },
            (Some(Err(value)), _) => HeaderOutcome::Rejected {
                error: FramingError::InvalidContentLength { value },
                consumed: pos,
            },
            (None, Some(error)) => HeaderOutcome::Rejected {
                error,
                consumed: pos,
            },
            (None, None) => HeaderOutcome::Rejected {
                error: FramingError::MissingContentLength,
                consumed: pos,
            },
        }
    }

    /// Advance the cursor to the next `Content-Length` header, keeping only
    /// a tail that may be the start of one.
    fn resync(&mut self) {
        let data = &self.buffer[self.cursor..];
        match find_ascii_case_insensitive(data, CONTENT_LENGTH) {
            Some(offset) => self.cursor += offset,
            None => {
                let keep = (1..CONTENT_LENGTH.len().min(data.len() + 1))
                    .rev()
                    .find(|&k| data[data.len() - k..].eq_ignore_ascii_case(&CONTENT_LENGTH[..k]))
                    .unwrap_or(0);
                self.cursor += data.len() - keep;
            }
        }
    }

    fn compact(&mut self) {
        if self.cursor == self.buffer.len() {
            self.buffer.clear();
            self.cursor = 0;
        } else if self.cursor >= COMPACT_THRESHOLD && self.cursor * 2 >= self.buffer.len() {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

/// Reject an endless header block; one byte is consumed so the resync that
/// follows looks past the current position.
fn oversized_header() -> HeaderOutcome {
    HeaderOutcome::Rejected {
        error: FramingError::HeaderTooLarge {
            max: MAX_HEADER_BYTES,
        },
        consumed: 1,
    }
}

fn decode_body(body: &[u8]) -> FrameResult {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| FramingError::InvalidJson {
            message: e.to_string(),
            raw: body.to_vec(),
        })?;
    Message::from_value(value).ok_or_else(|| FramingError::NotAMessage { raw: body.to_vec() })
}

/// Accept JSON-RPC mime types with a UTF-8 (or absent) charset.
fn check_content_type(value: &str) -> Result<(), FramingError> {
    let unsupported = || FramingError::UnsupportedEncoding {
        content_type: value.to_string(),
    };
    let mut parts = value.split(';').map(str::trim);
    let mime = parts.next().unwrap_or_default();
    if !(mime.eq_ignore_ascii_case("application/vscode-jsonrpc")
        || mime.eq_ignore_ascii_case("application/json"))
    {
        return Err(unsupported());
    }
    for param in parts {
        if let Some((name, charset)) = param.split_once('=')
            && name.trim().eq_ignore_ascii_case("charset")
        {
            let charset = charset.trim().trim_matches('"');
            if !(charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8")) {
                return Err(unsupported());
            }
        }
    }
    Ok(())
}

fn find_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}
