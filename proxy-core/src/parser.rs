//! Streaming HTTP/1.1 response parser (spec §4.1).
//!
//! A single-threaded, byte-driven state machine. `feed` never performs IO —
//! it consumes a byte slice and returns the events it produced, so pipelined
//! responses sharing one on-wire byte stream can be parsed from an arbitrary
//! slicing of that stream with identical results (the slicing-invariance
//! property in spec §8).

use crate::error::ErrorCode;
use crate::header::HeaderMap;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone)]
pub enum ParserEvent {
    Headers {
        status_code: u16,
        status_message: String,
        version: String,
        headers: HeaderMap,
    },
    BodyReadMode(BodyMode),
    BodyChunk { data: Bytes, is_last: bool },
    Error(ErrorCode),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    BodyFixed { remaining: u64 },
    BodyChunkSize,
    BodyChunkData { remaining: u64 },
    BodyChunkDataCrlf,
    BodyChunkTrailer,
    BodyUntilClose,
}

pub struct ResponseParser {
    state: State,
    line_buf: Vec<u8>,
    headers: HeaderMap,
    status_code: u16,
    /// Version and status message parsed off the status line, held until
    /// the header block closes and the `Headers` event is built.
    pending_version: String,
    pending_message: String,
    /// How many tolerable format issues (bare LF, etc.) have been seen.
    /// Not exposed as an event — spec classifies these as non-terminal.
    tolerated_issues: u64,
    locked_until_close: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::StatusLine,
            line_buf: Vec::with_capacity(128),
            headers: HeaderMap::with_capacity(16),
            status_code: 0,
            pending_version: String::new(),
            pending_message: String::new(),
            tolerated_issues: 0,
            locked_until_close: false,
        }
    }

    /// True once an `UntilClose` response has been announced on this
    /// parser instance — the owning Pipeline must stop accepting new
    /// pipelined requests on the same connection (spec §4.2 "Lock for
    /// UntilClose").
    pub fn is_locked_until_close(&self) -> bool {
        self.locked_until_close
    }

    pub fn tolerated_issues(&self) -> u64 {
        self.tolerated_issues
    }

    /// Explicit reset, used after a fatal error or a forced pipeline
    /// tear-down. Emits the `Reset` event per spec §4.1.
    pub fn reset(&mut self) -> Vec<ParserEvent> {
        self.reset_state();
        vec![ParserEvent::Reset]
    }

    fn reset_state(&mut self) {
        self.state = State::StatusLine;
        self.line_buf.clear();
        self.headers = HeaderMap::with_capacity(16);
        self.status_code = 0;
        self.pending_version.clear();
        self.pending_message.clear();
    }

    /// Feed a contiguous slice of backend bytes; synchronously returns
    /// whatever events that slice produced. An empty slice is a no-op
    /// (spec §8).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match self.state {
                State::StatusLine | State::Headers => {
                    i = self.feed_line_oriented(bytes, i, &mut events);
                    if self.fatal_pending(&events) {
                        return events;
                    }
                }
                State::BodyFixed { remaining } => {
                    let take = remaining.min((bytes.len() - i) as u64) as usize;
                    let data = Bytes::copy_from_slice(&bytes[i..i + take]);
                    i += take;
                    let left = remaining - take as u64;
                    let is_last = left == 0;
                    events.push(ParserEvent::BodyChunk { data, is_last });
                    if is_last {
                        self.reset_state();
                    } else {
                        self.state = State::BodyFixed { remaining: left };
                    }
                }
                State::BodyUntilClose => {
                    let data = Bytes::copy_from_slice(&bytes[i..]);
                    i = bytes.len();
                    events.push(ParserEvent::BodyChunk { data, is_last: false });
                }
                State::BodyChunkSize => {
                    i = self.feed_chunk_size_line(bytes, i, &mut events);
                    if self.fatal_pending(&events) {
                        return events;
                    }
                }
                State::BodyChunkData { remaining } => {
                    let take = remaining.min((bytes.len() - i) as u64) as usize;
                    let data = Bytes::copy_from_slice(&bytes[i..i + take]);
                    i += take;
                    let left = remaining - take as u64;
                    events.push(ParserEvent::BodyChunk { data, is_last: false });
                    self.state = if left == 0 { State::BodyChunkDataCrlf } else { State::BodyChunkData { remaining: left } };
                }
                State::BodyChunkDataCrlf => {
                    // Skip the CRLF (or bare LF) that terminates chunk data.
                    let b = bytes[i];
                    i += 1;
                    if b == b'\r' {
                        continue;
                    }
                    if b == b'\n' {
                        self.state = State::BodyChunkSize;
                    } else {
                        self.tolerated_issues += 1;
                        // Not a CR/LF where one was expected: tolerate and
                        // keep scanning for the real terminator.
                    }
                }
                State::BodyChunkTrailer => {
                    i = self.feed_trailer_line(bytes, i, &mut events);
                }
            }
        }
        events
    }

    fn fatal_pending(&self, events: &[ParserEvent]) -> bool {
        matches!(events.last(), Some(ParserEvent::Reset))
            && events.len() >= 2
            && matches!(events[events.len() - 2], ParserEvent::Error(_))
    }

    /// Consume bytes until a line terminator, accumulating into
    /// `self.line_buf`. Returns the new cursor position; when a full line
    /// has been consumed it is dispatched to `on_status_line`/`on_header_line`.
    fn feed_line_oriented(&mut self, bytes: &[u8], mut i: usize, events: &mut Vec<ParserEvent>) -> usize {
        while i < bytes.len() {
            let b = bytes[i];
            i += 1;
            if b == b'\n' {
                let had_cr = self.line_buf.last() == Some(&b'\r');
                if had_cr {
                    self.line_buf.pop();
                } else {
                    self.tolerated_issues += 1;
                }
                let line = std::mem::take(&mut self.line_buf);
                match self.state {
                    State::StatusLine => self.on_status_line(&line, events),
                    State::Headers => self.on_header_line(&line, events),
                    _ => unreachable!(),
                }
                if !matches!(self.state, State::StatusLine | State::Headers) {
                    return i;
                }
                if events.last().map(|e| matches!(e, ParserEvent::Reset)).unwrap_or(false) {
                    return i;
                }
            } else {
                self.line_buf.push(b);
            }
        }
        i
    }

    fn on_status_line(&mut self, line: &[u8], _events: &mut [ParserEvent]) {
        let text = String::from_utf8_lossy(line);
        let mut parts = text.splitn(3, ' ');
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();
        let code = parts.next().unwrap_or("0").parse::<u16>().unwrap_or(0);
        let message = parts.next().unwrap_or("").to_string();
        self.status_code = code;
        self.pending_version = version;
        self.pending_message = message;
        self.state = State::Headers;
    }

    fn on_header_line(&mut self, line: &[u8], events: &mut Vec<ParserEvent>) {
        if line.is_empty() {
            self.finish_headers(events);
            return;
        }
        let text = String::from_utf8_lossy(line);
        if let Some(idx) = text.find(':') {
            let name = &text[..idx];
            let mut value = &text[idx + 1..];
            if let Some(stripped) = value.strip_prefix(' ') {
                value = stripped;
            }
            self.headers.push(name, value);
        }
        // Lines without a colon are tolerated and ignored.
    }

    fn finish_headers(&mut self, events: &mut Vec<ParserEvent>) {
        let no_body_status = matches!(self.status_code, 100..=199 | 204 | 304);
        let transfer_chunked = self
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let content_length_raw = self.headers.get("content-length").map(|v| v.to_string());

        if transfer_chunked {
            self.headers.remove("content-length");
        }

        let no_body_redirect = matches!(self.status_code, 302 | 307)
            && !transfer_chunked
            && content_length_raw.is_none();

        let mode = if no_body_status || no_body_redirect {
            BodyMode::Fixed(0)
        } else if transfer_chunked {
            BodyMode::Chunked
        } else if let Some(raw) = &content_length_raw {
            match raw.trim().parse::<u64>() {
                Ok(n) => BodyMode::Fixed(n),
                Err(_) => {
                    events.push(ParserEvent::Error(ErrorCode::InvalidContentLength));
                    self.reset_state();
                    events.push(ParserEvent::Reset);
                    return;
                }
            }
        } else {
            BodyMode::UntilClose
        };

        events.push(ParserEvent::Headers {
            status_code: self.status_code,
            status_message: std::mem::take(&mut self.pending_message),
            version: std::mem::take(&mut self.pending_version),
            headers: std::mem::replace(&mut self.headers, HeaderMap::new()),
        });
        events.push(ParserEvent::BodyReadMode(mode));

        match mode {
            BodyMode::Fixed(0) => {
                events.push(ParserEvent::BodyChunk { data: Bytes::new(), is_last: true });
                self.reset_state();
            }
            BodyMode::Fixed(n) => {
                self.state = State::BodyFixed { remaining: n };
            }
            BodyMode::Chunked => {
                self.state = State::BodyChunkSize;
            }
            BodyMode::UntilClose => {
                self.locked_until_close = true;
                self.state = State::BodyUntilClose;
            }
        }
    }

    fn feed_chunk_size_line(&mut self, bytes: &[u8], mut i: usize, events: &mut Vec<ParserEvent>) -> usize {
        while i < bytes.len() {
            let b = bytes[i];
            i += 1;
            if b == b'\n' {
                let had_cr = self.line_buf.last() == Some(&b'\r');
                if had_cr {
                    self.line_buf.pop();
                } else {
                    self.tolerated_issues += 1;
                }
                let line = std::mem::take(&mut self.line_buf);
                let text = String::from_utf8_lossy(&line);
                let size_part = text.split(';').next().unwrap_or("").trim();
                match u64::from_str_radix(size_part, 16) {
                    Ok(size) if !size_part.is_empty() => {
                        if size == 0 {
                            self.state = State::BodyChunkTrailer;
                        } else {
                            self.state = State::BodyChunkData { remaining: size };
                        }
                    }
                    _ => {
                        events.push(ParserEvent::Error(ErrorCode::InvalidChunkSize));
                        self.reset_state();
                        events.push(ParserEvent::Reset);
                        return i;
                    }
                }
                return i;
            } else {
                self.line_buf.push(b);
            }
        }
        i
    }

    fn feed_trailer_line(&mut self, bytes: &[u8], mut i: usize, events: &mut Vec<ParserEvent>) -> usize {
        while i < bytes.len() {
            let b = bytes[i];
            i += 1;
            if b == b'\n' {
                let had_cr = self.line_buf.last() == Some(&b'\r');
                if had_cr {
                    self.line_buf.pop();
                } else {
                    self.tolerated_issues += 1;
                }
                let line = std::mem::take(&mut self.line_buf);
                if line.is_empty() {
                    events.push(ParserEvent::BodyChunk { data: Bytes::new(), is_last: true });
                    self.reset_state();
                    return i;
                }
                // Trailer headers are consumed and discarded — spec §9
                // does not require forwarding trailers.
                return i;
            } else {
                self.line_buf.push(b);
            }
        }
        i
    }
}
