//! Incremental HTTP/1.x response parser.
//!
//! Bytes arrive in whatever pieces the socket hands out. Every raw head
//! line (status line, header lines, the blank line) is reported to the
//! [`Sink`] as soon as it is complete, and decoded body bytes are reported
//! as they are framed.

use bytes::{Buf, BytesMut};

use crate::error::HttpError;

/// Longest head line accepted before the response is rejected.
const MAX_LINE: usize = 64 * 1024;

/// Receives parsed response pieces.
pub(crate) trait Sink {
    /// A complete head line including its CRLF.
    fn header(&mut self, line: &[u8]);
    /// Decoded body bytes.
    fn body(&mut self, chunk: &[u8]);
}

/// Interesting fields of the most recent response head.
#[derive(Debug, Default, Clone)]
pub(crate) struct Head {
    pub(crate) status: u16,
    pub(crate) minor_version: u8,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) close: bool,
    pub(crate) keep_alive: bool,
    pub(crate) location: Option<String>,
    pub(crate) set_cookies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    UntilClose,
    Done,
}

#[derive(Debug)]
pub(crate) struct ResponseParser {
    buf: BytesMut,
    state: State,
    head: Head,
    /// The request was HEAD: final responses carry no body.
    head_request: bool,
    received: u64,
    body_bytes: u64,
    /// Bytes arrived after the response was complete.
    trailing: bool,
}

impl ResponseParser {
    pub(crate) fn new(head_request: bool) -> Self {
        ResponseParser {
            buf: BytesMut::new(),
            state: State::StatusLine,
            head: Head::default(),
            head_request,
            received: 0,
            body_bytes: 0,
            trailing: false,
        }
    }

    /// Feed bytes read from the connection. Returns `true` once the
    /// response is complete.
    pub(crate) fn feed(&mut self, data: &[u8], sink: &mut dyn Sink) -> Result<bool, HttpError> {
        self.received += data.len() as u64;
        if self.state == State::Done {
            self.trailing |= !data.is_empty();
            return Ok(true);
        }
        self.buf.extend_from_slice(data);
        self.advance(sink)?;
        if self.state == State::Done && !self.buf.is_empty() {
            self.trailing = true;
            self.buf.clear();
        }
        Ok(self.state == State::Done)
    }

    /// The peer closed the connection.
    pub(crate) fn finish(&mut self) -> Result<(), HttpError> {
        match self.state {
            State::Done => Ok(()),
            State::UntilClose => {
                self.state = State::Done;
                Ok(())
            }
            State::StatusLine if self.received == 0 => Err(HttpError::ConnectionClosed),
            State::StatusLine | State::Headers => {
                Err(HttpError::Protocol("connection closed inside response head".into()))
            }
            State::Length(remaining) => Err(HttpError::Protocol(format!(
                "transfer closed with {remaining} bytes remaining to read"
            ))),
            State::ChunkSize | State::ChunkData(_) | State::ChunkEnd | State::Trailers => Err(
                HttpError::Protocol("transfer closed with outstanding read data remaining".into()),
            ),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Whether any byte of a response has arrived.
    pub(crate) fn head(&self) -> &Head {
        &self.head
    }

    pub(crate) fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// The connection can carry another request.
    pub(crate) fn reusable(&self) -> bool {
        self.state == State::Done
            && !self.trailing
            && !self.head.close
            && (self.head.minor_version >= 1 || self.head.keep_alive)
            && (self.head.chunked || self.head.content_length.is_some() || !self.has_body())
    }

    fn has_body(&self) -> bool {
        let status = self.head.status;
        !(self.head_request || status < 200 || status == 204 || status == 304)
    }

    fn advance(&mut self, sink: &mut dyn Sink) -> Result<(), HttpError> {
        loop {
            match self.state {
                State::StatusLine => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    sink.header(&line);
                    self.head = parse_status_line(&line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    sink.header(&line);
                    if line.len() == 2 {
                        self.state = self.body_state();
                    } else {
                        self.header_field(&line[..line.len() - 2])?;
                    }
                }
                State::Length(remaining) => {
                    let left = self.emit(remaining, sink);
                    if left > 0 {
                        self.state = State::Length(left);
                        return Ok(());
                    }
                    self.state = State::Done;
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    let size = parse_chunk_size(&line[..line.len() - 2])?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData(size)
                    };
                }
                State::ChunkData(remaining) => {
                    let left = self.emit(remaining, sink);
                    if left > 0 {
                        self.state = State::ChunkData(left);
                        return Ok(());
                    }
                    self.state = State::ChunkEnd;
                }
                State::ChunkEnd => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(HttpError::Parse("missing chunk terminator"));
                    }
                    self.buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    if line.len() == 2 {
                        self.state = State::Done;
                    }
                }
                State::UntilClose => {
                    let n = self.buf.len() as u64;
                    self.emit(n, sink);
                    return Ok(());
                }
                State::Done => return Ok(()),
            }
        }
    }

    /// State after the blank line ending a head.
    fn body_state(&self) -> State {
        let status = self.head.status;
        if (100..200).contains(&status) && status != 101 {
            // Interim response; the real one follows.
            return State::StatusLine;
        }
        if !self.has_body() {
            return State::Done;
        }
        if self.head.chunked {
            return State::ChunkSize;
        }
        match self.head.content_length {
            Some(0) => State::Done,
            Some(n) => State::Length(n),
            None => State::UntilClose,
        }
    }

    /// Hand up to `want` buffered bytes to the sink. Returns how many are
    /// still wanted.
    fn emit(&mut self, want: u64, sink: &mut dyn Sink) -> u64 {
        let n = (self.buf.len() as u64).min(want) as usize;
        if n > 0 {
            sink.body(&self.buf[..n]);
            self.buf.advance(n);
            self.body_bytes += n as u64;
        }
        want - n as u64
    }

    /// Split off one CRLF-terminated line, terminator included.
    fn take_line(&mut self) -> Result<Option<BytesMut>, HttpError> {
        match find_crlf(&self.buf) {
            Some(pos) => Ok(Some(self.buf.split_to(pos + 2))),
            None if self.buf.len() > MAX_LINE => Err(HttpError::Parse("response line too long")),
            None => Ok(None),
        }
    }

    fn header_field(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            // Tolerated, as most clients do.
            return Ok(());
        };
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| HttpError::Parse("non-utf8 header name"))?
            .trim();
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();

        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse::<u64>()
                .map_err(|_| HttpError::Parse("invalid content-length"))?;
            self.head.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            self.head.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    self.head.close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.head.keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case("location") {
            self.head.location = Some(value);
        } else if name.eq_ignore_ascii_case("set-cookie") {
            self.head.set_cookies.push(value);
        }
        Ok(())
    }
}

/// `HTTP/1.1 200 OK` → status and minor version.
fn parse_status_line(line: &[u8]) -> Result<Head, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::Parse("non-utf8 status line"))?;
    let mut parts = text.trim_end().splitn(3, ' ');
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .ok_or(HttpError::Parse("malformed status line"))?;
    let status = parts
        .next()
        .filter(|s| s.len() == 3)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(HttpError::Parse("malformed status code"))?;
    let minor_version = match version.split_once('.') {
        Some((_, minor)) => minor.parse().unwrap_or(0),
        None => 1,
    };
    Ok(Head {
        status,
        minor_version,
        close: status == 101,
        ..Head::default()
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::Parse("invalid chunk size"))?;
    // Strip chunk extensions (;key=value).
    let hex = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(hex, 16).map_err(|_| HttpError::Parse("invalid chunk size"))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}
