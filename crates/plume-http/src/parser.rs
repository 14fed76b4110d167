//! Incremental HTTP/1.x head parser
//!
//! The parser is fed whatever bytes have arrived. It consumes complete
//! lines only and reports how many bytes it took ([`Parser::parsed`]);
//! the caller keeps the rest and presents it again with the next chunk.
//!
//! ```text
//!   None ──line──► LineDone ──field*──► (CR) ──LF──► HeaderDone
//!                                        │
//!                                     HeaderCr: CR consumed, LF pending
//! ```
//!
//! Callbacks may stop the parse by returning `ControlFlow::Break`, which
//! surfaces as [`Status::Break`].

use std::ops::ControlFlow;

use plume_core::numeric::trim_spaces;

/// Outcome of one parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Head complete; body bytes (if any) start at `parsed()`
    Done,
    /// Need more bytes
    Again,
    /// Malformed input
    Error,
    /// A callback asked to stop
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http09 => "HTTP/0.9",
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"HTTP/0.9" => Some(Version::Http09),
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Post,
    Put,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    pub fn parse(s: &[u8]) -> Option<Self> {
        let m = match s {
            b"CONNECT" => Method::Connect,
            b"DELETE" => Method::Delete,
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            _ => return None,
        };
        Some(m)
    }
}

/// Header field callbacks shared by requests and responses.
pub trait FieldHandler {
    fn on_field(&mut self, key: &[u8], value: &[u8]) -> ControlFlow<()>;

    fn on_header_done(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

pub trait RequestHandler: FieldHandler {
    fn on_request_line(&mut self, method: Method, url: &[u8], version: Version) -> ControlFlow<()>;
}

pub trait ResponseHandler: FieldHandler {
    fn on_status_line(&mut self, version: Version, code: u16, reason: &[u8]) -> ControlFlow<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    None,
    LineDone,
    HeaderCr,
    HeaderDone,
}

/// Result of splitting off one line.
enum Line<'a> {
    /// Line content without CRLF, and bytes consumed including CRLF
    Complete(&'a [u8], usize),
    Partial,
    /// LF without a preceding CR
    Bad,
}

fn next_line(buf: &[u8]) -> Line<'_> {
    match buf.iter().position(|&b| b == b'\n') {
        None => Line::Partial,
        Some(lf) if lf > 0 && buf[lf - 1] == b'\r' => Line::Complete(&buf[..lf - 1], lf + 1),
        Some(_) => Line::Bad,
    }
}

fn skip_spaces(buf: &[u8]) -> usize {
    buf.iter().take_while(|&&b| b == b' ').count()
}

fn request_line<H: RequestHandler>(line: &[u8], h: &mut H) -> Option<ControlFlow<()>> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = Method::parse(parts.next()?)?;
    let url = parts.next()?;
    let version = Version::parse(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(h.on_request_line(method, url, version))
}

fn status_line<H: ResponseHandler>(line: &[u8], h: &mut H) -> Option<ControlFlow<()>> {
    let sp = line.iter().position(|&b| b == b' ')?;
    let version = Version::parse(&line[..sp])?;
    let rest = &line[sp + skip_spaces(&line[sp..])..];
    let (code, reason) = match rest.iter().position(|&b| b == b' ') {
        Some(i) => (&rest[..i], trim_spaces(&rest[i..])),
        None => (rest, &b""[..]),
    };
    if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = code.iter().fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));
    Some(h.on_status_line(version, code, reason))
}

#[derive(Debug, Default, Clone)]
pub struct Parser {
    state: State,
    parsed: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all progress, ready for the next message.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bytes consumed by the last call.
    #[inline]
    pub fn parsed(&self) -> usize {
        self.parsed
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    pub fn parse_request<H: RequestHandler>(&mut self, buf: &[u8], h: &mut H) -> Status {
        self.drive(buf, h, request_line)
    }

    pub fn parse_response<H: ResponseHandler>(&mut self, buf: &[u8], h: &mut H) -> Status {
        self.drive(buf, h, status_line)
    }

    fn drive<H: FieldHandler>(
        &mut self,
        buf: &[u8],
        h: &mut H,
        first: fn(&[u8], &mut H) -> Option<ControlFlow<()>>,
    ) -> Status {
        self.parsed = 0;
        loop {
            let rest = &buf[self.parsed..];
            match self.state {
                State::HeaderDone => return Status::Done,

                State::None => {
                    let skip = skip_spaces(rest);
                    let (line, used) = match next_line(&rest[skip..]) {
                        Line::Complete(line, used) => (line, used),
                        Line::Partial => return Status::Again,
                        Line::Bad => return Status::Error,
                    };
                    let flow = match first(line, h) {
                        Some(flow) => flow,
                        None => return Status::Error,
                    };
                    self.parsed += skip + used;
                    self.state = State::LineDone;
                    if flow.is_break() {
                        return Status::Break;
                    }
                }

                State::LineDone => match rest {
                    [] => return Status::Again,
                    [b'\r'] => {
                        self.parsed += 1;
                        self.state = State::HeaderCr;
                        return Status::Again;
                    }
                    [b'\r', b'\n', ..] => {
                        self.parsed += 2;
                        return self.header_done(h);
                    }
                    [b'\r', ..] => return Status::Error,
                    _ => {
                        let skip = skip_spaces(rest);
                        let (line, used) = match next_line(&rest[skip..]) {
                            Line::Complete(line, used) => (line, used),
                            Line::Partial => return Status::Again,
                            Line::Bad => return Status::Error,
                        };
                        let Some(colon) = line.iter().position(|&b| b == b':') else {
                            return Status::Error;
                        };
                        let key = trim_spaces(&line[..colon]);
                        let value = trim_spaces(&line[colon + 1..]);
                        self.parsed += skip + used;
                        if h.on_field(key, value).is_break() {
                            return Status::Break;
                        }
                    }
                },

                State::HeaderCr => match rest {
                    [] => return Status::Again,
                    [b'\n', ..] => {
                        self.parsed += 1;
                        return self.header_done(h);
                    }
                    _ => return Status::Error,
                },
            }
        }
    }

    fn header_done<H: FieldHandler>(&mut self, h: &mut H) -> Status {
        self.state = State::HeaderDone;
        match h.on_header_done() {
            ControlFlow::Break(()) => Status::Break,
            ControlFlow::Continue(()) => Status::Done,
        }
    }
}
