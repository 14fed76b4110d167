//! Backend link for the request at the front of a connection's queue
//!
//! The head is sent first, then body bytes as the client delivers them.
//! The response is relayed verbatim; its head is parsed only to find where
//! the response ends.
//!
//! ```text
//!   connect ──EINPROGRESS──► wait writable ──► SO_ERROR ok
//!      │                                           │
//!      └──────────────► send head ◄────────────────┘
//!                          │
//!                      send body* ──► read response* ──► complete / EOF
//! ```

use std::net::SocketAddrV4;
use std::ops::ControlFlow;
use std::os::fd::RawFd;

use nix::errno::Errno;
use plume_core::buffer::MAX_BUFFER;
use plume_core::numeric::{fold_eq, str2i};
use plume_core::{Buffer, Registry};

use crate::parser::{FieldHandler, Parser, ResponseHandler, Status, Version};

// ── Response tracking ──

#[derive(Debug, Default)]
struct ResponseHead {
    code: u16,
    content_length: Option<u64>,
}

impl FieldHandler for ResponseHead {
    fn on_field(&mut self, key: &[u8], value: &[u8]) -> ControlFlow<()> {
        if fold_eq(key, b"content-length") {
            let n = str2i(value);
            self.content_length = u64::try_from(n).ok();
        }
        ControlFlow::Continue(())
    }
}

impl ResponseHandler for ResponseHead {
    fn on_status_line(&mut self, _version: Version, code: u16, _reason: &[u8]) -> ControlFlow<()> {
        self.code = code;
        ControlFlow::Continue(())
    }
}

/// What to do with one chunk of backend bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Leading bytes of the chunk that belong to this response
    pub relay: usize,
    /// The response ended inside the chunk
    pub complete: bool,
}

/// Finds the end of a response as its bytes stream past.
#[derive(Debug, Default)]
pub struct ResponseTracker {
    parser: Parser,
    head: ResponseHead,
    /// Unconsumed head bytes carried between chunks
    pending: Vec<u8>,
    head_done: bool,
    head_request: bool,
    /// Body bytes still expected; `None` until EOF
    remaining: Option<u64>,
}

impl ResponseTracker {
    pub fn new(head_request: bool) -> Self {
        Self {
            head_request,
            ..Self::default()
        }
    }

    #[inline]
    pub fn head_done(&self) -> bool {
        self.head_done
    }

    /// Status code of the final response head, 0 until parsed.
    #[inline]
    pub fn code(&self) -> u16 {
        self.head.code
    }

    /// The response runs until the backend closes.
    #[inline]
    pub fn close_delimited(&self) -> bool {
        self.head_done && self.remaining.is_none()
    }

    pub fn feed(&mut self, data: &[u8]) -> Progress {
        let mut body_start = 0;

        if !self.head_done {
            self.pending.extend_from_slice(data);
            loop {
                let status = self.parser.parse_response(&self.pending, &mut self.head);
                let parsed = self.parser.parsed();
                self.pending.drain(..parsed);
                match status {
                    Status::Done => {
                        let code = self.head.code;
                        if (100..200).contains(&code) && code != 101 {
                            // interim response, the real head follows
                            self.parser.reset();
                            self.head = ResponseHead::default();
                            continue;
                        }
                        self.head_done = true;
                        self.remaining = if self.head_request || code < 200 || code == 204 || code == 304 {
                            Some(0)
                        } else {
                            self.head.content_length
                        };
                        body_start = data.len() - self.pending.len().min(data.len());
                        self.pending = Vec::new();
                        break;
                    }
                    Status::Again if self.pending.len() <= MAX_BUFFER => {
                        return Progress {
                            relay: data.len(),
                            complete: false,
                        };
                    }
                    _ => {
                        tracing::debug!("unparseable response head, relaying until close");
                        self.head_done = true;
                        self.remaining = None;
                        self.pending = Vec::new();
                        return Progress {
                            relay: data.len(),
                            complete: false,
                        };
                    }
                }
            }
        }

        let body = (data.len() - body_start) as u64;
        match self.remaining {
            None => Progress {
                relay: data.len(),
                complete: false,
            },
            Some(left) => {
                let take = left.min(body);
                debug_assert!(take <= body);
                self.remaining = Some(left - take);
                Progress {
                    relay: body_start + take as usize,
                    complete: left == take,
                }
            }
        }
    }
}

// ── Backend link ──

/// Result of pushing request bytes to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// Socket buffer full; wait for writability
    Blocked,
    /// Everything available went out, more body is still to come
    Idle,
    /// Head and full body sent
    Complete,
}

pub struct Forward {
    pub fd: RawFd,
    pub addr: SocketAddrV4,
    head: Vec<u8>,
    head_off: usize,
    /// Body bytes written to the backend
    body_total: u64,
    pub connected: bool,
    pub header_sent: bool,
    pub body_sent: bool,
    pub post_read_armed: bool,
    pub write_armed: bool,
    /// Backend reads wait for the client queue to drain
    pub read_paused: bool,
    pub buf: Buffer,
    pub tracker: ResponseTracker,
    /// Response bytes passed to the client so far
    pub relayed: u64,
}

impl Forward {
    pub fn new(fd: RawFd, addr: SocketAddrV4, head: Vec<u8>, buf: Buffer, head_request: bool) -> Self {
        Self {
            fd,
            addr,
            head,
            head_off: 0,
            body_total: 0,
            connected: false,
            header_sent: false,
            body_sent: false,
            post_read_armed: false,
            write_armed: false,
            read_paused: false,
            buf,
            tracker: ResponseTracker::new(head_request),
            relayed: 0,
        }
    }

    /// Head or buffered body bytes are waiting to go out.
    #[inline]
    pub fn has_unsent(&self, body: &[u8]) -> bool {
        !self.body_sent && (self.head_off < self.head.len() || !body.is_empty())
    }

    /// Body bytes written to the backend so far.
    #[inline]
    pub fn body_total(&self) -> u64 {
        self.body_total
    }

    /// Write head then body, from where the last call stopped. Body bytes
    /// that went out are drained from `body`.
    pub fn send(&mut self, reg: &Registry, body: &mut Vec<u8>, content_length: u64) -> Result<Sent, Errno> {
        while self.head_off < self.head.len() {
            match reg.write(self.fd, &self.head[self.head_off..]) {
                Ok(n) => self.head_off += n,
                Err(Errno::EAGAIN) => return Ok(Sent::Blocked),
                Err(e) => return Err(e),
            }
        }
        if !self.header_sent {
            self.header_sent = true;
            self.head = Vec::new();
            self.head_off = 0;
        }

        let mut off = 0;
        let mut blocked = false;
        while off < body.len() {
            match reg.write(self.fd, &body[off..]) {
                Ok(n) => off += n,
                Err(Errno::EAGAIN) => {
                    blocked = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        body.drain(..off);
        self.body_total += off as u64;

        if blocked {
            return Ok(Sent::Blocked);
        }
        if self.body_total >= content_length {
            self.body_sent = true;
            return Ok(Sent::Complete);
        }
        Ok(Sent::Idle)
    }
}
