//! Parsed requests
//!
//! Every string a request holds (target, header keys and values) lives in
//! the owning connection's [`MemPool`]; the request itself only keeps
//! [`Span`]s into it.

use std::ops::ControlFlow;

use plume_core::numeric::{fold_eq, fold_hash, str2i};
use plume_core::{MemPool, Span};

use crate::error::ProxyError;
use crate::parser::{FieldHandler, Method, RequestHandler, Version};
use crate::url::parse_url;

pub const DEFAULT_PORT: u16 = 80;

const HEADER_BUCKETS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Field {
    key: Span,
    value: Span,
    hash: u32,
}

/// Header fields in arrival order, with case-insensitive lookup.
#[derive(Debug, Default)]
pub struct HeaderTable {
    fields: Vec<Field>,
    buckets: [Vec<u16>; HEADER_BUCKETS],
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: &mut MemPool, key: &[u8], value: &[u8]) -> plume_core::Result<()> {
        let index = u16::try_from(self.fields.len())
            .map_err(|_| plume_core::Error::Exhausted("header table"))?;
        let hash = fold_hash(key);
        let key = pool.alloc_copy(key)?;
        let value = pool.alloc_copy(value)?;
        self.fields.push(Field { key, value, hash });
        self.buckets[hash as usize % HEADER_BUCKETS].push(index);
        Ok(())
    }

    /// First value stored under `key`, ignoring ASCII case.
    pub fn get<'p>(&self, pool: &'p MemPool, key: &[u8]) -> Option<&'p [u8]> {
        self.span(pool, key).map(|s| pool.get(s))
    }

    fn span(&self, pool: &MemPool, key: &[u8]) -> Option<Span> {
        let hash = fold_hash(key);
        self.buckets[hash as usize % HEADER_BUCKETS]
            .iter()
            .map(|&i| self.fields[usize::from(i)])
            .find(|f| f.hash == hash && fold_eq(pool.get(f.key), key))
            .map(|f| f.value)
    }

    pub fn contains(&self, pool: &MemPool, key: &[u8]) -> bool {
        self.span(pool, key).is_some()
    }

    /// Fields in parse order.
    pub fn iter<'p>(&'p self, pool: &'p MemPool) -> impl Iterator<Item = (&'p [u8], &'p [u8])> + 'p {
        self.fields.iter().map(move |f| (pool.get(f.key), pool.get(f.value)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    url: Span,
    path: Span,
    host: Span,
    pub port: u16,
    pub content_length: u64,
    pub keep_alive: bool,
    pub headers: HeaderTable,
    /// Body bytes received and not yet sent to the backend
    pub body: Vec<u8>,
    /// Body bytes received in total
    received: u64,
}

impl Request {
    fn new(method: Method, version: Version) -> Self {
        Self {
            method,
            version,
            url: Span::default(),
            path: Span::default(),
            host: Span::default(),
            port: DEFAULT_PORT,
            content_length: 0,
            keep_alive: version == Version::Http11,
            headers: HeaderTable::new(),
            body: Vec::new(),
            received: 0,
        }
    }

    pub fn url<'p>(&self, pool: &'p MemPool) -> &'p [u8] {
        pool.get(self.url)
    }

    pub fn path<'p>(&self, pool: &'p MemPool) -> &'p [u8] {
        pool.get(self.path)
    }

    pub fn host<'p>(&self, pool: &'p MemPool) -> &'p [u8] {
        pool.get(self.host)
    }

    /// Buffer body bytes read from the client.
    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
        self.received += data.len() as u64;
    }

    /// All body bytes have arrived.
    #[inline]
    pub fn body_complete(&self) -> bool {
        self.received >= self.content_length
    }

    /// Serialize the head sent to the backend: request line with the
    /// origin-form path, the fields in parse order, a `Host` field when the
    /// client sent none, then the blank line.
    pub fn write_head(&self, pool: &MemPool, out: &mut Vec<u8>) {
        let path = match self.path(pool) {
            [] => &b"/"[..],
            p => p,
        };
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(path);
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");

        for (key, value) in self.headers.iter(pool) {
            out.extend_from_slice(key);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        if !self.host.is_empty() && !self.headers.contains(pool, b"host") {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(self.host(pool));
            if self.port != DEFAULT_PORT {
                out.extend_from_slice(format!(":{}", self.port).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

// ── Parse target ──

/// Builds a [`Request`] from parser callbacks.
pub struct RequestBuilder<'a> {
    pool: &'a mut MemPool,
    slot: &'a mut Option<Request>,
    error: Option<ProxyError>,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(pool: &'a mut MemPool, slot: &'a mut Option<Request>) -> Self {
        Self {
            pool,
            slot,
            error: None,
        }
    }

    /// Why a callback stopped the parse.
    pub fn take_error(&mut self) -> Option<ProxyError> {
        self.error.take()
    }

    fn fail(&mut self, err: ProxyError) -> ControlFlow<()> {
        self.error = Some(err);
        ControlFlow::Break(())
    }

    fn line(&mut self, method: Method, url: &[u8], version: Version) -> plume_core::Result<Option<Request>> {
        let span = self.pool.alloc_copy(url)?;
        let stored = self.pool.get(span);
        let Some(parts) = parse_url(stored) else {
            return Ok(None);
        };
        let offset = |part: &[u8]| part.as_ptr() as usize - stored.as_ptr() as usize;

        let mut req = Request::new(method, version);
        req.url = span;
        let at = offset(parts.path);
        req.path = span.slice(at, at + parts.path.len());
        if !parts.host.is_empty() {
            let at = offset(parts.host);
            req.host = span.slice(at, at + parts.host.len());
        }
        if parts.port.is_some() {
            match parts.port_number() {
                Some(port) => req.port = port,
                None => return Ok(None),
            }
        }
        Ok(Some(req))
    }
}

impl FieldHandler for RequestBuilder<'_> {
    fn on_field(&mut self, key: &[u8], value: &[u8]) -> ControlFlow<()> {
        let Some(req) = self.slot.as_mut() else {
            return self.fail(ProxyError::BadRequest("field before request line"));
        };

        let key = if fold_eq(key, b"proxy-connection") {
            &b"Connection"[..]
        } else {
            key
        };

        if fold_eq(key, b"content-length") {
            let n = str2i(value);
            if n < 0 {
                return self.fail(ProxyError::BadRequest("negative content-length"));
            }
            req.content_length = n as u64;
        } else if fold_eq(key, b"connection") {
            if fold_eq(value, b"close") {
                req.keep_alive = false;
            } else if fold_eq(value, b"keep-alive") {
                req.keep_alive = true;
            }
        }

        if let Err(e) = req.headers.insert(self.pool, key, value) {
            return self.fail(e.into());
        }

        if fold_eq(key, b"host") && req.host.is_empty() {
            if let Some(span) = req.headers.span(self.pool, b"host") {
                let host = self.pool.get(span);
                match host.iter().position(|&b| b == b':') {
                    Some(i) => {
                        req.host = span.slice(0, i);
                        match u16::try_from(str2i(&host[i + 1..])) {
                            Ok(port) if port != 0 => req.port = port,
                            _ => return self.fail(ProxyError::BadRequest("bad host port")),
                        }
                    }
                    None => req.host = span,
                }
            }
        }
        ControlFlow::Continue(())
    }
}

impl RequestHandler for RequestBuilder<'_> {
    fn on_request_line(&mut self, method: Method, url: &[u8], version: Version) -> ControlFlow<()> {
        match self.line(method, url, version) {
            Ok(Some(req)) => {
                *self.slot = Some(req);
                ControlFlow::Continue(())
            }
            Ok(None) => self.fail(ProxyError::BadRequest("bad request target")),
            Err(e) => self.fail(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Parser, Status};

    fn parse(pool: &mut MemPool, bytes: &[u8]) -> (Status, Option<Request>, Option<ProxyError>) {
        let mut slot = None;
        let mut p = Parser::new();
        let mut b = RequestBuilder::new(pool, &mut slot);
        let status = p.parse_request(bytes, &mut b);
        let err = b.take_error();
        (status, slot, err)
    }

    #[test]
    fn test_header_table_lookup_and_order() {
        let mut pool = MemPool::new(256);
        let mut t = HeaderTable::new();
        t.insert(&mut pool, b"Host", b"a").unwrap();
        t.insert(&mut pool, b"X-Thing", b"1").unwrap();
        t.insert(&mut pool, b"x-thing", b"2").unwrap();

        assert_eq!(t.get(&pool, b"HOST"), Some(&b"a"[..]));
        assert_eq!(t.get(&pool, b"X-THING"), Some(&b"1"[..]));
        assert_eq!(t.get(&pool, b"missing"), None);
        let keys: Vec<&[u8]> = t.iter(&pool).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"Host"[..], &b"X-Thing"[..], &b"x-thing"[..]]);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let mut pool = MemPool::default();
        let (status, req, _) = parse(&mut pool, b"GET /foo HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(status, Status::Done);
        let req = req.unwrap();
        assert_eq!(req.path(&pool), b"/foo");
        assert_eq!(req.host(&pool), b"example.com");
        assert_eq!(req.port, 8080);
        assert!(req.keep_alive);
    }

    #[test]
    fn test_absolute_form() {
        let mut pool = MemPool::default();
        let (status, req, _) = parse(
            &mut pool,
            b"GET http://example.com/a?b HTTP/1.0\r\nProxy-Connection: keep-alive\r\n\r\n",
        );
        assert_eq!(status, Status::Done);
        let req = req.unwrap();
        assert_eq!(req.url(&pool), b"http://example.com/a?b");
        assert_eq!(req.path(&pool), b"/a?b");
        assert_eq!(req.host(&pool), b"example.com");
        assert_eq!(req.port, DEFAULT_PORT);
        assert!(req.keep_alive);
        assert_eq!(req.headers.get(&pool, b"connection"), Some(&b"keep-alive"[..]));
        assert!(!req.headers.contains(&pool, b"proxy-connection"));
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut pool = MemPool::default();
        let (_, req, _) = parse(&mut pool, b"GET / HTTP/1.0\r\n\r\n");
        assert!(!req.unwrap().keep_alive);
        let (_, req, _) = parse(&mut pool, b"GET / HTTP/1.1\r\nConnection: Close\r\n\r\n");
        assert!(!req.unwrap().keep_alive);
    }

    #[test]
    fn test_content_length() {
        let mut pool = MemPool::default();
        let (_, req, _) = parse(&mut pool, b"POST /u HTTP/1.1\r\nContent-Length: 42\r\n\r\n");
        assert_eq!(req.unwrap().content_length, 42);

        let (status, _, err) = parse(&mut pool, b"POST /u HTTP/1.1\r\nContent-Length: -1\r\n\r\n");
        assert_eq!(status, Status::Break);
        assert!(matches!(err, Some(ProxyError::BadRequest(_))));
    }

    #[test]
    fn test_body_complete_counts_drained_bytes() {
        let mut pool = MemPool::default();
        let (_, req, _) = parse(&mut pool, b"POST /u HTTP/1.1\r\nContent-Length: 6\r\n\r\n");
        let mut req = req.unwrap();
        assert!(!req.body_complete());

        req.append_body(b"abc");
        req.body.clear();
        assert!(!req.body_complete());
        req.append_body(b"def");
        assert!(req.body_complete());
        assert_eq!(req.body, b"def");
    }

    #[test]
    fn test_bad_target() {
        let mut pool = MemPool::default();
        let (status, req, err) = parse(&mut pool, b"GET http:nowhere HTTP/1.1\r\n\r\n");
        assert_eq!(status, Status::Break);
        assert!(req.is_none());
        assert!(matches!(err, Some(ProxyError::BadRequest(_))));
    }

    #[test]
    fn test_write_head() {
        let mut pool = MemPool::default();
        let (_, req, _) = parse(
            &mut pool,
            b"GET http://example.com:81/x HTTP/1.1\r\nAccept: */*\r\nProxy-Connection: close\r\n\r\n",
        );
        let mut out = Vec::new();
        req.unwrap().write_head(&pool, &mut out);
        assert_eq!(
            out,
            b"GET /x HTTP/1.1\r\nAccept: */*\r\nConnection: close\r\nHost: example.com:81\r\n\r\n"
        );

        let (_, req, _) = parse(&mut pool, b"GET /foo HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut out = Vec::new();
        req.unwrap().write_head(&pool, &mut out);
        assert_eq!(out, b"GET /foo HTTP/1.1\r\nHost: h\r\n\r\n");
    }
}
