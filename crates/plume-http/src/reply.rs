//! Canned error responses

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    BadRequest,
    BadGateway,
    NoBackend,
}

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Server: plume\r\n\
Content-Type: text/plain\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
bad request\n";

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Server: plume\r\n\
Content-Type: text/plain\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
bad gateway\n";

const NO_BACKEND: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Server: plume\r\n\
Content-Type: text/plain\r\n\
Content-Length: 11\r\n\
Connection: close\r\n\
\r\n\
no backend\n";

impl Reply {
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Reply::BadRequest => BAD_REQUEST,
            Reply::BadGateway => BAD_GATEWAY,
            Reply::NoBackend => NO_BACKEND,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Reply::BadRequest => 400,
            Reply::BadGateway => 502,
            Reply::NoBackend => 503,
        }
    }
}
