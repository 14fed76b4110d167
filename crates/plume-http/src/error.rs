//! Proxy error classification

use nix::errno::Errno;
use std::net::SocketAddrV4;

use crate::reply::Reply;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("no backend available")]
    NoBackend,

    #[error("backend {addr}: {source}")]
    Backend {
        addr: SocketAddrV4,
        #[source]
        source: Errno,
    },

    #[error("backend {0} closed before the response completed")]
    BackendClosed(SocketAddrV4),

    #[error(transparent)]
    Core(#[from] plume_core::Error),
}

impl ProxyError {
    /// Canned response sent to the client for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            ProxyError::BadRequest(_) => Reply::BadRequest,
            ProxyError::NoBackend => Reply::NoBackend,
            ProxyError::Backend { .. } | ProxyError::BackendClosed(_) | ProxyError::Core(_) => {
                Reply::BadGateway
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_reply_mapping() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8081);
        assert_eq!(ProxyError::BadRequest("x").reply(), Reply::BadRequest);
        assert_eq!(ProxyError::NoBackend.reply(), Reply::NoBackend);
        assert_eq!(
            ProxyError::Backend { addr, source: Errno::ECONNREFUSED }.reply(),
            Reply::BadGateway
        );
        assert_eq!(ProxyError::BackendClosed(addr).reply(), Reply::BadGateway);
        assert_eq!(
            ProxyError::from(plume_core::Error::Exhausted("buffer")).reply(),
            Reply::BadGateway
        );
    }

    #[test]
    fn test_display() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8081);
        let e = ProxyError::Backend { addr, source: Errno::ECONNREFUSED };
        assert!(e.to_string().starts_with("backend 127.0.0.1:8081"));
    }
}
