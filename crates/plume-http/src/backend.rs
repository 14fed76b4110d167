//! Backend table with a process-wide round-robin cursor

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};

use plume_core::{Error, Result};

#[derive(Debug, Default)]
pub struct Backends {
    addrs: Vec<SocketAddrV4>,
    cursor: AtomicUsize,
}

impl Backends {
    pub fn new(addrs: Vec<SocketAddrV4>) -> Self {
        Self {
            addrs,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Parse `ip:port` entries. `localhost` is accepted for the loopback
    /// address.
    pub fn parse(args: &[String]) -> Result<Vec<SocketAddrV4>> {
        args.iter().map(|a| parse_backend(a)).collect()
    }

    /// Next backend in rotation, or `None` when the table is empty.
    pub fn select(&self) -> Option<SocketAddrV4> {
        if self.addrs.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(self.addrs[i % self.addrs.len()])
    }

    pub fn addrs(&self) -> &[SocketAddrV4] {
        &self.addrs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

fn parse_backend(s: &str) -> Result<SocketAddrV4> {
    let s = s.trim();
    let bad = || Error::plugin("http", format!("backends: bad address `{s}`"));
    let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
    let ip = match host {
        "localhost" => Ipv4Addr::LOCALHOST,
        h => h.parse().map_err(|_| bad())?,
    };
    let port: u16 = port.parse().map_err(|_| bad())?;
    if port == 0 {
        return Err(bad());
    }
    Ok(SocketAddrV4::new(ip, port))
}
