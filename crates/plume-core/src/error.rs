//! Plume error types.

use nix::errno::Errno;
use std::io;
use std::os::fd::RawFd;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS error carried as an errno.
    #[error("OS error: {0}")]
    Os(#[from] Errno),

    /// I/O error from std.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Descriptor number is outside the registry.
    #[error("fd {fd} exceeds maxfd {maxfd}")]
    FdOutOfRange { fd: RawFd, maxfd: usize },

    /// Descriptor is not marked open in the registry.
    #[error("fd {0} is not open")]
    NotOpen(RawFd),

    /// Bad address string in config or at open time.
    #[error("invalid address: {0}")]
    Addr(String),

    /// Config file could not be read or parsed.
    #[error("config: {0}")]
    Config(String),

    /// A config value failed validation.
    #[error("invalid config: {0}")]
    Invalid(&'static str),

    /// Unknown directive inside a plugin block.
    #[error("unknown directive `{directive}` in block `{block}`")]
    UnknownDirective { block: String, directive: String },

    /// A plugin lifecycle hook failed.
    #[error("plugin {plugin}: {reason}")]
    Plugin { plugin: &'static str, reason: String },

    /// Pool, lookaside or timer allocation failed.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// Dispatcher is not running or already started.
    #[error("dispatcher state: {0}")]
    State(&'static str),
}

impl Error {
    /// Build a plugin error with a formatted reason.
    pub fn plugin(plugin: &'static str, reason: impl Into<String>) -> Self {
        Error::Plugin {
            plugin,
            reason: reason.into(),
        }
    }

    /// The errno behind this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os(e) => Some(*e),
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}
