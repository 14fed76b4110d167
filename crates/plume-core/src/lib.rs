//! # plume-core
//!
//! Runtime for the plume pluggable network server.
//!
//! Every worker thread runs a dispatch loop over a thread-local poller and
//! takes turns on a process-global poller that watches listening sockets.
//! All I/O is non-blocking: code waits by registering a one-shot callback
//! and returning.
//!
//! ```text
//!                ┌──────────────── Context ────────────────┐
//!                │ Config  Registry  global Poller  Buffers │
//!                └───────────────────▲──────────────────────┘
//!                                    │ Arc
//!   plume-worker-0 ─┐                │
//!   plume-worker-1 ─┼─ Worker { local Poller, Timers, locals }
//!   plume-worker-N ─┘      loop: timers → try global → local
//! ```
//!
//! ## Modules
//!
//! - `comm` - Descriptor registry and socket primitives
//! - `event` - Selector trait, epoll backend, one-shot callback poller
//! - `worker` - Worker thread, per-thread state, thread pool
//! - `dispatcher` - Shared context and server lifecycle
//! - `plugin` - Plugin trait and directive routing
//! - `timer` - Per-thread sorted timers
//! - `mempool` - Per-connection arena
//! - `lookaside` - Fixed-type free lists with a high-water mark
//! - `buffer` - Pooled I/O buffers in size classes
//! - `config` - TOML configuration
//! - `log` - tracing subscriber setup
//! - `env` - Environment overrides
//! - `numeric` - Lenient integer and header helpers
//! - `error` - Error types

pub mod buffer;
pub mod comm;
pub mod config;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod event;
pub mod log;
pub mod lookaside;
pub mod mempool;
pub mod numeric;
pub mod plugin;
pub mod timer;
pub mod worker;

// Re-exports for convenience
pub use buffer::{Buffer, BufferPool};
pub use comm::{CommKind, Registry};
pub use config::{Block, Config, MemConfig};
pub use dispatcher::{Context, Server};
pub use error::{Error, Result};
pub use event::Interest;
pub use lookaside::{LookasideList, LookasideOptions, LookasideStats, Pooled, SharedLookaside};
pub use mempool::{MemPool, Span};
pub use plugin::Plugin;
pub use timer::TimerId;
pub use worker::{current_worker_id, Worker};

/// Runtime limits
pub mod constants {
    /// Maximum worker threads
    pub const MAX_WORKERS: usize = 128;

    /// Events handled per poll
    pub const MAX_EVENTS: usize = 256;

    /// Upper bound on a single poll wait
    pub const POLL_TIMEOUT_MS: u64 = 100;

    /// Default descriptor registry size
    pub const DEFAULT_MAXFD: usize = 1024;

    /// Timer entries kept for reuse per thread
    pub const MAX_TIMERS: usize = 128;

    /// Idle buffers kept per size class
    pub const BUFFER_HWM: usize = 256;
}
