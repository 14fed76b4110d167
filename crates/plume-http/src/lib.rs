//! # plume-http
//!
//! HTTP/1.x reverse proxy plugin for the plume server.
//!
//! Requests are parsed incrementally as bytes arrive, queued per
//! connection, and forwarded one at a time to a backend chosen round
//! robin. Responses are relayed verbatim; only their heads are parsed, to
//! find where each one ends.
//!
//! ```text
//!   [http]
//!   http_port = 8080
//!   http_listen = "0.0.0.0,128"
//!   backends = ["127.0.0.1:8081", "127.0.0.1:8082"]
//! ```
//!
//! ## Modules
//!
//! - `parser` - Resumable request and response head parser
//! - `url` - Request-target splitting
//! - `request` - Parsed request and header table
//! - `forward` - Backend link and response tracking
//! - `conn` - Client connection state machine
//! - `backend` - Round-robin backend table
//! - `reply` - Canned error responses
//! - `plugin` - The `http` plugin

pub mod backend;
pub mod conn;
pub mod error;
pub mod forward;
pub mod parser;
pub mod plugin;
pub mod reply;
pub mod request;
pub mod url;

pub use backend::Backends;
pub use error::{ProxyError, Result};
pub use parser::{FieldHandler, Method, Parser, RequestHandler, ResponseHandler, Status, Version};
pub use plugin::{HttpPlugin, HttpShared, StatsSnapshot};
pub use reply::Reply;
pub use request::{HeaderTable, Request};
pub use url::{parse_url, Url};
