//! Core engine for a single-port, pipelined HTTP/1.1 reverse proxy.
//!
//! This crate has no knowledge of the edge transport (WebSocket upgrade,
//! TLS termination, HTTP/2) — it consumes an [`edge::EdgeReply`] /
//! [`edge::RequestBodySource`] pair and drives one or more backend
//! connections on their behalf.

pub mod client;
pub mod config;
pub mod connection;
pub mod edge;
pub mod error;
pub mod header;
pub mod parser;
pub mod pipeline;
pub mod proxy;
pub mod request;
pub mod sender;

pub use client::Client;
pub use config::{BackendConfig, ClientOptions, EdgeConfig, ProxyOptions};
pub use connection::Connection;
pub use error::{ErrorCode, ProxyError};
pub use header::HeaderMap;
pub use parser::{BodyMode, ParserEvent, ResponseParser};
pub use proxy::Proxy;
pub use request::Request;
