//! Logical forwarded request — the core's unit of work (spec §3).

use crate::edge::{EdgeReply, RequestBodySource};
use crate::header::HeaderMap;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// A decoded edge request, ready to be handed to [`crate::client::Client`].
///
/// Created once per inbound edge call, consumed exactly once by the
/// pipeline it is scheduled on, and dropped once that pipeline entry
/// terminates.
pub struct Request {
    pub method: String,
    pub path: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub headers: HeaderMap,
    pub reply: Rc<RefCell<dyn EdgeReply>>,
    pub body: Option<Rc<RefCell<dyn RequestBodySource>>>,
}

impl Request {
    pub fn new(
        method: String,
        path: String,
        host: String,
        port: u16,
        protocol: Protocol,
        headers: HeaderMap,
        reply: Rc<RefCell<dyn EdgeReply>>,
        body: Option<Rc<RefCell<dyn RequestBodySource>>>,
    ) -> Self {
        Self { method, path, host, port, protocol, headers, reply, body }
    }
}

/// Invoked once the pipeline entry for this request has terminated
/// (successfully or with an error).
pub type ResponseCallback = Box<dyn FnOnce(Option<crate::error::ProxyError>)>;
