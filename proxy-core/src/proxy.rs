//! Proxy (spec §4.6): decodes an inbound edge request, rewrites its
//! headers, and hands it off to the [`Client`] pool, translating any
//! failure the client cannot deliver through a scheduled callback into a
//! synthesized HTTP error response.

use crate::client::Client;
use crate::config::{BackendConfig, BackendProtocol, ProxyOptions};
use crate::edge::{EdgeReply, RequestBodySource};
use crate::error::{ErrorCode, ProxyError};
use crate::header::HeaderMap;
use crate::request::{Protocol, Request};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

pub struct Proxy {
    client: Rc<Client>,
    backend: BackendConfig,
    options: ProxyOptions,
    edge_port: u16,
    edge_is_https: bool,
}

impl Proxy {
    pub fn new(client: Rc<Client>, backend: BackendConfig, options: ProxyOptions, edge_port: u16, edge_is_https: bool) -> Self {
        Self { client, backend, options, edge_port, edge_is_https }
    }

    /// Decode, rewrite, and forward one edge request. Resolves once the
    /// request has either been scheduled on a backend connection (its
    /// response is then delivered through writes to `reply`, driven from
    /// the connection's own task) or failed before scheduling, in which
    /// case this synthesizes the error response itself.
    pub async fn dispatch(
        &self,
        mut headers: HeaderMap,
        method: String,
        url: String,
        query: String,
        reply: Rc<RefCell<dyn EdgeReply>>,
        body: Option<Rc<RefCell<dyn RequestBodySource>>>,
    ) {
        let remote_address = reply.borrow().remote_address();
        let original_host = headers.get("host").map(|s| s.to_string());
        self.rewrite_headers(&mut headers, &remote_address, original_host.as_deref());

        for (name, value) in self.options.extra_headers().iter() {
            headers.set(name, value);
        }

        let path = if query.is_empty() { url } else { format!("{url}?{query}") };
        let protocol = match self.backend.protocol {
            BackendProtocol::Http => Protocol::Http,
            BackendProtocol::Https => Protocol::Https,
        };

        // spec §4.6 step 2: register for client-initiated abort before
        // handing the request off, so a disconnect observed anywhere
        // downstream (the pipeline's stale-entry tracking, or our own
        // timeout below) is visible here too.
        let client_aborted = Rc::new(Cell::new(false));
        {
            let client_aborted = Rc::clone(&client_aborted);
            reply.borrow_mut().on_aborted(Box::new(move || client_aborted.set(true)));
        }

        let request = Request::new(method, path, self.backend.host.clone(), self.backend.port, protocol, headers, Rc::clone(&reply), body);

        let done = Rc::new(Cell::new(false));
        let done_for_callback = Rc::clone(&done);
        let outcome = self
            .client
            .request(
                request,
                Box::new(move |err| {
                    done_for_callback.set(true);
                    if let Some(err) = err {
                        tracing::debug!(code = ?err.code(), "backend request terminated with an error");
                    }
                }),
            )
            .await;

        if let Err(err) = outcome {
            write_default_error(&reply, &err);
            return;
        }

        // spec §5 "Timeouts": give the backend `options.timeout_ms` to
        // finish the whole response. If it doesn't, synthesize a 504 and
        // mark the reply aborted so the pipeline's stale-entry tracking
        // drops the real response if it lands afterward — otherwise it
        // would be written on top of the timeout response we just sent.
        if wait_for_completion(&done, self.options.timeout_ms).await {
            return;
        }
        if !done.get() && !client_aborted.get() {
            write_timeout_response(&reply);
            reply.borrow_mut().abort();
        }
    }

    /// spec §6: `x-forwarded-for`/`-port`/`-proto` are appended,
    /// `x-forwarded-host` is set from an existing value or the original
    /// `host` header, and hop-by-hop `connection`/`keep-alive` headers are
    /// stripped since [`crate::sender::RequestSender`] owns those for the
    /// forwarded request.
    fn rewrite_headers(&self, headers: &mut HeaderMap, remote_address: &str, original_host: Option<&str>) {
        headers.append_or_set("x-forwarded-for", remote_address);
        headers.append_or_set("x-forwarded-port", itoa::Buffer::new().format(self.edge_port));
        headers.append_or_set("x-forwarded-proto", if self.edge_is_https { "https" } else { "http" });
        if !headers.contains("x-forwarded-host") {
            if let Some(host) = original_host {
                headers.set("x-forwarded-host", host);
            }
        }
        headers.remove("connection");
        headers.remove("keep-alive");
    }
}

/// Synthesize the default error response (spec §7) for a request that
/// never reached a pipeline — nothing else will ever write to `reply`.
fn write_default_error(reply: &Rc<RefCell<dyn EdgeReply>>, err: &ProxyError) {
    let mut r = reply.borrow_mut();
    if r.is_aborted() {
        return;
    }
    let code = err.code();
    let body = err.to_body();
    r.cork(&mut |r| {
        r.write_status(code.status_code(), code.status_message());
        r.end(Some(&body));
    });
}

/// Poll `done` until it's set or `timeout_ms` elapses, in 5ms steps — the
/// same polling bridge `sender.rs`/`edge_tcp.rs` use, since nothing in this
/// dependency stack offers an async notify primitive. Returns `true` if
/// `done` was observed set before the deadline.
async fn wait_for_completion(done: &Rc<Cell<bool>>, timeout_ms: u64) -> bool {
    let step = Duration::from_millis(5);
    let limit = Duration::from_millis(timeout_ms);
    let mut waited = Duration::ZERO;
    while !done.get() {
        if waited >= limit {
            return false;
        }
        monoio::time::sleep(step).await;
        waited += step;
    }
    true
}

/// Synthesize the 504 timeout response (spec §7 `TIMED_OUT`). Unlike
/// [`write_default_error`] this does not check `is_aborted` up front —
/// the caller has already confirmed the client hasn't disconnected — but
/// it must run before the reply is marked aborted, not after.
fn write_timeout_response(reply: &Rc<RefCell<dyn EdgeReply>>) {
    let err = ProxyError::new(ErrorCode::TimedOut);
    let code = err.code();
    let body = err.to_body();
    reply.borrow_mut().cork(&mut |r| {
        r.write_status(code.status_code(), code.status_message());
        r.end(Some(&body));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use std::cell::Cell;

    #[derive(Default)]
    struct MockReply {
        status: Cell<u16>,
        body: RefCell<Vec<u8>>,
        ended: Cell<bool>,
        aborted: Cell<bool>,
    }

    impl EdgeReply for MockReply {
        fn write_status(&mut self, status: u16, _message: &str) {
            self.status.set(status);
        }
        fn write_header(&mut self, _name: &str, _value: &str) {}
        fn try_end(&mut self, _buf: &[u8], _total_size: u64) -> (bool, bool) {
            (true, true)
        }
        fn write(&mut self, _buf: &[u8]) -> bool {
            true
        }
        fn end(&mut self, buf: Option<&[u8]>) {
            if let Some(b) = buf {
                self.body.borrow_mut().extend_from_slice(b);
            }
            self.ended.set(true);
        }
        fn on_writable(&mut self, _cb: Box<dyn FnMut(u64) -> bool>) {}
        fn on_aborted(&mut self, _cb: Box<dyn FnOnce()>) {}
        fn abort(&mut self) {
            self.aborted.set(true);
        }
        fn cork(&mut self, f: &mut dyn FnMut(&mut dyn EdgeReply)) {
            f(self);
        }
        fn get_write_offset(&self) -> u64 {
            0
        }
        fn is_aborted(&self) -> bool {
            self.aborted.get()
        }
        fn remote_address(&self) -> String {
            "203.0.113.9".to_string()
        }
    }

    #[test]
    fn rewrites_forwarding_headers_and_strips_hop_by_hop() {
        let client = Rc::new(Client::new(ClientOptions::default()));
        let proxy = Proxy::new(client, BackendConfig::default(), ProxyOptions::default(), 8443, true);

        let mut headers = HeaderMap::new();
        headers.push("host", "public.example.com");
        headers.push("connection", "keep-alive");
        headers.push("keep-alive", "timeout=5");

        proxy.rewrite_headers(&mut headers, "203.0.113.9", Some("public.example.com"));

        assert_eq!(headers.get("x-forwarded-for"), Some("203.0.113.9"));
        assert_eq!(headers.get("x-forwarded-port"), Some("8443"));
        assert_eq!(headers.get("x-forwarded-proto"), Some("https"));
        assert_eq!(headers.get("x-forwarded-host"), Some("public.example.com"));
        assert!(!headers.contains("connection"));
        assert!(!headers.contains("keep-alive"));
    }

    #[test]
    fn existing_forwarded_host_is_preserved() {
        let client = Rc::new(Client::new(ClientOptions::default()));
        let proxy = Proxy::new(client, BackendConfig::default(), ProxyOptions::default(), 80, false);

        let mut headers = HeaderMap::new();
        headers.push("x-forwarded-host", "original.example.com");

        proxy.rewrite_headers(&mut headers, "10.0.0.1", Some("public.example.com"));
        assert_eq!(headers.get("x-forwarded-host"), Some("original.example.com"));
    }

    #[test]
    fn repeated_forwarded_for_appends_rather_than_replaces() {
        let client = Rc::new(Client::new(ClientOptions::default()));
        let proxy = Proxy::new(client, BackendConfig::default(), ProxyOptions::default(), 80, false);

        let mut headers = HeaderMap::new();
        headers.push("x-forwarded-for", "198.51.100.2");
        proxy.rewrite_headers(&mut headers, "203.0.113.9", None);
        assert_eq!(headers.get("x-forwarded-for"), Some("198.51.100.2, 203.0.113.9"));
    }

    #[monoio::test]
    async fn dispatch_against_closed_pool_synthesizes_default_error() {
        let client = Rc::new(Client::new(ClientOptions::default()));
        client.close(None);
        let proxy = Proxy::new(Rc::clone(&client), BackendConfig::default(), ProxyOptions::default(), 3000, false);

        let reply = Rc::new(RefCell::new(MockReply::default()));
        proxy
            .dispatch(HeaderMap::new(), "GET".to_string(), "/widgets".to_string(), String::new(), Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>, None)
            .await;

        assert!(reply.borrow().ended.get());
        assert_eq!(reply.borrow().status.get(), 503);
        assert!(!reply.borrow().body.borrow().is_empty());
    }

    #[monoio::test]
    async fn dispatch_times_out_when_backend_never_responds() {
        let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        monoio::spawn(async move {
            let _ = listener.accept().await;
            // Accept the connection but never write anything back, so the
            // request sits waiting for headers until dispatch's own
            // timeout gives up on it.
            loop {
                monoio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        });

        let client = Rc::new(Client::new(ClientOptions::default()));
        let backend = BackendConfig { host: addr.ip().to_string(), port: addr.port(), ..BackendConfig::default() };
        let options = ProxyOptions { timeout_ms: 20, ..ProxyOptions::default() };
        let proxy = Proxy::new(Rc::clone(&client), backend, options, 3000, false);

        let reply = Rc::new(RefCell::new(MockReply::default()));
        proxy
            .dispatch(HeaderMap::new(), "GET".to_string(), "/widgets".to_string(), String::new(), Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>, None)
            .await;

        assert_eq!(reply.borrow().status.get(), 504);
        assert!(reply.borrow().ended.get());
    }

    #[monoio::test]
    async fn dispatch_does_not_write_when_reply_already_aborted() {
        let client = Rc::new(Client::new(ClientOptions::default()));
        client.close(None);
        let proxy = Proxy::new(Rc::clone(&client), BackendConfig::default(), ProxyOptions::default(), 3000, false);

        let reply = Rc::new(RefCell::new(MockReply { aborted: Cell::new(true), ..Default::default() }));
        proxy
            .dispatch(HeaderMap::new(), "GET".to_string(), "/widgets".to_string(), String::new(), Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>, None)
            .await;

        assert!(!reply.borrow().ended.get());
    }
}
