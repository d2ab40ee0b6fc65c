//! Minimal plaintext HTTP/1.1 edge front end.
//!
//! `proxy-core` has no opinion on how edge connections are terminated — it
//! only needs an [`EdgeReply`]/[`RequestBodySource`] pair per request. This
//! module is the simplest thing that can satisfy that contract over a bare
//! `TcpStream`: one request in flight per connection, non-chunked bodies
//! only, no real write-side backpressure (the bounded backpressure the
//! design cares about is on the backend side, already handled in
//! `proxy_core::sender`). A WebSocket-capable or TLS-terminating edge would
//! implement the same two traits; this one exists so the binary has
//! something to serve traffic with.

use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt, Splitable};
use monoio::net::tcp::OwnedWriteHalf;
use monoio::net::TcpStream;
use proxy_core::edge::{EdgeReply, RequestBodySource};
use proxy_core::header::HeaderMap;
use proxy_core::proxy::Proxy;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

pub struct TcpEdgeReply {
    outbox: Rc<RefCell<VecDeque<Bytes>>>,
    status: RefCell<(u16, String)>,
    headers: RefCell<Vec<(String, String)>>,
    headers_flushed: Cell<bool>,
    ended: Cell<bool>,
    aborted: Rc<Cell<bool>>,
    on_aborted: RefCell<Vec<Box<dyn FnOnce()>>>,
    remote_address: String,
}

impl TcpEdgeReply {
    fn new(outbox: Rc<RefCell<VecDeque<Bytes>>>, aborted: Rc<Cell<bool>>, remote_address: String) -> Self {
        Self {
            outbox,
            status: RefCell::new((200, "OK".to_string())),
            headers: RefCell::new(Vec::new()),
            headers_flushed: Cell::new(false),
            ended: Cell::new(false),
            aborted,
            on_aborted: RefCell::new(Vec::new()),
            remote_address,
        }
    }

    fn flush_headers(&self) {
        if self.headers_flushed.get() {
            return;
        }
        self.headers_flushed.set(true);
        let (code, message) = &*self.status.borrow();
        let mut buf = format!("HTTP/1.1 {code} {message}\r\n").into_bytes();
        for (name, value) in self.headers.borrow().iter() {
            buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        self.outbox.borrow_mut().push_back(Bytes::from(buf));
    }

    pub fn is_ended(&self) -> bool {
        self.ended.get()
    }
}

impl EdgeReply for TcpEdgeReply {
    fn write_status(&mut self, status: u16, message: &str) {
        *self.status.borrow_mut() = (status, message.to_string());
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.headers.borrow_mut().push((name.to_string(), value.to_string()));
    }

    fn try_end(&mut self, buf: &[u8], _total_size: u64) -> (bool, bool) {
        self.flush_headers();
        if !buf.is_empty() {
            self.outbox.borrow_mut().push_back(Bytes::copy_from_slice(buf));
        }
        self.ended.set(true);
        (true, true)
    }

    fn write(&mut self, buf: &[u8]) -> bool {
        self.flush_headers();
        if !buf.is_empty() {
            self.outbox.borrow_mut().push_back(Bytes::copy_from_slice(buf));
        }
        true
    }

    fn end(&mut self, buf: Option<&[u8]>) {
        self.flush_headers();
        if let Some(b) = buf {
            if !b.is_empty() {
                self.outbox.borrow_mut().push_back(Bytes::copy_from_slice(b));
            }
        }
        self.ended.set(true);
    }

    fn on_writable(&mut self, _cb: Box<dyn FnMut(u64) -> bool>) {
        // This front end never refuses a write (unbounded outbox), so the
        // writable signal never fires. See module docs.
    }

    fn on_aborted(&mut self, cb: Box<dyn FnOnce()>) {
        self.on_aborted.borrow_mut().push(cb);
    }

    fn abort(&mut self) {
        self.aborted.set(true);
        for cb in self.on_aborted.borrow_mut().drain(..) {
            cb();
        }
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
        self.remote_address.clone()
    }
}

/// Request body delivered in one shot (the simplest framing this edge
/// supports — see module docs on chunked request bodies).
pub struct OneShotBody {
    data: Option<Bytes>,
}

impl OneShotBody {
    pub fn new(data: Bytes) -> Self {
        Self { data: Some(data) }
    }
}

impl RequestBodySource for OneShotBody {
    fn on_data(&mut self, mut cb: Box<dyn FnMut(&[u8], bool)>) {
        if let Some(data) = self.data.take() {
            cb(&data, true);
        } else {
            cb(&[], true);
        }
    }

    fn on_aborted(&mut self, _cb: Box<dyn FnOnce()>) {}
}

/// Drain `outbox` onto `write_half` until the connection is done or the
/// socket errors. Mirrors the polling bridge in `proxy_core::sender`: no
/// async notify primitive exists in this dependency stack, so an idle
/// outbox is polled on a short timer.
///
/// A write failure means the peer is gone; it's the one disconnect signal
/// this minimal edge front end can actually observe while a response is
/// in flight (the read half is blocked reading the next request, not
/// watching for a mid-response close). `current_reply` tracks whichever
/// request is in flight so that signal can reach its `EdgeReply::abort`.
async fn drain_outbox(
    mut write_half: OwnedWriteHalf,
    outbox: Rc<RefCell<VecDeque<Bytes>>>,
    done: Rc<Cell<bool>>,
    current_reply: Rc<RefCell<Option<Rc<RefCell<TcpEdgeReply>>>>>,
) {
    loop {
        let next = outbox.borrow_mut().pop_front();
        match next {
            Some(chunk) => {
                let (res, _) = write_half.write_all(chunk.to_vec()).await;
                if res.is_err() {
                    if let Some(reply) = current_reply.borrow().as_ref() {
                        reply.borrow_mut().abort();
                    }
                    done.set(true);
                    return;
                }
            }
            None => {
                if done.get() {
                    return;
                }
                monoio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
}

/// Read one request off `stream`, dispatch it through `proxy`, and drive
/// its response back onto the same connection. One request at a time —
/// no edge-side pipelining.
pub async fn serve_connection(stream: TcpStream, remote_address: String, proxy: Rc<Proxy>) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();

    let outbox: Rc<RefCell<VecDeque<Bytes>>> = Rc::new(RefCell::new(VecDeque::new()));
    let done = Rc::new(Cell::new(false));
    let current_reply: Rc<RefCell<Option<Rc<RefCell<TcpEdgeReply>>>>> = Rc::new(RefCell::new(None));
    monoio::spawn(drain_outbox(write_half, Rc::clone(&outbox), Rc::clone(&done), Rc::clone(&current_reply)));

    let mut buf = Vec::with_capacity(8 * 1024);
    let mut read_buf = vec![0u8; 8 * 1024];

    loop {
        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            let (res, returned) = read_half.read(read_buf).await;
            read_buf = returned;
            match res {
                Ok(0) => {
                    done.set(true);
                    return Ok(());
                }
                Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                Err(e) => {
                    done.set(true);
                    return Err(e.into());
                }
            }
        };

        let (method, url, query, headers) = parse_request_head(&buf[..header_end])?;
        let content_length = headers.get("content-length").and_then(|v| v.trim().parse::<usize>().ok()).unwrap_or(0);

        let body_end = header_end + content_length;
        while buf.len() < body_end {
            let (res, returned) = read_half.read(read_buf).await;
            read_buf = returned;
            match res {
                Ok(0) => {
                    done.set(true);
                    return Ok(());
                }
                Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                Err(e) => {
                    done.set(true);
                    return Err(e.into());
                }
            }
        }
        let body_bytes = Bytes::copy_from_slice(&buf[header_end..body_end]);
        buf.drain(0..body_end);

        let aborted = Rc::new(Cell::new(false));
        let reply = Rc::new(RefCell::new(TcpEdgeReply::new(Rc::clone(&outbox), Rc::clone(&aborted), remote_address.clone())));
        let body: Option<Rc<RefCell<dyn RequestBodySource>>> =
            if content_length > 0 { Some(Rc::new(RefCell::new(OneShotBody::new(body_bytes)))) } else { None };

        *current_reply.borrow_mut() = Some(Rc::clone(&reply));

        proxy.dispatch(headers, method, url, query, Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>, body).await;

        if !reply.borrow().is_ended() {
            // The backend request is still in flight (streaming response
            // driven asynchronously by the connection's read loop); give
            // it a moment to land before looping to read the next request.
            while !reply.borrow().is_ended() {
                monoio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        *current_reply.borrow_mut() = None;

        if done.get() {
            return Ok(());
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_request_head(head: &[u8]) -> anyhow::Result<(String, String, String, HeaderMap)> {
    let text = std::str::from_utf8(head)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow::anyhow!("empty request"))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or_else(|| anyhow::anyhow!("missing method"))?.to_string();
    let target = parts.next().ok_or_else(|| anyhow::anyhow!("missing target"))?;
    let (url, query) = match target.split_once('?') {
        Some((u, q)) => (u.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim(), value.trim());
        }
    }

    Ok((method, url, query, headers))
}
