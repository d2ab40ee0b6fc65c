//! RequestSender (spec §4.3): serializes one request's head onto a
//! backend socket and streams its body, honoring a bounded backpressure
//! buffer between the edge's body-chunk callback and the socket write.

use crate::edge::{EdgeReply, RequestBodySource};
use crate::error::{ErrorCode, ProxyError};
use crate::pipeline::Pipeline;
use crate::request::{Request, ResponseCallback};
use bytes::Bytes;
use monoio::io::AsyncWriteRentExt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Serialize the request line, mandatory headers, and caller headers into
/// the literal bytes written to the backend (spec §4.3 "Head write").
pub fn build_head(request: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(request.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(request.path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(format!("host: {}:{}\r\n", request.host, request.port).as_bytes());
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    for (name, value) in request.headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

pub struct RequestSender {
    max_stacked_buffers: usize,
}

impl RequestSender {
    pub fn new(max_stacked_buffers: usize) -> Self {
        Self { max_stacked_buffers }
    }

    /// Schedule `request` on `pipeline`, write its head, and stream its
    /// body (if any) onto `socket`.
    pub async fn send<W: AsyncWriteRentExt>(
        &self,
        socket: &mut W,
        pipeline: &Rc<RefCell<Pipeline>>,
        request: Request,
        response_callback: ResponseCallback,
    ) -> Result<(), ProxyError> {
        let content_length = request.headers.get("content-length").and_then(|v| v.trim().parse::<u64>().ok());
        let chunked = request
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let head = build_head(&request);
        let body = request.body.clone();
        let reply = Rc::clone(&request.reply);

        Pipeline::schedule_send(pipeline, request, response_callback, || {});

        let (res, _) = socket.write_all(head).await;
        res.map_err(|e| ProxyError::from_io(ErrorCode::ConnReset, e))?;

        if let Some(body) = body {
            self.stream_body(socket, body, reply, content_length, chunked).await?;
        }
        Ok(())
    }

    /// Bridge the edge's push-style body-chunk callback to the backend
    /// socket's async writes through a bounded FIFO. When the FIFO would
    /// exceed `max_stacked_buffers`, synthesize a 504 on the reply-handle
    /// and stop accepting further chunks (spec §4.3).
    async fn stream_body<W: AsyncWriteRentExt>(
        &self,
        socket: &mut W,
        body: Rc<RefCell<dyn RequestBodySource>>,
        reply: Rc<RefCell<dyn EdgeReply>>,
        content_length: Option<u64>,
        chunked: bool,
    ) -> Result<(), ProxyError> {
        let queue: Rc<RefCell<VecDeque<(Bytes, bool)>>> = Rc::new(RefCell::new(VecDeque::new()));
        let finished = Rc::new(Cell::new(false));
        let overflowed = Rc::new(Cell::new(false));
        let aborted = Rc::new(Cell::new(false));

        {
            let queue = Rc::clone(&queue);
            let finished = Rc::clone(&finished);
            let overflowed = Rc::clone(&overflowed);
            let max = self.max_stacked_buffers;
            body.borrow_mut().on_data(Box::new(move |chunk, is_last| {
                if overflowed.get() || finished.get() {
                    return;
                }
                if queue.borrow().len() >= max {
                    overflowed.set(true);
                    return;
                }
                queue.borrow_mut().push_back((Bytes::copy_from_slice(chunk), is_last));
                if is_last {
                    finished.set(true);
                }
            }));
        }
        {
            let aborted = Rc::clone(&aborted);
            body.borrow_mut().on_aborted(Box::new(move || aborted.set(true)));
        }

        let mut written: u64 = 0;

        loop {
            if overflowed.get() {
                synthesize_overflow_timeout(&reply);
                return Err(ProxyError::new(ErrorCode::PipelineOverflow));
            }
            if aborted.get() {
                return self.compensate_abort(socket, written, content_length, chunked).await;
            }
            let next = queue.borrow_mut().pop_front();
            match next {
                Some((chunk, is_last)) => {
                    let len = chunk.len() as u64;
                    let (res, _) = socket.write_all(chunk.to_vec()).await;
                    res.map_err(|e| ProxyError::from_io(ErrorCode::ConnReset, e))?;
                    written += len;
                    if is_last {
                        return Ok(());
                    }
                }
                None => {
                    if finished.get() {
                        return Ok(());
                    }
                    monoio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }

    /// On a body-source abort: pad a known-length request to its declared
    /// length (preserving pipeline framing — aborting the socket would
    /// take every other pipelined request down with it), or terminate a
    /// chunked request with a bare zero-chunk (spec §4.3, Open Question:
    /// whether the partial chunk needs padding first is unresolved — see
    /// DESIGN.md).
    async fn compensate_abort<W: AsyncWriteRentExt>(
        &self,
        socket: &mut W,
        written: u64,
        content_length: Option<u64>,
        chunked: bool,
    ) -> Result<(), ProxyError> {
        if let Some(n) = content_length {
            if written < n {
                let padding = vec![0u8; (n - written) as usize];
                let (res, _) = socket.write_all(padding).await;
                res.map_err(|e| ProxyError::from_io(ErrorCode::BodyStream, e))?;
            }
        } else if chunked {
            let (res, _) = socket.write_all(b"0\r\n\r\n".to_vec()).await;
            res.map_err(|e| ProxyError::from_io(ErrorCode::BodyStream, e))?;
        }
        Ok(())
    }
}

fn synthesize_overflow_timeout(reply: &Rc<RefCell<dyn EdgeReply>>) {
    let mut r = reply.borrow_mut();
    if r.is_aborted() {
        return;
    }
    r.cork(&mut |r| {
        r.write_status(504, "Gateway Timeout");
        r.end(Some(b"the server is too busy to handle your request"));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderMap;
    use crate::request::Protocol;

    struct NoopReply;
    impl EdgeReply for NoopReply {
        fn write_status(&mut self, _status: u16, _message: &str) {}
        fn write_header(&mut self, _name: &str, _value: &str) {}
        fn try_end(&mut self, _buf: &[u8], _total_size: u64) -> (bool, bool) {
            (true, true)
        }
        fn write(&mut self, _buf: &[u8]) -> bool {
            true
        }
        fn end(&mut self, _buf: Option<&[u8]>) {}
        fn on_writable(&mut self, _cb: Box<dyn FnMut(u64) -> bool>) {}
        fn on_aborted(&mut self, _cb: Box<dyn FnOnce()>) {}
        fn abort(&mut self) {}
        fn cork(&mut self, f: &mut dyn FnMut(&mut dyn EdgeReply)) {
            f(self);
        }
        fn get_write_offset(&self) -> u64 {
            0
        }
        fn is_aborted(&self) -> bool {
            false
        }
        fn remote_address(&self) -> String {
            "127.0.0.1".to_string()
        }
    }

    fn sample_request(headers: HeaderMap) -> Request {
        Request::new(
            "GET".to_string(),
            "/widgets?x=1".to_string(),
            "127.0.0.1".to_string(),
            8080,
            Protocol::Http,
            headers,
            Rc::new(RefCell::new(NoopReply)),
            None,
        )
    }

    #[test]
    fn head_contains_mandatory_headers() {
        let mut headers = HeaderMap::new();
        headers.push("x-request-id", "abc123");
        let req = sample_request(headers);
        let head = build_head(&req);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /widgets?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: 127.0.0.1:8080\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.contains("x-request-id: abc123\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn multi_valued_headers_repeat_name_in_head() {
        let mut headers = HeaderMap::new();
        headers.push("set-cookie", "a=1");
        headers.push("set-cookie", "b=2");
        let req = sample_request(headers);
        let head = String::from_utf8(build_head(&req)).unwrap();
        assert_eq!(head.matches("set-cookie:").count(), 2);
    }
}
