//! SendingStrategy / Pipeline (spec §4.2): the FIFO of in-flight requests
//! on one backend connection, correlating parser events with the queue
//! head and driving the edge reply-handle write loop.

use crate::error::ProxyError;
use crate::header::HeaderMap;
use crate::parser::{BodyMode, ParserEvent};
use crate::request::{Request, ResponseCallback};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Whether the owning Connection should keep reading from the backend
/// socket or pause until the reply-handle signals writable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Continue,
    Paused,
}

struct PipelineEntry {
    request: Request,
    /// `Some(n)` once `BodyReadMode(Fixed(n))` is known (try_end path);
    /// `None` for chunked/until-close (write path) or before the mode is
    /// known at all.
    total_size: Option<u64>,
    stale: bool,
    callback: Option<ResponseCallback>,
}

/// What's buffered while the reply-handle is not writable.
enum Pending {
    TryEnd { data: Bytes, offset: u64, total: u64 },
    Write { data: Bytes, is_last: bool },
}

pub struct Pipeline {
    max_requests: usize,
    entries: VecDeque<PipelineEntry>,
    locked: bool,
    paused: bool,
    pending: Option<Pending>,
    backlog: VecDeque<ParserEvent>,
}

impl Pipeline {
    pub fn new(max_requests: usize) -> Self {
        Self {
            max_requests,
            entries: VecDeque::new(),
            locked: false,
            paused: false,
            pending: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn accepts_more_requests(&self) -> bool {
        !self.locked && self.entries.len() < self.max_requests
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Enqueue `request`, install its abort/writable handlers, and invoke
    /// `ready_to_send` once to signal "write the head now" (spec §4.2).
    ///
    /// `pipeline` must be the same `Rc<RefCell<Pipeline>>` this instance
    /// lives behind — the abort/writable closures capture a clone of it
    /// so they can resume draining without the caller holding a borrow.
    pub fn schedule_send(
        pipeline: &Rc<RefCell<Pipeline>>,
        request: Request,
        callback: ResponseCallback,
        ready_to_send: impl FnOnce() + 'static,
    ) {
        let reply = Rc::clone(&request.reply);

        {
            let pipeline = Rc::clone(pipeline);
            let reply_for_abort = Rc::clone(&reply);
            reply.borrow_mut().on_aborted(Box::new(move || {
                pipeline.borrow_mut().mark_stale(&reply_for_abort);
            }));
        }
        {
            let pipeline = Rc::clone(pipeline);
            reply.borrow_mut().on_writable(Box::new(move |offset| pipeline.borrow_mut().resume_writable(offset)));
        }

        pipeline.borrow_mut().entries.push_back(PipelineEntry {
            request,
            total_size: None,
            stale: false,
            callback: Some(callback),
        });
        ready_to_send();
    }

    fn mark_stale(&mut self, reply: &Rc<RefCell<dyn crate::edge::EdgeReply>>) {
        for entry in &mut self.entries {
            if Rc::ptr_eq(&entry.request.reply, reply) {
                entry.stale = true;
                return;
            }
        }
    }

    /// Feed one parser event into the pipeline. Returns whether the
    /// owning Connection may keep reading more backend bytes.
    pub fn on_parser_event(&mut self, event: ParserEvent) -> Demand {
        if self.paused {
            self.backlog.push_back(event);
            return Demand::Paused;
        }
        self.process_event(event)
    }

    fn process_event(&mut self, event: ParserEvent) -> Demand {
        match event {
            ParserEvent::Headers { status_code, status_message, headers, .. } => {
                self.on_headers(status_code, &status_message, &headers);
                Demand::Continue
            }
            ParserEvent::BodyReadMode(mode) => {
                self.on_body_read_mode(mode);
                Demand::Continue
            }
            ParserEvent::BodyChunk { data, is_last } => self.on_body_chunk(data, is_last),
            ParserEvent::Error(code) => {
                self.close(Some(ProxyError::new(code)));
                Demand::Continue
            }
            ParserEvent::Reset => Demand::Continue,
        }
    }

    fn on_headers(&mut self, status_code: u16, status_message: &str, headers: &HeaderMap) {
        let Some(head) = self.entries.front() else { return };
        if head.stale {
            return;
        }
        let reply = Rc::clone(&head.request.reply);
        write_headers_corked(&reply, status_code, status_message, headers);
    }

    fn on_body_read_mode(&mut self, mode: BodyMode) {
        if self.entries.is_empty() {
            return;
        }
        match mode {
            BodyMode::Fixed(n) => self.entries.front_mut().unwrap().total_size = Some(n),
            BodyMode::Chunked => self.entries.front_mut().unwrap().total_size = None,
            BodyMode::UntilClose => {
                // An until-close body has no framing of its own — it only
                // terminates when the backend closes the socket. That's
                // fine for the sole request on the connection, but any
                // entry already queued behind it (spec §7
                // STREAM_UNTIL_CLOSE_NOT_SUPPORTED) would wait forever for
                // a response that can never come, so treat it as a fatal
                // pipeline error instead of silently locking.
                if self.entries.len() > 1 {
                    self.close(Some(ProxyError::new(crate::error::ErrorCode::StreamUntilCloseNotSupported)));
                    return;
                }
                self.entries.front_mut().unwrap().total_size = None;
                self.locked = true;
            }
        }
    }

    fn on_body_chunk(&mut self, data: Bytes, is_last: bool) -> Demand {
        let Some(head) = self.entries.front() else { return Demand::Continue };
        if head.stale {
            if is_last {
                self.terminate_head(None);
            }
            return Demand::Continue;
        }

        let reply = Rc::clone(&head.request.reply);
        if let Some(total) = head.total_size {
            let (accepted, done) = try_end_corked(&reply, &data, total);
            if done {
                self.terminate_head(None);
                return Demand::Continue;
            }
            if !accepted {
                let offset = reply.borrow().get_write_offset();
                self.pending = Some(Pending::TryEnd { data, offset, total });
                self.paused = true;
                return Demand::Paused;
            }
            Demand::Continue
        } else {
            let accepted = write_corked(&reply, &data);
            if !accepted {
                self.pending = Some(Pending::Write { data, is_last });
                self.paused = true;
                return Demand::Paused;
            }
            if is_last {
                reply.borrow_mut().end(None);
                self.terminate_head(None);
            }
            Demand::Continue
        }
    }

    /// Invoked from the reply-handle's writable callback; resumes the
    /// paused write and drains any backlog of parser events accumulated
    /// while paused.
    pub fn resume_writable(&mut self, offset: u64) -> bool {
        let Some(pending) = self.pending.take() else {
            return true;
        };
        let Some(head) = self.entries.front() else {
            return true;
        };
        let reply = Rc::clone(&head.request.reply);

        match pending {
            Pending::TryEnd { data, offset: pending_offset, total } => {
                let start = (offset.saturating_sub(pending_offset)) as usize;
                let remaining = &data[start.min(data.len())..];
                let (accepted, done) = try_end_corked(&reply, remaining, total);
                if done {
                    self.terminate_head(None);
                } else if !accepted {
                    let new_offset = reply.borrow().get_write_offset();
                    self.pending = Some(Pending::TryEnd { data: Bytes::copy_from_slice(remaining), offset: new_offset, total });
                    return true;
                }
            }
            Pending::Write { data, is_last } => {
                let accepted = write_corked(&reply, &data);
                if !accepted {
                    self.pending = Some(Pending::Write { data, is_last });
                    return true;
                }
                if is_last {
                    reply.borrow_mut().end(None);
                    self.terminate_head(None);
                }
            }
        }

        self.paused = false;
        self.drain_backlog();
        true
    }

    fn drain_backlog(&mut self) {
        while !self.paused {
            let Some(event) = self.backlog.pop_front() else { break };
            self.process_event(event);
        }
    }

    fn terminate_head(&mut self, err: Option<ProxyError>) {
        if let Some(mut entry) = self.entries.pop_front() {
            if let Some(cb) = entry.callback.take() {
                cb(err);
            }
        }
    }

    /// Drain the whole queue with `err`, best-effort-ending each attached
    /// reply-handle, then reset internal bookkeeping (spec §4.2 `close`).
    pub fn close(&mut self, err: Option<ProxyError>) {
        while let Some(mut entry) = self.entries.pop_front() {
            if !entry.stale {
                let body = err.as_ref().map(|e| e.to_body());
                let mut reply = entry.request.reply.borrow_mut();
                if !reply.is_aborted() {
                    if let Some(e) = &err {
                        reply.write_status(e.code().status_code(), e.code().status_message());
                    }
                    reply.end(body.as_deref());
                }
            }
            if let Some(cb) = entry.callback.take() {
                cb(err.clone());
            }
        }
        self.locked = false;
        self.paused = false;
        self.pending = None;
        self.backlog.clear();
    }
}

fn write_headers_corked(reply: &Rc<RefCell<dyn crate::edge::EdgeReply>>, status: u16, message: &str, headers: &HeaderMap) {
    reply.borrow_mut().cork(&mut |r| {
        r.write_status(status, message);
        for (k, v) in headers.iter() {
            r.write_header(k, v);
        }
    });
}

fn try_end_corked(reply: &Rc<RefCell<dyn crate::edge::EdgeReply>>, data: &[u8], total: u64) -> (bool, bool) {
    let mut result = (false, false);
    reply.borrow_mut().cork(&mut |r| {
        result = r.try_end(data, total);
    });
    result
}

fn write_corked(reply: &Rc<RefCell<dyn crate::edge::EdgeReply>>, data: &[u8]) -> bool {
    let mut accepted = false;
    reply.borrow_mut().cork(&mut |r| {
        accepted = r.write(data);
    });
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeReply;
    use crate::error::ErrorCode;
    use crate::request::Protocol;
    use std::cell::Cell;

    #[derive(Default)]
    struct MockReply {
        status: Cell<u16>,
        headers: RefCell<Vec<(String, String)>>,
        written: RefCell<Vec<u8>>,
        ended: Cell<bool>,
        aborted: Cell<bool>,
        write_accept: Cell<bool>,
    }

    impl EdgeReply for MockReply {
        fn write_status(&mut self, status: u16, _message: &str) {
            self.status.set(status);
        }
        fn write_header(&mut self, name: &str, value: &str) {
            self.headers.borrow_mut().push((name.to_string(), value.to_string()));
        }
        fn try_end(&mut self, buf: &[u8], total_size: u64) -> (bool, bool) {
            if !self.write_accept.get() {
                return (false, false);
            }
            self.written.borrow_mut().extend_from_slice(buf);
            let done = self.written.borrow().len() as u64 == total_size;
            (true, done)
        }
        fn write(&mut self, buf: &[u8]) -> bool {
            if !self.write_accept.get() {
                return false;
            }
            self.written.borrow_mut().extend_from_slice(buf);
            true
        }
        fn end(&mut self, buf: Option<&[u8]>) {
            if let Some(b) = buf {
                self.written.borrow_mut().extend_from_slice(b);
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
            self.written.borrow().len() as u64
        }
        fn is_aborted(&self) -> bool {
            self.aborted.get()
        }
        fn remote_address(&self) -> String {
            "127.0.0.1".to_string()
        }
    }

    fn make_request(reply: Rc<RefCell<MockReply>>) -> Request {
        Request::new(
            "GET".to_string(),
            "/".to_string(),
            "127.0.0.1".to_string(),
            80,
            Protocol::Http,
            HeaderMap::new(),
            reply,
            None,
        )
    }

    #[test]
    fn fifo_terminates_in_order() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply_a = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let reply_b = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));

        let order = Rc::new(RefCell::new(Vec::new()));
        let order_a = Rc::clone(&order);
        let order_b = Rc::clone(&order);

        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_a) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |_| order_a.borrow_mut().push("a")), || {});
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_b) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |_| order_b.borrow_mut().push("b")), || {});

        let mut p = pipeline.borrow_mut();
        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::Fixed(5)));
        p.on_parser_event(ParserEvent::BodyChunk { data: Bytes::from_static(b"hello"), is_last: true });
        assert_eq!(p.len(), 1);

        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::Fixed(5)));
        p.on_parser_event(ParserEvent::BodyChunk { data: Bytes::from_static(b"world"), is_last: true });
        assert_eq!(p.len(), 0);

        drop(p);
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(&reply_a.borrow().written.borrow()[..], b"hello");
        assert_eq!(&reply_b.borrow().written.borrow()[..], b"world");
    }

    #[test]
    fn backpressure_pauses_and_resumes_try_end() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(false), ..Default::default() }));
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>), Box::new(|_| {}), || {});

        let mut p = pipeline.borrow_mut();
        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::Fixed(5)));
        let demand = p.on_parser_event(ParserEvent::BodyChunk { data: Bytes::from_static(b"hello"), is_last: true });
        assert_eq!(demand, Demand::Paused);
        assert_eq!(p.len(), 1);

        reply.borrow_mut().write_accept.set(true);
        p.resume_writable(0);
        assert_eq!(p.len(), 0);
        assert_eq!(&reply.borrow().written.borrow()[..], b"hello");
    }

    #[test]
    fn until_close_locks_pipeline() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>), Box::new(|_| {}), || {});

        let mut p = pipeline.borrow_mut();
        assert!(p.accepts_more_requests());
        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::UntilClose));
        assert!(!p.accepts_more_requests());
    }

    #[test]
    fn until_close_behind_other_pipelined_entries_is_rejected() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply_a = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let reply_b = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors_a = Rc::clone(&errors);
        let errors_b = Rc::clone(&errors);

        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_a) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |e| errors_a.borrow_mut().push(e.map(|e| e.code()))), || {});
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_b) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |e| errors_b.borrow_mut().push(e.map(|e| e.code()))), || {});

        let mut p = pipeline.borrow_mut();
        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::UntilClose));
        drop(p);

        assert_eq!(pipeline.borrow().len(), 0);
        assert_eq!(*errors.borrow(), vec![Some(ErrorCode::StreamUntilCloseNotSupported), Some(ErrorCode::StreamUntilCloseNotSupported)]);
        assert!(reply_a.borrow().ended.get());
        assert!(reply_b.borrow().ended.get());
    }

    #[test]
    fn stale_entry_drains_without_writing() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let called = Rc::new(Cell::new(false));
        let called2 = Rc::clone(&called);
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |_| called2.set(true)), || {});

        let reply_dyn: Rc<RefCell<dyn EdgeReply>> = reply.clone();
        pipeline.borrow_mut().mark_stale(&reply_dyn);

        let mut p = pipeline.borrow_mut();
        p.on_parser_event(ParserEvent::Headers {
            status_code: 200,
            status_message: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: HeaderMap::new(),
        });
        p.on_parser_event(ParserEvent::BodyReadMode(BodyMode::Fixed(5)));
        p.on_parser_event(ParserEvent::BodyChunk { data: Bytes::from_static(b"hello"), is_last: true });
        assert_eq!(p.len(), 0);
        assert!(reply.borrow().written.borrow().is_empty());
        drop(p);
        assert!(called.get());
    }

    #[test]
    fn close_drains_queue_with_error() {
        let pipeline = Rc::new(RefCell::new(Pipeline::new(10)));
        let reply_a = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let reply_b = Rc::new(RefCell::new(MockReply { write_accept: Cell::new(true), ..Default::default() }));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors_a = Rc::clone(&errors);
        let errors_b = Rc::clone(&errors);

        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_a) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |e| errors_a.borrow_mut().push(e.is_some())), || {});
        Pipeline::schedule_send(&pipeline, make_request(Rc::clone(&reply_b) as Rc<RefCell<dyn EdgeReply>>), Box::new(move |e| errors_b.borrow_mut().push(e.is_some())), || {});

        pipeline.borrow_mut().close(Some(ProxyError::new(ErrorCode::ConnReset)));
        assert_eq!(*errors.borrow(), vec![true, true]);
        assert!(reply_a.borrow().ended.get());
        assert!(reply_b.borrow().ended.get());
        assert_eq!(pipeline.borrow().len(), 0);
    }
}
