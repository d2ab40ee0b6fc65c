//! Connection (spec §4.4): one backend TCP socket plus the
//! ResponseParser/Pipeline/RequestSender triple that owns it.

use crate::error::{ErrorCode, ProxyError};
use crate::parser::{ParserEvent, ResponseParser};
use crate::pipeline::Pipeline;
use crate::request::{Request, ResponseCallback};
use crate::sender::RequestSender;
use bytes::Bytes;
use monoio::io::{AsyncReadRent, Splitable};
use monoio::net::TcpStream;
use monoio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_reopen_attempts: u32,
    pub reopen_delay: Duration,
    pub connection_timeout: Duration,
    pub max_pipelined_requests: usize,
    pub max_stacked_buffers: usize,
}

/// One backend socket and the pipeline bookkeeping attached to it.
///
/// Lives inside `Rc<RefCell<_>>` on whichever worker thread accepted the
/// edge connection it's forwarding for — no cross-thread sharing, no
/// locks (spec §5).
pub struct Connection {
    host: String,
    port: u16,
    state: Rc<RefCell<ConnState>>,
    last_activity: Rc<RefCell<Instant>>,
    pipeline: Rc<RefCell<Pipeline>>,
    sender: RequestSender,
    write_half: RefCell<Option<OwnedWriteHalf>>,
    /// Serializes `send` calls on this connection. The write half is taken
    /// out of `write_half` for the duration of a send so no `RefCell`
    /// borrow spans the socket-write `.await`; this flag makes a second
    /// concurrent `send` wait for its turn instead of finding `write_half`
    /// empty.
    sending: Cell<bool>,
}

impl Connection {
    /// Open a new backend connection. Retries transparently on
    /// `ECONNREFUSED` up to `max_reopen_attempts`, waiting `reopen_delay`
    /// between attempts and not surfacing the error until attempts are
    /// exhausted (spec §4.4: "do not surface the error").
    pub async fn connect(host: String, port: u16, opts: ConnectionOptions) -> Result<Rc<RefCell<Connection>>, ProxyError> {
        let state = Rc::new(RefCell::new(ConnState::Connecting));
        let mut attempts = 0u32;
        let stream = loop {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(s) => break s,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused && attempts < opts.max_reopen_attempts => {
                    attempts += 1;
                    monoio::time::sleep(opts.reopen_delay).await;
                }
                Err(e) => return Err(ProxyError::from_io(ErrorCode::ConnRefused, e)),
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();

        // `state` was `Connecting` for the whole dial above (including any
        // refused-retry loop); now that the socket is live, transition it
        // before anything else can observe it (spec §4.4 ordering).
        *state.borrow_mut() = ConnState::Connected;
        let last_activity = Rc::new(RefCell::new(Instant::now()));
        let pipeline = Rc::new(RefCell::new(Pipeline::new(opts.max_pipelined_requests)));
        let sender = RequestSender::new(opts.max_stacked_buffers);

        let conn = Rc::new(RefCell::new(Connection {
            host,
            port,
            state: Rc::clone(&state),
            last_activity: Rc::clone(&last_activity),
            pipeline: Rc::clone(&pipeline),
            sender,
            write_half: RefCell::new(Some(write_half)),
            sending: Cell::new(false),
        }));

        spawn_read_loop(read_half, pipeline, state, last_activity);

        Ok(conn)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.borrow()
    }

    /// `isAvailable() ⇔ state == Connected ∧ Sender.acceptsMoreRequests()`
    /// (spec §4.4 "Send gating").
    pub fn is_available(&self) -> bool {
        self.state() == ConnState::Connected && self.pipeline.borrow().accepts_more_requests()
    }

    /// Returns `Err` only when `request` was never handed to the pipeline
    /// (connection not `Connected`) — the caller still owns the
    /// reply-handle and must answer it itself. Once `schedule_send` has
    /// run, any write failure is absorbed here: the connection and its
    /// whole pipeline are closed with that error, which invokes every
    /// queued callback (including this one) and ends their reply-handles,
    /// so `send` reports success to its caller.
    ///
    /// Concurrent pipelined requests on the same connection are common
    /// (the pool hands out the same `Connection` until its pipeline stops
    /// accepting more), so a second `send` arriving while the first is
    /// still streaming its body must wait rather than fight over
    /// `write_half`'s borrow. The write half is taken out of its `RefCell`
    /// for the duration of the send — no borrow is ever held across the
    /// `.await` — and `sending` gates entry so only one send owns it at a
    /// time.
    pub async fn send(&self, request: Request, callback: ResponseCallback) -> Result<(), ProxyError> {
        loop {
            if self.state() != ConnState::Connected {
                return Err(ProxyError::new(ErrorCode::ConnReset));
            }
            if !self.sending.replace(true) {
                break;
            }
            monoio::time::sleep(Duration::from_millis(1)).await;
        }

        let Some(mut write_half) = self.write_half.borrow_mut().take() else {
            self.sending.set(false);
            return Err(ProxyError::new(ErrorCode::ConnReset));
        };

        let result = self.sender.send(&mut write_half, &self.pipeline, request, callback).await;

        if self.state() == ConnState::Connected {
            *self.write_half.borrow_mut() = Some(write_half);
        }
        self.sending.set(false);

        if let Err(e) = result {
            self.close(Some(e));
        }
        Ok(())
    }

    /// Tear down: mark Closed, drain the pipeline with `err`, drop the
    /// write half so no further sends are attempted.
    pub fn close(&self, err: Option<ProxyError>) {
        *self.state.borrow_mut() = ConnState::Closed;
        self.pipeline.borrow_mut().close(err);
        *self.write_half.borrow_mut() = None;
    }
}

/// Background task owning the read half: feeds inbound bytes to the
/// ResponseParser and forwards every event to the Pipeline, reacting to
/// fatal parser errors and peer-initiated close per spec §4.4.
fn spawn_read_loop(
    mut read_half: OwnedReadHalf,
    pipeline: Rc<RefCell<Pipeline>>,
    state: Rc<RefCell<ConnState>>,
    last_activity: Rc<RefCell<Instant>>,
) {
    monoio::spawn(async move {
        let mut parser = ResponseParser::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let (res, returned_buf) = read_half.read(buf).await;
            buf = returned_buf;
            match res {
                Ok(0) => {
                    *state.borrow_mut() = ConnState::Closed;
                    if parser.is_locked_until_close() {
                        pipeline.borrow_mut().on_parser_event(ParserEvent::BodyChunk { data: Bytes::new(), is_last: true });
                    } else if !pipeline.borrow().is_empty() {
                        pipeline.borrow_mut().close(Some(ProxyError::new(ErrorCode::ConnAborted)));
                    } else {
                        pipeline.borrow_mut().close(None);
                    }
                    return;
                }
                Ok(n) => {
                    *last_activity.borrow_mut() = Instant::now();
                    let events = parser.feed(&buf[..n]);
                    let mut fatal = false;
                    for event in events {
                        if let ParserEvent::Error(code) = event {
                            fatal = fatal || code.is_parser_fatal();
                        }
                        pipeline.borrow_mut().on_parser_event(event);
                    }
                    if fatal {
                        *state.borrow_mut() = ConnState::Closed;
                        return;
                    }
                }
                Err(e) => {
                    let code = if e.kind() == std::io::ErrorKind::ConnectionAborted {
                        ErrorCode::RecipientAborted
                    } else {
                        ErrorCode::ConnReset
                    };
                    *state.borrow_mut() = ConnState::Closed;
                    pipeline.borrow_mut().close(Some(ProxyError::from_io(code, e)));
                    return;
                }
            }
        }
    });
}
