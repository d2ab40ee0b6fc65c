//! Client / pool (spec §4.5): a keyed connection pool choosing a
//! connection per request at random among available ones, up to
//! `maxConnectionsByHost`.

use crate::config::ClientOptions;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{ErrorCode, ProxyError};
use crate::request::{Request, ResponseCallback};
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

type Key = (String, u16);

pub struct Client {
    options: ClientOptions,
    ready: RefCell<HashMap<Key, Vec<Rc<RefCell<Connection>>>>>,
    pending: RefCell<HashMap<Key, usize>>,
    closed: Cell<bool>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self { options, ready: RefCell::new(HashMap::new()), pending: RefCell::new(HashMap::new()), closed: Cell::new(false) }
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_reopen_attempts: self.options.reconnection_attempts,
            reopen_delay: Duration::from_millis(self.options.reconnection_delay_ms),
            connection_timeout: Duration::from_millis(self.options.connection_timeout_ms),
            max_pipelined_requests: self.options.max_pipelined_requests_by_connection,
            max_stacked_buffers: self.options.max_stacked_buffers,
        }
    }

    /// Forward `request` onto a connection for `(request.host,
    /// request.port)`, opening one if the per-host cap allows it.
    pub async fn request(&self, request: Request, callback: ResponseCallback) -> Result<(), ProxyError> {
        if self.closed.get() {
            return Err(ProxyError::new(ErrorCode::ConnReset));
        }
        let key = (request.host.clone(), request.port);
        let conn = self.get_connection(&key).await?;
        let conn = conn.borrow();
        conn.send(request, callback).await
    }

    async fn get_connection(&self, key: &Key) -> Result<Rc<RefCell<Connection>>, ProxyError> {
        self.prune_closed(key);

        let ready_count = self.ready.borrow().get(key).map(|v| v.len()).unwrap_or(0);
        let pending_count = *self.pending.borrow().get(key).unwrap_or(&0);

        if pending_count + ready_count < self.options.max_connections_by_host {
            *self.pending.borrow_mut().entry(key.clone()).or_insert(0) += 1;
            let result = Connection::connect(key.0.clone(), key.1, self.connection_options()).await;
            if let Some(count) = self.pending.borrow_mut().get_mut(key) {
                *count = count.saturating_sub(1);
            }
            let conn = result?;
            self.ready.borrow_mut().entry(key.clone()).or_default().push(Rc::clone(&conn));
            return Ok(conn);
        }

        let ready = self.ready.borrow();
        let available: Vec<&Rc<RefCell<Connection>>> =
            ready.get(key).into_iter().flatten().filter(|c| c.borrow().is_available()).collect();
        if available.is_empty() {
            return Err(ProxyError::new(ErrorCode::MaxConnections));
        }
        let idx = rand::thread_rng().gen_range(0..available.len());
        Ok(Rc::clone(available[idx]))
    }

    fn prune_closed(&self, key: &Key) {
        if let Some(conns) = self.ready.borrow_mut().get_mut(key) {
            conns.retain(|c| c.borrow().state() != crate::connection::ConnState::Closed);
        }
    }

    /// Periodic idle sweep (spec §4.5 "Idle watcher"): close and evict
    /// every ready connection whose last activity predates
    /// `connectionTimeout`. In-flight connections are untouched.
    pub fn sweep_idle(&self, now: std::time::Instant) {
        let timeout = Duration::from_millis(self.options.connection_timeout_ms);
        for conns in self.ready.borrow_mut().values_mut() {
            for conn in conns.iter() {
                let c = conn.borrow();
                if c.is_available() && now.duration_since(c.last_activity()) >= timeout {
                    c.close(None);
                }
            }
            conns.retain(|c| c.borrow().state() != crate::connection::ConnState::Closed);
        }
    }

    /// Close every connection for `key`, or all connections (and stop
    /// accepting new requests) if `key` is `None`.
    pub fn close(&self, key: Option<&Key>) {
        match key {
            Some(k) => {
                if let Some(conns) = self.ready.borrow_mut().remove(k) {
                    for c in conns {
                        c.borrow().close(None);
                    }
                }
            }
            None => {
                self.closed.set(true);
                for conns in self.ready.borrow_mut().values() {
                    for c in conns {
                        c.borrow().close(None);
                    }
                }
                self.ready.borrow_mut().clear();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}
