//! Capability traits the core requires from the edge front-end.
//!
//! The core never depends on a concrete WebSocket/HTTP server — it is
//! handed a `&mut dyn EdgeReply` per request and a request body source,
//! both satisfied by whatever accept loop is terminating edge traffic.

/// Per-request reply-handle capability. Single-owner: written to exactly
/// once per request, only from within a `cork` scope.
pub trait EdgeReply {
    fn write_status(&mut self, status: u16, message: &str);
    fn write_header(&mut self, name: &str, value: &str);

    /// Content-Length path: try to end the response with `buf`, which may
    /// be the whole body or the final chunk of it. Returns
    /// `(accepted, done)` — `done` means the reply has now been fully
    /// written; `!accepted` means the caller must wait for a writable
    /// signal before retrying with the unaccepted remainder.
    fn try_end(&mut self, buf: &[u8], total_size: u64) -> (bool, bool);

    /// Unknown-length / chunked path: write `buf`. `false` means the
    /// caller must wait for a writable signal before retrying.
    fn write(&mut self, buf: &[u8]) -> bool;

    fn end(&mut self, buf: Option<&[u8]>);

    /// Register the writable-signal callback; invoked with the offset the
    /// reply has resumed writing from. Return `true` to keep listening.
    fn on_writable(&mut self, cb: Box<dyn FnMut(u64) -> bool>);

    fn on_aborted(&mut self, cb: Box<dyn FnOnce()>);

    /// Forcibly mark this reply aborted and invoke every callback
    /// registered through `on_aborted` so far. Called by the proxy itself
    /// (e.g. on a backend timeout) as well as by the edge transport on a
    /// detected peer disconnect — both are "nothing more will be written
    /// here" in spec §4.6's sense.
    fn abort(&mut self);

    /// Run `f` inside an IO-coalescing cork scope.
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn EdgeReply));

    fn get_write_offset(&self) -> u64;

    fn is_aborted(&self) -> bool;

    fn remote_address(&self) -> String;
}

/// Lazy sequence of request-body chunks, as delivered by the edge.
pub trait RequestBodySource {
    /// Register the data callback; each invocation delivers one chunk and
    /// whether it is the last.
    fn on_data(&mut self, cb: Box<dyn FnMut(&[u8], bool)>);

    fn on_aborted(&mut self, cb: Box<dyn FnOnce()>);
}
