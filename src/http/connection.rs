//! Per-socket connection state machine.
//!
//! A [`Conn`] is driven by three events: the socket is readable, the socket
//! is writable, or the connection's deadline passed. Each event runs the
//! state machine as far as it can without blocking and reports what to wait
//! for next.
//!
//! ```text
//!   BEGIN ──head parsed──► CONTENT ◄──► CHUNK
//!     ▲          │             │          │
//!     │          └──no body──► PROCESSING ◄┘ body complete
//!     │                        │
//!     └──keep-alive── COMPLETE ◄┘ connector wrote END
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::ParseError;
use crate::http::chunk::parse_chunk_boundary;
use crate::http::packet::{Packet, PacketKind};
use crate::http::parser::parse_request_head;
use crate::http::queue::{Direction, Pipeline, QueueId};
use crate::http::request::{BodyKind, Request};
use crate::http::response::{Response, StatusCode};
use crate::server::host::{Alias, Host, Location};
use crate::server::transport::Transport;

const READ_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for a complete request head.
    Begin,
    /// Reading body bytes.
    Content,
    /// Expecting a chunk boundary.
    Chunk,
    /// Running the pipeline.
    Processing,
    /// The response has been written.
    Complete,
}

/// What a connection needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Read,
    Write,
    Close,
}

pub struct Conn {
    id: u64,
    pub(crate) sock: Box<dyn Transport>,
    pub host: Arc<Host>,
    remote: SocketAddr,
    state: ConnState,
    input: Packet,
    pub request: Request,
    pub response: Response,
    pub pipeline: Pipeline,
    pub alias: Option<Arc<Alias>>,
    pub location: Option<Arc<Location>>,
    keep_alive_count: i32,
    close_after: bool,
    request_failed: bool,
    conn_failed: bool,
    disconnected: bool,
    pub(crate) handler_ran: bool,
    peer_eof: bool,
    write_blocked: Option<QueueId>,
    started: Instant,
    deadline: Arc<AtomicU64>,
    wake: Arc<Notify>,
}

impl Conn {
    /// Registers a new connection with `host`.
    pub fn new(sock: Box<dyn Transport>, host: Arc<Host>, remote: SocketAddr) -> Self {
        let registration = host.register(remote);
        let conn = Self {
            id: registration.id,
            sock,
            keep_alive_count: host.max_keep_alive,
            host,
            remote,
            state: ConnState::Begin,
            input: Packet::data(0),
            request: Request::new(),
            response: Response::new(),
            pipeline: Pipeline::new(),
            alias: None,
            location: None,
            close_after: false,
            request_failed: false,
            conn_failed: false,
            disconnected: false,
            handler_ran: false,
            peer_eof: false,
            write_blocked: None,
            started: Instant::now(),
            deadline: registration.deadline,
            wake: registration.wake,
        };
        conn.touch();
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.sock.is_secure()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn request_failed(&self) -> bool {
        self.request_failed
    }

    pub fn keep_alive_count(&self) -> i32 {
        self.keep_alive_count
    }

    /// Host-relative time after which the connection expires.
    pub fn expire(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    /// Signalled by the host's expiry scan.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Bytes received but not yet consumed by the state machine.
    pub fn buffered_input(&self) -> usize {
        self.input.count()
    }

    pub fn on_readable(&mut self) -> Wait {
        if self.disconnected {
            return Wait::Close;
        }
        self.touch();

        let mut buf = [0u8; READ_SIZE];
        match self.sock.read(&mut buf) {
            Ok(0) => self.on_peer_closed(),
            Ok(n) => {
                trace!(conn = self.id, bytes = n, "read");
                self.input.put_slice(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return self.wait(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return self.wait(),
            Err(e) => {
                debug!(conn = self.id, error = %e, "read failed");
                self.abort();
                return Wait::Close;
            }
        }
        self.process();
        self.wait()
    }

    pub fn on_writable(&mut self) -> Wait {
        if self.disconnected {
            return Wait::Close;
        }
        self.touch();
        if let Some(q) = self.write_blocked.take() {
            self.pipeline.schedule(q);
        }
        self.process();
        self.wait()
    }

    /// Handles a wake-up from the expiry scan.
    pub fn on_expired(&mut self) -> Wait {
        if self.disconnected {
            return Wait::Close;
        }
        if self.expire() > self.host.now_ms() {
            return self.wait();
        }
        self.keep_alive_count = 0;
        match self.state {
            ConnState::Begin => {
                debug!(conn = self.id, peer = %self.remote, "idle connection expired");
                self.disconnected = true;
            }
            _ => {
                self.fail_connection(StatusCode::RequestTimeout, "request timed out");
                self.set_deadline(self.host.keep_alive_timeout);
                self.process();
            }
        }
        self.wait()
    }

    fn wait(&self) -> Wait {
        if self.disconnected {
            Wait::Close
        } else if self.write_blocked.is_some() {
            Wait::Write
        } else if self.peer_eof {
            Wait::Close
        } else {
            Wait::Read
        }
    }

    fn on_peer_closed(&mut self) {
        self.peer_eof = true;
        self.close_after = true;
        match self.state {
            ConnState::Content if self.request.body == BodyKind::UntilClose => self.end_body(),
            ConnState::Content | ConnState::Chunk => {
                debug!(conn = self.id, "peer closed mid-body");
                self.abort();
            }
            ConnState::Begin => {
                if !self.input.is_empty() {
                    debug!(conn = self.id, "peer closed mid-head");
                }
                self.disconnected = true;
            }
            ConnState::Processing | ConnState::Complete => {}
        }
    }

    fn process(&mut self) {
        let mut more = true;
        while more && !self.disconnected {
            more = match self.state {
                ConnState::Begin => self.parse_request(),
                ConnState::Content => self.process_content(),
                ConnState::Chunk => self.process_chunk(),
                ConnState::Processing => self.process_pipeline(),
                ConnState::Complete => self.process_completion(),
            };
        }
    }

    fn parse_request(&mut self) -> bool {
        if self.input.is_empty() {
            return false;
        }
        let host = self.host.clone();
        match parse_request_head(self.input.bytes(), &host.limits) {
            Err(ParseError::Incomplete) => false,
            Ok((request, consumed)) => {
                self.take_input(consumed);
                self.start_request(request, None);
                true
            }
            Err(err) => {
                // Framing is unknown from here on.
                self.input = Packet::data(0);
                self.start_request(Request::new(), Some(err));
                true
            }
        }
    }

    fn start_request(&mut self, request: Request, error: Option<ParseError>) {
        self.request = request;
        self.started = Instant::now();
        self.set_deadline(self.host.timeout);

        if error.is_some()
            || self.keep_alive_count <= 0
            || !self.host.keep_alive
            || !self.request.keep_alive()
            || self.request.body == BodyKind::UntilClose
        {
            self.close_after = true;
        } else {
            self.keep_alive_count -= 1;
        }

        debug!(
            conn = self.id,
            method = self.request.method.as_str(),
            url = %self.request.url,
            "request"
        );

        if let Some(err) = error {
            self.fail_request(err.status(), err.to_string());
        }
        self.route_request();
        self.create_pipeline();
        self.open_pipeline();
        if self.disconnected {
            return;
        }
        self.start_pipeline();

        match self.request.body {
            _ if self.state != ConnState::Begin => {}
            BodyKind::Empty => self.end_body(),
            BodyKind::Length | BodyKind::UntilClose => self.state = ConnState::Content,
            BodyKind::Chunked => self.state = ConnState::Chunk,
        }
    }

    fn process_content(&mut self) -> bool {
        if self.input.is_empty() {
            return false;
        }
        let n = (self.input.count() as u64).min(self.request.remaining_content) as usize;
        let packet = self.take_input(n);
        self.request.remaining_content -= n as u64;
        self.request.received_content += n as u64;

        if self.request.received_content > self.host.limits.max_body {
            self.fail_request(StatusCode::PayloadTooLarge, "request body too large");
            return true;
        }
        if !self.request_failed {
            if let Some(q) = self.pipeline.first(Direction::Receive) {
                self.put(q, packet);
            }
        }
        if self.request.remaining_content == 0 {
            if self.request.body == BodyKind::Chunked {
                self.state = ConnState::Chunk;
            } else {
                self.end_body();
            }
        }
        true
    }

    fn process_chunk(&mut self) -> bool {
        match parse_chunk_boundary(self.input.bytes()) {
            Ok(None) => false,
            Ok(Some(boundary)) => {
                self.take_input(boundary.consumed);
                if boundary.size == 0 {
                    self.end_body();
                } else if boundary.size
                    > self
                        .host
                        .limits
                        .max_body
                        .saturating_sub(self.request.received_content)
                {
                    self.fail_request(StatusCode::PayloadTooLarge, "request body too large");
                } else {
                    self.request.remaining_content = boundary.size;
                    self.state = ConnState::Content;
                }
                true
            }
            Err(err) => {
                self.fail_connection(err.status(), err.to_string());
                true
            }
        }
    }

    /// Marks the request body complete and runs the handler.
    fn end_body(&mut self) {
        if let Some(q) = self.pipeline.first(Direction::Receive) {
            self.put(q, Packet::end());
        }
        self.state = ConnState::Processing;
        self.run_pipeline();
    }

    fn process_pipeline(&mut self) -> bool {
        self.service_queues();
        self.state == ConnState::Complete
    }

    fn process_completion(&mut self) -> bool {
        self.log_request();
        self.close_pipeline();

        if self.close_after || self.conn_failed || self.keep_alive_count < 0 {
            debug!(conn = self.id, "closing after response");
            self.disconnected = true;
            return false;
        }
        self.reset_request();
        self.state = ConnState::Begin;
        self.touch();
        !self.input.is_empty()
    }

    fn reset_request(&mut self) {
        self.request = Request::new();
        self.response = Response::new();
        self.pipeline.clear();
        self.alias = None;
        self.location = None;
        self.request_failed = false;
        self.handler_ran = false;
        self.write_blocked = None;
        self.close_after = false;
    }

    /// Removes the first `n` buffered input bytes and returns them.
    fn take_input(&mut self, n: usize) -> Packet {
        if n == 0 {
            return Packet::data(0);
        }
        let mut head = std::mem::replace(&mut self.input, Packet::data(0));
        if let Some(tail) = head.split(n) {
            self.input = tail;
        }
        head
    }

    /// Fails the current request with `code`.
    ///
    /// Queued output is discarded and the pass handler takes over the
    /// handler's queue, so the error response still travels the pipeline.
    /// Calling this on an already failed request does nothing.
    pub fn fail_request(&mut self, code: StatusCode, msg: impl Into<String>) {
        if self.request_failed {
            return;
        }
        self.request_failed = true;
        let msg: String = msg.into();
        warn!(
            conn = self.id,
            code = code.as_u16(),
            url = %self.request.url,
            "request failed: {msg}"
        );

        if self.response.headers_created {
            // The status line is already on the wire.
            self.abort();
            return;
        }
        self.set_error_response(code, msg);
        if !self.pipeline.is_built() {
            return;
        }

        let pass = self.host.stages.pass();
        for direction in [Direction::Send, Direction::Receive] {
            for q in self.pipeline.chain(direction) {
                self.pipeline.discard_data(q);
                let flags = &mut self.pipeline.queue_mut(q).flags;
                flags.disabled = false;
                flags.full = false;
            }
            if let Some(q) = self.pipeline.first(direction) {
                self.pipeline.set_stage(q, pass.clone());
            }
        }
        self.response.handler = Some(pass.clone());

        match self.state {
            ConnState::Content | ConnState::Chunk => {
                self.close_after = true;
                self.end_body();
            }
            _ if self.handler_ran => {
                if let Some(q) = self.pipeline.first(Direction::Send) {
                    pass.run(self, q);
                }
            }
            _ => {}
        }
    }

    fn set_error_response(&mut self, code: StatusCode, msg: String) {
        let document = self
            .location
            .as_ref()
            .and_then(|l| l.error_documents.get(&code.as_u16()))
            .filter(|target| **target != self.request.url)
            .cloned();
        match document {
            Some(target) => {
                self.response.redirect(StatusCode::Found, &target);
                self.response.error_msg = Some(msg);
            }
            None => self.response.set_error(code, msg),
        }
    }

    /// Fails the connection: stops reading the body, answers with `code` if
    /// nothing has been sent yet and closes once the response is flushed.
    pub fn fail_connection(&mut self, code: StatusCode, msg: impl Into<String>) {
        if self.conn_failed {
            return;
        }
        let msg: String = msg.into();
        self.conn_failed = true;
        self.keep_alive_count = 0;
        self.close_after = true;

        if self.response.headers_created || !self.pipeline.is_built() {
            warn!(conn = self.id, "connection failed: {msg}");
            self.abort();
            return;
        }
        self.fail_request(code, msg);
        if matches!(self.state, ConnState::Content | ConnState::Chunk) {
            self.end_body();
        }
    }

    /// Drops the connection without writing anything more.
    pub fn abort(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.conn_failed = true;
        self.keep_alive_count = 0;
        self.state = ConnState::Complete;
    }

    /// Called by a connector once the end of the response has been written.
    pub fn complete_request(&mut self) {
        self.state = ConnState::Complete;
    }

    /// Called by a connector whose write would block.
    pub fn request_write_blocked(&mut self, q: QueueId) {
        self.write_blocked = Some(q);
    }

    /// Serializes the response head into the header packet at the front of
    /// `q`.
    pub fn fill_headers(&mut self, q: QueueId) {
        if self.response.headers_created {
            return;
        }
        if self.response.length.is_none()
            && !self.response.is_chunked()
            && !self.response.omits_body(self.request.method)
        {
            // Body is delimited by closing the connection.
            self.close_after = true;
        }
        let keep_alive = (!self.close_after).then(|| {
            (self.host.keep_alive_timeout.as_secs(), self.keep_alive_count)
        });
        let head = self.response.format_headers(&self.request, keep_alive);
        self.response.headers_created = true;
        self.pipeline.with_packet(q, 0, |packet| {
            if packet.kind == PacketKind::Header {
                packet.put_slice(head.as_bytes());
            }
        });
    }

    fn log_request(&self) {
        let line = format!(
            "{} - {} [{}] \"{} {} {}\" {} {}",
            self.remote.ip(),
            self.request.user.as_deref().unwrap_or("-"),
            httpdate::fmt_http_date(SystemTime::now()),
            self.request.method.as_str(),
            self.request.uri,
            self.request.version.as_str(),
            self.response.code.as_u16(),
            self.response.bytes_written,
        );
        self.host.access_log().log(self.id, &line);
        debug!(
            conn = self.id,
            code = self.response.code.as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "request complete"
        );
    }

    fn touch(&self) {
        let timeout = match self.state {
            ConnState::Begin => self.host.keep_alive_timeout,
            _ => self.host.timeout,
        };
        self.set_deadline(timeout);
    }

    fn set_deadline(&self, timeout: Duration) {
        let deadline = self.host.now_ms().saturating_add(timeout.as_millis() as u64);
        self.deadline.store(deadline, Ordering::Relaxed);
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close_pipeline();
        self.host.deregister(self.id);
        trace!(conn = self.id, "connection dropped");
    }
}
