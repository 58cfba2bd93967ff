//! Request routing and pipeline assembly.
//!
//! For each request the connection picks an alias, a location, a handler and
//! a connector, then builds the queues:
//!
//! ```text
//!   send:    handler ─► filter ─► ... ─► connector ─► socket
//!   receive: socket ─► handler
//! ```
//!
//! Filters come from the location in declaration order and are only included
//! when their `matches` accepts the request.

use std::fs;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::http::connection::Conn;
use crate::http::packet::Packet;
use crate::http::queue::{Direction, QueueId, QueueLimits};
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::http::stage::{self, Stage, StageFlags};
use crate::server::host::{Alias, Location};

impl Conn {
    /// Picks the alias, location and handler for the current request.
    pub(crate) fn route_request(&mut self) {
        let host = self.host.clone();
        let url = self.request.url.clone();
        let alias = host.lookup_alias(&url);
        let location = host.lookup_location(&url);
        self.alias = Some(alias.clone());
        self.location = Some(location.clone());

        let mut handler = if self.request_failed() {
            host.stages.pass()
        } else if matches!(self.request.method, Method::OPTIONS | Method::TRACE) {
            host.stages.pass()
        } else if let Some(target) = &alias.redirect {
            self.response.redirect(alias.redirect_code, target);
            host.stages.pass()
        } else {
            self.match_handler(&location, &url)
        };

        if !self.request_failed() && !handler.flags().intersects(self.request.method.flag()) {
            self.fail_request(
                StatusCode::MethodNotAllowed,
                format!("{} does not support {}", handler.name(), self.request.method.as_str()),
            );
            handler = host.stages.pass();
        }

        if !self.request_failed()
            && !handler.flags().contains(StageFlags::VIRTUAL)
            && self.map_to_storage(&alias, &url)
        {
            handler = host.stages.pass();
        }

        trace!(conn = self.id(), handler = handler.name(), location = %location.prefix, "routed");
        self.response.handler = Some(handler);
    }

    fn match_handler(&self, location: &Location, url: &str) -> Arc<dyn Stage> {
        if let Some(handler) = &location.handler {
            return handler.clone();
        }
        if let Some(handler) = location.handlers.iter().find(|h| h.matches(self, url)) {
            return handler.clone();
        }
        if let Some(handler) = self
            .request
            .extension()
            .and_then(|ext| location.extensions.get(&ext))
        {
            return handler.clone();
        }
        self.host.stages.file()
    }

    /// Maps the URL onto the alias directory and records the file metadata.
    /// Returns true when the request was turned into a redirect.
    fn map_to_storage(&mut self, alias: &Alias, url: &str) -> bool {
        let rel = url
            .strip_prefix(alias.prefix.as_str())
            .unwrap_or(url)
            .trim_start_matches('/');
        let mut path = alias.path.join(rel);
        let mut info = fs::metadata(&path).ok();

        if info.as_ref().is_some_and(|m| m.is_dir()) {
            if !url.ends_with('/') {
                let mut target = format!("{url}/");
                if let Some(query) = &self.request.query {
                    target.push('?');
                    target.push_str(query);
                }
                self.response.redirect(StatusCode::MovedPermanently, &target);
                return true;
            }
            path = path.join(&self.host.index);
            info = fs::metadata(&path).ok();
        }

        if let Some(meta) = info.as_ref().filter(|m| m.is_file()) {
            self.response.set_entity_length(meta.len());
        }
        self.response.filename = Some(path);
        self.response.file_info = info;
        false
    }

    fn select_connector(&self) -> Arc<dyn Stage> {
        let stages = &self.host.stages;
        if let Some(connector) = self.location.as_ref().and_then(|l| l.connector.clone()) {
            return connector;
        }
        let is_file = self
            .response
            .handler
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, &stages.file()));
        if is_file
            && self.host.send_file
            && !self.request_failed()
            && self.request.ranges.is_empty()
            && self.response.length.is_some()
            && !self.is_secure()
        {
            stages.send()
        } else {
            stages.net()
        }
    }

    /// Builds the send and receive queues for the current request.
    pub(crate) fn create_pipeline(&mut self) {
        let Some(handler) = self.response.handler.clone() else {
            return;
        };
        let connector = self.select_connector();
        self.response.connector = Some(connector.clone());

        let url = self.request.url.clone();
        let mut stages = vec![handler.clone()];
        if let Some(location) = self.location.clone() {
            for filter in &location.filters {
                if filter.matches(self, &url) {
                    stages.push(filter.clone());
                }
            }
        }
        stages.push(connector);

        let limits = &self.host.limits;
        let limits = QueueLimits::new(limits.max_stage_buffer, limits.max_chunk_size);
        self.pipeline.clear();
        for stage in &stages {
            self.pipeline.append(stage.clone(), Direction::Send, limits);
        }
        let receive = self.pipeline.append(handler, Direction::Receive, limits);
        if let Some(send) = self.pipeline.first(Direction::Send) {
            self.pipeline.pair(send, receive);
        }

        debug!(
            conn = self.id(),
            pipeline = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "pipeline"
        );
        self.response.output_pipeline = stages;
    }

    /// Opens every queue once: access-deciding stages, the rest of the send
    /// chain, then the receive chain. A receive queue whose send pair is open
    /// shares that open.
    pub(crate) fn open_pipeline(&mut self) {
        let send = self.pipeline.chain(Direction::Send);
        let (auth, rest): (Vec<QueueId>, Vec<QueueId>) = send
            .into_iter()
            .partition(|&q| self.pipeline.queue(q).stage.flags().contains(StageFlags::AUTH));
        let queues: Vec<QueueId> = auth
            .into_iter()
            .chain(rest)
            .chain(self.pipeline.chain(Direction::Receive))
            .collect();
        for q in queues {
            if self.is_disconnected() {
                return;
            }
            let queue = self.pipeline.queue(q);
            if queue.flags.open {
                continue;
            }
            let shared = queue
                .pair
                .is_some_and(|pair| self.pipeline.queue(pair).flags.open);
            let stage = queue.stage.clone();
            self.pipeline.queue_mut(q).flags.open = true;
            if !shared {
                stage.open(self, q);
            }
        }
    }

    /// Queues the response header packet for the connector to fill in.
    pub(crate) fn start_pipeline(&mut self) {
        if let Some(q) = self.pipeline.first(Direction::Send) {
            self.pipeline.put_for_service(q, Packet::header(), false);
        }
    }

    /// Runs the handler, once per request.
    pub(crate) fn run_pipeline(&mut self) {
        let Some(q) = self.pipeline.first(Direction::Send) else {
            return;
        };
        if self.handler_ran {
            return;
        }
        self.handler_ran = true;
        let stage = self.pipeline.queue(q).stage.clone();
        stage.run(self, q);
    }

    /// Calls `close` on every opened queue.
    pub(crate) fn close_pipeline(&mut self) {
        let queues: Vec<QueueId> = self
            .pipeline
            .chain(Direction::Send)
            .into_iter()
            .chain(self.pipeline.chain(Direction::Receive))
            .collect();
        for q in queues {
            let queue = self.pipeline.queue(q);
            if !queue.flags.open {
                continue;
            }
            let shared = queue.direction == Direction::Receive && queue.pair.is_some();
            let stage = queue.stage.clone();
            self.pipeline.queue_mut(q).flags.open = false;
            if !shared {
                stage.close(self, q);
            }
        }
    }

    /// Delivers `packet` to the data callback of queue `q`.
    pub fn put(&mut self, q: QueueId, packet: Packet) {
        let queue = self.pipeline.queue(q);
        let stage = queue.stage.clone();
        let direction = queue.direction;
        stage::deliver(&stage, self, q, direction, packet);
    }

    /// Delivers `packet` to the queue after `q`. Packets past the end of a
    /// chain are dropped.
    pub fn put_next(&mut self, q: QueueId, packet: Packet) {
        match self.pipeline.queue(q).next {
            Some(next) => self.put(next, packet),
            None => trace!(conn = self.id(), "packet dropped at end of chain"),
        }
    }

    /// Forwards the packets of `q` downstream until the next queue refuses.
    pub fn send_packets(&mut self, q: QueueId) {
        while let Some(mut packet) = self.pipeline.get(q) {
            if !self.pipeline.will_next_queue_accept(q, &mut packet) {
                self.pipeline.put_back(q, packet);
                return;
            }
            self.put_next(q, packet);
        }
    }

    /// Runs the service callback of `q`.
    pub fn service_queue(&mut self, q: QueueId) {
        self.pipeline.unschedule(q);
        let queue = self.pipeline.queue(q);
        if queue.flags.servicing {
            return;
        }
        let stage = queue.stage.clone();
        let direction = queue.direction;

        self.pipeline.queue_mut(q).flags.servicing = true;
        match direction {
            Direction::Send => stage.outgoing_service(self, q),
            Direction::Receive => stage.incoming_service(self, q),
        }
        if q < self.pipeline.len() {
            let flags = &mut self.pipeline.queue_mut(q).flags;
            flags.servicing = false;
            flags.serviced = true;
        }
    }

    /// Services scheduled queues until none are ready.
    pub fn service_queues(&mut self) {
        while !self.is_disconnected() {
            let Some(q) = self.pipeline.next_scheduled() else {
                break;
            };
            self.service_queue(q);
        }
    }
}
