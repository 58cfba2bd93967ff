//! The stage contract shared by handlers, filters and connectors.
//!
//! A stage is a stateless, process-wide object. Per-request state lives on the
//! [`Conn`]'s request and response; the stage only ever sees the queue it is
//! being called for.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::http::connection::Conn;
use crate::http::packet::Packet;
use crate::http::queue::{Direction, QueueId};

/// Capability bits advertised by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageFlags(u32);

impl StageFlags {
    pub const DELETE: StageFlags = StageFlags(0x1);
    pub const GET: StageFlags = StageFlags(0x2);
    pub const HEAD: StageFlags = StageFlags(0x4);
    pub const OPTIONS: StageFlags = StageFlags(0x8);
    pub const POST: StageFlags = StageFlags(0x10);
    pub const PUT: StageFlags = StageFlags(0x20);
    pub const TRACE: StageFlags = StageFlags(0x40);
    pub const ALL_METHODS: StageFlags = StageFlags(0x7f);

    pub const CONNECTOR: StageFlags = StageFlags(0x1000);
    pub const HANDLER: StageFlags = StageFlags(0x2000);
    pub const FILTER: StageFlags = StageFlags(0x4000);

    /// Wants decoded form variables.
    pub const FORM_VARS: StageFlags = StageFlags(0x10000);
    /// Wants CGI-style environment variables.
    pub const ENV_VARS: StageFlags = StageFlags(0x20000);
    /// Has no backing file.
    pub const VIRTUAL: StageFlags = StageFlags(0x40000);
    /// Wants the URL split into script and extra path info.
    pub const PATH_INFO: StageFlags = StageFlags(0x80000);
    /// Decides access. Opened before any other queue of the pipeline.
    pub const AUTH: StageFlags = StageFlags(0x100000);

    pub const fn empty() -> Self {
        StageFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: StageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: StageFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for StageFlags {
    type Output = StageFlags;

    fn bitor(self, rhs: StageFlags) -> StageFlags {
        StageFlags(self.0 | rhs.0)
    }
}

/// A pipeline element.
///
/// Every callback has a default so a stage only implements what it needs.
/// The data defaults queue packets for service; the service defaults forward
/// queued packets downstream with flow control.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> StageFlags;

    /// Custom eligibility check, consulted for handlers a location lists
    /// without an extension and for filters during pipeline assembly.
    fn matches(&self, _conn: &Conn, _url: &str) -> bool {
        true
    }

    /// Per-request setup. May fail the request.
    fn open(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Per-request teardown. Called once for every opened queue.
    fn close(&self, _conn: &mut Conn, _q: QueueId) {}

    /// Handler entry point, invoked once the request body has been received.
    fn run(&self, _conn: &mut Conn, _q: QueueId) {}

    fn incoming_data(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        if conn.pipeline.queue(q).next.is_some() {
            conn.put_next(q, packet);
        } else {
            conn.pipeline.join_for_service(q, packet, false);
        }
    }

    fn incoming_service(&self, conn: &mut Conn, q: QueueId) {
        conn.send_packets(q);
    }

    fn outgoing_data(&self, conn: &mut Conn, q: QueueId, packet: Packet) {
        conn.pipeline.put_for_service(q, packet, true);
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        conn.send_packets(q);
    }
}

impl fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivers `packet` to the data callback of `stage` for `direction`.
pub(crate) fn deliver(
    stage: &Arc<dyn Stage>,
    conn: &mut Conn,
    q: QueueId,
    direction: Direction,
    packet: Packet,
) {
    match direction {
        Direction::Send => stage.outgoing_data(conn, q, packet),
        Direction::Receive => stage.incoming_data(conn, q, packet),
    }
}

/// Registry of stages by name.
#[derive(Default, Clone)]
pub struct Stages {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl Stages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for Stages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.stages.keys().collect();
        names.sort();
        f.debug_list().entries(names).finish()
    }
}
