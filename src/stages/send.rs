//! File send connector.
//!
//! Used for whole-file responses on plain sockets. The file body travels as
//! one file-backed packet and is handed to the transport's file send path
//! together with the header bytes, so the body never enters user memory.

use crate::http::connection::Conn;
use crate::http::queue::QueueId;
use crate::http::stage::{Stage, StageFlags};
use crate::http::writer;

#[derive(Debug, Default)]
pub struct SendConnector;

impl Stage for SendConnector {
    fn name(&self) -> &str {
        "sendConnector"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::CONNECTOR | StageFlags::GET | StageFlags::HEAD | StageFlags::POST
    }

    /// File regions are not buffered, so the queue limits only need to admit
    /// them whole.
    fn open(&self, conn: &mut Conn, q: QueueId) {
        let queue = conn.pipeline.queue_mut(q);
        queue.max = usize::MAX / 2;
        queue.packet_size = usize::MAX / 2;
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        writer::service(conn, q, true);
    }
}
