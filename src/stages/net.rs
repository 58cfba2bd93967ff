//! Default connector: gathers buffered packets into vectored socket writes.

use crate::http::connection::Conn;
use crate::http::queue::QueueId;
use crate::http::stage::{Stage, StageFlags};
use crate::http::writer;

#[derive(Debug, Default)]
pub struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> &str {
        "netConnector"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::CONNECTOR | StageFlags::ALL_METHODS
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        writer::service(conn, q, false);
    }
}
