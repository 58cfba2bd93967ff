//! Handler for responses that need no resource: errors, redirects,
//! `OPTIONS` and `TRACE`.

use crate::http::connection::Conn;
use crate::http::packet::{Packet, PacketKind};
use crate::http::queue::QueueId;
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags};

#[derive(Debug, Default)]
pub struct PassHandler;

impl Stage for PassHandler {
    fn name(&self) -> &str {
        "passHandler"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::HANDLER | StageFlags::ALL_METHODS | StageFlags::VIRTUAL
    }

    fn run(&self, conn: &mut Conn, q: QueueId) {
        if !conn.request_failed() && conn.response.alt_body.is_none() {
            match conn.request.method {
                Method::OPTIONS => {
                    let mut allow = "OPTIONS,GET,HEAD,POST,PUT,DELETE".to_string();
                    if conn.host.trace {
                        allow.push_str(",TRACE");
                    }
                    conn.response.set_header("Allow", allow);
                }
                Method::TRACE if conn.host.trace => {
                    conn.response.mime_type = Some("message/http".to_string());
                    conn.response.alt_body = Some(conn.request.head.clone());
                }
                Method::TRACE => {
                    conn.fail_request(StatusCode::NotAcceptable, "TRACE is disabled");
                    return;
                }
                _ => {}
            }
        }

        let body = conn.response.alt_body.clone().unwrap_or_default();
        conn.response.length = Some(body.len() as u64);
        if !body.is_empty() && !conn.response.omits_body(conn.request.method) {
            conn.pipeline
                .put_for_service(q, Packet::from_slice(PacketKind::Data, body.as_bytes()), false);
        }
        conn.pipeline.put_for_service(q, Packet::end(), true);
    }
}
