//! Static file handler.
//!
//! Routing has already mapped the URL to a path and stat'ed it. `open`
//! validates the file, sets the entity headers and evaluates conditional
//! requests. With the send connector the whole file goes down the pipeline
//! as a single file-backed packet. Otherwise the file is cut into
//! file-backed packets that are read just before they are forwarded, so
//! memory stays bounded by the queue limits.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::http::connection::Conn;
use crate::http::packet::Packet;
use crate::http::queue::QueueId;
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags};

#[derive(Debug, Default)]
pub struct FileHandler;

/// Entity tag built from inode, size and modification time.
pub fn file_etag(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    format!("\"{:x}-{:x}-{:x}\"", meta.ino(), meta.len(), mtime)
}

impl Stage for FileHandler {
    fn name(&self) -> &str {
        "fileHandler"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::HANDLER | StageFlags::GET | StageFlags::HEAD | StageFlags::POST
    }

    fn open(&self, conn: &mut Conn, _q: QueueId) {
        let Some(meta) = conn.response.file_info.clone().filter(|m| m.is_file()) else {
            conn.fail_request(
                StatusCode::NotFound,
                format!("cannot find {}", conn.request.url),
            );
            return;
        };

        let etag = file_etag(&meta);
        let modified = meta.modified().ok();
        conn.response.etag = Some(etag.clone());
        conn.response.last_modified = modified;
        conn.response.set_header("Accept-Ranges", "bytes");
        let mime = conn
            .response
            .filename
            .as_ref()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .and_then(|e| conn.host.mime_types.lookup(e))
            .map(str::to_string);
        conn.response.mime_type = mime;

        if let Some(modified) = modified {
            if conn.request.content_not_modified(Some(&etag), modified) {
                let method = conn.request.method;
                if conn.request.conditional.is_precondition()
                    || !matches!(method, Method::GET | Method::HEAD)
                {
                    conn.fail_request(StatusCode::PreconditionFailed, "precondition failed");
                    return;
                }
                conn.response.code = StatusCode::NotModified;
            }
        }

        if conn.response.omits_body(conn.request.method) {
            return;
        }
        let Some(path) = conn.response.filename.clone() else {
            return;
        };
        match File::open(&path) {
            Ok(file) => conn.response.file = Some(file),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot open file");
                conn.fail_request(StatusCode::Forbidden, "cannot open file");
            }
        }
    }

    fn run(&self, conn: &mut Conn, q: QueueId) {
        if conn.response.omits_body(conn.request.method) || conn.response.file.is_none() {
            conn.pipeline.put_for_service(q, Packet::end(), true);
            return;
        }

        let length = conn.response.entity_length.unwrap_or(0) as usize;
        let send_mode = conn
            .response
            .connector
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &conn.host.stages.send()));

        if send_mode {
            if length > 0 {
                conn.pipeline
                    .put_for_service(q, Packet::file_region(length), false);
            }
        } else {
            let packet_size = conn.pipeline.queue(q).packet_size.max(1);
            let mut remaining = length;
            while remaining > 0 {
                let size = remaining.min(packet_size);
                conn.pipeline
                    .put_for_service(q, Packet::file_region(size), false);
                remaining -= size;
            }
        }
        conn.pipeline.put_for_service(q, Packet::end(), true);
    }

    /// Forwards queued packets, reading each file-backed packet from the
    /// file once the next queue has room for it.
    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        let send_mode = conn
            .response
            .connector
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &conn.host.stages.send()));

        while let Some(mut packet) = conn.pipeline.get(q) {
            if !conn.pipeline.will_next_queue_accept(q, &mut packet) {
                conn.pipeline.put_back(q, packet);
                return;
            }
            if packet.is_file_backed() && !send_mode {
                let offset = conn.response.read_pos;
                let Some(file) = conn.response.file.as_ref() else {
                    conn.abort();
                    return;
                };
                if let Err(e) = packet.fill_from(file, offset) {
                    debug!(error = %e, "cannot read file");
                    conn.fail_request(StatusCode::InternalServerError, "cannot read file");
                    return;
                }
                conn.response.read_pos += packet.count() as u64;
            }
            conn.put_next(q, packet);
        }
    }
}
