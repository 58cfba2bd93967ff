//! Chunked transfer-coding filter.
//!
//! Matched for HTTP/1.1 responses whose length is unknown at assembly time.
//! If the handler turns out to have produced the whole body by the first
//! service, the filter sets a `Content-Length` instead and passes packets
//! through untouched.

use crate::http::chunk::{LAST_CHUNK, chunk_prefix};
use crate::http::connection::Conn;
use crate::http::packet::PacketKind;
use crate::http::queue::QueueId;
use crate::http::request::{Method, Version};
use crate::http::stage::{Stage, StageFlags};

#[derive(Debug, Default)]
pub struct ChunkFilter;

impl ChunkFilter {
    fn start(&self, conn: &mut Conn, q: QueueId) {
        if conn.response.length.is_some() {
            return;
        }
        let queue = conn.pipeline.queue(q);
        if queue.has_end() {
            conn.response.length = Some(queue.count() as u64);
            return;
        }
        let size = conn
            .host
            .chunk_size
            .unwrap_or(conn.host.limits.max_chunk_size)
            .min(queue.max);
        conn.response.chunk_size = Some(size);
    }
}

impl Stage for ChunkFilter {
    fn name(&self) -> &str {
        "chunkFilter"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::FILTER | StageFlags::ALL_METHODS
    }

    fn matches(&self, conn: &Conn, _url: &str) -> bool {
        conn.request.method != Method::HEAD
            && conn.request.version == Version::Http11
            && conn.response.length.is_none()
            && conn.host.chunk_size != Some(0)
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        if !conn.pipeline.queue(q).flags.serviced {
            self.start(conn, q);
        }
        let Some(size) = conn.response.chunk_size.filter(|&s| s > 0) else {
            conn.send_packets(q);
            return;
        };

        while let Some(mut packet) = conn.pipeline.get(q) {
            match packet.kind {
                PacketKind::Data | PacketKind::Range => {
                    if packet.is_empty() {
                        continue;
                    }
                    conn.pipeline.resize_packet(q, &mut packet, size);
                    if !conn.pipeline.will_next_queue_accept(q, &mut packet) {
                        conn.pipeline.put_back(q, packet);
                        return;
                    }
                    packet.set_prefix(chunk_prefix(packet.count()));
                }
                PacketKind::End => packet.set_prefix(LAST_CHUNK),
                PacketKind::Header => {}
            }
            conn.put_next(q, packet);
        }
    }
}
