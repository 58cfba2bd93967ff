//! Byte range filter.
//!
//! On its first service the filter resolves the request ranges against the
//! entity length and turns the response into a 206. After that it walks the
//! entity stream, tracking the entity offset in `range_pos`, and forwards
//! only the bytes inside the current range. Multiple ranges become a
//! `multipart/byteranges` body with a part header before each range and a
//! closing boundary before the end packet.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::http::connection::Conn;
use crate::http::packet::{Packet, PacketKind};
use crate::http::queue::QueueId;
use crate::http::range;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags};

#[derive(Debug, Default)]
pub struct RangeFilter;

impl RangeFilter {
    /// Returns false when the request was failed.
    fn start(&self, conn: &mut Conn, q: QueueId) -> bool {
        if conn.response.code != StatusCode::Ok || conn.request.ranges.is_empty() {
            conn.response.ranges.clear();
            return true;
        }
        let queue = conn.pipeline.queue(q);
        let length = conn
            .response
            .entity_length
            .or_else(|| queue.has_end().then(|| queue.count() as u64))
            .map(|l| l as i64);

        let ranges = match range::resolve(&conn.request.ranges, length) {
            Ok(ranges) => ranges,
            Err(_) => {
                conn.fail_request(StatusCode::RangeNotSatisfiable, "requested range not satisfiable");
                return false;
            }
        };

        conn.response.code = StatusCode::PartialContent;
        conn.response.range_pos = 0;
        conn.response.current_range = 0;
        if let [only] = ranges.as_slice() {
            conn.response.length = Some(only.len() as u64);
        } else {
            let time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            let boundary = range::create_boundary(conn.id(), time);
            conn.response.length = Some(range::multipart_length(
                &ranges,
                &boundary,
                length,
                conn.response.mime_type.as_deref(),
            ));
            conn.response.range_boundary = Some(boundary);
        }
        conn.response.ranges = ranges;
        true
    }

    /// Forwards the parts of `packet` that fall inside the requested ranges.
    fn select_bytes(&self, conn: &mut Conn, q: QueueId, mut packet: Packet) {
        let length = conn.response.entity_length.map(|l| l as i64);
        loop {
            let Some(range) = conn.response.ranges.get(conn.response.current_range).copied() else {
                // Past the last range.
                return;
            };
            let pos = conn.response.range_pos;
            let count = packet.count() as i64;
            if count == 0 {
                return;
            }
            if pos + count <= range.start {
                conn.response.range_pos += count;
                return;
            }
            if pos < range.start {
                let skip = range.start - pos;
                conn.response.range_pos += skip;
                match packet.split(skip as usize) {
                    Some(tail) => packet = tail,
                    None => return,
                }
                continue;
            }
            if pos >= range.end {
                conn.response.current_range += 1;
                continue;
            }

            let span = count.min(range.end - pos);
            let tail = packet.split(span as usize);
            if pos == range.start {
                if let Some(boundary) = conn.response.range_boundary.clone() {
                    let header = range::part_header(
                        &boundary,
                        &range,
                        length,
                        conn.response.mime_type.as_deref(),
                    );
                    conn.put_next(q, Packet::from_slice(PacketKind::Range, header.as_bytes()));
                }
            }
            conn.put_next(q, packet);
            conn.response.range_pos += span;
            if conn.response.range_pos >= range.end {
                conn.response.current_range += 1;
            }
            match tail {
                Some(tail) => packet = tail,
                None => return,
            }
        }
    }
}

impl Stage for RangeFilter {
    fn name(&self) -> &str {
        "rangeFilter"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::FILTER | StageFlags::GET | StageFlags::HEAD | StageFlags::POST
    }

    fn matches(&self, conn: &Conn, _url: &str) -> bool {
        !conn.request.ranges.is_empty()
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) {
        if !conn.pipeline.queue(q).flags.serviced && !self.start(conn, q) {
            return;
        }
        if conn.response.ranges.is_empty() {
            conn.send_packets(q);
            return;
        }

        while let Some(mut packet) = conn.pipeline.get(q) {
            match packet.kind {
                PacketKind::Data => {
                    if !conn.pipeline.will_next_queue_accept(q, &mut packet) {
                        conn.pipeline.put_back(q, packet);
                        return;
                    }
                    self.select_bytes(conn, q, packet);
                }
                PacketKind::End => {
                    if let Some(boundary) = conn.response.range_boundary.clone() {
                        let closing = range::final_boundary(&boundary);
                        conn.put_next(q, Packet::from_slice(PacketKind::Range, closing.as_bytes()));
                    }
                    conn.put_next(q, packet);
                }
                PacketKind::Header | PacketKind::Range => conn.put_next(q, packet),
            }
        }
    }
}
