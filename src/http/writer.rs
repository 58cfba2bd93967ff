//! Vectored response output shared by the connectors.
//!
//! Each pass gathers the front packets of the connector queue into an
//! [`IoVec`], writes it with one call, then frees what was written. Partial
//! writes leave the unwritten remainder at the front of the queue.

use std::collections::VecDeque;
use std::io::{self, IoSlice};

use tracing::{debug, trace};

use crate::http::connection::Conn;
use crate::http::packet::{Packet, PacketKind};
use crate::http::queue::QueueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Prefix,
    Content,
    File,
    Suffix,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    packet: usize,
    part: Part,
}

/// The buffer fragments of one vectored write.
#[derive(Debug, Default)]
pub struct IoVec {
    entries: Vec<Entry>,
    /// Total bytes described.
    pub count: usize,
    /// Bytes taken from the response file.
    pub file_len: usize,
    /// The end-of-stream packet was reached.
    pub eof: bool,
}

impl IoVec {
    /// Gathers up to `max_entries` fragments from the front of `packets`.
    ///
    /// A file region is only accepted when `allow_file` is set and only one
    /// per vector: gathering stops after the file packet's suffix.
    pub fn build(packets: &VecDeque<Packet>, max_entries: usize, allow_file: bool) -> Self {
        let mut io = IoVec::default();
        let max_entries = max_entries.max(3);

        for (index, packet) in packets.iter().enumerate() {
            if packet.kind == PacketKind::End {
                // The end packet may carry the last-chunk trailer.
                match packet.prefix.as_ref().filter(|b| !b.is_empty()) {
                    Some(prefix) if io.entries.len() < max_entries => {
                        io.push(index, Part::Prefix, prefix.len());
                        io.eof = true;
                    }
                    Some(_) => {}
                    None => io.eof = true,
                }
                break;
            }
            if io.entries.len() + 3 > max_entries {
                break;
            }
            let file_backed = packet.is_file_backed();
            if file_backed && !allow_file {
                break;
            }
            if let Some(prefix) = packet.prefix.as_ref().filter(|b| !b.is_empty()) {
                io.push(index, Part::Prefix, prefix.len());
            }
            if packet.count() > 0 {
                if file_backed {
                    io.push(index, Part::File, packet.count());
                    io.file_len = packet.count();
                } else {
                    io.push(index, Part::Content, packet.count());
                }
            }
            if let Some(suffix) = packet.suffix.as_ref().filter(|b| !b.is_empty()) {
                io.push(index, Part::Suffix, suffix.len());
            }
            if file_backed {
                io.eof = packets
                    .get(index + 1)
                    .is_some_and(|p| p.kind == PacketKind::End);
                break;
            }
        }
        io
    }

    fn push(&mut self, packet: usize, part: Part, len: usize) {
        self.entries.push(Entry { packet, part });
        self.count += len;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer slices before and after the file region. Without a file region
    /// everything is in the first list.
    fn slices<'p>(&self, packets: &'p VecDeque<Packet>) -> (Vec<IoSlice<'p>>, Vec<IoSlice<'p>>) {
        let mut before = Vec::with_capacity(self.entries.len());
        let mut after = Vec::new();
        let mut seen_file = false;
        for entry in &self.entries {
            let Some(packet) = packets.get(entry.packet) else {
                continue;
            };
            let bytes: &[u8] = match entry.part {
                Part::Prefix => packet.prefix.as_deref().unwrap_or_default(),
                Part::Content => packet.bytes(),
                Part::Suffix => packet.suffix.as_deref().unwrap_or_default(),
                Part::File => {
                    seen_file = true;
                    continue;
                }
            };
            if seen_file {
                after.push(IoSlice::new(bytes));
            } else {
                before.push(IoSlice::new(bytes));
            }
        }
        (before, after)
    }
}

/// Writes the packets queued on connector queue `q` until the queue is empty
/// or the socket would block.
///
/// `allow_file` lets file-backed packets go out through the transport's
/// file send path. Otherwise such a packet is a pipeline error.
pub(crate) fn service(conn: &mut Conn, q: QueueId, allow_file: bool) {
    loop {
        if conn.is_disconnected() {
            return;
        }
        let front = conn.pipeline.queue(q).packets().front().map(|p| p.kind);
        if front == Some(PacketKind::Header) && !conn.response.headers_created {
            conn.fill_headers(q);
        }

        let max_iovec = conn.host.limits.max_iovec;
        let io = IoVec::build(conn.pipeline.queue(q).packets(), max_iovec, allow_file);

        if io.count == 0 {
            free_packets(conn, q, 0);
            if io.eof {
                while let Some(packet) = conn.pipeline.get(q) {
                    if packet.kind == PacketKind::End {
                        break;
                    }
                }
                conn.complete_request();
            } else if conn
                .pipeline
                .queue(q)
                .packets()
                .front()
                .is_some_and(Packet::is_file_backed)
            {
                debug!(conn = conn.id(), "file data reached a buffered connector");
                conn.abort();
            }
            return;
        }

        match write_io(conn, q, &io) {
            Ok(0) => {
                debug!(conn = conn.id(), "peer stopped accepting data");
                conn.abort();
                return;
            }
            Ok(n) => {
                trace!(conn = conn.id(), bytes = n, of = io.count, "wrote");
                conn.response.bytes_written += n as u64;
                free_packets(conn, q, n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.request_write_blocked(q);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "write failed");
                conn.abort();
                return;
            }
        }
    }
}

fn write_io(conn: &mut Conn, q: QueueId, io: &IoVec) -> io::Result<usize> {
    let packets = conn.pipeline.queue(q).packets();
    let (before, after) = io.slices(packets);
    if io.file_len == 0 {
        return conn.sock.write_vectored(&before);
    }
    let Some(file) = conn.response.file.as_ref() else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "file packet without an open response file",
        ));
    };
    conn.sock
        .send_file(file, conn.response.pos, io.file_len, &before, &after)
}

/// Releases `written` bytes from the front of `q`. Fully written packets are
/// removed; a partially written one is trimmed in place. File positions
/// advance by the file bytes consumed.
fn free_packets(conn: &mut Conn, q: QueueId, mut written: usize) {
    loop {
        let Some(front) = conn.pipeline.queue(q).packets().front() else {
            return;
        };
        let wire = front.wire_len();
        if front.kind == PacketKind::End || wire > written {
            if written > 0 {
                let file = conn
                    .pipeline
                    .with_packet(q, 0, |p| p.consume(written).1)
                    .unwrap_or(0);
                conn.response.pos += file as u64;
            }
            return;
        }
        written -= wire;
        if let Some(packet) = conn.pipeline.get(q) {
            if packet.is_file_backed() {
                conn.response.pos += packet.count() as u64;
            }
        }
    }
}
