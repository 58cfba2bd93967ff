//! Packets: the unit of data flowing through pipeline queues.
//!
//! The outgoing stream of a response is a `Header` packet, zero or more
//! `Data` (or `Range` boundary) packets and a terminating `End` packet. The
//! incoming stream of a request body is a run of `Data` packets closed by an
//! `End` packet.
//!
//! A packet may carry a `prefix` and `suffix` that are written immediately
//! before and after its content. These hold protocol framing such as chunk
//! size lines and are not counted in [`Packet::count`].
//!
//! A `Data` packet without a content buffer but with a non-zero count is
//! file-backed: its bytes live in the response file at the connector's
//! current file position and are only read (or sent) when needed.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use bytes::{Buf, BytesMut};

/// Role of a packet in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Serialized response headers. Filled in by the connector.
    Header,
    /// Entity data.
    Data,
    /// Multipart range boundary.
    Range,
    /// End of stream. Carries no data.
    End,
}

#[derive(Debug)]
pub struct Packet {
    pub kind: PacketKind,
    pub prefix: Option<BytesMut>,
    pub content: Option<BytesMut>,
    pub suffix: Option<BytesMut>,
    count: usize,
}

impl Packet {
    /// Creates a packet. A zero `size` produces a packet without a content
    /// buffer.
    pub fn new(kind: PacketKind, size: usize) -> Self {
        Self {
            kind,
            prefix: None,
            content: (size > 0).then(|| BytesMut::with_capacity(size)),
            suffix: None,
            count: 0,
        }
    }

    /// Creates an empty data packet with room for `size` bytes.
    pub fn data(size: usize) -> Self {
        Self {
            content: Some(BytesMut::with_capacity(size)),
            ..Self::new(PacketKind::Data, 0)
        }
    }

    pub fn header() -> Self {
        Self {
            content: Some(BytesMut::new()),
            ..Self::new(PacketKind::Header, 0)
        }
    }

    pub fn end() -> Self {
        Self::new(PacketKind::End, 0)
    }

    pub fn from_slice(kind: PacketKind, bytes: &[u8]) -> Self {
        let mut packet = Self {
            content: Some(BytesMut::with_capacity(bytes.len())),
            ..Self::new(kind, 0)
        };
        packet.put_slice(bytes);
        packet
    }

    /// Creates a file-backed data packet of `count` bytes.
    pub fn file_region(count: usize) -> Self {
        Self {
            count,
            ..Self::new(PacketKind::Data, 0)
        }
    }

    /// Logical byte length of the packet, excluding prefix and suffix.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_file_backed(&self) -> bool {
        self.content.is_none() && self.count > 0
    }

    /// Content bytes. Empty for control and file-backed packets.
    pub fn bytes(&self) -> &[u8] {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.content
            .get_or_insert_with(BytesMut::new)
            .extend_from_slice(bytes);
        self.count += bytes.len();
    }

    pub fn set_prefix(&mut self, bytes: impl AsRef<[u8]>) {
        self.prefix = Some(BytesMut::from(bytes.as_ref()));
    }

    pub fn set_suffix(&mut self, bytes: impl AsRef<[u8]>) {
        self.suffix = Some(BytesMut::from(bytes.as_ref()));
    }

    /// Bytes this packet still puts on the wire: prefix, content (or file
    /// region) and suffix.
    pub fn wire_len(&self) -> usize {
        self.prefix.as_ref().map_or(0, |b| b.len())
            + self.count
            + self.suffix.as_ref().map_or(0, |b| b.len())
    }

    /// Splits the packet at `offset`, returning the tail.
    ///
    /// The tail receives every byte from `offset` onwards and the suffix. The
    /// prefix stays with the head. Returns `None` unless `0 < offset < count`.
    pub fn split(&mut self, offset: usize) -> Option<Packet> {
        if offset == 0 || offset >= self.count {
            return None;
        }
        let tail = Packet {
            kind: self.kind,
            prefix: None,
            content: self.content.as_mut().map(|c| c.split_off(offset)),
            suffix: self.suffix.take(),
            count: self.count - offset,
        };
        self.count = offset;
        Some(tail)
    }

    /// Appends `other` onto this packet.
    ///
    /// Buffered packets can only be joined with buffered packets and
    /// file-backed packets with file-backed ones, and never onto a packet
    /// that already carries a suffix; otherwise `other` is handed back
    /// untouched.
    pub fn join(&mut self, other: Packet) -> Result<(), Packet> {
        if self.content.is_some() != other.content.is_some() || self.suffix.is_some() {
            return Err(other);
        }
        let Packet {
            content,
            suffix,
            count,
            ..
        } = other;
        if let (Some(mine), Some(theirs)) = (self.content.as_mut(), content) {
            mine.unsplit(theirs);
        }
        self.count += count;
        if suffix.is_some() {
            self.suffix = suffix;
        }
        Ok(())
    }

    /// Reads the bytes of a file-backed packet from `file` at `offset`,
    /// turning it into a buffered packet.
    pub fn fill_from(&mut self, file: &File, offset: u64) -> io::Result<()> {
        if !self.is_file_backed() {
            return Ok(());
        }
        let mut buf = BytesMut::zeroed(self.count);
        file.read_exact_at(&mut buf, offset)?;
        self.content = Some(buf);
        Ok(())
    }

    /// Marks `n` bytes as written: prefix first, then content (or file
    /// region), then suffix. Returns `(bytes consumed, file bytes consumed)`.
    pub(crate) fn consume(&mut self, mut n: usize) -> (usize, usize) {
        let start = n;
        let mut file_bytes = 0;

        if let Some(prefix) = self.prefix.as_mut() {
            let len = prefix.len().min(n);
            prefix.advance(len);
            n -= len;
            if prefix.is_empty() {
                self.prefix = None;
            }
        }
        if self.count > 0 && n > 0 {
            let len = self.count.min(n);
            match self.content.as_mut() {
                Some(content) => content.advance(len),
                None => file_bytes = len,
            }
            self.count -= len;
            n -= len;
        }
        if self.count == 0 && n > 0 {
            if let Some(suffix) = self.suffix.as_mut() {
                let len = suffix.len().min(n);
                suffix.advance(len);
                n -= len;
                if suffix.is_empty() {
                    self.suffix = None;
                }
            }
        }
        (start - n, file_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_walks_prefix_content_suffix() {
        let mut packet = Packet::from_slice(PacketKind::Data, b"hello");
        packet.set_prefix(b"\r\n5\r\n");
        packet.set_suffix(b"!");
        assert_eq!(packet.wire_len(), 11);

        assert_eq!(packet.consume(3), (3, 0));
        assert_eq!(packet.prefix.as_deref(), Some(&b"5\r\n"[..]));
        assert_eq!(packet.consume(5), (5, 0));
        assert_eq!(packet.bytes(), b"llo");
        assert_eq!(packet.count(), 3);
        assert_eq!(packet.consume(10), (4, 0));
        assert_eq!(packet.wire_len(), 0);
    }

    #[test]
    fn consume_file_region_reports_file_bytes() {
        let mut packet = Packet::file_region(100);
        assert_eq!(packet.consume(40), (40, 40));
        assert_eq!(packet.count(), 60);
    }
}
