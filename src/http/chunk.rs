//! Chunked transfer-coding framing.
//!
//! On input the connection keeps the CRLF that ends the request head, so
//! every chunk boundary, the first included, reads `\r\n<hex-size>\r\n`.
//! Output uses the same shape: the header packet omits its final CRLF and
//! each data packet is prefixed with `\r\n<hex-size>\r\n`.

use crate::error::ParseError;

/// Prefix of the terminating zero-size chunk, trailer-less.
pub const LAST_CHUNK: &str = "\r\n0\r\n\r\n";

const MAX_BOUNDARY_LINE: usize = 80;

/// Chunk-size line prefix for a data packet of `len` bytes.
pub fn chunk_prefix(len: usize) -> String {
    format!("\r\n{len:x}\r\n")
}

/// A parsed chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Size of the chunk that follows. Zero ends the body.
    pub size: u64,
    /// Bytes of `buf` taken by the boundary, including the trailer section
    /// after a zero-size chunk.
    pub consumed: usize,
}

/// Parses the chunk boundary at the start of `buf`.
///
/// Returns `Ok(None)` when more input is needed.
pub fn parse_chunk_boundary(buf: &[u8]) -> Result<Option<Boundary>, ParseError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if &buf[..2] != b"\r\n" {
        return Err(ParseError::InvalidChunk);
    }
    let Some(nl) = buf[2..].iter().position(|&b| b == b'\n').map(|i| i + 2) else {
        return if buf.len() > MAX_BOUNDARY_LINE {
            Err(ParseError::InvalidChunk)
        } else {
            Ok(None)
        };
    };
    if nl > MAX_BOUNDARY_LINE {
        return Err(ParseError::InvalidChunk);
    }

    let line = std::str::from_utf8(&buf[2..nl]).map_err(|_| ParseError::InvalidChunk)?;
    let line = line.strip_suffix('\r').ok_or(ParseError::InvalidChunk)?;
    let digits = line.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    let size = u64::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidChunk)?;

    let mut consumed = nl + 1;
    if size == 0 {
        let rest = &buf[consumed..];
        if rest.len() < 2 {
            return Ok(None);
        }
        if rest.starts_with(b"\r\n") {
            consumed += 2;
        } else {
            // Skip trailer fields.
            match rest.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(end) => consumed += end + 4,
                None => return Ok(None),
            }
        }
    }
    Ok(Some(Boundary { size, consumed }))
}
