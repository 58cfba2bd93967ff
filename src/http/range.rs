//! Byte ranges: `Range` request headers, `Content-Range` values and the
//! multipart framing used for multi-range responses.

use std::fmt::Write as _;

use crate::error::ParseError;

/// A byte range with an exclusive `end`.
///
/// Before resolution a negative `start` means "the last `-start` bytes" and
/// an `end` of `-1` means "through the end of the entity".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    fn is_open(&self) -> bool {
        self.start < 0 || self.end < 0
    }
}

/// Parses the value of a `Range` header such as `bytes=0-49,100-,-20`.
///
/// Ranges that are known up front must be strictly increasing and must not
/// overlap. A suffix (`-n`) or open-ended (`n-`) range can only come last.
pub fn parse(value: &str, max_ranges: usize) -> Result<Vec<Range>, ParseError> {
    let ranges_str = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(ParseError::InvalidRange)?;

    let mut ranges = Vec::new();
    for part in ranges_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if ranges.len() == max_ranges {
            return Err(ParseError::InvalidRange);
        }
        let (first, last) = part.split_once('-').ok_or(ParseError::InvalidRange)?;
        let (first, last) = (first.trim(), last.trim());
        let range = match (first.is_empty(), last.is_empty()) {
            (true, false) => {
                let n = number(last)?;
                if n == 0 {
                    return Err(ParseError::InvalidRange);
                }
                Range::new(-n, -1)
            }
            (false, true) => Range::new(number(first)?, -1),
            (false, false) => {
                let start = number(first)?;
                let last = number(last)?;
                if last < start {
                    return Err(ParseError::InvalidRange);
                }
                let end = last.checked_add(1).ok_or(ParseError::InvalidRange)?;
                Range::new(start, end)
            }
            (true, true) => return Err(ParseError::InvalidRange),
        };
        ranges.push(range);
    }
    if ranges.is_empty() {
        return Err(ParseError::InvalidRange);
    }

    for pair in ranges.windows(2) {
        let (current, next) = (pair[0], pair[1]);
        if current.is_open() {
            return Err(ParseError::InvalidRange);
        }
        if next.start >= 0 && current.end > next.start {
            return Err(ParseError::InvalidRange);
        }
    }
    Ok(ranges)
}

fn number(s: &str) -> Result<i64, ParseError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidRange);
    }
    s.parse().map_err(|_| ParseError::InvalidRange)
}

/// Resolves parsed ranges against the entity length.
///
/// Suffix and open-ended ranges need the length; without it they cannot be
/// satisfied. Ends are clamped to the entity. A range starting at or beyond
/// the end of the entity, or a resolved list that is not strictly increasing,
/// is unsatisfiable.
pub fn resolve(ranges: &[Range], length: Option<i64>) -> Result<Vec<Range>, ParseError> {
    let mut resolved: Vec<Range> = Vec::with_capacity(ranges.len());
    for range in ranges {
        let mut r = *range;
        match length {
            Some(length) => {
                if r.start < 0 {
                    r.start = (length + r.start).max(0);
                    r.end = length;
                }
                if r.end < 0 || r.end > length {
                    r.end = length;
                }
            }
            None if r.is_open() => return Err(ParseError::InvalidRange),
            None => {}
        }
        if r.start >= r.end {
            return Err(ParseError::InvalidRange);
        }
        if let Some(prev) = resolved.last() {
            if prev.end > r.start {
                return Err(ParseError::InvalidRange);
            }
        }
        resolved.push(r);
    }
    Ok(resolved)
}

/// `bytes first-last/length` for a resolved range.
pub fn content_range(range: &Range, length: Option<i64>) -> String {
    match length {
        Some(length) => format!("bytes {}-{}/{}", range.start, range.end - 1, length),
        None => format!("bytes {}-{}/*", range.start, range.end - 1),
    }
}

/// Generates the multipart boundary for a response.
pub fn create_boundary(seed: u64, time: u64) -> String {
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ time;
    format!("{:08X}{:08X}", (mixed >> 32) as u32, mixed as u32)
}

/// Part header emitted before each range of a multipart response.
pub fn part_header(
    boundary: &str,
    range: &Range,
    length: Option<i64>,
    mime_type: Option<&str>,
) -> String {
    let mut out = format!("\r\n--{boundary}\r\n");
    if let Some(mime) = mime_type {
        let _ = write!(out, "Content-Type: {mime}\r\n");
    }
    let _ = write!(out, "Content-Range: {}\r\n\r\n", content_range(range, length));
    out
}

pub fn final_boundary(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

/// Exact length of a multipart body for resolved `ranges`.
pub fn multipart_length(
    ranges: &[Range],
    boundary: &str,
    length: Option<i64>,
    mime_type: Option<&str>,
) -> u64 {
    let parts: usize = ranges
        .iter()
        .map(|r| part_header(boundary, r, length, mime_type).len() + r.len() as usize)
        .sum();
    (parts + final_boundary(boundary).len()) as u64
}

/// A `Content-Range` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    /// Exclusive.
    pub end: i64,
    pub size: Option<i64>,
}

impl ContentRange {
    /// Parses `bytes first-last/size`, where size may be `*`.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let body = value
            .trim()
            .strip_prefix("bytes")
            .map(str::trim_start)
            .ok_or(ParseError::InvalidContentRange)?;
        let (span, size) = body
            .split_once('/')
            .ok_or(ParseError::InvalidContentRange)?;
        let (first, last) = span
            .split_once('-')
            .ok_or(ParseError::InvalidContentRange)?;
        let bad = |_| ParseError::InvalidContentRange;
        let start = number(first.trim()).map_err(bad)?;
        let end = number(last.trim())
            .map_err(bad)?
            .checked_add(1)
            .ok_or(ParseError::InvalidContentRange)?;
        let size = match size.trim() {
            "*" => None,
            s => Some(number(s).map_err(bad)?),
        };
        if end <= start || size.is_some_and(|size| end > size) {
            return Err(ParseError::InvalidContentRange);
        }
        Ok(Self { start, end, size })
    }
}
