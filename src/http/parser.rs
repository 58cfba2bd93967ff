use crate::config::Limits;
use crate::error::ParseError;
use crate::http::request::{BodyKind, Method, Request, Version};

/// Parses a request head from the front of `buf`.
///
/// Returns the request and the number of bytes it took. For a chunked body
/// the CRLF ending the head is left unconsumed so that the first chunk
/// boundary reads like every later one.
pub fn parse_request_head(buf: &[u8], limits: &Limits) -> Result<(Request, usize), ParseError> {
    // Look for header/body separator
    let Some(headers_end) = find_headers_end(buf) else {
        return Err(if buf.len() > limits.max_header {
            ParseError::HeaderTooLarge
        } else {
            ParseError::Incomplete
        });
    };
    if headers_end + 4 > limits.max_header {
        return Err(ParseError::HeaderTooLarge);
    }

    let headers_str =
        std::str::from_utf8(&buf[..headers_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method =
        Method::from_str(method_str).ok_or_else(|| ParseError::InvalidMethod(method_str.to_string()))?;
    if uri.len() > limits.max_url {
        return Err(ParseError::UrlTooLong);
    }

    let mut request = Request {
        method,
        version: Version::parse(version)?,
        head: headers_str.to_string(),
        ..Request::default()
    };
    request.set_uri(uri)?;

    // Headers
    let mut count = 0;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        count += 1;
        if count > limits.max_num_headers {
            return Err(ParseError::TooManyHeaders);
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if key.is_empty() || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(ParseError::InvalidHeader);
        }
        request.add_header(key, value, limits)?;
    }
    request.finish_headers();

    let consumed = match request.body {
        BodyKind::Chunked => headers_end + 2,
        _ => headers_end + 4,
    };
    Ok((request, consumed))
}

/// Position of the blank line ending the request head.
pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_request_head(req, &Limits::default()).unwrap();

        assert_eq!(parsed.url, "/");
        assert_eq!(parsed.header("Host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn chunked_head_keeps_final_crlf() {
        let req = b"POST /f HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello";

        let (parsed, consumed) = parse_request_head(req, &Limits::default()).unwrap();

        assert_eq!(parsed.body, BodyKind::Chunked);
        assert_eq!(&req[consumed..consumed + 5], b"\r\n5\r\n");
    }
}
