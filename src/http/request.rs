use std::collections::HashMap;
use std::time::SystemTime;

use httpdate::HttpDate;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::config::Limits;
use crate::error::ParseError;
use crate::http::range::{self, ContentRange, Range};
use crate::http::stage::StageFlags;

/// HTTP request methods.
///
/// Anything else on the request line is a client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// GET - Retrieve a resource
    #[default]
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// TRACE - Echo the request head back
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, typically uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use sluice::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
        }
    }

    /// The stage capability bit for this method.
    pub fn flag(&self) -> StageFlags {
        match self {
            Method::GET => StageFlags::GET,
            Method::POST => StageFlags::POST,
            Method::PUT => StageFlags::PUT,
            Method::DELETE => StageFlags::DELETE,
            Method::HEAD => StageFlags::HEAD,
            Method::OPTIONS => StageFlags::OPTIONS,
            Method::TRACE => StageFlags::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "HTTP/1.1" => Ok(Version::Http11),
            "HTTP/1.0" => Ok(Version::Http10),
            s if s.starts_with("HTTP/") => Err(ParseError::UnsupportedVersion(s.to_string())),
            _ => Err(ParseError::InvalidRequest),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    #[default]
    Empty,
    Length,
    Chunked,
    /// HTTP/1.0 body without a length, delimited by the peer closing.
    UntilClose,
}

/// Conditional request state gathered from `If-*` headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditional {
    pub since: Option<SystemTime>,
    /// `If-Modified-Since` rather than `If-Unmodified-Since`.
    pub if_modified: bool,
    pub etags: Option<Vec<String>>,
    /// `If-Match` rather than `If-None-Match`.
    pub if_match: bool,
}

impl Conditional {
    pub fn is_set(&self) -> bool {
        self.since.is_some() || self.etags.is_some()
    }

    /// True when a header demands the resource be unchanged
    /// (`If-Unmodified-Since` or `If-Match`).
    pub fn is_precondition(&self) -> bool {
        (self.since.is_some() && !self.if_modified) || (self.etags.is_some() && self.if_match)
    }

    /// Date half of the check. With `If-Modified-Since` this is true when the
    /// resource has not changed; with `If-Unmodified-Since`, when it has.
    pub fn match_modified(&self, modified: SystemTime) -> bool {
        let Some(since) = self.since else {
            return true;
        };
        // Dates on the wire have one-second resolution.
        let modified = SystemTime::from(HttpDate::from(modified));
        if self.if_modified {
            modified <= since
        } else {
            modified > since
        }
    }

    /// ETag half of the check, with the polarity of the header that supplied
    /// the list.
    pub fn match_etag(&self, etag: Option<&str>) -> bool {
        let Some(tags) = &self.etags else {
            return true;
        };
        let Some(etag) = etag else {
            return false;
        };
        let etag = strip_etag(etag);
        if tags.iter().any(|t| t == "*" || t == etag) {
            !self.if_match
        } else {
            self.if_match
        }
    }
}

fn strip_etag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"')
}

/// Represents a parsed HTTP request from a client.
///
/// Header names are stored lowercased. Repeated headers are folded into one
/// comma-separated value.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Method,
    /// Request target as sent.
    pub uri: String,
    /// Decoded and normalised path.
    pub url: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: HashMap<String, String>,
    /// The raw request head, used to answer TRACE.
    pub head: String,
    pub body: BodyKind,
    /// Declared `Content-Length`.
    pub length: Option<u64>,
    pub remaining_content: u64,
    pub received_content: u64,
    pub ranges: Vec<Range>,
    pub input_range: Option<ContentRange>,
    pub conditional: Conditional,
    /// Authenticated user name.
    pub user: Option<String>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Version,
    headers: Vec<(String, String)>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: Version::Http11,
            headers: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Builds the request, running headers through the same validation as
    /// the wire parser.
    pub fn build(self) -> Result<Request, ParseError> {
        let limits = Limits::default();
        let mut request = Request {
            method: self.method.ok_or(ParseError::InvalidRequest)?,
            version: self.version,
            ..Request::default()
        };
        request.set_uri(&self.uri.ok_or(ParseError::InvalidRequest)?)?;
        for (key, value) in &self.headers {
            request.add_header(key, value, &limits)?;
        }
        request.finish_headers();
        Ok(request)
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            uri: "/".to_string(),
            url: "/".to_string(),
            ..Self::default()
        }
    }

    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Retrieves the Content-Length header value.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> u64 {
        self.length.unwrap_or(0)
    }

    /// Determines whether the client wants the connection kept open.
    ///
    /// An explicit `Connection` header wins. Otherwise HTTP/1.1 defaults to
    /// keep-alive and HTTP/1.0 to close.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if has_token(v, "close") => false,
            Some(v) if has_token(v, "keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }

    /// Host header without any port.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name))
    }

    /// Extension of the last path segment, lowercased.
    pub fn extension(&self) -> Option<String> {
        let segment = self.url.rsplit('/').next()?;
        let (_, ext) = segment.rsplit_once('.')?;
        (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
    }

    /// Sets the request target, decoding and normalising its path.
    ///
    /// Dot segments are removed. A path that still escapes upwards once
    /// percent-decoded is rejected.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), ParseError> {
        self.uri = uri.to_string();
        if uri == "*" {
            self.url = "/".to_string();
            self.query = None;
            return Ok(());
        }
        if !uri.starts_with('/') && !uri.starts_with("http://") && !uri.starts_with("https://") {
            return Err(ParseError::InvalidUrl);
        }
        let base = Url::parse("http://localhost/").map_err(|_| ParseError::InvalidUrl)?;
        let parsed = base.join(uri).map_err(|_| ParseError::InvalidUrl)?;
        let path = percent_decode_str(parsed.path())
            .decode_utf8()
            .map_err(|_| ParseError::InvalidUrl)?;
        if path.contains('\0') || path.contains('\\') || path.split('/').any(|s| s == "..") {
            return Err(ParseError::InvalidUrl);
        }
        self.url = path.into_owned();
        self.query = parsed.query().map(str::to_string);
        Ok(())
    }

    /// Records one header line, interpreting the headers that drive request
    /// state.
    pub fn add_header(&mut self, key: &str, value: &str, limits: &Limits) -> Result<(), ParseError> {
        let key = key.to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "content-length" => {
                if self.length.is_some() {
                    return Err(ParseError::DuplicateContentLength);
                }
                let length: u64 = value.parse().map_err(|_| ParseError::InvalidContentLength)?;
                if length > limits.max_body {
                    return Err(ParseError::BodyTooLarge);
                }
                self.length = Some(length);
            }
            "content-range" => {
                self.input_range = Some(ContentRange::parse(value)?);
            }
            "range" => {
                self.ranges = range::parse(value, limits.max_ranges)?;
            }
            "if-modified-since" | "if-unmodified-since" => {
                // Unparseable dates are ignored.
                if let Ok(date) = httpdate::parse_http_date(value) {
                    self.conditional.since = Some(date);
                    self.conditional.if_modified = key == "if-modified-since";
                }
            }
            "if-match" | "if-none-match" => {
                let tags = value
                    .split(',')
                    .map(strip_etag)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                self.conditional
                    .etags
                    .get_or_insert_with(Vec::new)
                    .extend(tags);
                self.conditional.if_match = key == "if-match";
            }
            "transfer-encoding" => {
                if has_token(value, "chunked") {
                    self.body = BodyKind::Chunked;
                }
            }
            _ => {}
        }

        self.headers
            .entry(key)
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    /// Settles body framing once every header line has been seen.
    pub fn finish_headers(&mut self) {
        if self.body == BodyKind::Chunked {
            self.length = None;
            return;
        }
        self.body = match self.length {
            Some(0) => BodyKind::Empty,
            Some(_) => BodyKind::Length,
            None if self.version == Version::Http10
                && matches!(self.method, Method::POST | Method::PUT) =>
            {
                BodyKind::UntilClose
            }
            None => BodyKind::Empty,
        };
        self.remaining_content = match self.body {
            BodyKind::Length => self.content_length(),
            BodyKind::UntilClose => u64::MAX,
            _ => 0,
        };
    }

    /// Whether the resource described by `etag` and `modified` satisfies the
    /// conditional headers, so a 304 or 412 replaces the entity.
    ///
    /// Ranges are dropped when the entity must be sent whole.
    pub fn content_not_modified(&mut self, etag: Option<&str>, modified: SystemTime) -> bool {
        if !self.conditional.is_set() {
            return false;
        }
        let same = self.conditional.match_modified(modified) && self.conditional.match_etag(etag);
        if !same {
            self.ranges.clear();
        }
        same
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
