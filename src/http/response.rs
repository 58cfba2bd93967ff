use std::fmt::Write as _;
use std::fs::{File, Metadata};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::http::range::{self, Range};
use crate::http::request::{Method, Request};
use crate::http::stage::Stage;

/// Server token sent in the `Server` header.
pub const SERVER_NAME: &str = concat!("Sluice/", env!("CARGO_PKG_VERSION"));

/// HTTP status codes emitted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    /// 100 Continue
    Continue,
    /// 200 OK
    #[default]
    Ok,
    /// 201 Created
    Created,
    /// 202 Accepted
    Accepted,
    /// 204 No Content
    NoContent,
    /// 206 Partial Content
    PartialContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found
    Found,
    /// 303 See Other
    SeeOther,
    /// 304 Not Modified
    NotModified,
    /// 307 Temporary Redirect
    TemporaryRedirect,
    /// 308 Permanent Redirect
    PermanentRedirect,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 406 Not Acceptable
    NotAcceptable,
    /// 408 Request Timeout
    RequestTimeout,
    /// 411 Length Required
    LengthRequired,
    /// 412 Precondition Failed
    PreconditionFailed,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 414 URI Too Long
    UriTooLong,
    /// 415 Unsupported Media Type
    UnsupportedMediaType,
    /// 416 Range Not Satisfiable
    RangeNotSatisfiable,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 504 Gateway Timeout
    GatewayTimeout,
    /// 505 HTTP Version Not Supported
    HttpVersionNotSupported,
}

const ALL_CODES: [StatusCode; 31] = [
    StatusCode::Continue,
    StatusCode::Ok,
    StatusCode::Created,
    StatusCode::Accepted,
    StatusCode::NoContent,
    StatusCode::PartialContent,
    StatusCode::MovedPermanently,
    StatusCode::Found,
    StatusCode::SeeOther,
    StatusCode::NotModified,
    StatusCode::TemporaryRedirect,
    StatusCode::PermanentRedirect,
    StatusCode::BadRequest,
    StatusCode::Unauthorized,
    StatusCode::Forbidden,
    StatusCode::NotFound,
    StatusCode::MethodNotAllowed,
    StatusCode::NotAcceptable,
    StatusCode::RequestTimeout,
    StatusCode::LengthRequired,
    StatusCode::PreconditionFailed,
    StatusCode::PayloadTooLarge,
    StatusCode::UriTooLong,
    StatusCode::UnsupportedMediaType,
    StatusCode::RangeNotSatisfiable,
    StatusCode::InternalServerError,
    StatusCode::NotImplemented,
    StatusCode::BadGateway,
    StatusCode::ServiceUnavailable,
    StatusCode::GatewayTimeout,
    StatusCode::HttpVersionNotSupported,
];

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use sluice::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::PartialContent => 206,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::SeeOther => 303,
            StatusCode::NotModified => 304,
            StatusCode::TemporaryRedirect => 307,
            StatusCode::PermanentRedirect => 308,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::NotAcceptable => 406,
            StatusCode::RequestTimeout => 408,
            StatusCode::LengthRequired => 411,
            StatusCode::PreconditionFailed => 412,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UriTooLong => 414,
            StatusCode::UnsupportedMediaType => 415,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
            StatusCode::HttpVersionNotSupported => 505,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use sluice::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::Accepted => "Accepted",
            StatusCode::NoContent => "No Content",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::Found => "Found",
            StatusCode::SeeOther => "See Other",
            StatusCode::NotModified => "Not Modified",
            StatusCode::TemporaryRedirect => "Temporary Redirect",
            StatusCode::PermanentRedirect => "Permanent Redirect",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::NotAcceptable => "Not Acceptable",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::LengthRequired => "Length Required",
            StatusCode::PreconditionFailed => "Precondition Failed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::UriTooLong => "URI Too Long",
            StatusCode::UnsupportedMediaType => "Unsupported Media Type",
            StatusCode::RangeNotSatisfiable => "Range Not Satisfiable",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::GatewayTimeout => "Gateway Timeout",
            StatusCode::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        ALL_CODES.into_iter().find(|c| c.as_u16() == code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.as_u16()) && *self != StatusCode::NotModified
    }

    pub fn is_error(&self) -> bool {
        self.as_u16() >= 400
    }

    /// Responses that never carry a body.
    pub fn forbids_body(&self) -> bool {
        let code = self.as_u16();
        code < 200 || code == 204 || code == 304
    }
}

/// Per-request response state.
///
/// Besides the status and headers this carries the bookkeeping the stages
/// share for one request: chosen handler and connector, entity and transfer
/// lengths, the open file and the range cursor.
#[derive(Default)]
pub struct Response {
    pub code: StatusCode,
    pub handler: Option<Arc<dyn Stage>>,
    pub connector: Option<Arc<dyn Stage>>,
    /// Send-side stages in pipeline order.
    pub output_pipeline: Vec<Arc<dyn Stage>>,
    /// Transfer length announced in `Content-Length`.
    pub length: Option<u64>,
    /// Length of the whole entity, before any ranges are applied.
    pub entity_length: Option<u64>,
    /// Chunk framing: `None` until decided, `Some(0)` when disabled.
    pub chunk_size: Option<usize>,
    pub headers: Vec<(String, String)>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub mime_type: Option<String>,
    /// Generated body replacing the handler's output (errors, redirects).
    pub alt_body: Option<String>,
    pub error_msg: Option<String>,
    pub dont_cache: bool,
    /// The header packet has been serialized.
    pub headers_created: bool,
    pub filename: Option<PathBuf>,
    pub file_info: Option<Metadata>,
    pub file: Option<File>,
    /// File offset of the next byte a connector sends from `file`.
    pub pos: u64,
    /// File offset of the next byte the file handler reads.
    pub read_pos: u64,
    pub bytes_written: u64,
    /// Resolved ranges being served.
    pub ranges: Vec<Range>,
    pub current_range: usize,
    /// Entity offset of the next byte reaching the range filter.
    pub range_pos: i64,
    pub range_boundary: Option<String>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("code", &self.code)
            .field("handler", &self.handler.as_ref().map(|s| s.name().to_string()))
            .field("connector", &self.connector.as_ref().map(|s| s.name().to_string()))
            .field("length", &self.length)
            .field("chunk_size", &self.chunk_size)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_size.is_some_and(|size| size > 0)
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        self.headers.push((key, value.into()));
    }

    /// Adds a header, keeping earlier values of the same name.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Records the entity length, which is also the transfer length until a
    /// filter says otherwise.
    pub fn set_entity_length(&mut self, length: u64) {
        self.entity_length = Some(length);
        self.length = Some(length);
    }

    /// Replaces the response with a redirect to `target`.
    pub fn redirect(&mut self, code: StatusCode, target: &str) {
        self.code = code;
        self.set_header("Location", target);
        self.alt_body = Some(format!(
            "<!DOCTYPE html>\r\n\
             <html><head><title>{code} {reason}</title></head>\r\n\
             <body><h1>{reason}</h1>\r\n\
             <p>The document has moved <a href=\"{target}\">here</a>.</p>\r\n\
             </body></html>\r\n",
            code = code.as_u16(),
            reason = code.reason_phrase(),
            target = html_escape(target),
        ));
        self.mime_type = Some("text/html".to_string());
    }

    /// Replaces the response with the standard error document for `code`.
    pub fn set_error(&mut self, code: StatusCode, message: impl Into<String>) {
        self.code = code;
        self.error_msg = Some(message.into());
        self.alt_body = Some(error_body(code));
        self.mime_type = Some("text/html".to_string());
        self.etag = None;
        self.last_modified = None;
        self.ranges.clear();
        self.range_boundary = None;
    }

    /// True when no body bytes may follow the headers.
    pub fn omits_body(&self, method: Method) -> bool {
        method == Method::HEAD || self.code.forbids_body()
    }

    /// Serializes the status line and headers.
    ///
    /// `keep_alive` is `None` when the connection closes after this response,
    /// otherwise the idle timeout in seconds and the requests left. When the
    /// body is chunked the final blank line is left off; the first chunk
    /// prefix supplies it.
    pub fn format_headers(&self, request: &Request, keep_alive: Option<(u64, i32)>) -> String {
        let mut out = String::with_capacity(256);
        let _ = write!(
            out,
            "{} {} {}\r\n",
            request.version.as_str(),
            self.code.as_u16(),
            self.code.reason_phrase()
        );
        let _ = write!(out, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
        let _ = write!(out, "Server: {SERVER_NAME}\r\n");

        if let Some(etag) = &self.etag {
            let _ = write!(out, "ETag: {etag}\r\n");
        }
        if let Some(modified) = self.last_modified {
            let _ = write!(out, "Last-Modified: {}\r\n", httpdate::fmt_http_date(modified));
        }
        if self.dont_cache {
            out.push_str("Cache-Control: no-cache\r\n");
        }
        for (key, value) in &self.headers {
            let _ = write!(out, "{key}: {value}\r\n");
        }

        let entity_length = self.entity_length.map(|l| l as i64);
        if let Some(boundary) = &self.range_boundary {
            let _ = write!(out, "Content-Type: multipart/byteranges; boundary={boundary}\r\n");
        } else {
            if let [only] = self.ranges.as_slice() {
                let _ = write!(out, "Content-Range: {}\r\n", range::content_range(only, entity_length));
            } else if self.code == StatusCode::RangeNotSatisfiable {
                if let Some(length) = entity_length {
                    let _ = write!(out, "Content-Range: bytes */{length}\r\n");
                }
            }
            if let Some(mime) = &self.mime_type {
                if !self.code.forbids_body() {
                    let _ = write!(out, "Content-Type: {mime}\r\n");
                }
            }
        }

        if self.is_chunked() {
            out.push_str("Transfer-Encoding: chunked\r\n");
        } else if let Some(length) = self.length {
            if !self.code.forbids_body() {
                let _ = write!(out, "Content-Length: {length}\r\n");
            }
        }

        match keep_alive {
            Some((timeout, remaining)) => {
                out.push_str("Connection: keep-alive\r\n");
                let _ = write!(out, "Keep-Alive: timeout={timeout}, max={remaining}\r\n");
            }
            None => out.push_str("Connection: close\r\n"),
        }

        if !self.is_chunked() {
            out.push_str("\r\n");
        }
        out
    }
}

/// HTML body for an error response. Carries only the code and reason phrase.
pub fn error_body(code: StatusCode) -> String {
    format!(
        "<!DOCTYPE html>\r\n\
         <html><head><title>{code} {reason}</title></head>\r\n\
         <body><h2>Access Error: {code} -- {reason}</h2>\r\n\
         </body></html>\r\n",
        code = code.as_u16(),
        reason = code.reason_phrase(),
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
