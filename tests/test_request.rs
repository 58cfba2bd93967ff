use std::time::{Duration, SystemTime};

use sluice::error::ParseError;
use sluice::http::request::{BodyKind, Method, Request, RequestBuilder, Version};

fn get(headers: &[(&str, &str)]) -> Request {
    let mut builder = RequestBuilder::new().method(Method::GET).uri("/");
    for (key, value) in headers {
        builder = builder.header(*key, *value);
    }
    builder.build().unwrap()
}

#[test]
fn test_request_header_retrieval() {
    let req = get(&[("Host", "example.com:8080"), ("Content-Type", "application/json")]);

    assert_eq!(req.header("Host"), Some("example.com:8080"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
    assert_eq!(req.host(), Some("example.com"));
}

#[test]
fn test_request_content_length_parsing() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .uri("/api")
        .header("Content-Length", "42")
        .build()
        .unwrap();

    assert_eq!(req.content_length(), 42);
    assert_eq!(req.body, BodyKind::Length);
    assert_eq!(req.remaining_content, 42);
}

#[test]
fn test_request_content_length_missing() {
    let req = get(&[]);
    assert_eq!(req.content_length(), 0);
    assert_eq!(req.body, BodyKind::Empty);
}

#[test]
fn test_request_content_length_invalid() {
    let err = RequestBuilder::new()
        .method(Method::POST)
        .uri("/api")
        .header("Content-Length", "not-a-number")
        .build()
        .unwrap_err();

    assert_eq!(err, ParseError::InvalidContentLength);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    assert!(get(&[]).keep_alive());
}

#[test]
fn test_request_keep_alive_http10_default() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .version(Version::Http10)
        .build()
        .unwrap();
    assert!(!req.keep_alive());

    let req = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .version(Version::Http10)
        .header("Connection", "Keep-Alive")
        .build()
        .unwrap();
    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    assert!(!get(&[("Connection", "close")]).keep_alive());
    assert!(!get(&[("Connection", "TE, Close")]).keep_alive());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("TRACE"), Some(Method::TRACE));
    assert_eq!(Method::from_str("PATCH"), None);
    assert_eq!(Method::from_str("get"), None); // Case-sensitive
}

#[test]
fn test_request_set_uri() {
    let mut req = Request::new();
    req.set_uri("/docs/Read%20Me.TXT?lang=en").unwrap();

    assert_eq!(req.url, "/docs/Read Me.TXT");
    assert_eq!(req.query.as_deref(), Some("lang=en"));
    assert_eq!(req.extension().as_deref(), Some("txt"));

    assert_eq!(req.set_uri("relative/path"), Err(ParseError::InvalidUrl));
}

#[test]
fn test_request_absolute_uri() {
    let mut req = Request::new();
    req.set_uri("http://example.com/index.html").unwrap();
    assert_eq!(req.url, "/index.html");
}

#[test]
fn test_request_if_none_match() {
    let mut req = get(&[("If-None-Match", "\"abc\", \"def\"")]);
    let modified = SystemTime::now();

    assert!(req.content_not_modified(Some("\"def\""), modified));
    assert!(!req.conditional.is_precondition());

    let mut req = get(&[("If-None-Match", "\"abc\""), ("Range", "bytes=0-1")]);
    assert!(!req.content_not_modified(Some("\"xyz\""), modified));
    assert!(req.ranges.is_empty());
}

#[test]
fn test_request_if_modified_since() {
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    let date = httpdate::fmt_http_date(modified);

    let mut req = get(&[("If-Modified-Since", date.as_str())]);
    assert!(req.content_not_modified(None, modified));

    let later = modified + Duration::from_secs(60);
    assert!(!req.content_not_modified(None, later));
}

#[test]
fn test_request_if_unmodified_since_is_precondition() {
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    let date = httpdate::fmt_http_date(modified);

    let mut req = get(&[("If-Unmodified-Since", date.as_str())]);
    assert!(req.conditional.is_precondition());
    // Changed since the given date.
    assert!(req.content_not_modified(None, modified + Duration::from_secs(60)));
    assert!(!req.content_not_modified(None, modified));
}

#[test]
fn test_request_without_conditions_is_modified() {
    let mut req = get(&[]);
    assert!(!req.content_not_modified(Some("\"abc\""), SystemTime::now()));
}

#[test]
fn test_request_content_range() {
    let req = RequestBuilder::new()
        .method(Method::PUT)
        .uri("/upload")
        .header("Content-Range", "bytes 10-19/100")
        .header("Content-Length", "10")
        .build()
        .unwrap();

    let range = req.input_range.unwrap();
    assert_eq!((range.start, range.end, range.size), (10, 20, Some(100)));
}
