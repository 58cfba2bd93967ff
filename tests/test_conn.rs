use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sluice::config::Config;
use sluice::http::connection::{Conn, ConnState, Wait};
use sluice::http::packet::{Packet, PacketKind};
use sluice::http::queue::QueueId;
use sluice::http::stage::{Stage, StageFlags};
use sluice::server::host::{AccessLog, Host, HostStages};
use sluice::server::transport::{MemoryPeer, memory_pair};
use sluice::stages::{FormReply, FormRequest};

fn temp_root(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("sluice-conn-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("hello.txt"), "0123456789").unwrap();
    root
}

fn config(root: &PathBuf, yaml: &str) -> Config {
    let mut cfg = Config::from_yaml(yaml).unwrap();
    cfg.host.document_root = root.clone();
    cfg
}

fn remote() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn connect(host: &Arc<Host>) -> (Conn, MemoryPeer) {
    let (transport, peer) = memory_pair();
    (Conn::new(Box::new(transport), host.clone(), remote()), peer)
}

/// Runs the connection until it has consumed all input.
fn drive(conn: &mut Conn, peer: &MemoryPeer) -> Wait {
    loop {
        let wait = conn.on_readable();
        if wait != Wait::Read || peer.pending_input() == 0 {
            return wait;
        }
    }
}

fn exchange(conn: &mut Conn, peer: &MemoryPeer, request: &str) -> String {
    peer.push(request.as_bytes());
    drive(conn, peer);
    String::from_utf8(peer.take_output()).unwrap()
}

fn split(response: &str) -> (&str, &str) {
    response.split_once("\r\n\r\n").unwrap()
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let (head, _) = split(response);
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn decode_chunked(mut body: &str) -> String {
    let mut out = String::new();
    loop {
        let (size, rest) = body.split_once("\r\n").unwrap();
        let size = usize::from_str_radix(size, 16).unwrap();
        if size == 0 {
            return out;
        }
        out.push_str(&rest[..size]);
        body = rest[size..].strip_prefix("\r\n").unwrap();
    }
}

fn echo_host(root: &PathBuf, yaml: &str) -> Arc<Host> {
    let host = Host::from_config(&config(root, yaml)).unwrap();
    host.stages
        .egi()
        .register_form("/echo", |req: &FormRequest<'_>| FormReply::ok(req.body.to_vec()));
    host.stages.egi().register_form("/vars", |req: &FormRequest<'_>| {
        let value = format!(
            "{}-{}-{}",
            req.var("a").unwrap_or("?"),
            req.var("b").unwrap_or("?"),
            req.var("c").unwrap_or("?")
        );
        FormReply::ok(value)
    });
    Arc::new(host)
}

#[test]
fn test_get_static_file() {
    let root = temp_root("get");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header(&response, "Content-Length"), Some("10"));
    assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
    assert_eq!(header(&response, "Accept-Ranges"), Some("bytes"));
    assert!(header(&response, "ETag").is_some());
    assert_eq!(split(&response).1, "0123456789");
    assert_eq!(conn.state(), ConnState::Begin);
    assert!(!conn.is_disconnected());
}

#[test]
fn test_head_has_no_body() {
    let root = temp_root("head");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "HEAD /hello.txt HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Content-Length"), Some("10"));
    assert_eq!(split(&response).1, "");
}

#[test]
fn test_keep_alive_limit_closes_connection() {
    let root = temp_root("keepalive");
    let host = Arc::new(
        Host::from_config(&config(&root, "host:\n  max_keep_alive: 3\n")).unwrap(),
    );
    let (mut conn, peer) = connect(&host);

    for remaining in [2, 1, 0] {
        let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\n\r\n");
        assert_eq!(header(&response, "Connection"), Some("keep-alive"));
        let expected = format!("timeout=60, max={remaining}");
        assert_eq!(header(&response, "Keep-Alive"), Some(expected.as_str()));
        assert!(!conn.is_disconnected());
    }

    peer.push(b"GET /hello.txt HTTP/1.1\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert_eq!(header(&response, "Connection"), Some("close"));
    assert!(conn.is_disconnected());
}

#[test]
fn test_client_requested_close() {
    let root = temp_root("close");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    peer.push(b"GET /hello.txt HTTP/1.0\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.0 200"));
    assert_eq!(header(&response, "Connection"), Some("close"));
}

#[test]
fn test_etag_revalidation() {
    let root = temp_root("etag");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let first = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\n\r\n");
    let etag = header(&first, "ETag").unwrap().to_string();

    let request = format!("GET /hello.txt HTTP/1.1\r\nIf-None-Match: {etag}\r\n\r\n");
    let response = exchange(&mut conn, &peer, &request);
    assert!(response.starts_with("HTTP/1.1 304 Not Modified"));
    assert_eq!(header(&response, "Content-Length"), None);
    assert_eq!(split(&response).1, "");

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\nIf-None-Match: \"other\"\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(split(&response).1, "0123456789");

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\nIf-Match: \"other\"\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 412"));
}

#[test]
fn test_missing_file_is_404() {
    let root = temp_root("missing");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /nope.html HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    let (_, body) = split(&response);
    let length = body.len().to_string();
    assert_eq!(header(&response, "Content-Length"), Some(length.as_str()));
    assert!(body.contains("Access Error: 404"));
    assert!(!conn.is_disconnected());
}

#[test]
fn test_method_not_allowed() {
    let root = temp_root("method");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "PUT /hello.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 405"));
}

#[test]
fn test_post_body_reaches_form() {
    let root = temp_root("post");
    let host = echo_host(&root, "{}");
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
    );

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Content-Length"), Some("5"));
    assert_eq!(header(&response, "Cache-Control"), Some("no-cache"));
    assert_eq!(split(&response).1, "hello");
}

#[test]
fn test_chunked_request_across_reads() {
    let root = temp_root("chunked-in");
    let host = echo_host(&root, "{}");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel");
    assert_eq!(drive(&mut conn, &peer), Wait::Read);
    assert_eq!(conn.state(), ConnState::Content);
    assert!(peer.take_output().is_empty());

    peer.push(b"lo\r\n6\r\n world\r\n0\r\n\r\n");
    drive(&mut conn, &peer);
    let response = String::from_utf8(peer.take_output()).unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(split(&response).1, "hello world");
    assert_eq!(conn.state(), ConnState::Begin);
}

#[test]
fn test_form_variables() {
    let root = temp_root("vars");
    let host = echo_host(&root, "{}");
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "POST /vars?a=1 HTTP/1.1\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: 9\r\n\r\nb=2&c=x+y",
    );
    assert_eq!(split(&response).1, "1-2-x y");
}

#[test]
fn test_declared_body_too_large() {
    let root = temp_root("toolarge");
    let host = echo_host(&root, "limits:\n  max_body: 16\n");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nContent-Length: 100\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 413"));
    assert_eq!(header(&response, "Connection"), Some("close"));
}

#[test]
fn test_chunked_body_too_large() {
    let root = temp_root("chunk-toolarge");
    let host = echo_host(&root, "limits:\n  max_body: 16\n");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n20\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 413"));
}

#[test]
fn test_chunk_size_beyond_body_limit_after_data() {
    let root = temp_root("chunk-huge");
    let host = echo_host(&root, "{}");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 413"));
}

#[test]
fn test_bad_chunk_boundary_fails_connection() {
    let root = temp_root("badchunk");
    let host = echo_host(&root, "{}");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 400"));
}

#[test]
fn test_single_range() {
    let root = temp_root("range");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\nRange: bytes=2-4\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 206 Partial Content"));
    assert_eq!(header(&response, "Content-Range"), Some("bytes 2-4/10"));
    assert_eq!(header(&response, "Content-Length"), Some("3"));
    assert_eq!(split(&response).1, "234");
}

#[test]
fn test_suffix_range() {
    let root = temp_root("suffix");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\nRange: bytes=-3\r\n\r\n");

    assert_eq!(header(&response, "Content-Range"), Some("bytes 7-9/10"));
    assert_eq!(split(&response).1, "789");
}

#[test]
fn test_multiple_ranges() {
    let root = temp_root("multirange");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\nRange: bytes=0-1,5-6\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 206"));
    let content_type = header(&response, "Content-Type").unwrap();
    let boundary = content_type
        .strip_prefix("multipart/byteranges; boundary=")
        .unwrap();
    let (_, body) = split(&response);
    let length = body.len().to_string();
    assert_eq!(header(&response, "Content-Length"), Some(length.as_str()));
    assert!(body.contains("Content-Range: bytes 0-1/10\r\n\r\n01"));
    assert!(body.contains("Content-Range: bytes 5-6/10\r\n\r\n56"));
    assert!(body.ends_with(&format!("\r\n--{boundary}--\r\n")));
}

#[test]
fn test_unsatisfiable_range() {
    let root = temp_root("416");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\nRange: bytes=20-30\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 416"));
    assert_eq!(header(&response, "Content-Range"), Some("bytes */10"));
    let (_, body) = split(&response);
    let length = body.len().to_string();
    assert_eq!(header(&response, "Content-Length"), Some(length.as_str()));
}

#[test]
fn test_range_end_at_i64_max_is_unsatisfiable() {
    let root = temp_root("range-max");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    peer.push(b"GET /hello.txt HTTP/1.1\r\nRange: bytes=0-9223372036854775807\r\n\r\n");
    drive(&mut conn, &peer);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 416"));
}

/// Emits three 600 byte packets of `a`, `b` and `c`.
struct StreamHandler;

impl Stage for StreamHandler {
    fn name(&self) -> &str {
        "streamHandler"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::HANDLER | StageFlags::GET | StageFlags::VIRTUAL
    }

    fn run(&self, conn: &mut Conn, q: QueueId) {
        for byte in [b'a', b'b', b'c'] {
            let packet = Packet::from_slice(PacketKind::Data, &[byte; 600]);
            conn.pipeline.put_for_service(q, packet, false);
        }
        conn.pipeline.put_for_service(q, Packet::end(), true);
    }
}

fn stream_host(root: &PathBuf) -> Arc<Host> {
    let cfg = config(
        root,
        r#"
limits:
  max_stage_buffer: 1000
  max_chunk_size: 512
locations:
  - prefix: /stream
    handler: streamHandler
"#,
    );
    let mut stages = HostStages::new();
    stages.register(Arc::new(StreamHandler));
    Arc::new(Host::with_stages(&cfg, stages).unwrap())
}

#[test]
fn test_streamed_response_is_chunked() {
    let root = temp_root("chunked-out");
    let host = stream_host(&root);
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /stream HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Transfer-Encoding"), Some("chunked"));
    assert_eq!(header(&response, "Content-Length"), None);
    let body = decode_chunked(split(&response).1);
    let expected: String = ["a", "b", "c"].iter().map(|s| s.repeat(600)).collect();
    assert_eq!(body, expected);
    assert_eq!(conn.state(), ConnState::Begin);
}

#[test]
fn test_streamed_response_without_chunking_closes() {
    let root = temp_root("http10-stream");
    let host = stream_host(&root);
    let (mut conn, peer) = connect(&host);

    peer.push(b"GET /stream HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();

    assert_eq!(header(&response, "Transfer-Encoding"), None);
    assert_eq!(header(&response, "Connection"), Some("close"));
    assert_eq!(split(&response).1.len(), 1800);
}

#[test]
fn test_partial_writes() {
    let root = temp_root("partial");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);
    peer.set_write_limit(Some(7));

    let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(split(&response).1, "0123456789");
}

#[test]
fn test_blocked_write_resumes() {
    let root = temp_root("blocked");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);
    peer.set_blocked(true);

    peer.push(b"GET /hello.txt HTTP/1.1\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Write);
    assert!(peer.take_output().is_empty());
    assert_eq!(conn.state(), ConnState::Processing);
    let names: Vec<&str> = conn.response.output_pipeline.iter().map(|s| s.name()).collect();
    assert_eq!(names, ["fileHandler", "sendConnector"]);

    peer.set_blocked(false);
    assert_eq!(conn.on_writable(), Wait::Read);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert_eq!(split(&response).1, "0123456789");
}

#[test]
fn test_range_pipeline_uses_net_connector() {
    let root = temp_root("range-pipeline");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);
    peer.set_blocked(true);

    peer.push(b"GET /hello.txt HTTP/1.1\r\nRange: bytes=0-0\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Write);
    let names: Vec<&str> = conn.response.output_pipeline.iter().map(|s| s.name()).collect();
    assert_eq!(names, ["fileHandler", "rangeFilter", "netConnector"]);
}

#[test]
fn test_secure_transport_uses_net_connector() {
    let root = temp_root("secure");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (transport, peer) = memory_pair();
    let mut conn = Conn::new(Box::new(transport.secure()), host.clone(), remote());
    peer.set_blocked(true);

    peer.push(b"GET /hello.txt HTTP/1.1\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Write);
    assert!(conn.is_secure());
    let connector = conn.response.connector.as_ref().unwrap();
    assert_eq!(connector.name(), "netConnector");

    peer.set_blocked(false);
    conn.on_writable();
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert_eq!(split(&response).1, "0123456789");
}

#[test]
fn test_pipelined_requests() {
    let root = temp_root("pipelined");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "GET /hello.txt HTTP/1.1\r\n\r\nGET /nope HTTP/1.1\r\n\r\n",
    );

    assert_eq!(response.matches("HTTP/1.1 200").count(), 1);
    assert_eq!(response.matches("HTTP/1.1 404").count(), 1);
    assert!(response.find("200 OK").unwrap() < response.find("404 Not Found").unwrap());
}

#[test]
fn test_head_split_across_reads() {
    let root = temp_root("split");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    assert!(exchange(&mut conn, &peer, "GET /hello.txt HT").is_empty());
    assert_eq!(conn.buffered_input(), 17);

    let response = exchange(&mut conn, &peer, "TP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(conn.buffered_input(), 0);
}

#[test]
fn test_options_lists_methods() {
    let root = temp_root("options");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "OPTIONS / HTTP/1.1\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Allow"), Some("OPTIONS,GET,HEAD,POST,PUT,DELETE"));
    assert_eq!(header(&response, "Content-Length"), Some("0"));
}

#[test]
fn test_trace_disabled() {
    let root = temp_root("trace-off");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "TRACE / HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 406"));
}

#[test]
fn test_trace_echoes_request() {
    let root = temp_root("trace-on");
    let host = Arc::new(Host::from_config(&config(&root, "host:\n  trace: true\n")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "TRACE / HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Content-Type"), Some("message/http"));
    assert_eq!(split(&response).1, "TRACE / HTTP/1.1\r\nHost: x");
}

fn auth_host(root: &PathBuf) -> Arc<Host> {
    fs::create_dir_all(root.join("private")).unwrap();
    fs::write(root.join("private/secret.txt"), "classified").unwrap();
    let cfg = config(
        root,
        r#"
locations:
  - prefix: /private
    auth:
      realm: test
      users:
        - name: alice
          password: secret
        - name: bob
          password: pw
      require:
        users: [alice]
"#,
    );
    Arc::new(Host::from_config(&cfg).unwrap())
}

#[test]
fn test_auth_challenge() {
    let root = temp_root("auth-401");
    let host = auth_host(&root);
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /private/secret.txt HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 401"));
    assert_eq!(header(&response, "WWW-Authenticate"), Some("Basic realm=\"test\""));

    let response = exchange(
        &mut conn,
        &peer,
        "GET /private/secret.txt HTTP/1.1\r\nAuthorization: Basic YWxpY2U6d3Jvbmc=\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 401"));
}

#[test]
fn test_auth_decides_before_file_lookup() {
    let root = temp_root("auth-missing");
    let host = auth_host(&root);
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /private/nope.txt HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 401"));
    assert_eq!(header(&response, "WWW-Authenticate"), Some("Basic realm=\"test\""));

    let response = exchange(
        &mut conn,
        &peer,
        "GET /private/nope.txt HTTP/1.1\r\nIf-None-Match: \"x\"\r\nAuthorization: Basic Ym9iOnB3\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 403"));

    let response = exchange(
        &mut conn,
        &peer,
        "GET /private/nope.txt HTTP/1.1\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[test]
fn test_auth_and_chunk_filter_order() {
    let root = temp_root("auth-stream");
    let cfg = config(
        &root,
        r#"
locations:
  - prefix: /stream
    handler: streamHandler
    auth:
      realm: test
      users:
        - name: alice
          password: secret
"#,
    );
    let mut stages = HostStages::new();
    stages.register(Arc::new(StreamHandler));
    let host = Arc::new(Host::with_stages(&cfg, stages).unwrap());
    let (mut conn, peer) = connect(&host);
    peer.set_blocked(true);

    peer.push(b"GET /stream HTTP/1.1\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Write);
    let names: Vec<&str> = conn.response.output_pipeline.iter().map(|s| s.name()).collect();
    assert_eq!(names, ["streamHandler", "authFilter", "chunkFilter", "netConnector"]);

    peer.set_blocked(false);
    assert_eq!(conn.on_writable(), Wait::Read);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = decode_chunked(split(&response).1);
    assert_eq!(body.len(), 1800);
}

#[test]
fn test_auth_forbidden_and_allowed() {
    let root = temp_root("auth-ok");
    let host = auth_host(&root);
    let (mut conn, peer) = connect(&host);

    let response = exchange(
        &mut conn,
        &peer,
        "GET /private/secret.txt HTTP/1.1\r\nAuthorization: Basic Ym9iOnB3\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 403"));

    let response = exchange(
        &mut conn,
        &peer,
        "GET /private/secret.txt HTTP/1.1\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(split(&response).1, "classified");

    let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200"));
}

#[test]
fn test_directory_redirect_and_index() {
    let root = temp_root("dir");
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::write(root.join("docs/index.html"), "<p>docs</p>").unwrap();
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /docs?x=1 HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 301"));
    assert_eq!(header(&response, "Location"), Some("/docs/?x=1"));

    let response = exchange(&mut conn, &peer, "GET /docs/ HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Content-Type"), Some("text/html"));
    assert_eq!(split(&response).1, "<p>docs</p>");
}

#[test]
fn test_alias_redirect() {
    let root = temp_root("alias");
    let host = Arc::new(
        Host::from_config(&config(
            &root,
            "aliases:\n  - prefix: /old\n    redirect: /new\n    code: 301\n",
        ))
        .unwrap(),
    );
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /old/page.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 301"));
    assert_eq!(header(&response, "Location"), Some("/new"));
}

#[test]
fn test_alias_maps_directory() {
    let root = temp_root("alias-path");
    let assets = root.join("assets-dir");
    fs::create_dir_all(&assets).unwrap();
    fs::write(assets.join("app.js"), "let x;").unwrap();
    let host = Arc::new(
        Host::from_config(&config(
            &root,
            "aliases:\n  - prefix: /static\n    path: assets-dir\n",
        ))
        .unwrap(),
    );
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /static/app.js HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "Content-Type"), Some("application/javascript"));
    assert_eq!(split(&response).1, "let x;");
}

#[test]
fn test_error_document_redirect() {
    let root = temp_root("errordoc");
    let host = Arc::new(
        Host::from_config(&config(
            &root,
            "locations:\n  - prefix: /\n    error_documents:\n      404: /errors/404.html\n",
        ))
        .unwrap(),
    );
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /gone.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 302"));
    assert_eq!(header(&response, "Location"), Some("/errors/404.html"));
}

#[test]
fn test_parse_error_closes() {
    let root = temp_root("bad");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    peer.push(b"BOGUS / HTTP/1.1\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    assert_eq!(header(&response, "Connection"), Some("close"));
}

#[test]
fn test_unsupported_version() {
    let root = temp_root("version");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    peer.push(b"GET / HTTP/2.0\r\n\r\n");
    assert_eq!(drive(&mut conn, &peer), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.contains(" 505 "));
}

#[test]
fn test_peer_close_while_idle() {
    let root = temp_root("eof");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, peer) = connect(&host);

    peer.close();
    assert_eq!(conn.on_readable(), Wait::Close);
    assert!(conn.is_disconnected());
}

#[derive(Clone, Default)]
struct CaptureLog(Arc<Mutex<Vec<String>>>);

impl AccessLog for CaptureLog {
    fn log(&self, _conn: u64, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

#[test]
fn test_access_log_line() {
    let root = temp_root("accesslog");
    let log = CaptureLog::default();
    let host = Arc::new(
        Host::from_config(&config(&root, "{}"))
            .unwrap()
            .with_access_log(Box::new(log.clone())),
    );
    let (mut conn, peer) = connect(&host);

    let response = exchange(&mut conn, &peer, "GET /hello.txt HTTP/1.1\r\n\r\n");

    let lines = log.0.lock().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("127.0.0.1 - - ["));
    let tail = format!("\"GET /hello.txt HTTP/1.1\" 200 {}", response.len());
    assert!(lines[0].ends_with(&tail), "{}", lines[0]);
}

#[test]
fn test_idle_connection_expires() {
    let root = temp_root("idle");
    let host = Arc::new(
        Host::from_config(&config(&root, "host:\n  keep_alive_timeout_ms: 0\n")).unwrap(),
    );
    let (mut conn, _peer) = connect(&host);

    assert_eq!(host.connection_count(), 1);
    assert_eq!(host.expire_connections(), 1);
    assert_eq!(conn.on_expired(), Wait::Close);
    drop(conn);
    assert_eq!(host.connection_count(), 0);
}

#[test]
fn test_active_connection_not_expired() {
    let root = temp_root("not-idle");
    let host = Arc::new(Host::from_config(&config(&root, "{}")).unwrap());
    let (mut conn, _peer) = connect(&host);

    assert_eq!(host.expire_connections(), 0);
    assert_eq!(conn.on_expired(), Wait::Read);
    assert!(!conn.is_disconnected());
}

#[test]
fn test_request_timeout_mid_body() {
    let root = temp_root("timeout");
    let host = echo_host(&root, "host:\n  timeout_ms: 0\n");
    let (mut conn, peer) = connect(&host);

    peer.push(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
    assert_eq!(drive(&mut conn, &peer), Wait::Read);
    assert_eq!(conn.state(), ConnState::Content);

    assert_eq!(conn.on_expired(), Wait::Close);
    let response = String::from_utf8(peer.take_output()).unwrap();
    assert!(response.starts_with("HTTP/1.1 408"));
    assert_eq!(header(&response, "Connection"), Some("close"));
}
