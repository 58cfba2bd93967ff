//! Embedded gateway interface: in-process forms bound to URLs.
//!
//! A form sees the whole request, body included, and answers with a
//! [`FormReply`]. The request body arrives on the handler's receive queue
//! and is joined there until the end packet, so forms work the same for
//! `Content-Length` and chunked uploads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::http::connection::Conn;
use crate::http::packet::{Packet, PacketKind};
use crate::http::queue::QueueId;
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags};

/// What a form sees of the request.
#[derive(Debug)]
pub struct FormRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HashMap<String, String>,
    pub body: &'a [u8],
    /// Query and url-encoded body variables. Body values win.
    pub vars: HashMap<String, String>,
    pub user: Option<&'a str>,
}

impl FormRequest<'_> {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// A form's answer.
///
/// ```ignore
/// let reply = FormReply::new(StatusCode::Ok)
///     .content_type("application/json")
///     .header("Cache-Control", "no-cache")
///     .body(b"{}".to_vec());
/// ```
#[derive(Debug, Clone)]
pub struct FormReply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl FormReply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_type: None,
            body: Vec::new(),
        }
    }

    /// A 200 reply with a plain text body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::Ok)
            .content_type("text/plain")
            .body(body)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn content_type(mut self, mime: impl Into<String>) -> Self {
        self.content_type = Some(mime.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// An in-process form.
pub trait Form: Send + Sync {
    fn serve(&self, request: &FormRequest<'_>) -> FormReply;
}

impl<F> Form for F
where
    F: Fn(&FormRequest<'_>) -> FormReply + Send + Sync,
{
    fn serve(&self, request: &FormRequest<'_>) -> FormReply {
        self(request)
    }
}

#[derive(Default)]
pub struct EgiHandler {
    forms: RwLock<HashMap<String, Arc<dyn Form>>>,
}

impl fmt::Debug for EgiHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let forms = self.forms.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EgiHandler")
            .field("forms", &forms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EgiHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `form` to the exact URL path `url`.
    pub fn register_form(&self, url: impl Into<String>, form: impl Form + 'static) {
        self.forms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), Arc::new(form));
    }

    pub fn remove_form(&self, url: &str) -> bool {
        self.forms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url)
            .is_some()
    }

    pub fn has_form(&self, url: &str) -> bool {
        self.form(url).is_some()
    }

    fn form(&self, url: &str) -> Option<Arc<dyn Form>> {
        self.forms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }
}

impl Stage for EgiHandler {
    fn name(&self) -> &str {
        "egiHandler"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::HANDLER
            | StageFlags::GET
            | StageFlags::HEAD
            | StageFlags::POST
            | StageFlags::PUT
            | StageFlags::DELETE
            | StageFlags::FORM_VARS
            | StageFlags::VIRTUAL
    }

    fn matches(&self, _conn: &Conn, url: &str) -> bool {
        self.has_form(url)
    }

    fn run(&self, conn: &mut Conn, q: QueueId) {
        let Some(form) = self.form(&conn.request.url) else {
            conn.fail_request(
                StatusCode::NotFound,
                format!("no form bound to {}", conn.request.url),
            );
            return;
        };

        let mut body = Vec::new();
        if let Some(rx) = conn.pipeline.queue(q).pair {
            for packet in conn.pipeline.queue(rx).packets() {
                if packet.kind == PacketKind::Data {
                    body.extend_from_slice(packet.bytes());
                }
            }
        }

        let request = &conn.request;
        let mut vars: HashMap<String, String> = request
            .query
            .as_deref()
            .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let urlencoded = request
            .header("content-type")
            .is_some_and(|t| t.starts_with("application/x-www-form-urlencoded"));
        if urlencoded {
            vars.extend(url::form_urlencoded::parse(&body).into_owned());
        }

        let reply = form.serve(&FormRequest {
            method: request.method,
            url: &request.url,
            query: request.query.as_deref(),
            headers: &request.headers,
            body: &body,
            vars,
            user: request.user.as_deref(),
        });

        let FormReply {
            status,
            headers,
            content_type,
            body,
        } = reply;
        conn.response.code = status;
        for (key, value) in headers {
            conn.response.add_header(key, value);
        }
        conn.response.mime_type = content_type;
        conn.response.set_entity_length(body.len() as u64);
        conn.response.dont_cache = true;

        if !body.is_empty() && !conn.response.omits_body(conn.request.method) {
            conn.pipeline
                .put_for_service(q, Packet::from_slice(PacketKind::Data, &body), false);
        }
        conn.pipeline.put_for_service(q, Packet::end(), true);
    }
}
