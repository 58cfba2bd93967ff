//! Basic authentication filter.
//!
//! Included in the pipeline only for locations with an auth policy. All the
//! work happens in `open`, which runs before any other queue opens: a
//! request without valid credentials is failed with 401 and a challenge, an
//! authenticated user the policy does not admit gets 403.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::http::connection::Conn;
use crate::http::queue::QueueId;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags};

#[derive(Debug, Default)]
pub struct AuthFilter;

/// Decodes `Basic <base64(user:password)>`.
pub fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

impl Stage for AuthFilter {
    fn name(&self) -> &str {
        "authFilter"
    }

    fn flags(&self) -> StageFlags {
        StageFlags::FILTER | StageFlags::AUTH | StageFlags::ALL_METHODS
    }

    fn matches(&self, conn: &Conn, _url: &str) -> bool {
        !conn.request_failed() && conn.location.as_ref().is_some_and(|l| l.auth.is_some())
    }

    fn open(&self, conn: &mut Conn, _q: QueueId) {
        let Some(location) = conn.location.clone() else {
            return;
        };
        let Some(auth) = location.auth.as_ref() else {
            return;
        };

        let credentials = conn.request.header("authorization").and_then(parse_basic);
        let challenge = format!("Basic realm=\"{}\"", auth.realm);
        match credentials {
            None => {
                conn.response.set_header("WWW-Authenticate", challenge);
                conn.fail_request(StatusCode::Unauthorized, "access denied, user not authenticated");
            }
            Some((user, password)) if !auth.validate(&user, &password) => {
                conn.response.set_header("WWW-Authenticate", challenge);
                conn.fail_request(
                    StatusCode::Unauthorized,
                    format!("access denied, bad credentials for {user}"),
                );
            }
            Some((user, _)) if !auth.is_authorized(&user) => {
                conn.fail_request(
                    StatusCode::Forbidden,
                    format!("access denied, {user} is not authorized"),
                );
            }
            Some((user, _)) => conn.request.user = Some(user),
        }
    }
}
