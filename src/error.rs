//! Error types.
//!
//! Request framing problems are reported as [`ParseError`] and mapped onto an
//! HTTP status by the connection. Configuration problems surface as
//! [`ConfigError`] when a [`Host`](crate::server::host::Host) is built.

use thiserror::Error;

use crate::http::response::StatusCode;

/// Errors raised while parsing a request head or body framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// More bytes are needed before the request head can be parsed.
    #[error("incomplete request")]
    Incomplete,

    #[error("bad request line")]
    InvalidRequest,

    #[error("unknown method {0}")]
    InvalidMethod(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    #[error("bad header line")]
    InvalidHeader,

    #[error("too many header lines")]
    TooManyHeaders,

    #[error("header block too large")]
    HeaderTooLarge,

    #[error("URL too long")]
    UrlTooLong,

    #[error("bad URL")]
    InvalidUrl,

    #[error("bad content length")]
    InvalidContentLength,

    #[error("duplicate content length")]
    DuplicateContentLength,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("bad range")]
    InvalidRange,

    #[error("bad content range")]
    InvalidContentRange,

    #[error("malformed chunk boundary")]
    InvalidChunk,
}

impl ParseError {
    /// The status code the client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::Incomplete
            | ParseError::InvalidRequest
            | ParseError::InvalidMethod(_)
            | ParseError::InvalidHeader
            | ParseError::TooManyHeaders
            | ParseError::InvalidUrl
            | ParseError::InvalidContentLength
            | ParseError::DuplicateContentLength
            | ParseError::InvalidContentRange
            | ParseError::InvalidChunk => StatusCode::BadRequest,
            ParseError::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            ParseError::HeaderTooLarge | ParseError::BodyTooLarge => StatusCode::PayloadTooLarge,
            ParseError::UrlTooLong => StatusCode::UriTooLong,
            ParseError::InvalidRange => StatusCode::RangeNotSatisfiable,
        }
    }
}

/// Errors raised while turning a [`Config`](crate::config::Config) into a host.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("stage `{name}` is not a {expected}")]
    WrongStageKind { name: String, expected: &'static str },

    #[error("invalid redirect code {0}")]
    InvalidRedirect(u16),

    #[error("alias `{0}` needs either a path or a redirect")]
    InvalidAlias(String),

    #[error("bad ACL `{0}`")]
    InvalidAcl(String),

    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error("limit `{0}` must be greater than zero")]
    InvalidLimit(&'static str),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
