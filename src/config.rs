//! Server configuration.
//!
//! Configuration is a YAML document deserialized with serde. Every section is
//! optional and falls back to defaults. `Config::load` reads the file named by
//! `SLUICE_CONFIG` when set, then applies the `LISTEN` override.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: Limits,
    pub host: HostConfig,
    pub aliases: Vec<AliasConfig>,
    pub locations: Vec<LocationConfig>,
    /// Extension to content-type overrides.
    pub mime_types: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Resource limits applied to every request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted request body.
    pub max_body: u64,
    /// Largest transfer chunk, also the connector packet size.
    pub max_chunk_size: usize,
    /// Largest request head.
    pub max_header: usize,
    pub max_num_headers: usize,
    /// Queue capacity of every stage.
    pub max_stage_buffer: usize,
    pub max_url: usize,
    /// Buffer fragments gathered into one vectored write.
    pub max_iovec: usize,
    /// Byte ranges accepted in one `Range` header.
    pub max_ranges: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body: 1024 * 1024,
            max_chunk_size: 8 * 1024,
            max_header: 8 * 1024,
            max_num_headers: 40,
            max_stage_buffer: 32 * 1024,
            max_url: 4096,
            max_iovec: 24,
            max_ranges: 16,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 8] = [
            ("max_body", self.max_body),
            ("max_chunk_size", self.max_chunk_size as u64),
            ("max_header", self.max_header as u64),
            ("max_num_headers", self.max_num_headers as u64),
            ("max_stage_buffer", self.max_stage_buffer as u64),
            ("max_url", self.max_url as u64),
            ("max_iovec", self.max_iovec as u64),
            ("max_ranges", self.max_ranges as u64),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::InvalidLimit(name)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub name: String,
    pub document_root: PathBuf,
    /// File served for a directory URL.
    pub index: String,
    pub keep_alive: bool,
    /// Requests served on one connection before it is closed.
    pub max_keep_alive: i32,
    pub keep_alive_timeout_ms: u64,
    /// Upper bound on the time one request may take.
    pub timeout_ms: u64,
    /// Chunk size for chunked responses. Zero disables chunking; unset uses
    /// `limits.max_chunk_size`.
    pub chunk_size: Option<usize>,
    pub send_file: bool,
    pub trace: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            document_root: PathBuf::from("."),
            index: "index.html".to_string(),
            keep_alive: true,
            max_keep_alive: 100,
            keep_alive_timeout_ms: 60_000,
            timeout_ms: 300_000,
            chunk_size: None,
            send_file: true,
            trace: false,
        }
    }
}

/// Maps a URL prefix to a directory, or redirects it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AliasConfig {
    pub prefix: String,
    pub path: Option<PathBuf>,
    pub redirect: Option<String>,
    /// Redirect status, 302 when unset.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub prefix: String,
    /// Handler for every request under the prefix.
    pub handler: Option<String>,
    /// Extension to handler name.
    pub extensions: HashMap<String, String>,
    /// Handlers asked in order whether they match the URL.
    pub handlers: Vec<String>,
    pub filters: Vec<String>,
    pub connector: Option<String>,
    pub auth: Option<AuthConfig>,
    /// Status code to redirect target.
    pub error_documents: HashMap<u16, String>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            handler: None,
            extensions: HashMap::new(),
            handlers: vec!["egiHandler".to_string()],
            filters: vec![
                "authFilter".to_string(),
                "rangeFilter".to_string(),
                "chunkFilter".to_string(),
            ],
            connector: None,
            auth: None,
            error_documents: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub realm: String,
    pub users: Vec<UserConfig>,
    pub groups: Vec<GroupConfig>,
    pub require: RequireConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Hex ACL mask.
    #[serde(default)]
    pub acl: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequireConfig {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub valid_user: bool,
    pub acl: Option<String>,
}

fn enabled() -> bool {
    true
}

impl Config {
    /// Loads configuration from `SLUICE_CONFIG` (if set) and the environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("SLUICE_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_yaml(&text).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = addr;
        }
        cfg.limits.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.limits.validate()?;
        Ok(cfg)
    }
}
