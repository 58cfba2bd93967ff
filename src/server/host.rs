//! The host: everything a connection consults that outlives one request.
//!
//! Aliases map URL prefixes to directories (or redirects), locations attach
//! handlers, filters and auth to URL prefixes. Both are matched longest
//! prefix first. The host also keeps the registry of live connections used
//! by the periodic expiry scan.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::{AliasConfig, Config, Limits, LocationConfig};
use crate::error::ConfigError;
use crate::http::mime::MimeTypes;
use crate::http::response::StatusCode;
use crate::http::stage::{Stage, StageFlags, Stages};
use crate::server::auth::Auth;
use crate::stages::{
    AuthFilter, ChunkFilter, EgiHandler, FileHandler, NetConnector, PassHandler, RangeFilter,
    SendConnector,
};

#[derive(Debug)]
pub struct Alias {
    pub prefix: String,
    pub path: PathBuf,
    pub redirect: Option<String>,
    pub redirect_code: StatusCode,
}

pub struct Location {
    pub prefix: String,
    pub handler: Option<Arc<dyn Stage>>,
    pub handlers: Vec<Arc<dyn Stage>>,
    pub extensions: HashMap<String, Arc<dyn Stage>>,
    pub filters: Vec<Arc<dyn Stage>>,
    pub connector: Option<Arc<dyn Stage>>,
    pub auth: Option<Auth>,
    pub error_documents: HashMap<u16, String>,
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("prefix", &self.prefix)
            .field("handler", &self.handler)
            .field("handlers", &self.handlers)
            .field("filters", &self.filters)
            .field("connector", &self.connector)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Receives one line per completed request.
pub trait AccessLog: Send + Sync {
    fn log(&self, conn: u64, line: &str);
}

/// Writes access lines to the `access` tracing target.
#[derive(Debug, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn log(&self, conn: u64, line: &str) {
        info!(target: "access", conn, "{line}");
    }
}

/// The stage registry plus typed handles on the built-in stages.
#[derive(Clone)]
pub struct HostStages {
    registry: Stages,
    pass: Arc<PassHandler>,
    file: Arc<FileHandler>,
    egi: Arc<EgiHandler>,
    net: Arc<NetConnector>,
    send: Arc<SendConnector>,
}

impl Default for HostStages {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostStages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.registry.fmt(f)
    }
}

impl HostStages {
    pub fn new() -> Self {
        let pass = Arc::new(PassHandler);
        let file = Arc::new(FileHandler);
        let egi = Arc::new(EgiHandler::new());
        let net = Arc::new(NetConnector);
        let send = Arc::new(SendConnector);

        let mut registry = Stages::new();
        registry.register(pass.clone());
        registry.register(file.clone());
        registry.register(egi.clone());
        registry.register(Arc::new(AuthFilter));
        registry.register(Arc::new(RangeFilter));
        registry.register(Arc::new(ChunkFilter));
        registry.register(net.clone());
        registry.register(send.clone());

        Self {
            registry,
            pass,
            file,
            egi,
            net,
            send,
        }
    }

    /// Adds a custom stage, replacing any stage of the same name.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.registry.register(stage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.registry.get(name)
    }

    pub fn pass(&self) -> Arc<dyn Stage> {
        self.pass.clone()
    }

    pub fn file(&self) -> Arc<dyn Stage> {
        self.file.clone()
    }

    pub fn net(&self) -> Arc<dyn Stage> {
        self.net.clone()
    }

    pub fn send(&self) -> Arc<dyn Stage> {
        self.send.clone()
    }

    /// The form registry of the embedded gateway handler.
    pub fn egi(&self) -> &Arc<EgiHandler> {
        &self.egi
    }

    fn lookup(
        &self,
        name: &str,
        kind: StageFlags,
        expected: &'static str,
    ) -> Result<Arc<dyn Stage>, ConfigError> {
        let stage = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStage(name.to_string()))?;
        if !stage.flags().contains(kind) {
            return Err(ConfigError::WrongStageKind {
                name: name.to_string(),
                expected,
            });
        }
        Ok(stage)
    }
}

/// Handles a connection receives when it is registered.
#[derive(Debug)]
pub struct Registration {
    pub id: u64,
    pub deadline: Arc<AtomicU64>,
    pub wake: Arc<Notify>,
}

#[derive(Debug)]
struct ConnEntry {
    remote: SocketAddr,
    deadline: Arc<AtomicU64>,
    wake: Arc<Notify>,
}

pub struct Host {
    pub name: String,
    pub document_root: PathBuf,
    pub index: String,
    pub limits: Limits,
    pub keep_alive: bool,
    pub max_keep_alive: i32,
    pub keep_alive_timeout: Duration,
    pub timeout: Duration,
    pub chunk_size: Option<usize>,
    pub send_file: bool,
    pub trace: bool,
    pub stages: HostStages,
    pub mime_types: MimeTypes,
    aliases: Vec<Arc<Alias>>,
    locations: Vec<Arc<Location>>,
    access_log: Box<dyn AccessLog>,
    connections: Mutex<HashMap<u64, ConnEntry>>,
    next_id: AtomicU64,
    epoch: Instant,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("document_root", &self.document_root)
            .field("limits", &self.limits)
            .field("stages", &self.stages)
            .field("aliases", &self.aliases)
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Self::with_stages(cfg, HostStages::new())
    }

    /// Builds a host whose locations may name the custom stages in `stages`.
    pub fn with_stages(cfg: &Config, stages: HostStages) -> Result<Self, ConfigError> {
        cfg.limits.validate()?;
        let host_cfg = &cfg.host;

        let mut aliases = cfg
            .aliases
            .iter()
            .map(|a| build_alias(a, &host_cfg.document_root).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        if !aliases.iter().any(|a| a.prefix.is_empty()) {
            aliases.push(Arc::new(Alias {
                prefix: String::new(),
                path: host_cfg.document_root.clone(),
                redirect: None,
                redirect_code: StatusCode::Found,
            }));
        }
        aliases.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        let mut locations = cfg
            .locations
            .iter()
            .map(|l| build_location(l, &stages).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        if !locations.iter().any(|l| l.prefix == "/") {
            locations.push(Arc::new(build_location(&LocationConfig::default(), &stages)?));
        }
        locations.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            name: host_cfg.name.clone(),
            document_root: host_cfg.document_root.clone(),
            index: host_cfg.index.clone(),
            limits: cfg.limits.clone(),
            keep_alive: host_cfg.keep_alive,
            max_keep_alive: host_cfg.max_keep_alive,
            keep_alive_timeout: Duration::from_millis(host_cfg.keep_alive_timeout_ms),
            timeout: Duration::from_millis(host_cfg.timeout_ms),
            chunk_size: host_cfg.chunk_size,
            send_file: host_cfg.send_file,
            trace: host_cfg.trace,
            stages,
            mime_types: MimeTypes::with_overrides(&cfg.mime_types),
            aliases,
            locations,
            access_log: Box::new(TracingAccessLog),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
        })
    }

    pub fn with_access_log(mut self, log: Box<dyn AccessLog>) -> Self {
        self.access_log = log;
        self
    }

    pub fn access_log(&self) -> &dyn AccessLog {
        self.access_log.as_ref()
    }

    /// Longest alias prefix of `url`. There is always a catch-all alias.
    pub fn lookup_alias(&self, url: &str) -> Arc<Alias> {
        self.aliases
            .iter()
            .find(|a| url.starts_with(a.prefix.as_str()))
            .or_else(|| self.aliases.last())
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(Alias {
                    prefix: String::new(),
                    path: self.document_root.clone(),
                    redirect: None,
                    redirect_code: StatusCode::Found,
                })
            })
    }

    /// Longest location prefix of `url`. There is always a `/` location.
    pub fn lookup_location(&self, url: &str) -> Arc<Location> {
        self.locations
            .iter()
            .find(|l| url.starts_with(l.prefix.as_str()))
            .or_else(|| self.locations.last())
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(Location {
                    prefix: "/".to_string(),
                    handler: None,
                    handlers: Vec::new(),
                    extensions: HashMap::new(),
                    filters: Vec::new(),
                    connector: None,
                    auth: None,
                    error_documents: HashMap::new(),
                })
            })
    }

    /// Milliseconds since the host was created. Connection deadlines use
    /// this clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn register(&self, remote: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Arc::new(AtomicU64::new(u64::MAX));
        let wake = Arc::new(Notify::new());
        self.lock_connections().insert(
            id,
            ConnEntry {
                remote,
                deadline: deadline.clone(),
                wake: wake.clone(),
            },
        );
        Registration { id, deadline, wake }
    }

    pub fn deregister(&self, id: u64) {
        self.lock_connections().remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Wakes every connection whose deadline has passed. Returns how many
    /// were woken.
    pub fn expire_connections(&self) -> usize {
        let now = self.now_ms();
        let connections = self.lock_connections();
        let mut woken = 0;
        for (id, entry) in connections.iter() {
            if entry.deadline.load(Ordering::Relaxed) <= now {
                debug!(conn = id, peer = %entry.remote, "connection expired");
                entry.wake.notify_one();
                woken += 1;
            }
        }
        woken
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn build_alias(cfg: &AliasConfig, document_root: &Path) -> Result<Alias, ConfigError> {
    let redirect_code = match cfg.code {
        Some(code) => StatusCode::from_u16(code)
            .filter(StatusCode::is_redirect)
            .ok_or(ConfigError::InvalidRedirect(code))?,
        None => StatusCode::Found,
    };
    if cfg.path.is_none() && cfg.redirect.is_none() {
        return Err(ConfigError::InvalidAlias(cfg.prefix.clone()));
    }
    let path = match &cfg.path {
        Some(path) if path.is_relative() => document_root.join(path),
        Some(path) => path.clone(),
        None => document_root.to_path_buf(),
    };
    Ok(Alias {
        prefix: cfg.prefix.clone(),
        path,
        redirect: cfg.redirect.clone(),
        redirect_code,
    })
}

fn build_location(cfg: &LocationConfig, stages: &HostStages) -> Result<Location, ConfigError> {
    let handler = |name: &String| stages.lookup(name, StageFlags::HANDLER, "handler");

    let extensions = cfg
        .extensions
        .iter()
        .map(|(ext, name)| {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            handler(name).map(|stage| (ext, stage))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(Location {
        prefix: cfg.prefix.clone(),
        handler: cfg.handler.as_ref().map(handler).transpose()?,
        handlers: cfg.handlers.iter().map(handler).collect::<Result<_, _>>()?,
        extensions,
        filters: cfg
            .filters
            .iter()
            .map(|name| stages.lookup(name, StageFlags::FILTER, "filter"))
            .collect::<Result<_, _>>()?,
        connector: cfg
            .connector
            .as_ref()
            .map(|name| stages.lookup(name, StageFlags::CONNECTOR, "connector"))
            .transpose()?,
        auth: cfg.auth.as_ref().map(Auth::from_config).transpose()?,
        error_documents: cfg.error_documents.clone(),
    })
}
