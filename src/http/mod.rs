//! HTTP protocol engine.
//!
//! # Architecture
//!
//! - **`packet`**: units of data and control flowing between stages
//! - **`queue`**: flow-controlled packet queues and the per-request pipeline arena
//! - **`stage`**: the handler / filter / connector contract and stage registry
//! - **`connection`**: the per-socket state machine
//! - **`pipeline`**: routing, pipeline assembly and queue servicing
//! - **`parser`**: request head parsing
//! - **`request`** / **`response`**: per-request state, header generation
//! - **`range`** / **`chunk`**: byte ranges and chunked transfer-coding
//! - **`writer`**: vectored socket output shared by the connectors
//! - **`mime`**: content types by extension
//!
//! # Request flow
//!
//! ```text
//!   socket ─► Conn ─► parser ─► route ─► build pipeline
//!                                            │
//!      handler ─► filters ─► connector ─► socket
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sluice::config::Config;
//! use sluice::server::{serve, Host};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let host = Arc::new(Host::from_config(&Config::default())?);
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     serve(listener, host).await
//! }
//! ```

pub mod chunk;
pub mod connection;
pub mod mime;
pub mod packet;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod range;
pub mod request;
pub mod response;
pub mod stage;
pub mod writer;
