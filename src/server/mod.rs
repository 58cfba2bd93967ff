//! Server runtime: transports, the tokio listener and per-connection driver,
//! host configuration and the auth policy.

pub mod auth;
pub mod host;
pub mod listener;
pub mod transport;

pub use host::Host;
pub use listener::{drive, run, serve};
