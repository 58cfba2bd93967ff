//! Sluice - embedded HTTP/1.x pipeline server
//!
//! Requests flow through a per-request pipeline of stages: a handler that
//! produces the response, filters that transform it and a connector that
//! writes it to the socket. Stages exchange packets over flow-controlled
//! queues.

pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod stages;
