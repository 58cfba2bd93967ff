//! Built-in stages.
//!
//! - **handlers**: [`PassHandler`] (errors, redirects, `OPTIONS`, `TRACE`),
//!   [`FileHandler`] (static files) and [`EgiHandler`] (in-process forms)
//! - **filters**: [`AuthFilter`], [`RangeFilter`], [`ChunkFilter`]
//! - **connectors**: [`NetConnector`] (vectored writes) and
//!   [`SendConnector`] (file send)

pub mod auth;
pub mod chunk;
pub mod egi;
pub mod file;
pub mod net;
pub mod pass;
pub mod range;
pub mod send;

pub use auth::AuthFilter;
pub use chunk::ChunkFilter;
pub use egi::{EgiHandler, Form, FormReply, FormRequest};
pub use file::FileHandler;
pub use net::NetConnector;
pub use pass::PassHandler;
pub use range::RangeFilter;
pub use send::SendConnector;
