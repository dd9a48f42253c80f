//! Server side of the native columnar database protocol.
//!
//! [`handler::ProtocolHandler`] runs the protocol on a single connection:
//! the handshake, then queries one at a time, moving blocks between the
//! client and a [`engine::QueryEngine`].

pub mod async_insert;
pub mod auth;
pub mod block;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod compression;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod handler;
pub mod logs;
pub mod messages;
pub mod metrics;
pub mod parallel_read;
pub mod profile_events;
pub mod progress;
pub mod protocol;
pub mod proxy_protocol;
pub mod settings;
pub mod timeouts;

mod query;
mod query_state;
mod reader;
mod session;
mod writer;

pub use session::{ConnectionSettings, Session, SessionAuth};
pub use writer::SharedWriter;
