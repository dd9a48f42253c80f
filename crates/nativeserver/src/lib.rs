//! Standalone server speaking the native protocol, backed by the in-memory
//! engine.

pub mod args;
pub mod server;
