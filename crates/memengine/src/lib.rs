//! A small in-memory engine for the native protocol server.
//!
//! Understands a fixed set of statements: literal selects, full scans and
//! counts of tables, `system.numbers`, table and database creation, and
//! inserts. Enough to drive every path of the protocol handler.

pub mod async_insert;
pub mod engine;
pub mod errors;
pub mod sink;
pub mod source;
pub mod statement;
pub mod storage;

pub use engine::MemEngine;
