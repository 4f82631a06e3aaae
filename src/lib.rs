//! An asynchronous client for Redis-compatible servers.
//!
//! This crate provides a typed, pipelined command interface over the
//! RESP2 wire protocol, with first-class support for the server's
//! Pub/Sub mode and for connection pooling:
//!
//! - Incremental, binary-safe RESP2 encoding and parsing
//! - A per-connection state machine that correlates pipelined replies,
//!   tracks subscriptions, and dispatches push frames to user callbacks
//!   in arrival order
//! - A bounded connection pool that dedicates a single connection to all
//!   pool-level subscriptions
//! - Thin typed wrappers (PING, ECHO, AUTH, GET, SET, DEL, PUBLISH) with
//!   raw `send` as the escape hatch for everything else
//!
//! The crate is built on Tokio; every connection spawns one reader task
//! on the ambient runtime. Logging goes through the `log` facade.

mod commands;
pub mod connection;
pub mod pool;
pub mod resp;
pub mod subscriptions;

pub use connection::{Connection, ConnectionError};
pub use pool::{ConnectionPool, PoolConfig, PoolError};
pub use resp::{RespError, RespValue};
pub use subscriptions::{
    MessageHandler, PatternMessageHandler, SubscriptionChangeHandler, SubscriptionKind,
};
