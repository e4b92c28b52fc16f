//! # timber-server
//!
//! Centralized log storage service.
//!
//! This crate provides:
//!
//! - [`StorageServer`] — WebSocket RPC server exposing the storage
//!   contract (Write, Query, GetById, Delete, Stats, Health)
//! - [`RetentionWorker`] — Periodic deletion of entries past the
//!   configured age
//! - [`ServerConfig`] — Service configuration
//!
//! Sessions enforce the keepalive policy: the server pings every
//! fifteen seconds and expects an ack within five; clients may ping no
//! more often than every ten seconds. Idle connections are permitted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod retention;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use retention::{RetentionStats, RetentionWorker};
pub use server::StorageServer;
