//! # timbernode
//!
//! Per-node Kubernetes container log collector.
//!
//! The collector discovers containers running on its node, tails their
//! log streams through the Kubernetes API, parses each line, batches
//! entries, and ships them to a remote or embedded
//! [`Store`](timber_store::Store).
//!
//! Pipeline, upstream to downstream:
//!
//! - [`PodDiscovery`] — cluster watch, translated into start/stop events
//! - [`StreamManager`] — bounded pool of per-container streams
//! - [`ContainerStream`] — tail with resume, idle detection, retries
//! - [`Parser`] — timestamp/severity/attribute extraction per line
//! - [`Batcher`] — size/time-triggered flushing with retry queue and
//!   circuit breaker
//! - [`Collector`] — wires the above and owns the shutdown sequence

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batcher;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod kubernetes;
pub mod parser;
pub mod stream;
pub mod stream_manager;
pub mod types;

pub use batcher::{Batcher, BatcherMetrics, BatcherStats};
pub use collector::Collector;
pub use config::CollectorConfig;
pub use discovery::PodDiscovery;
pub use error::{CollectorError, Result};
pub use kubernetes::KubeLogSource;
pub use parser::{ParsedLine, Parser};
pub use stream::{ContainerStream, LineStream, LogSource, StreamState, StreamStats};
pub use stream_manager::StreamManager;
pub use types::{ContainerRef, LogLine, PodEvent, PodEventKind};
