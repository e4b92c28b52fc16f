//! Collector-side types flowing through the pipeline.
//!
//! - [`ContainerRef`] — identity of one running container instance
//! - [`PodEvent`] — discovery output driving stream lifecycle
//! - [`LogLine`] — parser output travelling to the batcher

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use timber_proto::{LogEntry, Severity, ATTR_POD_UID};

/// Uniquely identifies a running container instance.
///
/// The pod UID is carried so a pod recreated with the same name is
/// distinguished from the prior one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod name.
    pub pod_name: String,
    /// Pod UID.
    pub pod_uid: String,
    /// Container name.
    pub container_name: String,
}

impl ContainerRef {
    /// Returns the unique string key used for map lookups.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, self.pod_name, self.pod_uid, self.container_name
        )
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.pod_name, self.pod_uid, self.container_name
        )
    }
}

/// Kind of pod lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    /// A container started (or restarted with a new container id).
    Started,
    /// A container stopped.
    Stopped,
}

/// A pod lifecycle event derived from the cluster watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    /// What happened.
    pub kind: PodEventKind,
    /// The affected container.
    pub container: ContainerRef,
}

/// A parsed log line on its way to the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Source container.
    pub container: ContainerRef,
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,
    /// Extracted severity.
    pub severity: Severity,
    /// Log body after structured extraction.
    pub message: String,
    /// Extracted structured fields, `None` if none.
    pub attributes: Option<HashMap<String, String>>,
}

impl LogLine {
    /// Converts the line into a storage entry, adding the reserved
    /// `pod_uid` attribute.
    #[must_use]
    pub fn into_entry(self) -> LogEntry {
        let mut attributes = self.attributes.unwrap_or_default();
        attributes.insert(ATTR_POD_UID.to_string(), self.container.pod_uid.clone());

        LogEntry {
            id: 0,
            timestamp: self.timestamp,
            namespace: self.container.namespace,
            pod: self.container.pod_name,
            container: self.container.container_name,
            severity: self.severity,
            message: self.message,
            attributes: Some(attributes),
        }
    }
}
