//! Collector configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CollectorError, Result};

/// Configuration for the collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Only pods scheduled on this node are collected. Required for
    /// DaemonSet deployment.
    pub node_name: String,
    /// Cap on active log streams.
    pub max_concurrent_streams: usize,
    /// Entries buffered before a storage write.
    pub batch_size: usize,
    /// A non-empty buffer is flushed after this long.
    pub batch_timeout: Duration,
    /// Per-stream channel sizing; the shared output channel holds ten
    /// times this many lines.
    pub stream_buffer_size: usize,
    /// Collect logs produced after this instant. `None` means from pod
    /// start.
    pub since_time: Option<DateTime<Utc>>,
    /// Namespaces never collected. Exclusion wins over inclusion.
    pub exclude_namespaces: Vec<String>,
    /// When non-empty, only these namespaces are collected.
    pub include_namespaces: Vec<String>,
    /// Bound on draining the pipeline at shutdown.
    pub shutdown_timeout: Duration,
    /// A stream with no lines for this long closes and reconnects.
    pub stream_idle_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            max_concurrent_streams: 100,
            batch_size: 500,
            batch_timeout: Duration::from_secs(5),
            stream_buffer_size: 1000,
            since_time: Some(Utc::now() - chrono::Duration::minutes(15)),
            exclude_namespaces: vec!["kube-system".to_string()],
            include_namespaces: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl CollectorConfig {
    /// Creates a configuration for the given node with defaults for
    /// everything else.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// Checks the configuration, returning the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Config`] for a missing node name or a
    /// non-positive size or timeout.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(CollectorError::Config {
                field: "node_name",
                message: "node name is required (set NODE_NAME)".into(),
            });
        }
        if self.max_concurrent_streams == 0 {
            return Err(CollectorError::Config {
                field: "max_concurrent_streams",
                message: "must be positive".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(CollectorError::Config {
                field: "batch_size",
                message: "must be positive".into(),
            });
        }
        if self.batch_timeout.is_zero() {
            return Err(CollectorError::Config {
                field: "batch_timeout",
                message: "must be positive".into(),
            });
        }
        if self.stream_buffer_size == 0 {
            return Err(CollectorError::Config {
                field: "stream_buffer_size",
                message: "must be positive".into(),
            });
        }
        if self.shutdown_timeout.is_zero() {
            return Err(CollectorError::Config {
                field: "shutdown_timeout",
                message: "must be positive".into(),
            });
        }
        if self.stream_idle_timeout.is_zero() {
            return Err(CollectorError::Config {
                field: "stream_idle_timeout",
                message: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Returns true if logs from the namespace should be collected.
    /// Exclusion wins; an empty include list means "all except
    /// excluded".
    #[must_use]
    pub fn should_collect(&self, namespace: &str) -> bool {
        if self.exclude_namespaces.iter().any(|ns| ns == namespace) {
            return false;
        }
        if self.include_namespaces.is_empty() {
            return true;
        }
        self.include_namespaces.iter().any(|ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_with_node_name() {
        let config = CollectorConfig::new("node-1");
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_timeout, Duration::from_secs(5));
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.exclude_namespaces, vec!["kube-system"]);
    }

    #[test]
    fn missing_node_name_is_rejected() {
        let config = CollectorConfig::default();
        let err = config.validate().expect_err("node name required");
        assert!(matches!(err, CollectorError::Config { field: "node_name", .. }));
    }

    #[test]
    fn non_positive_sizes_are_rejected() {
        let mut config = CollectorConfig::new("node-1");
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = CollectorConfig::new("node-1");
        config.max_concurrent_streams = 0;
        assert!(config.validate().is_err());

        let mut config = CollectorConfig::new("node-1");
        config.batch_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn exclusion_wins_over_inclusion() {
        let mut config = CollectorConfig::new("node-1");
        config.include_namespaces = vec!["prod".into()];
        config.exclude_namespaces = vec!["prod".into()];
        assert!(!config.should_collect("prod"));
    }

    #[test]
    fn empty_include_means_all_except_excluded() {
        let config = CollectorConfig::new("node-1");
        assert!(config.should_collect("default"));
        assert!(config.should_collect("prod"));
        assert!(!config.should_collect("kube-system"));
    }

    #[test]
    fn include_list_restricts() {
        let mut config = CollectorConfig::new("node-1");
        config.include_namespaces = vec!["prod".into(), "staging".into()];
        assert!(config.should_collect("prod"));
        assert!(config.should_collect("staging"));
        assert!(!config.should_collect("default"));
    }
}
