//! Kubernetes-backed log source.
//!
//! Wraps the `pods/{name}/log` subresource in follow mode with
//! server-side timestamps, and the pod `get` used to distinguish a
//! terminated container from a dropped connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::error::Result;
use crate::stream::{LineStream, LogSource};
use crate::types::ContainerRef;

/// Maximum accepted log line length. Longer lines fail the read and the
/// stream reconnects past them.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Log source reading from the Kubernetes API.
#[derive(Clone)]
pub struct KubeLogSource {
    client: kube::Client,
}

impl KubeLogSource {
    /// Creates a source over the given client.
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(
        &self,
        container: &ContainerRef,
        since: Option<DateTime<Utc>>,
    ) -> Result<LineStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &container.namespace);
        let params = LogParams {
            container: Some(container.container_name.clone()),
            follow: true,
            timestamps: true,
            since_time: since,
            ..Default::default()
        };

        let reader = api.log_stream(&container.pod_name, &params).await?.compat();
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
            .map(|item| {
                item.map_err(|e| match e {
                    LinesCodecError::MaxLineLengthExceeded => std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "log line exceeds maximum length",
                    ),
                    LinesCodecError::Io(io) => io,
                })
            })
            .boxed();
        Ok(lines)
    }

    async fn is_container_running(&self, container: &ContainerRef) -> bool {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &container.namespace);
        let Ok(pod) = api.get(&container.pod_name).await else {
            // Unreachable API or missing pod: treat as not running.
            return false;
        };

        // Pod UID first: a pod recreated under the same name is not the
        // pod this stream was tailing.
        if pod.metadata.uid.as_deref() != Some(container.pod_uid.as_str()) {
            return false;
        }

        pod.status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .is_some_and(|statuses| {
                statuses.iter().any(|cs| {
                    cs.name == container.container_name
                        && cs.state.as_ref().is_some_and(|s| s.running.is_some())
                })
            })
    }
}
