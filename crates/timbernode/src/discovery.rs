//! Pod lifecycle discovery for the local node.
//!
//! Watches pods scheduled on this node and translates container status
//! transitions into [`PodEvent`]s: a container newly running (or
//! restarted under a new container id) emits `Started`; a running
//! container that stopped, or a deleted pod, emits `Stopped`. Each
//! watcher re-list reconciles the tracked state so containers that
//! vanished while the watch was down still emit `Stopped`.

use std::collections::{HashMap, HashSet};

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{CollectorError, Result};
use crate::types::{ContainerRef, PodEvent, PodEventKind};

/// Capacity of the event channel; sized for high pod churn.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Bound on a blocked event send before the event is dropped audibly.
const EVENT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Tracked per-container state used to derive lifecycle transitions.
#[derive(Debug, Clone)]
struct ContainerState {
    running: bool,
    restart_count: i32,
    container_id: String,
}

/// Watches pods on one node and emits container start/stop events.
pub struct PodDiscovery {
    client: kube::Client,
    node_name: String,
    events_tx: mpsc::Sender<PodEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PodEvent>>>,
    states: Mutex<HashMap<String, ContainerState>>,
    cancel: CancellationToken,
}

impl PodDiscovery {
    /// Creates a pod watcher for the given node.
    #[must_use]
    pub fn new(client: kube::Client, node_name: impl Into<String>, cancel: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            node_name: node_name.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            states: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Takes the receiving end of the event channel. The orchestrator
    /// calls this exactly once.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::Receiver<PodEvent>> {
        self.events_rx.lock().take()
    }

    /// Watches pods until cancelled. Watch failures back off and
    /// re-list; each re-list reconciles the tracked container set.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch stream terminates.
    pub async fn run(&self) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        let stream = watcher(api, config).default_backoff();
        tokio::pin!(stream);

        info!(node = %self.node_name, "pod discovery started");

        // Container keys observed during the current re-list, used to
        // reconcile state when the list completes.
        let mut relist_seen: Option<HashSet<String>> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(node = %self.node_name, "pod discovery stopping");
                    return Ok(());
                }

                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Init)) => {
                        relist_seen = Some(HashSet::new());
                    }
                    Ok(Some(watcher::Event::InitApply(pod))) => {
                        if let Some(seen) = relist_seen.as_mut() {
                            for container in containers_of(&pod) {
                                seen.insert(container.key());
                            }
                        }
                        self.apply_pod(&pod).await;
                    }
                    Ok(Some(watcher::Event::InitDone)) => {
                        if let Some(seen) = relist_seen.take() {
                            self.reconcile(&seen).await;
                        }
                    }
                    Ok(Some(watcher::Event::Apply(pod))) => {
                        self.apply_pod(&pod).await;
                    }
                    Ok(Some(watcher::Event::Delete(pod))) => {
                        self.remove_pod(&pod).await;
                    }
                    Ok(None) => {
                        return Err(CollectorError::Discovery(
                            "watch stream ended".into(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "pod watch error, stream will re-list");
                    }
                },
            }
        }
    }

    /// Diffs a pod's container statuses against the tracked state and
    /// emits start/stop events for the transitions.
    async fn apply_pod(&self, pod: &Pod) {
        for (container, status) in container_statuses(pod) {
            let key = container.key();
            let restart_count = status.restart_count;
            let transition = {
                let mut states = self.states.lock();
                let prev = states.get(&key).cloned();

                match prev {
                    // New or previously-not-running container now
                    // running, or a changed container id (restart).
                    prev if status.running
                        && prev
                            .as_ref()
                            .is_none_or(|p| !p.running || p.container_id != status.container_id) =>
                    {
                        states.insert(key, status);
                        Some(PodEventKind::Started)
                    }
                    // Previously running, now not.
                    Some(p) if !status.running && p.running => {
                        states.insert(key, status);
                        Some(PodEventKind::Stopped)
                    }
                    None => {
                        // Initial observation of a non-running container.
                        states.insert(key, status);
                        None
                    }
                    Some(_) => None,
                }
            };

            if let Some(kind) = transition {
                tracing::debug!(
                    container = %container,
                    ?kind,
                    restart_count,
                    "container transition"
                );
                self.emit(PodEvent { kind, container }).await;
            }
        }
    }

    /// Emits `Stopped` for every registered container of a deleted pod.
    async fn remove_pod(&self, pod: &Pod) {
        for (container, _) in container_statuses(pod) {
            let removed = self.states.lock().remove(&container.key()).is_some();
            if removed {
                self.emit(PodEvent {
                    kind: PodEventKind::Stopped,
                    container,
                })
                .await;
            } else {
                // Never tracked as running; nothing downstream to stop.
            }
        }
    }

    /// Emits `Stopped` for tracked containers that a re-list no longer
    /// reports (deleted while the watch was down).
    async fn reconcile(&self, seen: &HashSet<String>) {
        let vanished: Vec<(String, ContainerRef)> = {
            let states = self.states.lock();
            states
                .keys()
                .filter(|key| !seen.contains(*key))
                .filter_map(|key| parse_key(key).map(|container| (key.clone(), container)))
                .collect()
        };

        for (key, container) in vanished {
            self.states.lock().remove(&key);
            self.emit(PodEvent {
                kind: PodEventKind::Stopped,
                container,
            })
            .await;
        }
    }

    /// Sends an event, preferring a non-blocking send; when the channel
    /// is full, waits a bounded time and then drops the event audibly.
    async fn emit(&self, event: PodEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    container = %event.container,
                    "pod event channel full, waiting to emit"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        error!(
                            container = %event.container,
                            "dropping pod event, discovery cancelled"
                        );
                    }
                    sent = tokio::time::timeout(EVENT_SEND_TIMEOUT, self.events_tx.send(event.clone())) => {
                        match sent {
                            Ok(Ok(())) => {}
                            Ok(Err(mpsc::error::SendError(event))) => {
                                error!(
                                    container = %event.container,
                                    "dropping pod event, channel closed"
                                );
                            }
                            Err(_) => {
                                error!("dropping pod event, send timed out");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Extracts `(ContainerRef, state)` pairs from a pod's statuses.
fn container_statuses(pod: &Pod) -> Vec<(ContainerRef, ContainerState)> {
    let Some(meta) = pod_identity(pod) else {
        return Vec::new();
    };
    let (namespace, pod_name, pod_uid) = meta;

    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| {
                    let container = ContainerRef {
                        namespace: namespace.clone(),
                        pod_name: pod_name.clone(),
                        pod_uid: pod_uid.clone(),
                        container_name: cs.name.clone(),
                    };
                    let state = ContainerState {
                        running: cs
                            .state
                            .as_ref()
                            .is_some_and(|s| s.running.is_some()),
                        restart_count: cs.restart_count,
                        container_id: cs.container_id.clone().unwrap_or_default(),
                    };
                    (container, state)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn containers_of(pod: &Pod) -> Vec<ContainerRef> {
    container_statuses(pod)
        .into_iter()
        .map(|(container, _)| container)
        .collect()
}

fn pod_identity(pod: &Pod) -> Option<(String, String, String)> {
    Some((
        pod.metadata.namespace.clone()?,
        pod.metadata.name.clone()?,
        pod.metadata.uid.clone()?,
    ))
}

/// Rebuilds a [`ContainerRef`] from its map key.
fn parse_key(key: &str) -> Option<ContainerRef> {
    let mut parts = key.splitn(4, '/');
    Some(ContainerRef {
        namespace: parts.next()?.to_string(),
        pod_name: parts.next()?.to_string(),
        pod_uid: parts.next()?.to_string(),
        container_name: parts.next()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState as K8sContainerState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, uid: &str, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.into()),
                uid: Some(uid.into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn running_status(container: &str, container_id: &str) -> ContainerStatus {
        ContainerStatus {
            name: container.into(),
            container_id: Some(container_id.into()),
            state: Some(K8sContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated_status(container: &str, container_id: &str) -> ContainerStatus {
        ContainerStatus {
            name: container.into(),
            container_id: Some(container_id.into()),
            state: Some(K8sContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Discovery with a client that is never actually used: the tests
    /// drive `apply_pod`/`remove_pod` directly.
    async fn discovery() -> (PodDiscovery, mpsc::Receiver<PodEvent>) {
        let config = kube::Config::new("http://127.0.0.1:8080".parse().expect("url"));
        let client = kube::Client::try_from(config).expect("client");
        let discovery = PodDiscovery::new(client, "node-1", CancellationToken::new());
        let events = discovery.take_events().expect("events");
        (discovery, events)
    }

    #[tokio::test]
    async fn running_container_emits_started() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]))
            .await;

        let event = events.try_recv().expect("event");
        assert_eq!(event.kind, PodEventKind::Started);
        assert_eq!(event.container.pod_name, "api-0");
        assert_eq!(event.container.pod_uid, "uid-1");
        assert_eq!(event.container.container_name, "app");
    }

    #[tokio::test]
    async fn unchanged_running_container_emits_nothing() {
        let (discovery, mut events) = discovery().await;
        let p = pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]);

        discovery.apply_pod(&p).await;
        let _ = events.try_recv().expect("started");

        discovery.apply_pod(&p).await;
        assert!(events.try_recv().is_err(), "no duplicate event");
    }

    #[tokio::test]
    async fn changed_container_id_emits_started_again() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]))
            .await;
        let _ = events.try_recv().expect("first start");

        // Same pod, restarted container under a new id.
        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c2")]))
            .await;
        let event = events.try_recv().expect("restart event");
        assert_eq!(event.kind, PodEventKind::Started);
    }

    #[tokio::test]
    async fn running_to_terminated_emits_stopped() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]))
            .await;
        let _ = events.try_recv().expect("started");

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![terminated_status("app", "docker://c1")]))
            .await;
        let event = events.try_recv().expect("stopped event");
        assert_eq!(event.kind, PodEventKind::Stopped);
    }

    #[tokio::test]
    async fn initially_terminated_container_emits_nothing() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![terminated_status("app", "docker://c1")]))
            .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn deleted_pod_emits_stopped_for_registered_containers() {
        let (discovery, mut events) = discovery().await;
        let p = pod(
            "api-0",
            "uid-1",
            vec![
                running_status("app", "docker://c1"),
                running_status("sidecar", "docker://c2"),
            ],
        );

        discovery.apply_pod(&p).await;
        let _ = events.try_recv().expect("app started");
        let _ = events.try_recv().expect("sidecar started");

        discovery.remove_pod(&p).await;
        let stopped: Vec<PodEvent> = [
            events.try_recv().expect("first stop"),
            events.try_recv().expect("second stop"),
        ]
        .to_vec();
        assert!(stopped.iter().all(|e| e.kind == PodEventKind::Stopped));

        // Deleting again is quiet: nothing is registered anymore.
        discovery.remove_pod(&p).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pod_recreated_with_same_name_is_distinct() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]))
            .await;
        let first = events.try_recv().expect("first");

        // Same name, different UID: a brand-new pod.
        discovery
            .apply_pod(&pod("api-0", "uid-2", vec![running_status("app", "docker://c9")]))
            .await;
        let second = events.try_recv().expect("second");

        assert_eq!(second.kind, PodEventKind::Started);
        assert_ne!(first.container.key(), second.container.key());
    }

    #[tokio::test]
    async fn reconcile_stops_vanished_containers() {
        let (discovery, mut events) = discovery().await;

        discovery
            .apply_pod(&pod("api-0", "uid-1", vec![running_status("app", "docker://c1")]))
            .await;
        discovery
            .apply_pod(&pod("api-1", "uid-2", vec![running_status("app", "docker://c2")]))
            .await;
        let _ = events.try_recv().expect("started 1");
        let _ = events.try_recv().expect("started 2");

        // A re-list that only saw api-1: api-0 vanished while the watch
        // was down.
        let seen: HashSet<String> =
            containers_of(&pod("api-1", "uid-2", vec![running_status("app", "docker://c2")]))
                .iter()
                .map(ContainerRef::key)
                .collect();
        discovery.reconcile(&seen).await;

        let event = events.try_recv().expect("vanished stop");
        assert_eq!(event.kind, PodEventKind::Stopped);
        assert_eq!(event.container.pod_name, "api-0");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn key_parse_roundtrip() {
        let container = ContainerRef {
            namespace: "prod".into(),
            pod_name: "api-0".into(),
            pod_uid: "uid-9".into(),
            container_name: "app".into(),
        };
        let parsed = parse_key(&container.key()).expect("parse");
        assert_eq!(parsed, container);
    }
}
