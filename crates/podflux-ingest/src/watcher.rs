//! Pod lifecycle watching and the stream registry.
//!
//! One subscription task per watched namespace converts raw watch events
//! into [`PodEvent`]s; a single dispatch loop applies the eligibility policy
//! and starts/stops container streamers against the shared registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, pin_mut};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, Client};
use parking_lot::RwLock;
use podflux_k8s::Selector;
use podflux_types::{OutputRecord, PodPhase, StreamKey, WorkloadIdentity};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::IngestResult;
use crate::streamer::ContainerStreamer;

/// How often each namespace subscription re-lists its pods, bounding the
/// staleness of the local snapshot after missed watch events.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pod lifecycle notification produced by a namespace subscription.
#[derive(Clone, Debug)]
pub enum PodEvent {
    /// The pod was added, updated, or observed during a resync listing.
    Applied(Pod),
    /// The pod was deleted.
    Deleted(Pod),
}

/// Eligibility policy applied to every observed pod.
#[derive(Clone, Debug)]
pub struct WatchFilter {
    selector: Selector,
    /// `namespace/name` allow-list; empty admits every pod.
    allowed_pods: HashSet<String>,
}

impl WatchFilter {
    pub fn new(selector: Selector, allowed_pods: Vec<String>) -> Self {
        Self {
            selector,
            allowed_pods: allowed_pods.into_iter().collect(),
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Pure eligibility check: label selector, then the allow-list, then the
    /// pod phase. Succeeded pods stay eligible so job logs remain readable;
    /// pending pods have no log stream yet.
    pub fn should_watch(&self, pod: &Pod) -> bool {
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        if !self.selector.matches(labels) {
            return false;
        }

        if !self.allowed_pods.is_empty() {
            let key = format!("{}/{}", pod_namespace(pod), pod_name(pod));
            if !self.allowed_pods.contains(&key) {
                return false;
            }
        }

        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(PodPhase::from)
            .unwrap_or(PodPhase::Unknown);
        matches!(phase, PodPhase::Running | PodPhase::Succeeded)
    }
}

/// A live streaming task tracked by the registry.
struct StreamEntry {
    cancel: CancellationToken,
    started_at: Instant,
}

type StreamRegistry = Arc<RwLock<HashMap<StreamKey, StreamEntry>>>;

/// Maintains the invariant "exactly one active streamer per eligible
/// container" as the underlying workload set changes.
pub struct WorkloadWatcher {
    client: Client,
    namespaces: Vec<String>,
    filter: Arc<WatchFilter>,
    output: mpsc::Sender<OutputRecord>,
    streams: StreamRegistry,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
}

impl WorkloadWatcher {
    /// Parses the label selector (`InvalidSelector` on failure). An empty
    /// namespace set means the whole cluster; an empty allow-list admits
    /// every pod.
    pub fn new(
        client: Client,
        namespaces: Vec<String>,
        selector: &str,
        allowed_pods: Vec<String>,
        output: mpsc::Sender<OutputRecord>,
        tail_lines: Option<i64>,
        since_seconds: Option<i64>,
    ) -> IngestResult<Self> {
        let selector = Selector::parse(selector)?;

        let namespaces = if namespaces.is_empty() {
            vec![String::new()]
        } else {
            namespaces
        };

        Ok(Self {
            client,
            namespaces,
            filter: Arc::new(WatchFilter::new(selector, allowed_pods)),
            output,
            streams: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tail_lines,
            since_seconds,
        })
    }

    /// Start one subscription per configured namespace plus the dispatch
    /// loop. Namespaces run independently: one failing watch degrades that
    /// namespace only.
    pub fn start(&self) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        for namespace in &self.namespaces {
            let api = self.pods_api(namespace);
            self.tracker.spawn(run_subscription(
                api,
                namespace.clone(),
                self.filter.selector().as_str().to_string(),
                event_tx.clone(),
                self.cancel.child_token(),
            ));
            tracing::debug!(
                namespace = namespace_label(namespace),
                "started pod subscription"
            );
        }

        let dispatcher = Dispatcher {
            client: self.client.clone(),
            filter: Arc::clone(&self.filter),
            output: self.output.clone(),
            streams: Arc::clone(&self.streams),
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
        };
        self.tracker.spawn(dispatcher.run(event_rx));
    }

    /// Cancel the root scope (cascading to every subscription and streamer),
    /// wait until all spawned tasks have exited, then clear the registry.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.streams.write().clear();
    }

    /// Number of live container streams.
    pub fn active_streams(&self) -> usize {
        self.streams.read().len()
    }

    /// Point-in-time listing of running pods matching the configured
    /// selector, independent of the live watch state.
    pub async fn list_eligible_pods(&self, namespace: &str) -> IngestResult<Vec<Pod>> {
        let api = self.pods_api(namespace);
        let mut params = ListParams::default().fields("status.phase=Running");
        let selector = self.filter.selector();
        if !selector.is_empty() {
            params = params.labels(selector.as_str());
        }
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    fn pods_api(&self, namespace: &str) -> Api<Pod> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

/// Shared state moved into the dispatch loop task.
struct Dispatcher {
    client: Client,
    filter: Arc<WatchFilter>,
    output: mpsc::Sender<OutputRecord>,
    streams: StreamRegistry,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
}

impl Dispatcher {
    async fn run(self, mut events: mpsc::Receiver<PodEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                PodEvent::Applied(pod) => {
                    if self.filter.should_watch(&pod) {
                        self.start_pod_streams(&pod);
                    } else {
                        // The pod stopped matching the criteria.
                        self.stop_pod_streams(&pod);
                    }
                }
                PodEvent::Deleted(pod) => self.stop_pod_streams(&pod),
            }
        }
    }

    /// Ensure a streamer exists for every regular container of the pod, and
    /// for every init container currently reported running. Starting an
    /// already-registered stream is a no-op.
    fn start_pod_streams(&self, pod: &Pod) {
        let Some(spec) = pod.spec.as_ref() else {
            return;
        };

        let namespace = pod_namespace(pod);
        let name = pod_name(pod);
        let node = spec.node_name.clone().unwrap_or_default();
        let labels = pod.metadata.labels.clone().unwrap_or_default();

        for container in &spec.containers {
            self.start_container_stream(namespace, name, &container.name, &node, &labels, false);
        }

        // Init containers are only picked up while their status reports
        // running; a stale status here is not reconciled until the next pod
        // event.
        for container in spec.init_containers.iter().flatten() {
            if init_container_running(pod, &container.name) {
                self.start_container_stream(namespace, name, &container.name, &node, &labels, true);
            }
        }
    }

    fn start_container_stream(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        node: &str,
        labels: &BTreeMap<String, String>,
        init: bool,
    ) {
        let key = StreamKey::new(namespace, pod, container);

        // Check-then-insert under the write lock; the blocking I/O of the
        // streamer runs outside it.
        let cancel = {
            let mut streams = self.streams.write();
            match try_register(&mut streams, &key, &self.cancel) {
                Some(cancel) => cancel,
                None => return,
            }
        };

        let identity = WorkloadIdentity {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            node: node.to_string(),
            labels: labels.clone(),
        };
        let streamer = ContainerStreamer::new(
            self.client.clone(),
            identity,
            self.output.clone(),
            cancel,
            self.tail_lines,
            self.since_seconds,
        );
        self.tracker.spawn(streamer.run());

        tracing::info!(stream = %key, init, "started log stream");
    }

    fn stop_pod_streams(&self, pod: &Pod) {
        let namespace = pod_namespace(pod);
        let name = pod_name(pod);

        let removed = {
            let mut streams = self.streams.write();
            cancel_pod_entries(&mut streams, namespace, name)
        };

        if removed > 0 {
            tracing::info!(namespace, pod = name, removed, "stopped log streams");
        }
    }
}

/// Register a stream key, deriving a child token from the watcher's root
/// scope. Returns `None` when a streamer already exists for the key, making
/// duplicate starts a no-op. Caller holds the write lock.
fn try_register(
    streams: &mut HashMap<StreamKey, StreamEntry>,
    key: &StreamKey,
    root: &CancellationToken,
) -> Option<CancellationToken> {
    if streams.contains_key(key) {
        return None;
    }
    let cancel = root.child_token();
    streams.insert(
        key.clone(),
        StreamEntry {
            cancel: cancel.clone(),
            started_at: Instant::now(),
        },
    );
    Some(cancel)
}

/// Cancel and drop every registry entry belonging to the pod. Returns the
/// number of entries removed. Caller holds the write lock.
fn cancel_pod_entries(
    streams: &mut HashMap<StreamKey, StreamEntry>,
    namespace: &str,
    pod: &str,
) -> usize {
    let before = streams.len();
    streams.retain(|key, entry| {
        if key.namespace == namespace && key.pod == pod {
            entry.cancel.cancel();
            tracing::debug!(stream = %key, uptime = ?entry.started_at.elapsed(), "cancelled log stream");
            false
        } else {
            true
        }
    });
    before - streams.len()
}

fn init_container_running(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.init_container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|status| {
                status.name == container
                    && status
                        .state
                        .as_ref()
                        .is_some_and(|state| state.running.is_some())
            })
        })
}

/// Translate raw watch events into [`PodEvent`]s and re-list on a fixed
/// interval. Watch errors are logged and non-fatal; the underlying watcher
/// re-establishes the connection itself.
async fn run_subscription(
    api: Api<Pod>,
    namespace: String,
    selector: String,
    events: mpsc::Sender<PodEvent>,
    cancel: CancellationToken,
) {
    let mut config = watcher::Config::default();
    if !selector.is_empty() {
        config = config.labels(&selector);
    }

    let stream = watcher(api.clone(), config);
    pin_mut!(stream);

    let mut resync = time::interval_at(
        time::Instant::now() + RESYNC_INTERVAL,
        RESYNC_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = resync.tick() => {
                if let Err(error) = resync_pods(&api, &selector, &events, &cancel).await {
                    tracing::warn!(
                        namespace = namespace_label(&namespace),
                        %error,
                        "pod resync listing failed"
                    );
                }
            }

            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let mapped = match event {
                        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                            Some(PodEvent::Applied(pod))
                        }
                        watcher::Event::Delete(pod) => Some(PodEvent::Deleted(pod)),
                        watcher::Event::Init | watcher::Event::InitDone => None,
                    };
                    if let Some(event) = mapped {
                        if events.send(event).await.is_err() {
                            return; // dispatch loop is gone
                        }
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        namespace = namespace_label(&namespace),
                        %error,
                        "pod watch error"
                    );
                }
                None => return,
            },
        }
    }
}

/// Re-announce every pod in the namespace. Starts are idempotent, so known
/// pods are harmless; pods whose events were missed get picked up here.
async fn resync_pods(
    api: &Api<Pod>,
    selector: &str,
    events: &mpsc::Sender<PodEvent>,
    cancel: &CancellationToken,
) -> kube::Result<()> {
    let mut params = ListParams::default();
    if !selector.is_empty() {
        params = params.labels(selector);
    }

    let pods = api.list(&params).await?;
    for pod in pods.items {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = events.send(PodEvent::Applied(pod)) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

fn namespace_label(namespace: &str) -> &str {
    if namespace.is_empty() { "*" } else { namespace }
}
