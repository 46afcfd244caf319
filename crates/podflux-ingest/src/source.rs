//! Public facade over the watcher and the bounded output channel.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use kube::api::ListParams;
use podflux_k8s::ClientProvider;
use podflux_types::OutputRecord;
use tokio::sync::mpsc;

use crate::error::{IngestError, IngestResult};
use crate::watcher::WorkloadWatcher;

/// Capacity of the output channel. This is the backpressure boundary: a
/// stalled consumer blocks sends, which blocks each container's read loop,
/// throttling ingestion per container instead of dropping data or growing
/// memory without bound.
const OUTPUT_CHANNEL_CAPACITY: usize = 1000;

/// Configuration for a [`LogIngestionSource`].
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Namespaces to watch; empty means the whole cluster.
    pub namespaces: Vec<String>,
    /// Label selector expression; empty matches everything.
    pub selector: String,
    /// Trailing lines to request per stream; negative disables the bound.
    pub tail_lines: i64,
    /// Only lines newer than this many seconds; zero disables the bound.
    pub since_seconds: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespaces: Vec::new(),
            selector: String::new(),
            // Recent lines only, so a fresh consumer is not flooded.
            tail_lines: 10,
            since_seconds: 0,
        }
    }
}

impl SourceConfig {
    fn tail_lines_param(&self) -> Option<i64> {
        (self.tail_lines >= 0).then_some(self.tail_lines)
    }

    fn since_seconds_param(&self) -> Option<i64> {
        (self.since_seconds > 0).then_some(self.since_seconds)
    }
}

/// Entry point for streaming enriched Kubernetes logs.
///
/// Owns the output channel and the watcher lifecycle; also answers the
/// point-in-time listing queries used to populate external filter UIs.
pub struct LogIngestionSource {
    config: SourceConfig,
    provider: ClientProvider,
    watcher: Option<WorkloadWatcher>,
    output_tx: Option<mpsc::Sender<OutputRecord>>,
    output_rx: Option<mpsc::Receiver<OutputRecord>>,
    namespace_selection: BTreeMap<String, bool>,
    pod_selection: BTreeMap<String, bool>,
}

impl LogIngestionSource {
    pub fn new(config: SourceConfig) -> Self {
        let provider = ClientProvider::new(config.kubeconfig.clone(), config.context.clone());
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            config,
            provider,
            watcher: None,
            output_tx: Some(output_tx),
            output_rx: Some(output_rx),
            namespace_selection: BTreeMap::new(),
            pod_selection: BTreeMap::new(),
        }
    }

    /// Take the receiving end of the output channel. The sequence terminates
    /// once [`Self::stop`] has torn down every producer.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputRecord>> {
        self.output_rx.take()
    }

    /// Resolve a cluster client and start watching with the configured
    /// filter and no pod allow-list.
    pub async fn start(&mut self) -> IngestResult<()> {
        self.spawn_watcher(Vec::new()).await
    }

    /// Replace the active filter wholesale. The current watcher is fully
    /// stopped before its replacement starts, so no stale eligibility state
    /// survives a filter change.
    pub async fn reconfigure(
        &mut self,
        namespaces: Vec<String>,
        selector: String,
        pod_allowlist: Vec<String>,
    ) -> IngestResult<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        self.config.namespaces = namespaces;
        self.config.selector = selector;
        self.spawn_watcher(pod_allowlist).await
    }

    async fn spawn_watcher(&mut self, pod_allowlist: Vec<String>) -> IngestResult<()> {
        let Some(output_tx) = self.output_tx.clone() else {
            tracing::warn!("ignoring start on a stopped log source");
            return Ok(());
        };

        let client = self.provider.client().await.map_err(IngestError::ClientBuild)?;

        let watcher = WorkloadWatcher::new(
            client,
            self.config.namespaces.clone(),
            &self.config.selector,
            pod_allowlist,
            output_tx,
            self.config.tail_lines_param(),
            self.config.since_seconds_param(),
        )?;
        watcher.start();

        tracing::info!(
            namespaces = ?self.config.namespaces,
            selector = %self.config.selector,
            "started kubernetes log ingestion"
        );
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop ingestion, wait for all producers to exit, then close the output
    /// channel exactly once. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        // Every producer handle is gone once the watcher has stopped, so
        // dropping the facade's sender closes the channel.
        self.output_tx.take();
    }

    /// Number of live container streams.
    pub fn active_streams(&self) -> usize {
        self.watcher.as_ref().map_or(0, WorkloadWatcher::active_streams)
    }

    /// List cluster namespaces mapped to a selection flag. Namespaces from
    /// the initial configuration default to selected (all of them, when none
    /// were configured); prior user selections are preserved across calls.
    pub async fn list_namespaces(&mut self) -> IngestResult<BTreeMap<String, bool>> {
        let client = self.provider.client().await.map_err(IngestError::ClientBuild)?;
        let api: Api<Namespace> = Api::all(client);
        let list = api.list(&ListParams::default()).await?;

        let configured: HashSet<&str> = self
            .config
            .namespaces
            .iter()
            .filter(|ns| !ns.is_empty())
            .map(String::as_str)
            .collect();
        let select_all = configured.is_empty();

        let mut fresh = BTreeMap::new();
        for ns in list.items {
            let Some(name) = ns.metadata.name else {
                continue;
            };
            let selected = select_all || configured.contains(name.as_str());
            fresh.insert(name, selected);
        }

        merge_selection(&mut fresh, &self.namespace_selection);
        self.namespace_selection = fresh.clone();
        Ok(fresh)
    }

    /// List pods from the selected namespaces (all, when none are selected),
    /// filtered by the configured label selector, keyed `namespace/name`.
    /// New pods default to selected; prior user selections are preserved.
    /// A namespace that fails to list is logged and skipped.
    pub async fn list_pods(
        &mut self,
        selected_namespaces: &BTreeMap<String, bool>,
    ) -> IngestResult<BTreeMap<String, bool>> {
        let client = self.provider.client().await.map_err(IngestError::ClientBuild)?;

        let mut params = ListParams::default();
        if !self.config.selector.is_empty() {
            params = params.labels(&self.config.selector);
        }

        let mut namespaces: Vec<String> = selected_namespaces
            .iter()
            .filter(|(_, selected)| **selected)
            .map(|(ns, _)| ns.clone())
            .collect();
        if namespaces.is_empty() {
            namespaces.push(String::new()); // all namespaces
        }

        let mut fresh = BTreeMap::new();
        for namespace in &namespaces {
            let api: Api<Pod> = if namespace.is_empty() {
                Api::all(client.clone())
            } else {
                Api::namespaced(client.clone(), namespace)
            };

            let list = match api.list(&params).await {
                Ok(list) => list,
                Err(error) => {
                    tracing::warn!(namespace = %namespace, %error, "failed to list pods");
                    continue;
                }
            };

            for pod in list.items {
                let (Some(ns), Some(name)) = (pod.metadata.namespace, pod.metadata.name) else {
                    continue;
                };
                fresh.insert(format!("{ns}/{name}"), true);
            }
        }

        merge_selection(&mut fresh, &self.pod_selection);
        self.pod_selection = fresh.clone();
        Ok(fresh)
    }
}

/// Carry prior user selections over to a freshly-listed result: a name seen
/// before keeps its previous boolean, a new name keeps the query default.
fn merge_selection(fresh: &mut BTreeMap<String, bool>, prior: &BTreeMap<String, bool>) {
    for (name, selected) in fresh.iter_mut() {
        if let Some(previous) = prior.get(name) {
            *selected = *previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs
            .iter()
            .map(|(name, selected)| (name.to_string(), *selected))
            .collect()
    }

    #[test]
    fn prior_selections_survive_a_refresh() {
        let mut fresh = selection(&[("default", true), ("kube-system", true), ("new-ns", true)]);
        let prior = selection(&[("default", false), ("kube-system", true)]);
        merge_selection(&mut fresh, &prior);

        assert_eq!(
            fresh,
            selection(&[("default", false), ("kube-system", true), ("new-ns", true)])
        );
    }

    #[test]
    fn names_gone_from_the_cluster_are_dropped() {
        let mut fresh = selection(&[("default", true)]);
        let prior = selection(&[("default", false), ("removed-ns", false)]);
        merge_selection(&mut fresh, &prior);

        assert_eq!(fresh, selection(&[("default", false)]));
    }

    #[test]
    fn tail_and_since_params_honor_sentinels() {
        let mut config = SourceConfig::default();
        assert_eq!(config.tail_lines_param(), Some(10));
        assert_eq!(config.since_seconds_param(), None);

        config.tail_lines = -1;
        config.since_seconds = 300;
        assert_eq!(config.tail_lines_param(), None);
        assert_eq!(config.since_seconds_param(), Some(300));

        config.tail_lines = 0;
        assert_eq!(config.tail_lines_param(), Some(0));
    }
}
