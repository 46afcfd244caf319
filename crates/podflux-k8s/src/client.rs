use std::path::PathBuf;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

/// Resolves an authenticated cluster client.
///
/// In-cluster credentials are preferred; outside a cluster the provider
/// falls back to kubeconfig resolution with an optional context override.
#[derive(Clone, Debug, Default)]
pub struct ClientProvider {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl ClientProvider {
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
        }
    }

    /// Build a client for the configured cluster.
    pub async fn client(&self) -> Result<Client> {
        let config = match Config::incluster() {
            Ok(config) => config,
            Err(_) => {
                tracing::debug!("not running in-cluster, falling back to kubeconfig");
                self.kubeconfig_config().await?
            }
        };

        Client::try_from(config).context("failed to create kubernetes client")
    }

    async fn kubeconfig_config(&self) -> Result<Config> {
        let kubeconfig = match &self.kubeconfig {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig at {}", path.display()))?,
            None => Kubeconfig::read().context("failed to read kubeconfig. Is kubectl configured?")?,
        };

        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };

        Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .context("failed to load kubeconfig")
    }
}
