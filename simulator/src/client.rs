//! Kubernetes client construction.

use std::path::Path;

use anyhow::{Context as _, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

/// Build a client, preferring in-cluster configuration and falling back to
/// the provided kubeconfig path, or the standard discovery chain when no path
/// is given.
pub async fn new_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match Config::incluster() {
        Ok(config) => {
            info!("running with in-cluster client configuration");
            config
        }
        Err(_) => match kubeconfig {
            Some(path) => {
                info!(path = %path.display(), "creating client configuration from kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("failed to load kubeconfig")?
            }
            None => {
                info!("inferring client configuration");
                Config::infer()
                    .await
                    .context("failed to infer client configuration")?
            }
        },
    };
    Client::try_from(config).context("failed to initialize kubernetes client")
}
