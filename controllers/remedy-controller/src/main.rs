//! Azure Remedy Controller
//!
//! Watches Kubernetes Services and Nodes and remediates known Azure issues:
//! - Orphaned public IP addresses: IPs left behind by deleted LoadBalancer
//!   Services are removed from the load balancer and deleted
//! - Failed virtual machines: VMs in the Failed provisioning state whose node
//!   is not ready or unreachable are reapplied
//!
//! Progress is tracked in `PublicIPAddress` and `VirtualMachine` records in
//! the controller namespace.

mod actuator;
mod backoff;
mod cache;
mod client;
mod clock;
mod config;
mod controller;
mod error;
mod labeler;
mod metrics;
mod predicate;
mod reconciler;
mod sweep;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::{ClientConnectionConfiguration, ControllerConfiguration, RuntimeOptions};
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use anyhow::Context;
use azure_client::{AzureClient, read_credentials};
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Kubernetes client for the configured kubeconfig, or inferred from the environment
async fn kube_client(connection: &ClientConnectionConfiguration) -> Result<Client, ControllerError> {
    let config = if connection.kubeconfig.is_empty() {
        kube::Config::infer()
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("could not infer Kubernetes configuration: {e}")))?
    } else {
        let kubeconfig = Kubeconfig::read_from(&connection.kubeconfig).map_err(|e| {
            ControllerError::InvalidConfig(format!("could not read kubeconfig {}: {e}", connection.kubeconfig))
        })?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ControllerError::InvalidConfig(format!("could not load kubeconfig {}: {e}", connection.kubeconfig)))?
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Azure Remedy Controller");

    let options = RuntimeOptions::from_env().context("could not read options from the environment")?;
    let config = ControllerConfiguration::load(options.config_path.as_deref().map(Path::new))
        .context("could not load configuration")?;

    info!("Configuration:");
    info!("  Namespace: {}", options.namespace);
    info!("  Infrastructure config: {}", options.infra_config_path);
    info!("  Metrics address: {}", options.metrics_bind_address);
    info!("  Max concurrent reconciles: {}", options.max_concurrent_reconciles);
    info!("  Disabled controllers: {:?}", options.disabled_controllers);
    info!("  Orphaned public IP remedy: {:?}", config.azure.orphaned_public_ip_remedy);
    info!("  Failed VM remedy: {:?}", config.azure.failed_vm_remedy);

    let kube_client = kube_client(&config.client_connection)
        .await
        .context("could not create Kubernetes client")?;

    let metrics = Arc::new(Metrics::new().context("could not register metrics")?);
    let credentials = read_credentials(&options.infra_config_path).context("could not read Azure credentials")?;
    let azure_client = AzureClient::new(
        credentials,
        metrics.azure_read_requests.clone(),
        metrics.azure_write_requests.clone(),
    )
    .context("could not create Azure client")?;

    let controller = Controller::start(kube_client, Arc::new(azure_client), &options, &config, metrics)
        .context("could not start controllers")?;
    controller.run().await?;

    info!("Azure Remedy Controller stopped");
    Ok(())
}
