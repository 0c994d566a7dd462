//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the four
//! controllers of the remedy controller together and runs them until shutdown:
//! - service: projects LoadBalancer Services into PublicIPAddress records
//! - node: projects Nodes into VirtualMachine records
//! - publicipaddress: cleans Azure public IPs of deleted records
//! - virtualmachine: reapplies failed Azure virtual machines
//!
//! The metrics server and the optional orphaned public IP sweep run alongside.

use crate::actuator::node::NodeActuator;
use crate::actuator::publicipaddress::PublicIPAddressActuator;
use crate::actuator::service::{SERVICE_LABEL_SEPARATOR, ServiceActuator};
use crate::actuator::virtualmachine::VirtualMachineActuator;
use crate::client::{KubeResourceClient, ObjectKey, ResourceClient};
use crate::clock::{Clock, SystemClock};
use crate::config::{ControllerConfiguration, ControllerKind, RuntimeOptions};
use crate::error::ControllerError;
use crate::labeler::{ClusterObjectLabeler, LabelMapper, NamespacedObjectLabeler};
use crate::metrics::{Metrics, run_metrics_server};
use crate::predicate::{GenerationChangedPredicate, NodePredicate, OwnedObjectPredicate, Predicate, ServicePredicate};
use crate::reconciler::Reconciler;
use crate::sweep::OrphanedPublicIPSweeper;
use crate::watcher::{no_owner_keys, watch_owned, watch_resource};
use azure_client::{AzureClient, AzurePublicIPAddressUtils, AzureVirtualMachineUtils, PublicIPAddressUtils, VirtualMachineUtils};
use crds::constants::{NODE_FINALIZER, NODE_LABEL, PUBLIC_IP_ADDRESS_FINALIZER, SERVICE_FINALIZER, SERVICE_LABEL, VIRTUAL_MACHINE_FINALIZER};
use crds::{PublicIPAddress, VirtualMachine};
use futures::channel::mpsc::unbounded;
use futures::future::{join_all, select_all};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

/// How long controllers get to finish in-flight reconciliations on shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for Azure remediation.
pub struct Controller {
    watchers: Vec<(&'static str, Task)>,
    background: Vec<(&'static str, JoinHandle<()>)>,
    metrics_server: Task,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("watchers", &self.watchers.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn service_prototype(key: &ObjectKey) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: key.namespace.clone(),
            name: Some(key.name.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn node_prototype(key: &ObjectKey) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn spawn(
    watchers: &mut Vec<(&'static str, Task)>,
    name: &'static str,
    task: impl Future<Output = Result<(), ControllerError>> + Send + 'static,
) {
    watchers.push((name, tokio::spawn(task)));
}

/// Spawns a task that is stopped on shutdown; failures are only logged
fn spawn_background(
    background: &mut Vec<(&'static str, JoinHandle<()>)>,
    name: &'static str,
    task: impl Future<Output = Result<(), ControllerError>> + Send + 'static,
) {
    background.push((
        name,
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(task = name, "Background task failed: {}", e);
            }
        }),
    ));
}

enum Exit {
    Signal,
    Watcher(Result<Result<(), ControllerError>, JoinError>, usize, Vec<Task>),
    MetricsServer(Result<Result<(), ControllerError>, JoinError>),
}

impl Controller {
    /// Creates the controllers enabled in `options` and starts them.
    ///
    /// # Arguments
    /// * `kube_client` - Kubernetes client
    /// * `azure_client` - Azure Resource Manager client
    /// * `options` - Process settings
    /// * `config` - Remedy configuration
    /// * `metrics` - Metrics shared by all controllers
    pub fn start(
        kube_client: Client,
        azure_client: Arc<AzureClient>,
        options: &RuntimeOptions,
        config: &ControllerConfiguration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ControllerError> {
        info!("Initializing remedy controller");

        let namespace = options.namespace.as_str();
        let concurrency = options.max_concurrent_reconciles;
        let pubip_config = &config.azure.orphaned_public_ip_remedy;
        let vm_config = &config.azure.failed_vm_remedy;

        let services: Arc<dyn ResourceClient<Service>> = Arc::new(KubeResourceClient::<Service>::namespaced(kube_client.clone()));
        let nodes: Arc<dyn ResourceClient<Node>> = Arc::new(KubeResourceClient::<Node>::cluster(kube_client.clone()));
        let pubips: Arc<dyn ResourceClient<PublicIPAddress>> =
            Arc::new(KubeResourceClient::<PublicIPAddress>::namespaced(kube_client.clone()));
        let vms: Arc<dyn ResourceClient<VirtualMachine>> =
            Arc::new(KubeResourceClient::<VirtualMachine>::namespaced(kube_client.clone()));
        let pubip_api: Api<PublicIPAddress> = Api::namespaced(kube_client.clone(), namespace);
        let vm_api: Api<VirtualMachine> = Api::namespaced(kube_client.clone(), namespace);

        let pubip_utils: Arc<dyn PublicIPAddressUtils> = Arc::new(AzurePublicIPAddressUtils::new(Arc::clone(&azure_client)));
        let vm_utils: Arc<dyn VirtualMachineUtils> = Arc::new(AzureVirtualMachineUtils::new(Arc::clone(&azure_client)));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut watchers = Vec::new();
        let mut background = Vec::new();

        if options.is_enabled(ControllerKind::Service) {
            let actuator = ServiceActuator::new(
                Arc::clone(&pubips),
                namespace,
                pubip_config.sync_period,
                pubip_config.blacklisted_service_labels.clone(),
            );
            let reconciler = Reconciler::new(
                ControllerKind::Service.as_str(),
                SERVICE_FINALIZER,
                Arc::new(actuator),
                Arc::clone(&services),
            )
            .with_ensure_deleted(Arc::new(service_prototype));
            let predicate = ServicePredicate::new(pubip_config.blacklisted_service_labels.clone());

            let (owner_keys, owner_stream) = unbounded();
            let owned_predicate: Arc<dyn Predicate<PublicIPAddress>> = Arc::new(OwnedObjectPredicate::new(
                Arc::clone(&services),
                LabelMapper::new(NamespacedObjectLabeler::new(SERVICE_LABEL_SEPARATOR), SERVICE_LABEL),
                SERVICE_FINALIZER,
            ));
            spawn_background(
                &mut background,
                "service-owned-publicipaddresses",
                watch_owned(
                    "service",
                    pubip_api.clone(),
                    owned_predicate,
                    LabelMapper::new(NamespacedObjectLabeler::new(SERVICE_LABEL_SEPARATOR), SERVICE_LABEL),
                    owner_keys,
                ),
            );
            spawn(
                &mut watchers,
                "service",
                watch_resource(
                    Api::<Service>::all(kube_client.clone()),
                    Arc::new(reconciler),
                    Arc::new(predicate),
                    owner_stream,
                    concurrency,
                ),
            );
        }

        if options.is_enabled(ControllerKind::Node) {
            let actuator = NodeActuator::new(Arc::clone(&vms), namespace, vm_config.node_sync_period);
            let reconciler = Reconciler::new(
                ControllerKind::Node.as_str(),
                NODE_FINALIZER,
                Arc::new(actuator),
                Arc::clone(&nodes),
            )
            .with_ensure_deleted(Arc::new(node_prototype));

            let (owner_keys, owner_stream) = unbounded();
            let owned_predicate: Arc<dyn Predicate<VirtualMachine>> = Arc::new(OwnedObjectPredicate::new(
                Arc::clone(&nodes),
                LabelMapper::new(ClusterObjectLabeler, NODE_LABEL),
                NODE_FINALIZER,
            ));
            spawn_background(
                &mut background,
                "node-owned-virtualmachines",
                watch_owned(
                    "node",
                    vm_api.clone(),
                    owned_predicate,
                    LabelMapper::new(ClusterObjectLabeler, NODE_LABEL),
                    owner_keys,
                ),
            );
            spawn(
                &mut watchers,
                "node",
                watch_resource(
                    Api::<Node>::all(kube_client.clone()),
                    Arc::new(reconciler),
                    Arc::new(NodePredicate::new()),
                    owner_stream,
                    concurrency,
                ),
            );
        }

        if options.is_enabled(ControllerKind::PublicIPAddress) {
            let actuator = PublicIPAddressActuator::new(
                Arc::clone(&pubips),
                Arc::clone(&pubip_utils),
                pubip_config.clone(),
                Arc::clone(&clock),
                Arc::clone(&metrics),
            );
            let reconciler = Reconciler::new(
                ControllerKind::PublicIPAddress.as_str(),
                PUBLIC_IP_ADDRESS_FINALIZER,
                Arc::new(actuator),
                Arc::clone(&pubips),
            );
            spawn(
                &mut watchers,
                "publicipaddress",
                watch_resource(
                    pubip_api,
                    Arc::new(reconciler),
                    Arc::new(GenerationChangedPredicate),
                    no_owner_keys(),
                    concurrency,
                ),
            );
        }

        if options.is_enabled(ControllerKind::VirtualMachine) {
            let actuator = VirtualMachineActuator::new(
                Arc::clone(&vms),
                vm_utils,
                vm_config.clone(),
                clock,
                Arc::clone(&metrics),
            );
            let reconciler = Reconciler::new(
                ControllerKind::VirtualMachine.as_str(),
                VIRTUAL_MACHINE_FINALIZER,
                Arc::new(actuator),
                vms,
            );
            spawn(
                &mut watchers,
                "virtualmachine",
                watch_resource(
                    vm_api,
                    Arc::new(reconciler),
                    Arc::new(GenerationChangedPredicate),
                    no_owner_keys(),
                    concurrency,
                ),
            );
        }

        if watchers.is_empty() {
            return Err(ControllerError::InvalidConfig("all controllers are disabled".to_string()));
        }

        if pubip_config.sweep.enabled {
            let name_filter = if pubip_config.sweep.name_filter.is_empty() {
                azure_client.credentials().resource_group.clone()
            } else {
                pubip_config.sweep.name_filter.clone()
            };
            let sweeper = OrphanedPublicIPSweeper::new(
                services,
                pubip_utils,
                name_filter,
                pubip_config.sweep.interval,
                Arc::clone(&metrics),
            );
            background.push(("orphaned-public-ip-sweep", tokio::spawn(sweeper.run())));
        }

        let metrics_server = tokio::spawn(run_metrics_server(metrics, options.metrics_bind_address));

        Ok(Self {
            watchers,
            background,
            metrics_server,
        })
    }

    /// Runs the controllers until shutdown or until one of them fails.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!(
            controllers = ?self.watchers.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "Remedy controller running"
        );

        let (names, handles): (Vec<_>, Vec<_>) = std::mem::take(&mut self.watchers).into_iter().unzip();
        let mut watchers = select_all(handles);
        let exit = tokio::select! {
            () = shutdown_signal() => Exit::Signal,
            (result, index, remaining) = &mut watchers => Exit::Watcher(result, index, remaining),
            result = &mut self.metrics_server => Exit::MetricsServer(result),
        };

        let result = match exit {
            Exit::Signal => {
                info!("Shutdown signal received, stopping controllers");
                // The controllers stop on the same signal; give them time to finish
                let handles = watchers.into_inner();
                if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, join_all(handles)).await.is_err() {
                    warn!("Controllers did not stop within {:?}", SHUTDOWN_GRACE_PERIOD);
                }
                Ok(())
            }
            Exit::Watcher(result, index, remaining) => {
                for handle in remaining {
                    handle.abort();
                }
                let name = names.get(index).copied().unwrap_or("unknown");
                match result {
                    Ok(Ok(())) => {
                        info!(controller = name, "Controller stopped");
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        error!(controller = name, "Controller failed: {}", e);
                        Err(e)
                    }
                    Err(e) => Err(ControllerError::Watch(format!("{name} watcher panicked: {e}"))),
                }
            }
            Exit::MetricsServer(result) => match result {
                Ok(Ok(())) => Err(ControllerError::Metrics("metrics server stopped".to_string())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ControllerError::Metrics(format!("metrics server panicked: {e}"))),
            },
        };

        for (name, handle) in self.background.drain(..) {
            info!(task = name, "Stopping background task");
            handle.abort();
        }
        self.metrics_server.abort();
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
