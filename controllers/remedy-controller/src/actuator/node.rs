//! Node projector.
//!
//! Keeps one VirtualMachine record per Node, carrying the node hostname, the
//! provider ID and whether the node is not ready or unreachable.

use crate::backoff::retry_on_conflict;
use crate::client::{ObjectKey, ResourceClient, is_not_found};
use crate::error::ActuatorError;
use crate::labeler::{ClusterObjectLabeler, ObjectLabeler};
use crate::reconciler::{Actuator, Outcome};
use async_trait::async_trait;
use crds::constants::NODE_LABEL;
use crds::{VirtualMachine, VirtualMachineSpec};
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Well-known label holding the node hostname
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Taint set by the node lifecycle controller on unreachable nodes
pub const UNREACHABLE_TAINT_KEY: &str = "node.kubernetes.io/unreachable";

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|condition| condition.status == "True")
}

fn is_node_unreachable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == UNREACHABLE_TAINT_KEY))
}

/// Whether the node is not Ready or carries the unreachable taint
pub fn is_node_not_ready_or_unreachable(node: &Node) -> bool {
    !is_node_ready(node) || is_node_unreachable(node)
}

/// Spec of the VirtualMachine record of a node
pub fn virtual_machine_spec(node: &Node) -> VirtualMachineSpec {
    VirtualMachineSpec {
        hostname: node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(HOSTNAME_LABEL))
            .cloned()
            .unwrap_or_default(),
        provider_id: node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.clone())
            .unwrap_or_default(),
        not_ready_or_unreachable: is_node_not_ready_or_unreachable(node),
    }
}

/// Projects Nodes into VirtualMachine records.
pub struct NodeActuator {
    client: Arc<dyn ResourceClient<VirtualMachine>>,
    namespace: String,
    sync_period: Duration,
}

impl std::fmt::Debug for NodeActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeActuator")
            .field("namespace", &self.namespace)
            .field("sync_period", &self.sync_period)
            .finish_non_exhaustive()
    }
}

impl NodeActuator {
    /// Create a node projector writing records into `namespace`
    pub fn new(
        client: Arc<dyn ResourceClient<VirtualMachine>>,
        namespace: impl Into<String>,
        sync_period: Duration,
    ) -> Self {
        let namespace = namespace.into();
        info!(%namespace, ?sync_period, "Creating node actuator");
        Self {
            client,
            namespace,
            sync_period,
        }
    }

    fn record_key(&self, node: &Node) -> ObjectKey {
        ObjectKey::namespaced(
            self.namespace.as_str(),
            node.metadata.name.as_deref().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl Actuator<Node> for NodeActuator {
    async fn create_or_update(&self, node: &Node) -> Result<Outcome, ActuatorError> {
        let key = self.record_key(node);
        let label_value = ClusterObjectLabeler.label_value(&node.metadata);
        let spec = virtual_machine_spec(node);
        let client = &self.client;
        let (key, label_value, spec) = (&key, &label_value, &spec);

        retry_on_conflict(|_| async move {
            match client.get(key).await? {
                None => {
                    info!(name = %key.name, namespace = ?key.namespace, "Creating virtualmachine");
                    let mut vm = VirtualMachine::new(&key.name, spec.clone());
                    vm.metadata.namespace = key.namespace.clone();
                    vm.metadata.labels = Some(BTreeMap::from([(NODE_LABEL.to_string(), label_value.clone())]));
                    client.create(&vm).await.map(|_| ())
                }
                Some(existing) => {
                    let labelled = existing
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(NODE_LABEL))
                        == Some(label_value);
                    if labelled && existing.spec == *spec {
                        debug!(name = %key.name, "Virtualmachine is up to date");
                        return Ok(());
                    }
                    info!(
                        name = %key.name,
                        namespace = ?key.namespace,
                        not_ready_or_unreachable = spec.not_ready_or_unreachable,
                        "Updating virtualmachine"
                    );
                    let patch = serde_json::json!({
                        "metadata": {
                            "resourceVersion": existing.metadata.resource_version,
                            "labels": { NODE_LABEL: label_value },
                        },
                        "spec": spec,
                    });
                    client.patch(key, &patch).await.map(|_| ())
                }
            }
        })
        .await
        .map_err(|e| ActuatorError::from(e).context("could not create or update virtualmachine"))?;

        Ok(Outcome::Done(self.sync_period))
    }

    async fn delete(&self, node: &Node) -> Result<Outcome, ActuatorError> {
        let key = self.record_key(node);
        info!(name = %key.name, namespace = ?key.namespace, "Deleting virtualmachine");
        match self.client.delete(&key).await {
            Err(e) if !is_not_found(&e) => {
                Err(ActuatorError::from(e).context("could not delete virtualmachine"))
            }
            _ => Ok(Outcome::done()),
        }
    }

    async fn should_finalize(&self, _node: &Node) -> Result<bool, ActuatorError> {
        Ok(true)
    }
}
