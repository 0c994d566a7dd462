//! Service projector.
//!
//! Keeps one PublicIPAddress record per load balancer ingress IP of every
//! LoadBalancer Service, and removes records whose IP went away.

use crate::backoff::retry_on_conflict;
use crate::client::{ObjectKey, ResourceClient, is_not_found};
use crate::error::ActuatorError;
use crate::labeler::{NamespacedObjectLabeler, ObjectLabeler};
use crate::reconciler::{Actuator, Outcome};
use async_trait::async_trait;
use crds::constants::{DO_NOT_CLEAN_ANNOTATION, IGNORE_ANNOTATION, SERVICE_LABEL, annotation_is_true};
use crds::{PublicIPAddress, PublicIPAddressSpec};
use k8s_openapi::api::core::v1::Service;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Separator between namespace and name in the service label value
pub const SERVICE_LABEL_SEPARATOR: &str = ".";

const LOAD_BALANCER_SERVICE_TYPE: &str = "LoadBalancer";

/// Ingress IPs of a LoadBalancer Service. Empty for other service types.
pub fn service_load_balancer_ips(service: &Service) -> BTreeSet<String> {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER_SERVICE_TYPE);
    if !is_load_balancer {
        return BTreeSet::new();
    }
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| ingress.ip.clone())
        .filter(|ip| !ip.is_empty())
        .collect()
}

/// Whether the projector leaves the service alone: it carries the ignore
/// annotation, or its labels include all labels of a blacklist entry.
pub fn should_ignore_service(service: &Service, blacklisted_labels: &[BTreeMap<String, String>]) -> bool {
    if annotation_is_true(service.metadata.annotations.as_ref(), IGNORE_ANNOTATION) {
        return true;
    }
    let Some(labels) = service.metadata.labels.as_ref() else {
        return false;
    };
    blacklisted_labels
        .iter()
        .filter(|entry| !entry.is_empty())
        .any(|entry| entry.iter().all(|(k, v)| labels.get(k) == Some(v)))
}

/// Name of the record for one ingress IP of a service
pub fn public_ip_address_name(service_namespace: &str, service_name: &str, ip: &str) -> String {
    format!("{service_namespace}-{service_name}-{ip}")
}

/// Projects Services into PublicIPAddress records.
pub struct ServiceActuator {
    client: Arc<dyn ResourceClient<PublicIPAddress>>,
    namespace: String,
    sync_period: Duration,
    blacklisted_labels: Vec<BTreeMap<String, String>>,
    labeler: NamespacedObjectLabeler,
}

impl std::fmt::Debug for ServiceActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceActuator")
            .field("namespace", &self.namespace)
            .field("sync_period", &self.sync_period)
            .field("blacklisted_labels", &self.blacklisted_labels)
            .finish_non_exhaustive()
    }
}

impl ServiceActuator {
    /// Create a service projector
    ///
    /// # Arguments
    /// * `client` - Access to PublicIPAddress records
    /// * `namespace` - Namespace the records are created in
    /// * `sync_period` - How often every service is looked at again
    /// * `blacklisted_labels` - Services matching any of these label sets are ignored
    pub fn new(
        client: Arc<dyn ResourceClient<PublicIPAddress>>,
        namespace: impl Into<String>,
        sync_period: Duration,
        blacklisted_labels: Vec<BTreeMap<String, String>>,
    ) -> Self {
        let namespace = namespace.into();
        info!(%namespace, ?sync_period, "Creating service actuator");
        Self {
            client,
            namespace,
            sync_period,
            blacklisted_labels,
            labeler: NamespacedObjectLabeler::new(SERVICE_LABEL_SEPARATOR),
        }
    }

    fn label_selector(&self, service: &Service) -> String {
        format!("{}={}", SERVICE_LABEL, self.labeler.label_value(&service.metadata))
    }

    fn record_key(&self, service: &Service, ip: &str) -> ObjectKey {
        ObjectKey::namespaced(
            self.namespace.as_str(),
            public_ip_address_name(
                service.metadata.namespace.as_deref().unwrap_or_default(),
                service.metadata.name.as_deref().unwrap_or_default(),
                ip,
            ),
        )
    }

    async fn create_or_update_record(&self, service: &Service, ip: &str) -> Result<(), kube::Error> {
        let key = self.record_key(service, ip);
        let label_value = self.labeler.label_value(&service.metadata);
        let client = &self.client;
        let (key, label_value) = (&key, &label_value);

        retry_on_conflict(|_| async move {
            match client.get(key).await? {
                None => {
                    info!(name = %key.name, namespace = ?key.namespace, "Creating publicipaddress");
                    let mut pubip = PublicIPAddress::new(
                        &key.name,
                        PublicIPAddressSpec {
                            ip_address: ip.to_string(),
                        },
                    );
                    pubip.metadata.namespace = key.namespace.clone();
                    pubip.metadata.labels = Some(BTreeMap::from([(SERVICE_LABEL.to_string(), label_value.clone())]));
                    client.create(&pubip).await.map(|_| ())
                }
                Some(existing) => {
                    let labelled = existing
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(SERVICE_LABEL))
                        == Some(label_value);
                    if labelled && existing.spec.ip_address == ip {
                        debug!(name = %key.name, "Publicipaddress is up to date");
                        return Ok(());
                    }
                    info!(name = %key.name, namespace = ?key.namespace, "Updating publicipaddress");
                    let patch = serde_json::json!({
                        "metadata": {
                            "resourceVersion": existing.metadata.resource_version,
                            "labels": { SERVICE_LABEL: label_value },
                        },
                        "spec": { "ipAddress": ip },
                    });
                    client.patch(key, &patch).await.map(|_| ())
                }
            }
        })
        .await
    }

    async fn delete_record(&self, key: &ObjectKey) -> Result<(), ActuatorError> {
        info!(name = %key.name, namespace = ?key.namespace, "Deleting publicipaddress");
        match self.client.delete(key).await {
            Err(e) if !is_not_found(&e) => {
                Err(ActuatorError::from(e).context("could not delete publicipaddress"))
            }
            _ => Ok(()),
        }
    }

    async fn list_records(&self, service: &Service) -> Result<Vec<PublicIPAddress>, ActuatorError> {
        self.client
            .list(Some(&self.namespace), &self.label_selector(service))
            .await
            .map_err(|e| ActuatorError::from(e).context("could not list publicipaddresses"))
    }

    /// Hand the records of an ignored service over without cloud cleanup
    async fn release_records(&self, service: &Service) -> Result<(), ActuatorError> {
        for pubip in self.list_records(service).await? {
            let key = ObjectKey::from_resource(&pubip);
            if !annotation_is_true(pubip.metadata.annotations.as_ref(), DO_NOT_CLEAN_ANNOTATION) {
                info!(name = %key.name, namespace = ?key.namespace, "Annotating publicipaddress with do-not-clean");
                let patch = serde_json::json!({
                    "metadata": { "annotations": { DO_NOT_CLEAN_ANNOTATION: "true" } }
                });
                match self.client.patch(&key, &patch).await {
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => return Err(ActuatorError::from(e).context("could not annotate publicipaddress")),
                    Ok(_) => {}
                }
            }
            self.delete_record(&key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator<Service> for ServiceActuator {
    async fn create_or_update(&self, service: &Service) -> Result<Outcome, ActuatorError> {
        if should_ignore_service(service, &self.blacklisted_labels) {
            info!(service = %ObjectKey::from_resource(service), "Service is ignored, releasing its publicipaddresses");
            self.release_records(service).await?;
            return Ok(Outcome::done());
        }

        let ips = service_load_balancer_ips(service);
        for ip in &ips {
            self.create_or_update_record(service, ip)
                .await
                .map_err(|e| ActuatorError::from(e).context("could not create or update publicipaddress"))?;
        }

        for pubip in self.list_records(service).await? {
            if !ips.contains(&pubip.spec.ip_address) {
                self.delete_record(&ObjectKey::from_resource(&pubip)).await?;
            }
        }

        Ok(Outcome::Done(self.sync_period))
    }

    async fn delete(&self, service: &Service) -> Result<Outcome, ActuatorError> {
        for ip in service_load_balancer_ips(service) {
            self.delete_record(&self.record_key(service, &ip)).await?;
        }

        // Records of IPs the service no longer reports, or of a service that is already gone
        for pubip in self.list_records(service).await? {
            self.delete_record(&ObjectKey::from_resource(&pubip)).await?;
        }

        Ok(Outcome::done())
    }

    async fn should_finalize(&self, service: &Service) -> Result<bool, ActuatorError> {
        Ok(!should_ignore_service(service, &self.blacklisted_labels)
            && !service_load_balancer_ips(service).is_empty())
    }
}
