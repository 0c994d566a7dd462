//! PublicIPAddress remediator.
//!
//! Looks up the Azure public IP address of each record and mirrors it into the
//! record status. When a record is deleted and the Azure address is still
//! there after the deletion grace period, the address is removed from the load
//! balancer and deleted.

use super::{failure_outcome, update_status};
use crate::client::ResourceClient;
use crate::clock::{Clock, to_date_time};
use crate::config::OrphanedPublicIPRemedyConfiguration;
use crate::error::ActuatorError;
use crate::metrics::Metrics;
use crate::reconciler::{Actuator, Outcome};
use async_trait::async_trait;
use azure_client::{AzureError, PublicIPAddressUtils, is_terminal_provisioning_state};
use chrono::{DateTime, Utc};
use crds::constants::{DO_NOT_CLEAN_ANNOTATION, annotation_is_true};
use crds::{
    FailedOperation, OperationType, PublicIPAddress, PublicIPAddressStatus, add_or_update_failed_operation,
    delete_failed_operation,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

type AzurePublicIPAddress = azure_client::PublicIPAddress;

/// Result of looking up the Azure address of a record
enum Lookup {
    /// The lookup succeeded and the status was written
    Done(Option<AzurePublicIPAddress>, PublicIPAddressStatus),
    /// The lookup failed and was recorded; return the outcome as is
    Failed(Outcome),
}

/// Remediates PublicIPAddress records.
pub struct PublicIPAddressActuator {
    client: Arc<dyn ResourceClient<PublicIPAddress>>,
    utils: Arc<dyn PublicIPAddressUtils>,
    config: OrphanedPublicIPRemedyConfiguration,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for PublicIPAddressActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIPAddressActuator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Status mirroring `azure_ip`. When the address is gone the last known ID
/// and name are kept.
fn public_ip_address_status(
    azure_ip: Option<&AzurePublicIPAddress>,
    previous: &PublicIPAddressStatus,
    failed_operations: Vec<FailedOperation>,
) -> PublicIPAddressStatus {
    match azure_ip {
        Some(ip) => PublicIPAddressStatus {
            exists: true,
            id: ip.id.clone(),
            name: ip.name.clone(),
            provisioning_state: ip.provisioning_state().map(str::to_string),
            failed_operations,
        },
        None => PublicIPAddressStatus {
            exists: false,
            id: previous.id.clone(),
            name: previous.name.clone(),
            provisioning_state: None,
            failed_operations,
        },
    }
}

impl PublicIPAddressActuator {
    /// Create a PublicIPAddress remediator
    ///
    /// # Arguments
    /// * `client` - Access to PublicIPAddress records
    /// * `utils` - Azure public IP address operations
    /// * `config` - Orphaned public IP remedy configuration
    /// * `clock` - Time source for failed operations and the deletion grace period
    /// * `metrics` - Metrics, `cleaned_azure_public_ips_total` is incremented per clean
    pub fn new(
        client: Arc<dyn ResourceClient<PublicIPAddress>>,
        utils: Arc<dyn PublicIPAddressUtils>,
        config: OrphanedPublicIPRemedyConfiguration,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!(?config, "Creating publicipaddress actuator");
        Self {
            client,
            utils,
            config,
            clock,
            metrics,
        }
    }

    /// Look up by the Azure name once it is known, by IP before that
    async fn get_azure_public_ip_address(
        &self,
        pubip: &PublicIPAddress,
    ) -> Result<Option<AzurePublicIPAddress>, AzureError> {
        match pubip.status.as_ref().and_then(|s| s.name.as_deref()) {
            Some(name) if !name.is_empty() => self.utils.get_by_name(name).await,
            _ => self.utils.get_by_ip(&pubip.spec.ip_address).await,
        }
    }

    /// Look up the Azure address and write the result into the status
    async fn refresh_status(&self, pubip: &PublicIPAddress) -> Result<Lookup, ActuatorError> {
        let previous = pubip.status.clone().unwrap_or_default();
        let mut failed_operations = previous.failed_operations.clone();

        let azure_ip = match self.get_azure_public_ip_address(pubip).await {
            Ok(azure_ip) => azure_ip,
            Err(e) => {
                let failed_operation = add_or_update_failed_operation(
                    &mut failed_operations,
                    OperationType::GetPublicIPAddress,
                    e.to_string(),
                    self.clock.now(),
                );
                warn!(
                    name = pubip.metadata.name.as_deref().unwrap_or_default(),
                    attempts = failed_operation.attempts,
                    "Could not get Azure public IP address: {}",
                    e
                );
                let status = PublicIPAddressStatus {
                    failed_operations,
                    ..previous
                };
                update_status(self.client.as_ref(), pubip, &status).await?;
                return Ok(Lookup::Failed(failure_outcome(
                    &failed_operation,
                    self.config.max_get_attempts,
                    self.config.requeue_interval,
                    Outcome::done(),
                )));
            }
        };

        delete_failed_operation(&mut failed_operations, OperationType::GetPublicIPAddress);
        let status = public_ip_address_status(azure_ip.as_ref(), &previous, failed_operations);
        debug!(name = pubip.metadata.name.as_deref().unwrap_or_default(), ?status, "Updating publicipaddress status");
        update_status(self.client.as_ref(), pubip, &status).await?;
        Ok(Lookup::Done(azure_ip, status))
    }

    fn deletion_grace_period_elapsed(&self, pubip: &PublicIPAddress) -> bool {
        let Some(deleted_at) = pubip.metadata.deletion_timestamp.as_ref().and_then(to_date_time) else {
            return false;
        };
        let Ok(grace) = chrono::Duration::from_std(self.config.deletion_grace_period) else {
            return false;
        };
        let expires_at: DateTime<Utc> = deleted_at + grace;
        self.clock.now() > expires_at
    }

    async fn clean(&self, id: &str, name: &str) -> Result<(), AzureError> {
        info!(id, "Removing Azure public IP address from the load balancer");
        self.utils.remove_from_load_balancer(&[id.to_string()]).await?;
        info!(name, "Deleting Azure public IP address");
        self.utils.delete(name).await
    }
}

#[async_trait]
impl Actuator<PublicIPAddress> for PublicIPAddressActuator {
    async fn create_or_update(&self, pubip: &PublicIPAddress) -> Result<Outcome, ActuatorError> {
        let azure_ip = match self.refresh_status(pubip).await? {
            Lookup::Done(azure_ip, _) => azure_ip,
            Lookup::Failed(outcome) => return Ok(outcome),
        };

        // Requeue while the address is missing or still provisioning
        let terminal = azure_ip
            .as_ref()
            .is_some_and(|ip| is_terminal_provisioning_state(ip.provisioning_state()));
        if terminal {
            Ok(Outcome::done())
        } else {
            Ok(Outcome::Done(self.config.requeue_interval))
        }
    }

    async fn delete(&self, pubip: &PublicIPAddress) -> Result<Outcome, ActuatorError> {
        let name = pubip.metadata.name.as_deref().unwrap_or_default();
        let (azure_ip, mut status) = match self.refresh_status(pubip).await? {
            Lookup::Done(azure_ip, status) => (azure_ip, status),
            Lookup::Failed(outcome) => return Ok(outcome),
        };

        let Some(azure_ip) = azure_ip else {
            debug!(name, "Azure public IP address does not exist");
            return Ok(Outcome::done());
        };

        if annotation_is_true(pubip.metadata.annotations.as_ref(), DO_NOT_CLEAN_ANNOTATION) {
            info!(name, "Publicipaddress is annotated with do-not-clean, releasing it");
            return Ok(Outcome::done());
        }

        if !self.deletion_grace_period_elapsed(pubip) {
            return Ok(Outcome::RequeueAfter(
                self.config.requeue_interval,
                "public IP address still exists".to_string(),
            ));
        }

        let (Some(id), Some(azure_name)) = (azure_ip.id.as_deref(), azure_ip.name.as_deref()) else {
            warn!(name, "Azure public IP address has no ID or name, not cleaning it");
            return Ok(Outcome::done());
        };

        if let Err(e) = self.clean(id, azure_name).await {
            let failed_operation = add_or_update_failed_operation(
                &mut status.failed_operations,
                OperationType::CleanPublicIPAddress,
                e.to_string(),
                self.clock.now(),
            );
            warn!(name, attempts = failed_operation.attempts, "Could not clean Azure public IP address: {}", e);
            update_status(self.client.as_ref(), pubip, &status).await?;
            return Ok(failure_outcome(
                &failed_operation,
                self.config.max_clean_attempts,
                self.config.requeue_interval,
                Outcome::done(),
            ));
        }

        info!(name, azure_name, "Cleaned Azure public IP address");
        self.metrics.cleaned_public_ips.inc();
        delete_failed_operation(&mut status.failed_operations, OperationType::CleanPublicIPAddress);
        let status = PublicIPAddressStatus {
            exists: false,
            provisioning_state: None,
            ..status
        };
        update_status(self.client.as_ref(), pubip, &status).await?;
        Ok(Outcome::done())
    }

    async fn should_finalize(&self, _pubip: &PublicIPAddress) -> Result<bool, ActuatorError> {
        Ok(true)
    }
}
