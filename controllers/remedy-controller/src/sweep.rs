//! Periodic sweep of orphaned Azure public IP addresses.
//!
//! Complements the per-record remediation: every public IP address of the
//! resource group whose name matches the filter and whose address is not the
//! ingress IP of any LoadBalancer Service is removed from the load balancer and
//! deleted. Failed sweeps are retried with Fibonacci backoff.

use crate::backoff::FibonacciBackoff;
use crate::actuator::service::service_load_balancer_ips;
use crate::client::ResourceClient;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use azure_client::{PublicIPAddress as AzurePublicIPAddress, PublicIPAddressUtils};
use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Minimum backoff between failed sweeps, in seconds
const MIN_BACKOFF_SECONDS: u64 = 1;
/// Maximum backoff between failed sweeps, in seconds
const MAX_BACKOFF_SECONDS: u64 = 300;

/// Public IP addresses matching `name_filter` that no service claims.
///
/// An address without an allocated IP is always an orphan.
pub fn find_orphans<'a>(
    public_ips: &'a [AzurePublicIPAddress],
    known_ips: &BTreeSet<String>,
    name_filter: &str,
) -> Vec<&'a AzurePublicIPAddress> {
    public_ips
        .iter()
        .filter(|pubip| pubip.name.as_deref().is_some_and(|name| name.contains(name_filter)))
        .filter(|pubip| pubip.ip_address().is_none_or(|ip| !known_ips.contains(ip)))
        .collect()
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Orphaned addresses found
    pub orphans: usize,
    /// Orphaned addresses deleted
    pub deleted: usize,
}

/// Deletes public IP addresses that no LoadBalancer Service uses.
pub struct OrphanedPublicIPSweeper {
    services: Arc<dyn ResourceClient<Service>>,
    utils: Arc<dyn PublicIPAddressUtils>,
    name_filter: String,
    interval: Duration,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for OrphanedPublicIPSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanedPublicIPSweeper")
            .field("name_filter", &self.name_filter)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl OrphanedPublicIPSweeper {
    /// Create a sweeper
    ///
    /// # Arguments
    /// * `services` - Access to Services in all namespaces
    /// * `utils` - Azure public IP address operations
    /// * `name_filter` - Only addresses whose name contains this are considered
    /// * `interval` - Time between successful sweeps
    /// * `metrics` - Receives the count of deleted addresses
    pub fn new(
        services: Arc<dyn ResourceClient<Service>>,
        utils: Arc<dyn PublicIPAddressUtils>,
        name_filter: impl Into<String>,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            services,
            utils,
            name_filter: name_filter.into(),
            interval,
            metrics,
        }
    }

    async fn known_ips(&self) -> Result<BTreeSet<String>, ControllerError> {
        let services = self.services.list(None, "").await?;
        Ok(services.iter().flat_map(service_load_balancer_ips).collect())
    }

    /// Run one sweep
    pub async fn sweep(&self) -> Result<SweepSummary, ControllerError> {
        let known_ips = self.known_ips().await?;
        let public_ips = self.utils.get_all().await?;
        let orphans = find_orphans(&public_ips, &known_ips, &self.name_filter);
        debug!(count = public_ips.len(), "Azure public IP addresses");
        info!(
            known = known_ips.len(),
            orphans = orphans.len(),
            "Sweeping orphaned public IP addresses"
        );

        let mut summary = SweepSummary {
            orphans: orphans.len(),
            deleted: 0,
        };
        if orphans.is_empty() {
            return Ok(summary);
        }

        let ids: Vec<String> = orphans.iter().filter_map(|pubip| pubip.id.clone()).collect();
        self.utils.remove_from_load_balancer(&ids).await?;

        for name in orphans.iter().filter_map(|pubip| pubip.name.as_deref()) {
            info!(name, "Deleting orphaned public IP address");
            match self.utils.delete(name).await {
                Ok(()) => {
                    self.metrics.cleaned_public_ips.inc();
                    summary.deleted += 1;
                }
                Err(e) => warn!(name, "Could not delete orphaned public IP address: {}", e),
            }
        }
        Ok(summary)
    }

    /// Sweep until the task is dropped
    pub async fn run(self) {
        info!(
            name_filter = %self.name_filter,
            interval = ?self.interval,
            "Starting orphaned public IP address sweep"
        );
        let mut backoff = FibonacciBackoff::new(MIN_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS);
        loop {
            let delay = match self.sweep().await {
                Ok(summary) => {
                    info!(orphans = summary.orphans, deleted = summary.deleted, "Sweep completed");
                    backoff.reset();
                    self.interval
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    error!(retry_in = ?delay, "Sweep failed: {}", e);
                    delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockOperation, MockResourceClient, create_test_service};
    use azure_client::MockPublicIPAddressUtils;
    use azure_client::mock::{PublicIPAddressCall, PublicIPAddressOperation, public_ip_address, public_ip_address_id};

    const NAME_FILTER: &str = "shoot--dev--test";

    fn pubip(suffix: &str, ip: Option<&str>) -> AzurePublicIPAddress {
        public_ip_address(&format!("{NAME_FILTER}-{suffix}"), ip, "Succeeded")
    }

    fn sweeper(
        services: &Arc<MockResourceClient<Service>>,
        utils: &Arc<MockPublicIPAddressUtils>,
        metrics: &Arc<Metrics>,
    ) -> OrphanedPublicIPSweeper {
        OrphanedPublicIPSweeper::new(
            Arc::clone(services) as Arc<dyn ResourceClient<Service>>,
            Arc::clone(utils) as Arc<dyn PublicIPAddressUtils>,
            NAME_FILTER,
            Duration::from_secs(24 * 60 * 60),
            Arc::clone(metrics),
        )
    }

    #[test]
    fn test_find_orphans() {
        let public_ips = vec![
            pubip("known", Some("1.2.3.4")),
            pubip("unknown", Some("5.6.7.8")),
            pubip("unallocated", None),
            public_ip_address("other-cluster", Some("9.9.9.9"), "Succeeded"),
        ];
        let known = BTreeSet::from(["1.2.3.4".to_string()]);

        let names: Vec<&str> = find_orphans(&public_ips, &known, NAME_FILTER)
            .into_iter()
            .filter_map(|pubip| pubip.name.as_deref())
            .collect();

        assert_eq!(
            names,
            vec!["shoot--dev--test-unknown", "shoot--dev--test-unallocated"]
        );
    }

    #[tokio::test]
    async fn test_sweep_deletes_orphans() {
        let services = Arc::new(MockResourceClient::with_objects([create_test_service(
            "test",
            "svc1",
            &["1.2.3.4"],
        )]));
        let utils = Arc::new(MockPublicIPAddressUtils::new());
        utils.add_public_ip_address(pubip("known", Some("1.2.3.4")));
        utils.add_public_ip_address(pubip("orphan", Some("5.6.7.8")));
        let metrics = Arc::new(Metrics::new().unwrap());

        let summary = sweeper(&services, &utils, &metrics).sweep().await.unwrap();

        assert_eq!(summary, SweepSummary { orphans: 1, deleted: 1 });
        let orphan = format!("{NAME_FILTER}-orphan");
        assert_eq!(
            utils.calls(),
            vec![
                PublicIPAddressCall::GetAll,
                PublicIPAddressCall::RemoveFromLoadBalancer(vec![public_ip_address_id(&orphan)]),
                PublicIPAddressCall::Delete(orphan),
            ]
        );
        assert_eq!(utils.public_ip_addresses(), vec![pubip("known", Some("1.2.3.4"))]);
        assert_eq!(metrics.cleaned_public_ips.get(), 1);
    }

    #[tokio::test]
    async fn test_sweep_without_orphans_leaves_load_balancer_alone() {
        let services = Arc::new(MockResourceClient::with_objects([create_test_service(
            "test",
            "svc1",
            &["1.2.3.4"],
        )]));
        let utils = Arc::new(MockPublicIPAddressUtils::new());
        utils.add_public_ip_address(pubip("known", Some("1.2.3.4")));
        let metrics = Arc::new(Metrics::new().unwrap());

        let summary = sweeper(&services, &utils, &metrics).sweep().await.unwrap();

        assert_eq!(summary, SweepSummary::default());
        assert_eq!(utils.calls(), vec![PublicIPAddressCall::GetAll]);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_fail_the_sweep() {
        let services = Arc::new(MockResourceClient::<Service>::new());
        let utils = Arc::new(MockPublicIPAddressUtils::new());
        utils.add_public_ip_address(pubip("a", Some("1.1.1.1")));
        utils.add_public_ip_address(pubip("b", Some("2.2.2.2")));
        utils.fail(PublicIPAddressOperation::Delete, 1, "boom");
        let metrics = Arc::new(Metrics::new().unwrap());

        let summary = sweeper(&services, &utils, &metrics).sweep().await.unwrap();

        assert_eq!(summary, SweepSummary { orphans: 2, deleted: 1 });
        assert_eq!(utils.public_ip_addresses(), vec![pubip("a", Some("1.1.1.1"))]);
    }

    #[tokio::test]
    async fn test_sweep_errors() {
        let services = Arc::new(MockResourceClient::<Service>::new());
        services.fail(MockOperation::List, 1, 500, "InternalError");
        let utils = Arc::new(MockPublicIPAddressUtils::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let sweeper = sweeper(&services, &utils, &metrics);

        assert!(matches!(sweeper.sweep().await, Err(ControllerError::Kube(_))));
        assert!(utils.calls().is_empty());

        utils.add_public_ip_address(pubip("orphan", None));
        utils.fail(PublicIPAddressOperation::RemoveFromLoadBalancer, 1, "boom");
        assert!(matches!(sweeper.sweep().await, Err(ControllerError::Azure(_))));
        // Nothing is deleted while the load balancer still references the address
        assert_eq!(utils.public_ip_addresses().len(), 1);
    }
}
