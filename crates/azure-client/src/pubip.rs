//! Public IP address operations
//!
//! The load balancer mutation is a read-modify-write of a single document. The
//! three `update_*` functions edit an in-memory copy; the result is submitted
//! with one PUT.

use crate::client::{AzureClient, NETWORK_API_VERSION};
use crate::error::AzureError;
use crate::models::{ListResult, LoadBalancer, PublicIPAddress};
use crate::utils_trait::PublicIPAddressUtils;
use std::sync::Arc;
use tracing::{debug, info};

/// [`PublicIPAddressUtils`] backed by Azure Resource Manager
#[derive(Debug, Clone)]
pub struct AzurePublicIPAddressUtils {
    client: Arc<AzureClient>,
}

impl AzurePublicIPAddressUtils {
    /// Create utils over the given client
    pub fn new(client: Arc<AzureClient>) -> Self {
        Self { client }
    }

    fn public_ip_addresses_url(&self) -> String {
        format!(
            "{}?api-version={NETWORK_API_VERSION}",
            self.client.resource_group_url("Microsoft.Network/publicIPAddresses")
        )
    }

    fn public_ip_address_url(&self, name: &str) -> String {
        format!(
            "{}?api-version={NETWORK_API_VERSION}",
            self.client
                .resource_group_url(&format!("Microsoft.Network/publicIPAddresses/{name}"))
        )
    }

    fn load_balancer_url(&self) -> String {
        let name = self.client.credentials().load_balancer_name();
        format!(
            "{}?api-version={NETWORK_API_VERSION}",
            self.client
                .resource_group_url(&format!("Microsoft.Network/loadBalancers/{name}"))
        )
    }

    /// Fetch one page of the public IP address listing
    async fn list_page(&self, url: &str) -> Result<ListResult<PublicIPAddress>, AzureError> {
        self.client
            .get(url)
            .await
            .map_err(|e| e.context("could not list Azure PublicIPAddresses"))
    }
}

#[async_trait::async_trait]
impl PublicIPAddressUtils for AzurePublicIPAddressUtils {
    async fn get_by_name(&self, name: &str) -> Result<Option<PublicIPAddress>, AzureError> {
        match self.client.get(&self.public_ip_address_url(name)).await {
            Ok(ip) => Ok(Some(ip)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context("could not get Azure PublicIPAddress")),
        }
    }

    async fn get_by_ip(&self, ip: &str) -> Result<Option<PublicIPAddress>, AzureError> {
        let mut next = Some(self.public_ip_addresses_url());
        while let Some(url) = next {
            let page = self.list_page(&url).await?;
            if let Some(found) = page.value.into_iter().find(|p| p.ip_address() == Some(ip)) {
                return Ok(Some(found));
            }
            next = page.next_link.filter(|l| !l.is_empty());
        }
        Ok(None)
    }

    async fn get_all(&self) -> Result<Vec<PublicIPAddress>, AzureError> {
        let mut all = Vec::new();
        let mut next = Some(self.public_ip_addresses_url());
        while let Some(url) = next {
            let page = self.list_page(&url).await?;
            all.extend(page.value);
            next = page.next_link.filter(|l| !l.is_empty());
        }
        Ok(all)
    }

    async fn remove_from_load_balancer(&self, public_ip_address_ids: &[String]) -> Result<(), AzureError> {
        let url = self.load_balancer_url();
        let mut lb: LoadBalancer = self
            .client
            .get(&url)
            .await
            .map_err(|e| e.context("could not get Azure LoadBalancer"))?;

        let fc_ids = update_frontend_ip_configurations(&mut lb, public_ip_address_ids);
        if fc_ids.is_empty() {
            debug!("No frontend IP configurations use {:?}", public_ip_address_ids);
            return Ok(());
        }
        let rule_ids = update_load_balancing_rules(&mut lb, &fc_ids);
        update_probes(&mut lb, &rule_ids);

        info!(
            "Removing {} frontend IP configuration(s) and {} rule(s) from Azure LoadBalancer",
            fc_ids.len(),
            rule_ids.len()
        );
        self.client
            .put(&url, &lb)
            .await
            .map_err(|e| e.context("could not update Azure LoadBalancer"))
    }

    async fn delete(&self, name: &str) -> Result<(), AzureError> {
        match self.client.delete(&self.public_ip_address_url(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context("could not delete Azure PublicIPAddress")),
        }
    }
}

/// Drops the frontend IP configurations backed by any of the given public IP
/// address IDs. Returns the IDs of the dropped configurations.
pub fn update_frontend_ip_configurations(lb: &mut LoadBalancer, public_ip_address_ids: &[String]) -> Vec<String> {
    let Some(fcs) = lb
        .properties
        .as_mut()
        .and_then(|p| p.frontend_ip_configurations.as_mut())
    else {
        return Vec::new();
    };

    let mut fc_ids = Vec::new();
    fcs.retain(|fc| match (fc.id.as_deref(), fc.public_ip_address_id()) {
        (Some(id), Some(ip_id)) if public_ip_address_ids.iter().any(|i| i == ip_id) => {
            fc_ids.push(id.to_string());
            false
        }
        _ => true,
    });
    fc_ids
}

/// Drops the load balancing rules that use any of the given frontend IP
/// configuration IDs. Returns the IDs of the dropped rules.
pub fn update_load_balancing_rules(lb: &mut LoadBalancer, fc_ids: &[String]) -> Vec<String> {
    let Some(rules) = lb
        .properties
        .as_mut()
        .and_then(|p| p.load_balancing_rules.as_mut())
    else {
        return Vec::new();
    };

    let mut rule_ids = Vec::new();
    rules.retain(|rule| match (rule.id.as_deref(), rule.frontend_ip_configuration_id()) {
        (Some(id), Some(fc_id)) if fc_ids.iter().any(|i| i == fc_id) => {
            rule_ids.push(id.to_string());
            false
        }
        _ => true,
    });
    rule_ids
}

/// Drops the probes that are only used by the given load balancing rules.
pub fn update_probes(lb: &mut LoadBalancer, rule_ids: &[String]) {
    let Some(probes) = lb.properties.as_mut().and_then(|p| p.probes.as_mut()) else {
        return;
    };

    probes.retain(|probe| {
        let mut used_by = probe.load_balancing_rule_ids().peekable();
        if used_by.peek().is_none() {
            return true;
        }
        !used_by.all(|id| rule_ids.iter().any(|r| r == id))
    });
}
