//! Azure utility traits for mocking
//!
//! These traits abstract the Azure operations the remediation actuators need.
//! The concrete implementations talk to Azure Resource Manager, tests use the
//! in-memory mocks from the `test-util` feature.

use crate::error::AzureError;
use crate::models::{PublicIPAddress, VirtualMachine};

/// Getting and cleaning Azure public IP addresses
///
/// A resource that does not exist is `Ok(None)`, never an error.
#[async_trait::async_trait]
pub trait PublicIPAddressUtils: Send + Sync {
    /// Returns the public IP address with the given name.
    async fn get_by_name(&self, name: &str) -> Result<Option<PublicIPAddress>, AzureError>;

    /// Returns the first public IP address whose address equals `ip`.
    async fn get_by_ip(&self, ip: &str) -> Result<Option<PublicIPAddress>, AzureError>;

    /// Returns all public IP addresses of the resource group.
    async fn get_all(&self) -> Result<Vec<PublicIPAddress>, AzureError>;

    /// Removes all frontend IP configurations, load balancing rules and probes
    /// using the given public IP address IDs from the load balancer.
    async fn remove_from_load_balancer(&self, public_ip_address_ids: &[String]) -> Result<(), AzureError>;

    /// Deletes the public IP address with the given name. Deleting an absent
    /// address succeeds.
    async fn delete(&self, name: &str) -> Result<(), AzureError>;
}

/// Getting and reapplying Azure virtual machines
#[async_trait::async_trait]
pub trait VirtualMachineUtils: Send + Sync {
    /// Returns the virtual machine with the given name, including its instance view.
    async fn get(&self, name: &str) -> Result<Option<VirtualMachine>, AzureError>;

    /// Reapplies the state of the virtual machine with the given name.
    async fn reapply(&self, name: &str) -> Result<(), AzureError>;
}
