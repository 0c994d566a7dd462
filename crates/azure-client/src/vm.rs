//! Virtual machine operations

use crate::client::{AzureClient, COMPUTE_API_VERSION};
use crate::error::AzureError;
use crate::models::VirtualMachine;
use crate::utils_trait::VirtualMachineUtils;
use std::sync::Arc;

/// [`VirtualMachineUtils`] backed by Azure Resource Manager
#[derive(Debug, Clone)]
pub struct AzureVirtualMachineUtils {
    client: Arc<AzureClient>,
}

impl AzureVirtualMachineUtils {
    /// Create utils over the given client
    pub fn new(client: Arc<AzureClient>) -> Self {
        Self { client }
    }

    fn virtual_machine_url(&self, name: &str, action: Option<&str>) -> String {
        let mut path = format!("Microsoft.Compute/virtualMachines/{name}");
        if let Some(action) = action {
            path.push('/');
            path.push_str(action);
        }
        format!(
            "{}?api-version={COMPUTE_API_VERSION}",
            self.client.resource_group_url(&path)
        )
    }
}

#[async_trait::async_trait]
impl VirtualMachineUtils for AzureVirtualMachineUtils {
    async fn get(&self, name: &str) -> Result<Option<VirtualMachine>, AzureError> {
        let url = format!("{}&$expand=instanceView", self.virtual_machine_url(name, None));
        match self.client.get(&url).await {
            Ok(vm) => Ok(Some(vm)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context("could not get Azure VirtualMachine")),
        }
    }

    async fn reapply(&self, name: &str) -> Result<(), AzureError> {
        self.client
            .post(&self.virtual_machine_url(name, Some("reapply")))
            .await
            .map_err(|e| e.context("could not reapply Azure VirtualMachine"))
    }
}
