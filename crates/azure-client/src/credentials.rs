//! Azure credentials file

use crate::error::AzureError;
use serde::Deserialize;
use std::path::Path;

/// Credentials and parameters needed to work with Azure resources.
///
/// Read from the cloud provider infrastructure file.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Service principal client ID
    pub aad_client_id: String,
    /// Service principal client secret
    pub aad_client_secret: String,
    /// Azure AD tenant ID
    pub tenant_id: String,
    /// Azure subscription ID
    pub subscription_id: String,
    /// Resource group holding the cluster resources
    pub resource_group: String,
    /// Name of the cluster load balancer, defaults to the resource group name
    #[serde(default)]
    pub load_balancer_name: Option<String>,
}

impl Credentials {
    /// Name of the load balancer that fronts LoadBalancer Services.
    #[must_use]
    pub fn load_balancer_name(&self) -> &str {
        self.load_balancer_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.resource_group)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("aad_client_id", &self.aad_client_id)
            .field("aad_client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("load_balancer_name", &self.load_balancer_name)
            .finish()
    }
}

/// Parses credentials from YAML.
pub fn parse_credentials(input: &str) -> Result<Credentials, AzureError> {
    serde_yaml::from_str(input)
        .map_err(|e| AzureError::Credentials(format!("could not decode Azure credentials: {e}")))
}

/// Reads credentials from the YAML file at the given path.
pub fn read_credentials(path: impl AsRef<Path>) -> Result<Credentials, AzureError> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path).map_err(|e| {
        AzureError::Credentials(format!("could not open configuration file {}: {e}", path.display()))
    })?;
    parse_credentials(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDENTIALS: &str = r"
aadClientId: client
aadClientSecret: secret
tenantId: tenant
subscriptionId: subscription
resourceGroup: shoot--foo--bar
";

    #[test]
    fn test_parse_credentials() {
        let credentials = parse_credentials(CREDENTIALS).unwrap();
        assert_eq!(credentials.aad_client_id, "client");
        assert_eq!(credentials.subscription_id, "subscription");
        assert_eq!(credentials.load_balancer_name(), "shoot--foo--bar");
    }

    #[test]
    fn test_explicit_load_balancer_name() {
        let input = format!("{CREDENTIALS}loadBalancerName: kubernetes\n");
        let credentials = parse_credentials(&input).unwrap();
        assert_eq!(credentials.load_balancer_name(), "kubernetes");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credentials = parse_credentials(CREDENTIALS).unwrap();
        assert!(!format!("{credentials:?}").contains("\"secret\""));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let err = parse_credentials("aadClientId: client\n").unwrap_err();
        assert!(matches!(err, AzureError::Credentials(_)));
    }
}
