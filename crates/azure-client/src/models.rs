//! Azure Resource Manager data models
//!
//! Only the fields the controller reads or mutates are typed. Everything else
//! is kept in `extra` so that documents written back (the load balancer) do not
//! lose properties this crate does not know about.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Provisioning state reported for a resource that finished provisioning
pub const PROVISIONING_STATE_SUCCEEDED: &str = "Succeeded";
/// Provisioning state reported for a resource whose provisioning failed
pub const PROVISIONING_STATE_FAILED: &str = "Failed";

/// Returns true if the provisioning state is terminal (`Succeeded` or `Failed`).
#[must_use]
pub fn is_terminal_provisioning_state(state: Option<&str>) -> bool {
    matches!(
        state,
        Some(PROVISIONING_STATE_SUCCEEDED | PROVISIONING_STATE_FAILED)
    )
}

/// A page of an Azure list operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult<T> {
    /// Items on this page
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    /// URL of the next page, absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
}

/// Reference to another Azure resource
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubResource {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl SubResource {
    /// Creates a reference to the resource with the given ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()) }
    }
}

/// Azure public IP address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublicIPAddress {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<PublicIPAddressProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of an Azure public IP address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPAddressProperties {
    /// Allocated IP address literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PublicIPAddress {
    /// Allocated IP address literal, if any.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.properties.as_ref()?.ip_address.as_deref()
    }

    /// Provisioning state, if reported.
    #[must_use]
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties.as_ref()?.provisioning_state.as_deref()
    }
}

/// Azure load balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancer {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<LoadBalancerProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of an Azure load balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerProperties {
    /// Frontend IP configurations
    #[serde(rename = "frontendIPConfigurations", default, skip_serializing_if = "Option::is_none")]
    pub frontend_ip_configurations: Option<Vec<FrontendIPConfiguration>>,
    /// Load balancing rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_rules: Option<Vec<LoadBalancingRule>>,
    /// Health probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<Vec<Probe>>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Frontend IP configuration of a load balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FrontendIPConfiguration {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<FrontendIPConfigurationProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of a frontend IP configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendIPConfigurationProperties {
    /// Public IP address backing the frontend
    #[serde(rename = "publicIPAddress", default, skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<SubResource>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FrontendIPConfiguration {
    /// ID of the backing public IP address, if any.
    #[must_use]
    pub fn public_ip_address_id(&self) -> Option<&str> {
        self.properties.as_ref()?.public_ip_address.as_ref()?.id.as_deref()
    }
}

/// Load balancing rule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancingRule {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<LoadBalancingRuleProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of a load balancing rule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingRuleProperties {
    /// Frontend IP configuration the rule applies to
    #[serde(rename = "frontendIPConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub frontend_ip_configuration: Option<SubResource>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoadBalancingRule {
    /// ID of the frontend IP configuration the rule applies to, if any.
    #[must_use]
    pub fn frontend_ip_configuration_id(&self) -> Option<&str> {
        self.properties.as_ref()?.frontend_ip_configuration.as_ref()?.id.as_deref()
    }
}

/// Load balancer health probe
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Probe {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<ProbeProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of a health probe
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeProperties {
    /// Load balancing rules using the probe (read-only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_rules: Option<Vec<SubResource>>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Probe {
    /// IDs of the load balancing rules using the probe.
    pub fn load_balancing_rule_ids(&self) -> impl Iterator<Item = &str> {
        self.properties
            .as_ref()
            .and_then(|p| p.load_balancing_rules.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|r| r.id.as_deref())
    }
}

/// Azure virtual machine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<VirtualMachineProperties>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Properties of an Azure virtual machine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    /// Provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
    /// Properties not modelled by this crate
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VirtualMachine {
    /// Provisioning state, if reported.
    #[must_use]
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties.as_ref()?.provisioning_state.as_deref()
    }
}

/// Status document of an asynchronous operation
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OperationStatus {
    pub status: String,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

/// Error envelope returned by Azure Resource Manager
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail returned by Azure Resource Manager
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}
