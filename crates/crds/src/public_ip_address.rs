//! PublicIPAddress CRD
//!
//! Shadows an Azure public IP address that backs a LoadBalancer Service ingress.

use crate::failed_operation::FailedOperation;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "azure.remedy.gardener.cloud",
    version = "v1alpha1",
    kind = "PublicIPAddress",
    shortname = "pubip",
    namespaced,
    status = "PublicIPAddressStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"IP", "type":"string", "jsonPath":".spec.ipAddress"}"#,
    printcolumn = r#"{"name":"Exists", "type":"boolean", "jsonPath":".status.exists"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPAddressSpec {
    /// IP address literal of the Service ingress
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPAddressStatus {
    /// Whether the Azure public IP address was found on the last lookup
    #[serde(default)]
    pub exists: bool,

    /// Azure resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Azure resource name, used for all lookups once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Azure provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,

    /// Operations that failed and may be retried
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_operations: Vec<FailedOperation>,
}
