//! VirtualMachine CRD
//!
//! Shadows the Azure virtual machine backing a Node.

use crate::failed_operation::FailedOperation;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "azure.remedy.gardener.cloud",
    version = "v1alpha1",
    kind = "VirtualMachine",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Hostname", "type":"string", "jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"NotReadyOrUnreachable", "type":"boolean", "jsonPath":".spec.notReadyOrUnreachable"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.provisioningState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Node hostname
    #[serde(default)]
    pub hostname: String,

    /// Node provider ID, its last path segment is the Azure VM name
    #[serde(default, rename = "providerID")]
    pub provider_id: String,

    /// Whether the Node is not ready or carries the unreachable taint
    #[serde(default)]
    pub not_ready_or_unreachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Whether the Azure virtual machine was found on the last lookup
    #[serde(default)]
    pub exists: bool,

    /// Azure resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Azure resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Azure provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,

    /// Operations that failed and may be retried
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_operations: Vec<FailedOperation>,
}
