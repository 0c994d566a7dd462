//! Well-known label, annotation and finalizer names.

/// API group of the remedy CRDs
pub const GROUP: &str = "azure.remedy.gardener.cloud";

/// Service annotation that suppresses projection into PublicIPAddress records
pub const IGNORE_ANNOTATION: &str = "azure.remedy.gardener.cloud/ignore";

/// PublicIPAddress annotation that releases the record without cloud cleanup
pub const DO_NOT_CLEAN_ANNOTATION: &str = "azure.remedy.gardener.cloud/do-not-clean";

/// Label linking a PublicIPAddress record to its Service (`<namespace>.<name>`)
pub const SERVICE_LABEL: &str = "azure.remedy.gardener.cloud/service";

/// Label linking a VirtualMachine record to its Node
pub const NODE_LABEL: &str = "azure.remedy.gardener.cloud/node";

/// Finalizer placed on Services by the service projector
pub const SERVICE_FINALIZER: &str = "azure.remedy.gardener.cloud/service";

/// Finalizer placed on Nodes by the node projector
pub const NODE_FINALIZER: &str = "azure.remedy.gardener.cloud/node";

/// Finalizer placed on PublicIPAddress records
pub const PUBLIC_IP_ADDRESS_FINALIZER: &str = "azure.remedy.gardener.cloud/publicipaddress";

/// Finalizer placed on VirtualMachine records
pub const VIRTUAL_MACHINE_FINALIZER: &str = "azure.remedy.gardener.cloud/virtualmachine";

/// Returns true if the annotation is present and set to `"true"`.
#[must_use]
pub fn annotation_is_true(
    annotations: Option<&std::collections::BTreeMap<String, String>>,
    key: &str,
) -> bool {
    annotations
        .and_then(|a| a.get(key))
        .is_some_and(|v| v == "true")
}
