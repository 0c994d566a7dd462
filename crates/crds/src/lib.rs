//! Azure Remedy CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Azure remedy controller.
//! Records shadow Azure resources and carry the outcome of the last cloud
//! lookups in their status.

pub mod constants;
pub mod failed_operation;
pub mod public_ip_address;
pub mod virtual_machine;

pub use failed_operation::*;
pub use public_ip_address::*;
pub use virtual_machine::*;
