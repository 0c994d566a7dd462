//! Failed operation bookkeeping shared by the record kinds.
//!
//! A record keeps at most one entry per operation kind. Each retry of the same
//! kind bumps `attempts` and overwrites the message and timestamp; a success
//! removes the entry. Insertion order is preserved so persisted status stays
//! stable between reconciliations.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of a cloud operation that can fail on a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Looking up an Azure public IP address
    GetPublicIPAddress,
    /// Removing an Azure public IP address from the load balancer and deleting it
    CleanPublicIPAddress,
    /// Looking up an Azure virtual machine
    GetVirtualMachine,
    /// Reapplying an Azure virtual machine
    ReapplyVirtualMachine,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::GetPublicIPAddress => "GetPublicIPAddress",
            OperationType::CleanPublicIPAddress => "CleanPublicIPAddress",
            OperationType::GetVirtualMachine => "GetVirtualMachine",
            OperationType::ReapplyVirtualMachine => "ReapplyVirtualMachine",
        };
        f.write_str(s)
    }
}

/// A failed operation on an Azure resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// Number of consecutive failed attempts
    pub attempts: u32,

    /// Error message of the last attempt
    pub error_message: String,

    /// Time of the last attempt
    pub timestamp: DateTime<Utc>,
}

/// Adds a failed operation of the given kind, or updates the existing one.
///
/// Returns a copy of the entry as it is after the update.
pub fn add_or_update_failed_operation(
    failed_operations: &mut Vec<FailedOperation>,
    operation_type: OperationType,
    error_message: impl Into<String>,
    timestamp: DateTime<Utc>,
) -> FailedOperation {
    let error_message = error_message.into();
    if let Some(existing) = failed_operations
        .iter_mut()
        .find(|op| op.operation_type == operation_type)
    {
        existing.attempts += 1;
        existing.error_message = error_message;
        existing.timestamp = timestamp;
        return existing.clone();
    }

    let op = FailedOperation {
        operation_type,
        attempts: 1,
        error_message,
        timestamp,
    };
    failed_operations.push(op.clone());
    op
}

/// Removes the failed operation of the given kind, if present.
pub fn delete_failed_operation(
    failed_operations: &mut Vec<FailedOperation>,
    operation_type: OperationType,
) {
    failed_operations.retain(|op| op.operation_type != operation_type);
}

/// Returns the failed operation of the given kind, if present.
#[must_use]
pub fn get_failed_operation(
    failed_operations: &[FailedOperation],
    operation_type: OperationType,
) -> Option<&FailedOperation> {
    failed_operations
        .iter()
        .find(|op| op.operation_type == operation_type)
}
