//! Kind specific reconciliation logic.
//!
//! - `service`: projects LoadBalancer Services into PublicIPAddress records
//! - `node`: projects Nodes into VirtualMachine records
//! - `publicipaddress`: tracks Azure public IP addresses and cleans them up
//! - `virtualmachine`: tracks Azure virtual machines and reapplies failed ones

pub mod node;
pub mod publicipaddress;
pub mod service;
pub mod virtualmachine;

#[cfg(test)]
mod node_test;

use crate::backoff::{exponential_backoff, retry_on_conflict};
use crate::client::{ObjectKey, ResourceClient};
use crate::error::ActuatorError;
use crate::reconciler::Outcome;
use crds::FailedOperation;
use kube::Resource;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Status fields that are omitted when empty and must be cleared explicitly
const CLEARABLE_STATUS_FIELDS: &[&str] = &["id", "name", "provisioningState", "failedOperations"];

/// Replace the status of a record with `status`.
///
/// The write is a merge patch carrying the observed resource version. On a
/// conflict the record is read again and the patch retried; a record that is
/// gone by then needs no status.
pub(crate) async fn update_status<K, S>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    status: &S,
) -> Result<(), ActuatorError>
where
    K: Resource + Send + Sync,
    S: Serialize,
{
    let mut status = serde_json::to_value(status)?;
    if let Value::Object(fields) = &mut status {
        for field in CLEARABLE_STATUS_FIELDS {
            fields.entry(*field).or_insert(Value::Null);
        }
    }

    let key = ObjectKey::from_resource(obj);
    let key = &key;
    let status = &status;
    retry_on_conflict(|attempt| async move {
        let resource_version = if attempt == 0 {
            obj.meta().resource_version.clone()
        } else {
            match client.get(key).await? {
                Some(current) => current.meta().resource_version.clone(),
                None => return Ok(()),
            }
        };
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        client.patch_status(key, &patch).await.map(|_| ())
    })
    .await
    .map_err(|e| ActuatorError::from(e).context("could not update status"))
}

/// Outcome after a cloud operation failed for the `attempts`-th time.
///
/// Below `max_attempts` the key is requeued with exponential backoff starting
/// at `interval`; after that the failure is given up on until `exhausted`.
pub(crate) fn failure_outcome(
    failed_operation: &FailedOperation,
    max_attempts: u32,
    interval: Duration,
    exhausted: Outcome,
) -> Outcome {
    if failed_operation.attempts < max_attempts {
        Outcome::RequeueAfter(
            exponential_backoff(interval, failed_operation.attempts),
            failed_operation.error_message.clone(),
        )
    } else {
        exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::{OperationType, PublicIPAddressStatus};

    fn failed(attempts: u32) -> FailedOperation {
        FailedOperation {
            operation_type: OperationType::GetPublicIPAddress,
            attempts,
            error_message: "boom".to_string(),
            timestamp: utc("2024-01-01T00:00:00Z"),
        }
    }

    #[test]
    fn test_failure_outcome_backs_off_exponentially() {
        let interval = Duration::from_secs(30);
        assert_eq!(
            failure_outcome(&failed(1), 5, interval, Outcome::done()),
            Outcome::RequeueAfter(interval, "boom".to_string())
        );
        assert_eq!(
            failure_outcome(&failed(3), 5, interval, Outcome::done()),
            Outcome::RequeueAfter(interval * 4, "boom".to_string())
        );
        assert_eq!(failure_outcome(&failed(5), 5, interval, Outcome::done()), Outcome::done());
    }

    #[tokio::test]
    async fn test_update_status_clears_absent_fields() {
        let mut pubip = create_test_public_ip_address("ip1", "1.2.3.4");
        pubip.status = Some(PublicIPAddressStatus {
            exists: true,
            id: Some("id".to_string()),
            name: Some("ip1".to_string()),
            provisioning_state: Some("Succeeded".to_string()),
            failed_operations: vec![failed(1)],
        });
        let client = MockResourceClient::with_objects([pubip]);
        let key = ObjectKey::namespaced(TEST_NAMESPACE, "ip1");
        let stored = client.object(&key).unwrap();

        update_status(&client, &stored, &PublicIPAddressStatus::default())
            .await
            .unwrap();

        assert_eq!(client.object(&key).unwrap().status, Some(PublicIPAddressStatus::default()));
    }

    #[tokio::test]
    async fn test_update_status_retries_with_fresh_resource_version() {
        let client = MockResourceClient::with_objects([create_test_public_ip_address("ip1", "1.2.3.4")]);
        let key = ObjectKey::namespaced(TEST_NAMESPACE, "ip1");
        let stale = client.object(&key).unwrap();
        // Somebody else writes the record in between
        client.insert(client.object(&key).unwrap());

        let status = PublicIPAddressStatus {
            exists: true,
            ..Default::default()
        };
        update_status(&client, &stale, &status).await.unwrap();

        assert_eq!(client.count(MockOperation::PatchStatus), 2);
        assert!(client.object(&key).unwrap().status.unwrap().exists);
    }

    #[tokio::test]
    async fn test_update_status_of_missing_record_after_conflict() {
        let client = MockResourceClient::with_objects([create_test_public_ip_address("ip1", "1.2.3.4")]);
        let key = ObjectKey::namespaced(TEST_NAMESPACE, "ip1");
        let stored = client.object(&key).unwrap();
        client.fail(MockOperation::PatchStatus, 1, 409, "Conflict");
        // Record disappears before the retry
        client.delete(&key).await.unwrap();

        update_status(&client, &stored, &PublicIPAddressStatus::default())
            .await
            .unwrap();
        assert!(client.object(&key).is_none());
    }
}
