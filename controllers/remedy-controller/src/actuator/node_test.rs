//! Unit tests for the node projector

#[cfg(test)]
mod tests {
    use crate::actuator::node::{NodeActuator, is_node_not_ready_or_unreachable, virtual_machine_spec};
    use crate::client::{ObjectKey, ResourceClient};
    use crate::reconciler::{Actuator, Outcome};
    use crate::test_utils::*;
    use crds::VirtualMachine;
    use crds::constants::NODE_LABEL;
    use std::sync::Arc;
    use std::time::Duration;

    const SYNC_PERIOD: Duration = Duration::from_secs(4 * 60 * 60);

    fn actuator(client: &Arc<MockResourceClient<VirtualMachine>>) -> NodeActuator {
        NodeActuator::new(
            Arc::clone(client) as Arc<dyn ResourceClient<VirtualMachine>>,
            TEST_NAMESPACE,
            SYNC_PERIOD,
        )
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced(TEST_NAMESPACE, "node1")
    }

    #[test]
    fn test_not_ready_or_unreachable() {
        assert!(!is_node_not_ready_or_unreachable(&create_test_node("n", true, false)));
        assert!(is_node_not_ready_or_unreachable(&create_test_node("n", false, false)));
        assert!(is_node_not_ready_or_unreachable(&create_test_node("n", true, true)));

        // A node without a Ready condition is not ready
        let mut node = create_test_node("n", true, false);
        node.status = None;
        assert!(is_node_not_ready_or_unreachable(&node));
    }

    #[test]
    fn test_virtual_machine_spec() {
        let spec = virtual_machine_spec(&create_test_node("node1", false, false));
        assert_eq!(spec.hostname, "node1-host");
        assert!(spec.provider_id.ends_with("/virtualMachines/node1"));
        assert!(spec.not_ready_or_unreachable);
    }

    #[tokio::test]
    async fn test_create_or_update_creates_record() {
        let client = Arc::new(MockResourceClient::new());
        let node = create_test_node("node1", true, false);

        let outcome = actuator(&client).create_or_update(&node).await.unwrap();

        assert_eq!(outcome, Outcome::Done(SYNC_PERIOD));
        let vm = client.object(&key()).unwrap();
        assert_eq!(vm.spec, virtual_machine_spec(&node));
        assert_eq!(
            vm.metadata.labels.unwrap().get(NODE_LABEL).map(String::as_str),
            Some("node1")
        );
    }

    #[tokio::test]
    async fn test_create_or_update_tracks_readiness() {
        let client = Arc::new(MockResourceClient::new());
        let actuator = actuator(&client);

        actuator
            .create_or_update(&create_test_node("node1", true, false))
            .await
            .unwrap();
        assert!(!client.object(&key()).unwrap().spec.not_ready_or_unreachable);

        actuator
            .create_or_update(&create_test_node("node1", true, true))
            .await
            .unwrap();
        assert!(client.object(&key()).unwrap().spec.not_ready_or_unreachable);
        assert_eq!(client.count(MockOperation::Create), 1);
        assert_eq!(client.count(MockOperation::Patch), 1);
    }

    #[tokio::test]
    async fn test_create_or_update_skips_unchanged_record() {
        let client = Arc::new(MockResourceClient::new());
        let node = create_test_node("node1", true, false);
        let actuator = actuator(&client);

        actuator.create_or_update(&node).await.unwrap();
        actuator.create_or_update(&node).await.unwrap();

        assert_eq!(client.count(MockOperation::Create), 1);
        assert_eq!(client.count(MockOperation::Patch), 0);
    }

    #[tokio::test]
    async fn test_update_retries_on_conflict() {
        let client = Arc::new(MockResourceClient::with_objects([create_test_virtual_machine("node1", false)]));
        client.fail(MockOperation::Patch, 1, 409, "Conflict");

        actuator(&client)
            .create_or_update(&create_test_node("node1", false, false))
            .await
            .unwrap();

        assert_eq!(client.count(MockOperation::Patch), 2);
        assert!(client.object(&key()).unwrap().spec.not_ready_or_unreachable);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let client = Arc::new(MockResourceClient::with_objects([create_test_virtual_machine("node1", false)]));
        let node = create_test_node("node1", true, false);

        let outcome = actuator(&client).delete(&node).await.unwrap();

        assert_eq!(outcome, Outcome::done());
        assert!(client.object(&key()).is_none());

        // Deleting again is harmless
        assert_eq!(actuator(&client).delete(&node).await.unwrap(), Outcome::done());
    }

    #[tokio::test]
    async fn test_delete_reports_api_errors() {
        let client = Arc::new(MockResourceClient::with_objects([create_test_virtual_machine("node1", false)]));
        client.fail(MockOperation::Delete, 1, 403, "Forbidden");

        let err = actuator(&client)
            .delete(&create_test_node("node1", true, false))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("could not delete virtualmachine"));
    }

    #[tokio::test]
    async fn test_should_finalize() {
        let client = Arc::new(MockResourceClient::new());
        assert!(
            actuator(&client)
                .should_finalize(&create_test_node("node1", true, false))
                .await
                .unwrap()
        );
    }
}
