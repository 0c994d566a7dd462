//! Test utilities for unit testing the reconciler and actuators
//!
//! This module provides an in-memory [`ResourceClient`], a fixed clock and
//! helpers for creating test objects.

use crate::client::{ObjectKey, ResourceClient};
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crds::{PublicIPAddress, PublicIPAddressSpec, VirtualMachine, VirtualMachineSpec};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, NodeCondition, NodeSpec, NodeStatus, Service,
    ServiceSpec, ServiceStatus, Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Namespace records live in during tests
pub const TEST_NAMESPACE: &str = "kube-system";

/// Deletion timestamp set by [`MockResourceClient::delete`] on objects with finalizers
pub const MOCK_DELETION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

/// Build a Kubernetes API error with the given HTTP code and reason
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (mock)"),
        reason: reason.to_string(),
        code,
    })
}

/// Parse an RFC 3339 timestamp into a Kubernetes `Time`
pub fn k8s_time(rfc3339: &str) -> Time {
    serde_json::from_value(json!(rfc3339)).unwrap()
}

/// Parse an RFC 3339 timestamp
pub fn utc(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

/// Apply an RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Clock that always returns the same instant
#[derive(Debug)]
pub struct FixedClock(pub Mutex<DateTime<Utc>>);

impl FixedClock {
    /// Clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Move the clock
    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Operation on [`MockResourceClient`], for scripting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Get,
    List,
    Create,
    Delete,
    Patch,
    PatchStatus,
}

/// In-memory [`ResourceClient`]
///
/// Objects get a new resource version on every write. Writes carrying a stale
/// resource version fail with a conflict. Deleting an object with finalizers
/// only sets its deletion timestamp; the object goes away once a patch removes
/// the last finalizer.
#[derive(Debug)]
pub struct MockResourceClient<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    next_version: Mutex<u64>,
    failures: Mutex<HashMap<MockOperation, Vec<(u16, String)>>>,
    calls: Mutex<Vec<(MockOperation, String)>>,
}

impl<K> Default for MockResourceClient<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_version: Mutex::new(1),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> MockResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the given objects
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let client = Self::new();
        for obj in objects {
            client.insert(obj);
        }
        client
    }

    /// Put an object into the store as is, assigning a resource version
    pub fn insert(&self, mut obj: K) {
        obj.meta_mut().resource_version = Some(self.bump_version());
        lock(&self.objects).insert(ObjectKey::from_resource(&obj), obj);
    }

    /// Stored object
    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        lock(&self.objects).get(key).cloned()
    }

    /// All stored objects, ordered by key
    pub fn objects(&self) -> Vec<K> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Make the next `times` calls of `op` fail with an API error
    pub fn fail(&self, op: MockOperation, times: usize, code: u16, reason: &str) {
        let mut failures = lock(&self.failures);
        let queue = failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n((code, reason.to_string()), times));
    }

    /// Calls made so far, with the key or selector they were made for
    pub fn calls(&self) -> Vec<(MockOperation, String)> {
        lock(&self.calls).clone()
    }

    /// Number of calls of `op` made so far
    pub fn count(&self, op: MockOperation) -> usize {
        lock(&self.calls).iter().filter(|(o, _)| *o == op).count()
    }

    fn bump_version(&self) -> String {
        let mut next = lock(&self.next_version);
        let version = next.to_string();
        *next += 1;
        version
    }

    fn record(&self, op: MockOperation, target: String) -> Result<(), kube::Error> {
        lock(&self.calls).push((op, target));
        let mut failures = lock(&self.failures);
        match failures.get_mut(&op) {
            Some(queue) if !queue.is_empty() => {
                let (code, reason) = queue.remove(0);
                Err(api_error(code, &reason))
            }
            _ => Ok(()),
        }
    }

    fn check_version(stored: &K, expected: Option<&str>) -> Result<(), kube::Error> {
        match expected {
            Some(expected) if stored.meta().resource_version.as_deref() != Some(expected) => {
                Err(api_error(409, "Conflict"))
            }
            _ => Ok(()),
        }
    }

    /// Store `obj` under `key` after a write, honouring pending deletion
    fn store(&self, key: &ObjectKey, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.bump_version());
        let finalized = obj.meta().finalizers.as_ref().is_none_or(Vec::is_empty);
        let mut objects = lock(&self.objects);
        if obj.meta().deletion_timestamp.is_some() && finalized {
            objects.remove(key);
        } else {
            objects.insert(key.clone(), obj.clone());
        }
        obj
    }

    fn apply_patch(&self, key: &ObjectKey, patch: &Value, status: bool) -> Result<K, kube::Error> {
        let stored = self.object(key).ok_or_else(|| api_error(404, "NotFound"))?;
        let expected = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        Self::check_version(&stored, expected)?;

        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            if status {
                map.retain(|k, _| k == "status");
            } else {
                map.remove("status");
            }
        }

        let mut value = serde_json::to_value(&stored).map_err(kube::Error::SerdeError)?;
        merge_patch(&mut value, &patch);
        let patched: K = serde_json::from_value(value).map_err(kube::Error::SerdeError)?;
        Ok(self.store(key, patched))
    }
}

fn selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).is_some_and(|value| value == v),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl<K> ResourceClient<K> for MockResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, kube::Error> {
        self.record(MockOperation::Get, key.to_string())?;
        Ok(self.object(key))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        self.record(MockOperation::List, label_selector.to_string())?;
        Ok(lock(&self.objects)
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, obj)| selector_matches(obj.meta().labels.as_ref(), label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        let key = ObjectKey::from_resource(obj);
        self.record(MockOperation::Create, key.to_string())?;
        if self.object(&key).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut obj = obj.clone();
        obj.meta_mut().generation = Some(1);
        Ok(self.store(&key, obj))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), kube::Error> {
        self.record(MockOperation::Delete, key.to_string())?;
        let mut stored = self.object(key).ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(k8s_time(MOCK_DELETION_TIMESTAMP));
        }
        self.store(key, stored);
        Ok(())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error> {
        self.record(MockOperation::Patch, key.to_string())?;
        self.apply_patch(key, patch, false)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error> {
        self.record(MockOperation::PatchStatus, key.to_string())?;
        self.apply_patch(key, patch, true)
    }
}

/// Helper to create a test Service, of type LoadBalancer when `ips` is not empty
pub fn create_test_service(namespace: &str, name: &str, ips: &[&str]) -> Service {
    let ingress: Vec<LoadBalancerIngress> = ips
        .iter()
        .map(|ip| LoadBalancerIngress {
            ip: Some((*ip).to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(ingress),
            }),
            ..Default::default()
        }),
    }
}

/// Helper to create a test Node
pub fn create_test_node(name: &str, ready: bool, unreachable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "kubernetes.io/hostname".to_string(),
                format!("{name}-host"),
            )])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(format!(
                "azure:///subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/shoot--dev--test/providers/Microsoft.Compute/virtualMachines/{name}"
            )),
            taints: unreachable.then(|| {
                vec![Taint {
                    key: "node.kubernetes.io/unreachable".to_string(),
                    effect: "NoSchedule".to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Helper to create a test PublicIPAddress record
pub fn create_test_public_ip_address(name: &str, ip: &str) -> PublicIPAddress {
    let mut pubip = PublicIPAddress::new(
        name,
        PublicIPAddressSpec {
            ip_address: ip.to_string(),
        },
    );
    pubip.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    pubip
}

/// Helper to create a test VirtualMachine record
pub fn create_test_virtual_machine(name: &str, not_ready_or_unreachable: bool) -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            hostname: format!("{name}-host"),
            provider_id: format!(
                "azure:///subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/shoot--dev--test/providers/Microsoft.Compute/virtualMachines/{name}"
            ),
            not_ready_or_unreachable,
        },
    );
    vm.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    vm
}

/// Set labels on an object's metadata
pub fn with_labels(meta: &mut ObjectMeta, labels: &[(&str, &str)]) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
}

/// Set annotations on an object's metadata
pub fn with_annotations(meta: &mut ObjectMeta, annotations: &[(&str, &str)]) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(annotations.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
}

/// Add a finalizer to an object's metadata
pub fn with_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch_rfc7386() {
        let mut target = json!({ "a": "b", "c": { "d": "e", "f": "g" }, "list": [1, 2] });
        merge_patch(
            &mut target,
            &json!({ "a": "z", "c": { "f": null }, "list": [3] }),
        );
        assert_eq!(target, json!({ "a": "z", "c": { "d": "e" }, "list": [3] }));
    }

    #[tokio::test]
    async fn test_mock_detects_stale_resource_version() {
        let client = MockResourceClient::with_objects([create_test_public_ip_address("ip1", "1.2.3.4")]);
        let key = ObjectKey::namespaced(TEST_NAMESPACE, "ip1");

        let err = client
            .patch_status(&key, &json!({ "metadata": { "resourceVersion": "999" }, "status": { "exists": true } }))
            .await
            .unwrap_err();
        assert!(crate::client::is_conflict(&err));

        let current = client.object(&key).unwrap();
        let patched = client
            .patch_status(
                &key,
                &json!({ "metadata": { "resourceVersion": current.metadata.resource_version }, "status": { "exists": true } }),
            )
            .await
            .unwrap();
        assert!(patched.status.unwrap().exists);
    }

    #[tokio::test]
    async fn test_mock_delete_waits_for_finalizers() {
        let mut pubip = create_test_public_ip_address("ip1", "1.2.3.4");
        with_finalizer(&mut pubip.metadata, "test");
        let client = MockResourceClient::with_objects([pubip]);
        let key = ObjectKey::namespaced(TEST_NAMESPACE, "ip1");

        client.delete(&key).await.unwrap();
        assert!(client.object(&key).unwrap().metadata.deletion_timestamp.is_some());

        client
            .patch(&key, &json!({ "metadata": { "finalizers": [] } }))
            .await
            .unwrap();
        assert!(client.object(&key).is_none());
    }

    #[tokio::test]
    async fn test_mock_list_filters_by_label() {
        let mut a = create_test_public_ip_address("a", "1.1.1.1");
        with_labels(&mut a.metadata, &[("owner", "x")]);
        let b = create_test_public_ip_address("b", "2.2.2.2");
        let client = MockResourceClient::with_objects([a, b]);

        let listed = client.list(Some(TEST_NAMESPACE), "owner=x").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name.as_deref(), Some("a"));
    }
}
