//! Event admission.
//!
//! A predicate decides for each create, update or delete event whether the
//! object is enqueued for reconciliation. The Service and Node predicates keep
//! the projection of the last admitted version of each object in an
//! [`ExpiringCache`] so that informer resyncs and heartbeat updates do not
//! cause cloud round trips.

use crate::actuator::node::is_node_not_ready_or_unreachable;
use crate::actuator::service::{service_load_balancer_ips, should_ignore_service};
use crate::cache::ExpiringCache;
use crate::client::{ObjectKey, ResourceClient};
use crate::labeler::LabelMapper;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long the projection of an admitted Service is remembered
pub const SERVICE_CACHE_TTL: Duration = Duration::from_secs(10 * 60 * 60);

/// How long the projection of an admitted Node is remembered
pub const NODE_CACHE_TTL: Duration = Duration::from_secs(10 * 60 * 60);

/// Decides whether an event is enqueued.
#[async_trait]
pub trait Predicate<K>: Send + Sync {
    /// An object was created, or first seen after a (re)list
    async fn create(&self, obj: &K) -> bool;

    /// An object changed from `old` to `new`
    async fn update(&self, old: &K, new: &K) -> bool;

    /// An object was deleted
    async fn delete(&self, obj: &K) -> bool;

    /// An event that did not originate in the API server
    async fn generic(&self, _obj: &K) -> bool {
        false
    }
}

/// Admits updates only when the generation changed, so status writes never
/// trigger reconciliations.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

#[async_trait]
impl<K: Resource + Sync> Predicate<K> for GenerationChangedPredicate {
    async fn create(&self, _obj: &K) -> bool {
        true
    }

    async fn update(&self, old: &K, new: &K) -> bool {
        old.meta().generation != new.meta().generation
    }

    async fn delete(&self, _obj: &K) -> bool {
        true
    }
}

fn cache_key<K: Resource>(obj: &K) -> String {
    ObjectKey::from_resource(obj).to_string()
}

#[derive(Debug, Clone, PartialEq)]
struct ServiceProjection {
    deletion_timestamp: Option<Time>,
    should_ignore: bool,
    load_balancer_ips: BTreeSet<String>,
}

/// Admits Service events that change what the service projector does:
/// creation and deletion, a new deletion timestamp or ignore flag on a
/// service with load balancer IPs, and changed load balancer IPs.
#[derive(Debug)]
pub struct ServicePredicate {
    cache: ExpiringCache<String, ServiceProjection>,
    blacklisted_labels: Vec<BTreeMap<String, String>>,
}

impl ServicePredicate {
    /// Create a predicate honouring the given label blacklist
    pub fn new(blacklisted_labels: Vec<BTreeMap<String, String>>) -> Self {
        Self {
            cache: ExpiringCache::new(SERVICE_CACHE_TTL),
            blacklisted_labels,
        }
    }

    fn project(&self, service: &Service) -> ServiceProjection {
        ServiceProjection {
            deletion_timestamp: service.metadata.deletion_timestamp.clone(),
            should_ignore: should_ignore_service(service, &self.blacklisted_labels),
            load_balancer_ips: service_load_balancer_ips(service),
        }
    }
}

#[async_trait]
impl Predicate<Service> for ServicePredicate {
    async fn create(&self, obj: &Service) -> bool {
        let key = cache_key(obj);
        info!(service = %key, "Creating a service");
        self.cache.set(key, self.project(obj));
        true
    }

    async fn update(&self, old: &Service, new: &Service) -> bool {
        let key = cache_key(new);
        let new_projection = self.project(new);
        let admit = match self.cache.get(&key) {
            None => {
                info!(service = %key, "Updating a service that is missing in the service cache");
                true
            }
            Some(cached) => {
                let old_projection = self.project(old);
                let has_ips = !new_projection.load_balancer_ips.is_empty();
                if has_ips
                    && (new_projection.deletion_timestamp != old_projection.deletion_timestamp
                        || new_projection.deletion_timestamp != cached.deletion_timestamp)
                {
                    info!(service = %key, "Updating the deletion timestamp of a service with LoadBalancer IPs");
                    true
                } else if has_ips
                    && (new_projection.should_ignore != old_projection.should_ignore
                        || new_projection.should_ignore != cached.should_ignore)
                {
                    info!(service = %key, "Updating the ignore annotation of a service with LoadBalancer IPs");
                    true
                } else if new_projection.load_balancer_ips != old_projection.load_balancer_ips
                    || new_projection.load_balancer_ips != cached.load_balancer_ips
                {
                    info!(service = %key, "Updating service LoadBalancer IPs");
                    true
                } else {
                    false
                }
            }
        };

        // Only admitted changes are cached, other changes do not affect later comparisons
        if admit {
            self.cache.set(key, new_projection);
        }
        admit
    }

    async fn delete(&self, obj: &Service) -> bool {
        let key = cache_key(obj);
        info!(service = %key, "Deleting a service");
        self.cache.delete(&key);
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NodeProjection {
    deletion_timestamp: Option<Time>,
    not_ready_or_unreachable: bool,
}

impl NodeProjection {
    fn of(node: &Node) -> Self {
        Self {
            deletion_timestamp: node.metadata.deletion_timestamp.clone(),
            not_ready_or_unreachable: is_node_not_ready_or_unreachable(node),
        }
    }
}

/// Admits Node events that change the deletion timestamp, the Ready
/// condition or the unreachable taint.
#[derive(Debug)]
pub struct NodePredicate {
    cache: ExpiringCache<String, NodeProjection>,
}

impl Default for NodePredicate {
    fn default() -> Self {
        Self::new()
    }
}

impl NodePredicate {
    /// Create a predicate with an empty cache
    pub fn new() -> Self {
        Self {
            cache: ExpiringCache::new(NODE_CACHE_TTL),
        }
    }
}

#[async_trait]
impl Predicate<Node> for NodePredicate {
    async fn create(&self, obj: &Node) -> bool {
        let key = cache_key(obj);
        info!(node = %key, "Creating a node");
        self.cache.set(key, NodeProjection::of(obj));
        true
    }

    async fn update(&self, old: &Node, new: &Node) -> bool {
        let key = cache_key(new);
        let new_projection = NodeProjection::of(new);
        let admit = match self.cache.get(&key) {
            None => {
                info!(node = %key, "Updating a node that is missing in the node cache");
                true
            }
            Some(cached) => {
                let old_projection = NodeProjection::of(old);
                if new_projection.deletion_timestamp != old_projection.deletion_timestamp
                    || new_projection.deletion_timestamp != cached.deletion_timestamp
                {
                    info!(node = %key, "Updating the deletion timestamp of a node");
                    true
                } else if new_projection.not_ready_or_unreachable != old_projection.not_ready_or_unreachable
                    || new_projection.not_ready_or_unreachable != cached.not_ready_or_unreachable
                {
                    info!(node = %key, "Updating the ready condition or unreachable taint of a node");
                    true
                } else {
                    false
                }
            }
        };

        if admit {
            self.cache.set(key, new_projection);
        }
        admit
    }

    async fn delete(&self, obj: &Node) -> bool {
        let key = cache_key(obj);
        info!(node = %key, "Deleting a node");
        self.cache.delete(&key);
        true
    }
}

/// Admits record events that require the owner to be reconciled.
///
/// A created or updated record matters when its owner is gone, or when the
/// owner is being deleted while the record is not. A deleted record matters
/// when its owner still exists and is not being deleted, since the record
/// must be re-created.
pub struct OwnedObjectPredicate<O> {
    owners: Arc<dyn ResourceClient<O>>,
    mapper: LabelMapper,
    finalizer: String,
}

impl<O> std::fmt::Debug for OwnedObjectPredicate<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedObjectPredicate")
            .field("mapper", &self.mapper)
            .field("finalizer", &self.finalizer)
            .finish_non_exhaustive()
    }
}

impl<O: Resource> OwnedObjectPredicate<O> {
    /// Create a predicate resolving owners through `mapper`
    pub fn new(owners: Arc<dyn ResourceClient<O>>, mapper: LabelMapper, finalizer: impl Into<String>) -> Self {
        Self {
            owners,
            mapper,
            finalizer: finalizer.into(),
        }
    }

    fn has_finalizer(&self, owner: &O) -> bool {
        owner
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| *f == self.finalizer))
    }

    /// Owner key and owner of the record, the owner being `None` when it does
    /// not exist. `None` when the record has no owner label or the lookup failed.
    async fn owner<K: Resource + Sync>(&self, obj: &K) -> Option<(ObjectKey, Option<O>)> {
        let key = self.mapper.map(obj.meta());
        if key.name.is_empty() {
            return None;
        }
        match self.owners.get(&key).await {
            Ok(owner) => Some((key, owner)),
            Err(e) => {
                debug!(owner = %key, "Could not get owner: {}", e);
                None
            }
        }
    }

    async fn handle_create_or_update<K: Resource + Sync>(&self, obj: &K) -> bool {
        let Some((owner_key, owner)) = self.owner(obj).await else {
            return false;
        };
        let name = obj.meta().name.as_deref().unwrap_or_default();
        let Some(owner) = owner else {
            info!(name, owner = %owner_key, "Creating or updating an object without an owner");
            return true;
        };
        if !self.has_finalizer(&owner) {
            return false;
        }
        if obj.meta().deletion_timestamp.is_none() && owner.meta().deletion_timestamp.is_some() {
            info!(name, owner = %owner_key, "Creating or updating an object with an owner that is being deleted");
            return true;
        }
        false
    }
}

#[async_trait]
impl<K, O> Predicate<K> for OwnedObjectPredicate<O>
where
    K: Resource + Sync,
    O: Resource + Send + Sync,
{
    async fn create(&self, obj: &K) -> bool {
        self.handle_create_or_update(obj).await
    }

    async fn update(&self, _old: &K, new: &K) -> bool {
        self.handle_create_or_update(new).await
    }

    async fn delete(&self, obj: &K) -> bool {
        let Some((owner_key, Some(owner))) = self.owner(obj).await else {
            return false;
        };
        if !self.has_finalizer(&owner) || owner.meta().deletion_timestamp.is_some() {
            return false;
        }
        info!(
            name = obj.meta().name.as_deref().unwrap_or_default(),
            owner = %owner_key,
            "Deleting an object with an owner that is not being deleted"
        );
        true
    }
}
