//! Generic reconciler.
//!
//! Fetches the object, maintains the controller finalizer and routes to the
//! [`Actuator`] for creation/update or deletion. The reconciler is generic
//! over the object kind; everything kind specific lives in the actuators.

use crate::backoff::retry_on_conflict;
use crate::client::{ObjectKey, ResourceClient};
use crate::error::{ActuatorError, ReconcileError};
use async_trait::async_trait;
use kube::Resource;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a successful actuator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Reconciled; look at the object again after the duration (zero: only on change)
    Done(Duration),
    /// Not finished; requeue after the duration. Carries the cause for logging.
    RequeueAfter(Duration, String),
}

impl Outcome {
    /// Done, with no periodic requeue
    pub const fn done() -> Self {
        Outcome::Done(Duration::ZERO)
    }
}

/// Kind specific reconciliation logic.
#[async_trait]
pub trait Actuator<K>: Send + Sync {
    /// Reconcile the creation or update of an object
    async fn create_or_update(&self, obj: &K) -> Result<Outcome, ActuatorError>;

    /// Reconcile the deletion of an object
    async fn delete(&self, obj: &K) -> Result<Outcome, ActuatorError>;

    /// Whether the object should carry the controller finalizer
    async fn should_finalize(&self, obj: &K) -> Result<bool, ActuatorError>;
}

/// Builds an object carrying only the given key.
pub type Prototype<K> = Arc<dyn Fn(&ObjectKey) -> K + Send + Sync>;

/// Generic reconciler for objects of kind `K`.
pub struct Reconciler<K> {
    name: String,
    finalizer: String,
    actuator: Arc<dyn Actuator<K>>,
    client: Arc<dyn ResourceClient<K>>,
    prototype: Option<Prototype<K>>,
}

impl<K> fmt::Debug for Reconciler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("name", &self.name)
            .field("finalizer", &self.finalizer)
            .field("ensure_deleted", &self.prototype.is_some())
            .finish_non_exhaustive()
    }
}

fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

impl<K> Reconciler<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Create a reconciler
    ///
    /// # Arguments
    /// * `name` - Controller name, used in logs
    /// * `finalizer` - Finalizer the reconciler maintains on objects
    /// * `actuator` - Kind specific logic
    /// * `client` - Access to objects of kind `K`
    pub fn new(
        name: impl Into<String>,
        finalizer: impl Into<String>,
        actuator: Arc<dyn Actuator<K>>,
        client: Arc<dyn ResourceClient<K>>,
    ) -> Self {
        Self {
            name: name.into(),
            finalizer: finalizer.into(),
            actuator,
            client,
            prototype: None,
        }
    }

    /// Call `delete` with a prototype built from the key when a reconciled
    /// object no longer exists, so that objects deleted without the finalizer
    /// are still cleaned up.
    #[must_use]
    pub fn with_ensure_deleted(mut self, prototype: Prototype<K>) -> Self {
        self.prototype = Some(prototype);
        self
    }

    /// Controller name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether objects that are gone are cleaned up through `delete`
    pub fn ensures_deleted(&self) -> bool {
        self.prototype.is_some()
    }

    /// Reconcile the object with the given key
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        debug!(controller = %self.name, key = %key, "Reconciling object");

        let Some(obj) = self.client.get(key).await.map_err(ReconcileError::Get)? else {
            return self.ensure_deleted(key).await;
        };

        if obj.meta().deletion_timestamp.is_some() {
            return self.reconcile_deletion(key, &obj).await;
        }

        let should_finalize = self
            .actuator
            .should_finalize(&obj)
            .await
            .map_err(ReconcileError::ShouldFinalize)?;

        if should_finalize {
            let obj = if has_finalizer(&obj, &self.finalizer) {
                obj
            } else {
                info!(controller = %self.name, key = %key, "Adding finalizer");
                self.add_finalizer(key, &obj)
                    .await
                    .map_err(ReconcileError::AddFinalizer)?
            };
            return self
                .actuator
                .create_or_update(&obj)
                .await
                .map_err(ReconcileError::CreateOrUpdate);
        }

        if !has_finalizer(&obj, &self.finalizer) {
            debug!(controller = %self.name, key = %key, "Object should not be finalized, skipping");
            return Ok(Outcome::done());
        }

        // The object no longer needs the finalizer: reconcile once more, then release it
        let outcome = self
            .actuator
            .create_or_update(&obj)
            .await
            .map_err(ReconcileError::CreateOrUpdate)?;
        if let Outcome::RequeueAfter(..) = outcome {
            return Ok(outcome);
        }
        info!(controller = %self.name, key = %key, "Removing finalizer");
        self.remove_finalizer(key, &obj)
            .await
            .map_err(ReconcileError::RemoveFinalizer)?;
        Ok(Outcome::done())
    }

    async fn reconcile_deletion(&self, key: &ObjectKey, obj: &K) -> Result<Outcome, ReconcileError> {
        if !has_finalizer(obj, &self.finalizer) {
            debug!(controller = %self.name, key = %key, "Object is being deleted without our finalizer, skipping");
            return Ok(Outcome::done());
        }

        let outcome = self
            .actuator
            .delete(obj)
            .await
            .map_err(ReconcileError::Delete)?;
        if let Outcome::RequeueAfter(..) = outcome {
            return Ok(outcome);
        }

        info!(controller = %self.name, key = %key, "Removing finalizer");
        self.remove_finalizer(key, obj)
            .await
            .map_err(ReconcileError::RemoveFinalizer)?;
        Ok(outcome)
    }

    async fn ensure_deleted(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(prototype) = &self.prototype else {
            debug!(controller = %self.name, key = %key, "Object is gone");
            return Ok(Outcome::done());
        };

        info!(controller = %self.name, key = %key, "Ensuring deletion of an object that is gone");
        let obj = prototype(key);
        self.actuator
            .delete(&obj)
            .await
            .map_err(ReconcileError::EnsureDeleted)?;
        Ok(Outcome::done())
    }

    async fn add_finalizer(&self, key: &ObjectKey, obj: &K) -> Result<K, kube::Error> {
        let client = &self.client;
        let finalizer = self.finalizer.as_str();
        retry_on_conflict(|attempt| async move {
            let current = if attempt == 0 {
                obj.clone()
            } else {
                client.get(key).await?.unwrap_or_else(|| obj.clone())
            };
            if has_finalizer(&current, finalizer) {
                return Ok(current);
            }
            let mut finalizers = current.meta().finalizers.clone().unwrap_or_default();
            finalizers.push(finalizer.to_string());
            let patch = json!({
                "metadata": {
                    "resourceVersion": current.meta().resource_version,
                    "finalizers": finalizers,
                }
            });
            client.patch(key, &patch).await
        })
        .await
    }

    async fn remove_finalizer(&self, key: &ObjectKey, obj: &K) -> Result<(), kube::Error> {
        let client = &self.client;
        let finalizer = self.finalizer.as_str();
        retry_on_conflict(|attempt| async move {
            let current = if attempt == 0 {
                obj.clone()
            } else {
                match client.get(key).await? {
                    Some(current) => current,
                    None => return Ok(()),
                }
            };
            if !has_finalizer(&current, finalizer) {
                return Ok(());
            }
            let finalizers: Vec<String> = current
                .meta()
                .finalizers
                .iter()
                .flatten()
                .filter(|f| *f != finalizer)
                .cloned()
                .collect();
            let patch = json!({
                "metadata": {
                    "resourceVersion": current.meta().resource_version,
                    "finalizers": finalizers,
                }
            });
            client.patch(key, &patch).await.map(|_| ())
        })
        .await
    }
}
