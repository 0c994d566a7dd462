//! Kubernetes resource watchers.
//!
//! Each controller watches its primary kind with `kube_runtime::watcher`,
//! translates the raw watch events into create, update and delete events,
//! passes them through a [`Predicate`] and feeds the admitted objects into a
//! `kube_runtime::Controller` built with `for_stream`. The controller provides
//! the work queue: deduplication, one reconciliation per key at a time,
//! bounded concurrency and delayed requeues.
//!
//! Owned records are watched separately with [`watch_owned`]; admitted record
//! events are mapped to the key of the owner through a [`LabelMapper`] and
//! handed to the owner's watcher.
//!
//! Objects that are gone from the API server cannot be reconciled through the
//! controller, which only runs for objects in its store. Admitted delete
//! events, and owner keys without a cached owner, are reconciled directly so
//! that the reconciler can ensure their deletion.

use crate::client::ObjectKey;
use crate::error::{ControllerError, ReconcileError};
use crate::labeler::LabelMapper;
use crate::predicate::Predicate;
use crate::reconciler::{Outcome, Reconciler};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::controller::{Action, Config as ControllerConfig, Error as RuntimeError};
use kube_runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube_runtime::{Controller, WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before an object whose reconciliation failed is retried
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// A change to a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<K> {
    /// The object was created, or seen for the first time
    Created(K),
    /// The object changed
    Updated {
        /// Last version seen before the change
        old: K,
        /// Current version
        new: K,
    },
    /// The object was deleted
    Deleted(K),
}

impl<K: Resource> ResourceEvent<K> {
    /// Key of the object the event is about
    pub fn key(&self) -> ObjectKey {
        match self {
            ResourceEvent::Created(obj) | ResourceEvent::Deleted(obj) => ObjectKey::from_resource(obj),
            ResourceEvent::Updated { new, .. } => ObjectKey::from_resource(new),
        }
    }
}

/// Turns the raw event stream of a watcher into [`ResourceEvent`]s.
///
/// Owns the reflector writer of the watch: the previous version of an object
/// is read from the store before the event is applied, so that updates carry
/// the old object. A relist (`Init` ... `InitDone`) is compared with the store
/// when it completes: relisted objects are reported as created or updated,
/// stored objects missing from the relist as deleted.
pub struct EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    writer: Writer<K>,
    reader: Store<K>,
    relisted: Option<Vec<K>>,
}

impl<K> Debug for EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTranslator")
            .field("relisting", &self.relisted.is_some())
            .finish_non_exhaustive()
    }
}

impl<K> EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Create a translator over an empty store
    pub fn new(writer: Writer<K>) -> Self {
        Self {
            reader: writer.as_reader(),
            writer,
            relisted: None,
        }
    }

    /// Store the translator keeps current
    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    fn stored(&self, obj: &K) -> Option<K> {
        self.reader
            .get(&object_ref(&ObjectKey::from_resource(obj)))
            .map(|stored| stored.as_ref().clone())
    }

    /// Translate one watcher event and apply it to the store
    pub fn translate(&mut self, event: watcher::Event<K>) -> Vec<ResourceEvent<K>> {
        let events = match &event {
            watcher::Event::Apply(obj) => match self.stored(obj) {
                Some(old) => vec![ResourceEvent::Updated { old, new: obj.clone() }],
                None => vec![ResourceEvent::Created(obj.clone())],
            },
            watcher::Event::Delete(obj) => vec![ResourceEvent::Deleted(obj.clone())],
            watcher::Event::Init => {
                self.relisted = Some(Vec::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.relisted.get_or_insert_with(Vec::new).push(obj.clone());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let relisted_keys: HashSet<ObjectKey> = relisted.iter().map(ObjectKey::from_resource).collect();
                let mut events: Vec<ResourceEvent<K>> = relisted
                    .into_iter()
                    .map(|obj| match self.stored(&obj) {
                        Some(old) => ResourceEvent::Updated { old, new: obj },
                        None => ResourceEvent::Created(obj),
                    })
                    .collect();
                events.extend(
                    self.reader
                        .state()
                        .into_iter()
                        .filter(|stored| !relisted_keys.contains(&ObjectKey::from_resource(stored.as_ref())))
                        .map(|stored| ResourceEvent::Deleted(stored.as_ref().clone())),
                );
                events.sort_by_key(ResourceEvent::key);
                events
            }
        };
        self.writer.apply_watcher_event(&event);
        events
    }
}

/// Whether the predicate admits the event
pub async fn admit<K>(predicate: &dyn Predicate<K>, event: &ResourceEvent<K>) -> bool {
    match event {
        ResourceEvent::Created(obj) => predicate.create(obj).await,
        ResourceEvent::Updated { old, new } => predicate.update(old, new).await,
        ResourceEvent::Deleted(obj) => predicate.delete(obj).await,
    }
}

/// Controller action for a reconcile outcome
pub fn action_for(controller: &str, key: &ObjectKey, outcome: &Outcome) -> Action {
    match outcome {
        Outcome::Done(after) if after.is_zero() => Action::await_change(),
        Outcome::Done(after) => Action::requeue(*after),
        Outcome::RequeueAfter(after, cause) => {
            info!(controller, key = %key, requeue_after = ?after, "Requeueing object: {}", cause);
            Action::requeue(*after)
        }
    }
}

fn object_ref<K>(key: &ObjectKey) -> ObjectRef<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    let obj_ref = ObjectRef::new(&key.name);
    match &key.namespace {
        Some(namespace) => obj_ref.within(namespace),
        None => obj_ref,
    }
}

/// Reconciles objects that are no longer in the controller store.
///
/// Failed reconciliations are retried after `retry_delay` until they succeed.
/// A key is reconciled by at most one task at a time.
struct GoneReconciler<K> {
    reconciler: Arc<Reconciler<K>>,
    in_flight: Arc<Mutex<HashSet<ObjectKey>>>,
    retry_delay: Duration,
}

impl<K> GoneReconciler<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn new(reconciler: Arc<Reconciler<K>>, retry_delay: Duration) -> Self {
        Self {
            reconciler,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            retry_delay,
        }
    }

    fn reconcile(&self, key: ObjectKey) -> Option<JoinHandle<()>> {
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            debug!(controller = %self.reconciler.name(), key = %key, "Reconciliation already in flight");
            return None;
        }

        let reconciler = Arc::clone(&self.reconciler);
        let in_flight = Arc::clone(&self.in_flight);
        let retry_delay = self.retry_delay;
        Some(tokio::spawn(async move {
            loop {
                match reconciler.reconcile(&key).await {
                    Ok(outcome) => {
                        debug!(controller = %reconciler.name(), key = %key, ?outcome, "Reconciled object that is gone");
                        break;
                    }
                    Err(e) => error!(
                        controller = %reconciler.name(),
                        key = %key,
                        retry_in = ?retry_delay,
                        "Reconciliation failed: {}",
                        e
                    ),
                }
                tokio::time::sleep(retry_delay).await;
            }
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }))
    }
}

enum Input<K> {
    Watch(Result<watcher::Event<K>, watcher::Error>),
    Owner(ObjectKey),
}

/// Sends admitted objects to the controller, reconciles the rest directly.
async fn dispatch_events<K>(
    api: Api<K>,
    reconciler: Arc<Reconciler<K>>,
    predicate: Arc<dyn Predicate<K>>,
    owner_keys: UnboundedReceiver<ObjectKey>,
    writer: Writer<K>,
    triggers: UnboundedSender<K>,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let controller = reconciler.name().to_string();
    let gone = GoneReconciler::new(reconciler, ERROR_REQUEUE_DELAY);
    let mut translator = EventTranslator::new(writer);
    let reader = translator.reader();

    let watch = watcher(api, watcher::Config::default())
        .default_backoff()
        .map(Input::Watch)
        .boxed();
    let owners = owner_keys.map(Input::Owner);
    let mut inputs = futures::stream::select(watch, owners);

    while let Some(input) = inputs.next().await {
        match input {
            Input::Watch(Ok(event)) => {
                for event in translator.translate(event) {
                    if !admit(predicate.as_ref(), &event).await {
                        continue;
                    }
                    match event {
                        ResourceEvent::Created(obj) | ResourceEvent::Updated { new: obj, .. } => {
                            triggers
                                .unbounded_send(obj)
                                .map_err(|e| ControllerError::Watch(format!("{controller} queue closed: {e}")))?;
                        }
                        ResourceEvent::Deleted(obj) => {
                            gone.reconcile(ObjectKey::from_resource(&obj));
                        }
                    }
                }
            }
            Input::Watch(Err(e)) => {
                warn!(controller = %controller, "Watch error, retrying: {}", e);
            }
            Input::Owner(key) => match reader.get(&object_ref(&key)) {
                Some(owner) => {
                    triggers
                        .unbounded_send(owner.as_ref().clone())
                        .map_err(|e| ControllerError::Watch(format!("{controller} queue closed: {e}")))?;
                }
                None => {
                    gone.reconcile(key);
                }
            },
        }
    }

    Err(ControllerError::Watch(format!("{controller} watch stream ended")))
}

async fn reconcile<K>(obj: Arc<K>, reconciler: Arc<Reconciler<K>>) -> Result<Action, ReconcileError>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let key = ObjectKey::from_resource(obj.as_ref());
    let outcome = reconciler.reconcile(&key).await?;
    Ok(action_for(reconciler.name(), &key, &outcome))
}

fn error_policy<K>(obj: Arc<K>, error: &ReconcileError, reconciler: Arc<Reconciler<K>>) -> Action
where
    K: Resource + Clone + Send + Sync + 'static,
{
    error!(
        controller = %reconciler.name(),
        key = %ObjectKey::from_resource(obj.as_ref()),
        "Reconciliation failed: {}",
        error
    );
    Action::requeue(ERROR_REQUEUE_DELAY)
}

/// Watches objects of kind `K` and reconciles them until shutdown.
///
/// # Arguments
/// * `api` - Api the objects are watched through
/// * `reconciler` - Reconciler for the kind
/// * `predicate` - Decides which events are enqueued
/// * `owner_keys` - Keys of owners to reconcile, sent by [`watch_owned`]
/// * `concurrency` - Maximum number of concurrent reconciliations
pub async fn watch_resource<K>(
    api: Api<K>,
    reconciler: Arc<Reconciler<K>>,
    predicate: Arc<dyn Predicate<K>>,
    owner_keys: UnboundedReceiver<ObjectKey>,
    concurrency: u16,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
{
    let name = reconciler.name().to_string();
    info!(controller = %name, concurrency, "Starting watcher");

    let (reader, writer) = reflector::store();
    let (triggers, trigger_stream) = unbounded();

    let events = dispatch_events(api, Arc::clone(&reconciler), predicate, owner_keys, writer, triggers);

    let controller = Controller::for_stream(trigger_stream.map(Ok::<K, watcher::Error>), reader)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| {
            let name = name.clone();
            async move {
                match res {
                    Ok((obj_ref, action)) => debug!(controller = %name, object = %obj_ref, ?action, "Reconciled"),
                    // Requeued objects that have been deleted in the meantime
                    Err(RuntimeError::ObjectNotFound(obj_ref)) => {
                        debug!(controller = %name, object = %obj_ref, "Object no longer exists");
                    }
                    Err(RuntimeError::ReconcilerFailed(..)) => {}
                    Err(e) => error!(controller = %name, "Controller error: {}", e),
                }
            }
        });

    tokio::select! {
        () = controller => {
            info!(controller = %name, "Controller stopped");
            Ok(())
        }
        res = events => res,
    }
}

/// Watches owned records of kind `C` and sends the keys of owners that must
/// be reconciled to `owners`.
pub async fn watch_owned<C>(
    name: &str,
    api: Api<C>,
    predicate: Arc<dyn Predicate<C>>,
    mapper: LabelMapper,
    owners: UnboundedSender<ObjectKey>,
) -> Result<(), ControllerError>
where
    C: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    C::DynamicType: Default + Eq + Hash + Clone,
{
    info!(controller = %name, "Starting owned object watcher");
    let (_, writer) = reflector::store();
    let mut translator = EventTranslator::new(writer);
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(controller = %name, "Owned object watch error, retrying: {}", e);
                continue;
            }
        };
        for event in translator.translate(event) {
            if !admit(predicate.as_ref(), &event).await {
                continue;
            }
            let obj = match &event {
                ResourceEvent::Created(obj) | ResourceEvent::Updated { new: obj, .. } | ResourceEvent::Deleted(obj) => obj,
            };
            let owner = mapper.map(obj.meta());
            debug!(controller = %name, object = %event.key(), owner = %owner, "Enqueueing owner");
            owners
                .unbounded_send(owner)
                .map_err(|e| ControllerError::Watch(format!("{name} owner queue closed: {e}")))?;
        }
    }

    Err(ControllerError::Watch(format!("{name} owned object watch stream ended")))
}

/// Stream of owner keys for a controller without owned watches
pub fn no_owner_keys() -> UnboundedReceiver<ObjectKey> {
    let (_, receiver) = unbounded();
    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::service::ServiceActuator;
    use crate::client::ResourceClient;
    use crate::predicate::GenerationChangedPredicate;
    use crate::reconciler::Prototype;
    use crate::test_utils::{MockOperation, MockResourceClient, TEST_NAMESPACE, create_test_public_ip_address, with_labels};
    use crds::PublicIPAddress;
    use crds::constants::{SERVICE_FINALIZER, SERVICE_LABEL};
    use futures::Stream;
    use k8s_openapi::api::core::v1::Service;

    async fn translate_all<S>(events: S) -> Vec<ResourceEvent<PublicIPAddress>>
    where
        S: Stream<Item = watcher::Event<PublicIPAddress>>,
    {
        let mut translator = translator();
        let mut out = Vec::new();
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            out.extend(translator.translate(event));
        }
        out
    }

    fn translator() -> EventTranslator<PublicIPAddress> {
        let (_, writer) = reflector::store();
        EventTranslator::new(writer)
    }

    fn pubip(name: &str, generation: i64) -> PublicIPAddress {
        let mut pubip = create_test_public_ip_address(name, "1.2.3.4");
        pubip.metadata.generation = Some(generation);
        pubip
    }

    fn names(events: &[ResourceEvent<PublicIPAddress>]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                ResourceEvent::Created(obj) => format!("created {}", obj.metadata.name.as_deref().unwrap_or_default()),
                ResourceEvent::Updated { new, .. } => format!("updated {}", new.metadata.name.as_deref().unwrap_or_default()),
                ResourceEvent::Deleted(obj) => format!("deleted {}", obj.metadata.name.as_deref().unwrap_or_default()),
            })
            .collect()
    }

    #[test]
    fn test_apply_and_delete() {
        let mut translator = translator();
        let created = translator.translate(watcher::Event::Apply(pubip("ip1", 1)));
        assert_eq!(created, vec![ResourceEvent::Created(pubip("ip1", 1))]);

        let updated = translator.translate(watcher::Event::Apply(pubip("ip1", 2)));
        assert_eq!(
            updated,
            vec![ResourceEvent::Updated {
                old: pubip("ip1", 1),
                new: pubip("ip1", 2)
            }]
        );

        let deleted = translator.translate(watcher::Event::Delete(pubip("ip1", 2)));
        assert_eq!(deleted, vec![ResourceEvent::Deleted(pubip("ip1", 2))]);

        // Seen again after deletion: a creation
        let recreated = translator.translate(watcher::Event::Apply(pubip("ip1", 1)));
        assert_eq!(names(&recreated), vec!["created ip1"]);
    }

    #[tokio::test]
    async fn test_relist_reports_changes_when_done() {
        let events = futures::stream::iter([
            watcher::Event::Init,
            watcher::Event::InitApply(pubip("ip1", 1)),
            watcher::Event::InitApply(pubip("ip2", 1)),
            watcher::Event::InitDone,
            // Reconnect: ip1 deleted and ip3 created while disconnected
            watcher::Event::Init,
            watcher::Event::InitApply(pubip("ip2", 2)),
            watcher::Event::InitApply(pubip("ip3", 1)),
            watcher::Event::InitDone,
        ]);

        let translated = translate_all(events).await;

        assert_eq!(
            names(&translated),
            vec!["created ip1", "created ip2", "deleted ip1", "updated ip2", "created ip3"]
        );
    }

    #[test]
    fn test_relist_without_objects_deletes_everything() {
        let mut translator = translator();
        translator.translate(watcher::Event::Apply(pubip("ip1", 1)));
        assert!(translator.translate(watcher::Event::Init).is_empty());
        let events = translator.translate(watcher::Event::InitDone);
        assert_eq!(names(&events), vec!["deleted ip1"]);
    }

    #[test]
    fn test_store_follows_events() {
        let mut translator = translator();
        let reader = translator.reader();
        translator.translate(watcher::Event::Apply(pubip("ip1", 1)));
        translator.translate(watcher::Event::Apply(pubip("ip2", 1)));
        translator.translate(watcher::Event::Delete(pubip("ip1", 1)));
        assert_eq!(reader.state().len(), 1);

        // A relist replaces the store only once it is done
        translator.translate(watcher::Event::Init);
        translator.translate(watcher::Event::InitApply(pubip("ip3", 1)));
        assert_eq!(reader.state()[0].metadata.name.as_deref(), Some("ip2"));
        translator.translate(watcher::Event::InitDone);
        let names: Vec<_> = reader.state().iter().filter_map(|obj| obj.metadata.name.clone()).collect();
        assert_eq!(names, vec!["ip3".to_string()]);
    }

    #[tokio::test]
    async fn test_admit_routes_to_predicate() {
        let predicate = GenerationChangedPredicate;
        let status_write = ResourceEvent::Updated {
            old: pubip("ip1", 1),
            new: pubip("ip1", 1),
        };
        let spec_write = ResourceEvent::Updated {
            old: pubip("ip1", 1),
            new: pubip("ip1", 2),
        };

        assert!(admit(&predicate, &ResourceEvent::Created(pubip("ip1", 1))).await);
        assert!(!admit(&predicate, &status_write).await);
        assert!(admit(&predicate, &spec_write).await);
        assert!(admit(&predicate, &ResourceEvent::Deleted(pubip("ip1", 1))).await);
    }

    #[test]
    fn test_action_for_outcome() {
        let key = ObjectKey::namespaced("kube-system", "ip1");
        assert_eq!(action_for("test", &key, &Outcome::done()), Action::await_change());
        assert_eq!(
            action_for("test", &key, &Outcome::Done(Duration::from_secs(30))),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            action_for(
                "test",
                &key,
                &Outcome::RequeueAfter(Duration::from_secs(5), "still exists".to_string())
            ),
            Action::requeue(Duration::from_secs(5))
        );
    }

    fn service_reconciler(
        services: &Arc<MockResourceClient<Service>>,
        records: &Arc<MockResourceClient<PublicIPAddress>>,
    ) -> Arc<Reconciler<Service>> {
        let actuator = ServiceActuator::new(
            Arc::clone(records) as Arc<dyn ResourceClient<PublicIPAddress>>,
            TEST_NAMESPACE,
            Duration::from_secs(60),
            Vec::new(),
        );
        let prototype: Prototype<Service> = Arc::new(|key: &ObjectKey| {
            let mut service = Service::default();
            service.metadata.namespace = key.namespace.clone();
            service.metadata.name = Some(key.name.clone());
            service
        });
        Arc::new(
            Reconciler::new(
                "service",
                SERVICE_FINALIZER,
                Arc::new(actuator),
                Arc::clone(services) as Arc<dyn ResourceClient<Service>>,
            )
            .with_ensure_deleted(prototype),
        )
    }

    fn labelled_record() -> PublicIPAddress {
        let mut pubip = create_test_public_ip_address("test-svc1-1.2.3.4", "1.2.3.4");
        with_labels(&mut pubip.metadata, &[(SERVICE_LABEL, "test.svc1")]);
        pubip
    }

    #[tokio::test]
    async fn test_gone_object_is_retried_until_cleaned_up() {
        let services = Arc::new(MockResourceClient::<Service>::new());
        let records = Arc::new(MockResourceClient::with_objects([labelled_record()]));
        records.fail(MockOperation::List, 1, 500, "InternalError");
        let gone = GoneReconciler::new(service_reconciler(&services, &records), Duration::from_millis(10));

        let task = gone.reconcile(ObjectKey::namespaced("test", "svc1")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(records.count(MockOperation::List), 2);
        assert!(records.objects().is_empty());
        assert!(gone.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gone_object_is_reconciled_once_at_a_time() {
        let services = Arc::new(MockResourceClient::<Service>::new());
        let records = Arc::new(MockResourceClient::with_objects([labelled_record()]));
        records.fail(MockOperation::List, 1, 500, "InternalError");
        let gone = GoneReconciler::new(service_reconciler(&services, &records), Duration::from_millis(50));
        let key = ObjectKey::namespaced("test", "svc1");

        let task = gone.reconcile(key.clone()).unwrap();
        assert!(gone.reconcile(key.clone()).is_none());
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        // Accepted again once the first reconciliation is done
        let task = gone.reconcile(key).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
