//! The backend's process-wide resource collection: one split hashring per
//! resource type, plus the registry of distributors that want to hear about
//! changes.

use crate::hashring::{Hashring, OnAddHook};
use crate::queue::ResourceDiff;
use crate::resource::{Hashkey, Resource, ResourceRequest, TestRecord};
use crate::stencil::{SplitHashring, Stencil};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceEvent {
    New,
    Changed,
    Gone,
}

/// What we need to keep a distributor informed: its original request and the
/// channels its update streams hang off of.
pub struct EventRecipient {
    pub request: ResourceRequest,
    pub channels: Vec<UnboundedSender<ResourceDiff>>,
}

/// The backend's collection of resources.
///
/// The per-type hashrings each sit behind their own reader-writer lock; the
/// recipient registry has its own.  Mutations propagate single-resource
/// diffs to every registered distributor whose stencil subset contains the
/// resource.
pub struct BackendResources {
    collection: HashMap<String, RwLock<SplitHashring>>,
    stencil: Arc<Stencil>,
    recipients: RwLock<HashMap<String, EventRecipient>>,
}

impl BackendResources {
    /// Creates a collection with one split hashring per resource type, all
    /// sharing the given stencil.  The on-add hook, if any, is threaded
    /// through each hashring.
    pub fn new(resource_types: &[String], stencil: Stencil, on_add: Option<OnAddHook>) -> Self {
        let stencil = Arc::new(stencil);
        let mut collection = HashMap::new();
        for type_tag in resource_types {
            tracing::info!(%type_tag, "creating split hashring");
            let ring = match &on_add {
                Some(hook) => Hashring::with_hook(hook.clone()),
                None => Hashring::new(),
            };
            collection.insert(
                type_tag.clone(),
                RwLock::new(SplitHashring::new(ring, stencil.clone())),
            );
        }
        Self {
            collection,
            stencil,
            recipients: RwLock::new(HashMap::new()),
        }
    }

    /// The resource types this collection manages.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.collection.keys().cloned().collect();
        types.sort();
        types
    }

    /// Adds the given resource.  A resource of an unknown type is silently
    /// dropped; upstream may send us junk.  A new uid emits a `new` event, a
    /// known uid with a changed oid emits `changed`, and a known uid with an
    /// unchanged oid only refreshes the node's timestamp.
    pub async fn add(&self, r: Box<dyn Resource>) {
        let Some(entry) = self.collection.get(r.type_tag()) else {
            return;
        };
        let mut split = entry.write().await;
        let event = match split.ring.get_exact(r.uid()) {
            Ok(old) if old.oid() == r.oid() => None,
            Ok(_) => Some(ResourceEvent::Changed),
            Err(_) => Some(ResourceEvent::New),
        };
        split.ring.add_or_update(r.clone());
        // Propagate while the ring is still locked, so a subscriber sees
        // events for a single resource in mutation order.
        if let Some(event) = event {
            self.propagate(r, event).await;
        }
    }

    /// The resources of the given type that the stencil allocates to the
    /// given distributor.
    pub async fn get(&self, dist_name: &str, type_tag: &str) -> Vec<Box<dyn Resource>> {
        let Some(entry) = self.collection.get(type_tag) else {
            tracing::warn!(%type_tag, "requested resource type not in collection");
            return Vec::new();
        };
        match entry.read().await.get_for_dist(dist_name) {
            Ok(resources) => resources,
            Err(err) => {
                tracing::warn!(%dist_name, %err, "failed to get resources for distributor");
                Vec::new()
            }
        }
    }

    /// All resources of the given type, regardless of distributor.
    pub async fn get_all(&self, type_tag: &str) -> Vec<Box<dyn Resource>> {
        match self.collection.get(type_tag) {
            Some(entry) => entry.read().await.ring.get_all(),
            None => Vec::new(),
        }
    }

    /// A diff holding everything the given request is entitled to, as `new`
    /// entries.  This is the first frame of a resource stream.
    pub async fn snapshot(&self, request: &ResourceRequest) -> ResourceDiff {
        let mut diff = ResourceDiff::new();
        for type_tag in &request.resource_types {
            for r in self.get(&request.request_origin, type_tag).await {
                diff.new.push(r);
            }
        }
        diff
    }

    /// Removes expired resources from every hashring, emitting a `gone`
    /// event for each.
    pub async fn prune(&self) {
        for (type_tag, entry) in &self.collection {
            let mut split = entry.write().await;
            let before = split.ring.len();
            let pruned = split.ring.prune();
            if !pruned.is_empty() {
                tracing::info!(
                    num = pruned.len(),
                    total = before,
                    %type_tag,
                    "pruned expired resources",
                );
            }
            for r in pruned {
                self.propagate(r, ResourceEvent::Gone).await;
            }
        }
    }

    /// Overwrites the test record of the resource with the given uid.  Test
    /// results do not change a resource's oid, so no event is emitted.
    pub async fn update_test_record(&self, type_tag: &str, uid: Hashkey, record: TestRecord) {
        let Some(entry) = self.collection.get(type_tag) else {
            return;
        };
        if let Err(err) = entry.write().await.ring.set_test_record(uid, record) {
            tracing::warn!(%type_tag, uid, %err, "cannot record test result");
        }
    }

    /// Registers a channel to be informed about resource updates.
    pub async fn register(&self, request: ResourceRequest, channel: UnboundedSender<ResourceDiff>) {
        let mut recipients = self.recipients.write().await;
        let dist_name = request.request_origin.clone();
        tracing::info!(%dist_name, "registered new update channel for distributor");
        recipients
            .entry(dist_name)
            .and_modify(|recipient| recipient.channels.push(channel.clone()))
            .or_insert_with(|| EventRecipient {
                request,
                channels: vec![channel],
            });
    }

    /// Unregisters a previously registered channel.
    pub async fn unregister(&self, dist_name: &str, channel: &UnboundedSender<ResourceDiff>) {
        let mut recipients = self.recipients.write().await;
        if let Some(recipient) = recipients.get_mut(dist_name) {
            recipient.channels.retain(|c| !c.same_channel(channel));
            if recipient.channels.is_empty() {
                recipients.remove(dist_name);
            }
            tracing::info!(%dist_name, "unregistered update channel");
        }
    }

    /// Sends a single-resource diff to every distributor whose request
    /// covers the resource's type and whose stencil subset owns it.
    async fn propagate(&self, r: Box<dyn Resource>, event: ResourceEvent) {
        let mut recipients = self.recipients.write().await;
        for (dist_name, recipient) in recipients.iter_mut() {
            if !recipient.request.has_resource_type(r.type_tag()) {
                continue;
            }
            if !self.stencil.owns(dist_name, r.as_ref()) {
                continue;
            }

            let mut diff = ResourceDiff::new();
            match event {
                ResourceEvent::New => diff.new.push(r.clone()),
                ResourceEvent::Changed => diff.changed.push(r.clone()),
                ResourceEvent::Gone => diff.gone.push(r.clone()),
            }
            recipient.channels.retain(|c| {
                if c.send(diff.clone()).is_err() {
                    tracing::info!(%dist_name, "dropping closed update channel");
                    false
                } else {
                    true
                }
            });
        }
        recipients.retain(|_, recipient| !recipient.channels.is_empty());
    }

    /// A per-type summary of the collection, e.g. "10 obfs4, 3 vanilla".
    pub async fn summary(&self) -> String {
        let mut parts = Vec::new();
        for type_tag in self.resource_types() {
            if let Some(entry) = self.collection.get(&type_tag) {
                parts.push(format!("{} {type_tag}", entry.read().await.len()));
            }
        }
        parts.join(", ")
    }
}
