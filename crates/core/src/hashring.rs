//! A sorted, uid-keyed container with closest-ceiling lookup.

use crate::queue::ResourceDiff;
use crate::resource::{Hashkey, Resource};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Invoked whenever a resource enters the ring and deserves a functionality
/// test.  The test pool injects this at collection construction.
pub type OnAddHook = Arc<dyn Fn(Box<dyn Resource>) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashringError {
    #[error("hashring is empty")]
    Empty,
    #[error("key `{0}` not found in hashring")]
    NotFound(Hashkey),
    #[error("resource already present in hashring")]
    AlreadyPresent,
    #[error("requested {wanted} resources but hashring only has {have}")]
    NotEnough { wanted: usize, have: usize },
}

/// A node in a hashring.
#[derive(Clone, Debug)]
pub struct Hashnode {
    pub hashkey: Hashkey,
    pub elem: Box<dyn Resource>,
    pub last_update: DateTime<Utc>,
}

impl Hashnode {
    fn new(hashkey: Hashkey, elem: Box<dyn Resource>) -> Self {
        Self {
            hashkey,
            elem,
            last_update: Utc::now(),
        }
    }
}

/// A hashring of resources, ordered ascending by uid.
#[derive(Clone, Default)]
pub struct Hashring {
    nodes: Vec<Hashnode>,
    on_add: Option<OnAddHook>,
}

impl Hashring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: OnAddHook) -> Self {
        Self {
            nodes: Vec::new(),
            on_add: Some(hook),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The index of the exact key, or the insertion point if it is absent.
    fn locate(&self, key: Hashkey) -> Result<usize, usize> {
        self.nodes.binary_search_by_key(&key, |n| n.hashkey)
    }

    /// The index of the first node whose key is >= the query, wrapping
    /// around to index 0 past the last node.
    fn index_ceiling(&self, key: Hashkey) -> Result<usize, HashringError> {
        if self.nodes.is_empty() {
            return Err(HashringError::Empty);
        }
        Ok(match self.locate(key) {
            Ok(i) => i,
            Err(i) if i == self.nodes.len() => 0,
            Err(i) => i,
        })
    }

    /// Adds the given resource.  If a resource with the same uid is already
    /// present, only its timestamp is refreshed and an error is returned.
    pub fn add(&mut self, r: Box<dyn Resource>) -> Result<(), HashringError> {
        let uid = r.uid();
        match self.locate(uid) {
            Ok(i) => {
                self.nodes[i].last_update = Utc::now();
                Err(HashringError::AlreadyPresent)
            }
            Err(i) => {
                self.maybe_test(r.as_ref());
                self.nodes.insert(i, Hashnode::new(uid, r));
                Ok(())
            }
        }
    }

    /// Adds the resource, or refreshes the existing node with the same uid.
    /// The stored element is only replaced if its oid changed.
    pub fn add_or_update(&mut self, r: Box<dyn Resource>) {
        self.maybe_test(r.as_ref());
        let uid = r.uid();
        match self.locate(uid) {
            Ok(i) => {
                self.nodes[i].last_update = Utc::now();
                if self.nodes[i].elem.oid() != r.oid() {
                    self.nodes[i].elem = r;
                }
            }
            Err(i) => self.nodes.insert(i, Hashnode::new(uid, r)),
        }
    }

    /// Hands the resource to the on-add hook unless an identical copy (same
    /// uid and oid) is present that was already tested recently enough.
    fn maybe_test(&self, r: &(dyn Resource + 'static)) {
        let Some(hook) = &self.on_add else {
            return;
        };
        if let Ok(i) = self.locate(r.uid()) {
            let old = &self.nodes[i].elem;
            if old.oid() == r.oid() && old.test().tested_within(old.expiry()) {
                return;
            }
        }
        hook(dyn_clone::clone_box(r));
    }

    pub fn remove(&mut self, uid: Hashkey) -> Result<Box<dyn Resource>, HashringError> {
        if self.nodes.is_empty() {
            return Err(HashringError::Empty);
        }
        match self.locate(uid) {
            Ok(i) => Ok(self.nodes.remove(i).elem),
            Err(_) => Err(HashringError::NotFound(uid)),
        }
    }

    /// Returns the element whose key is the closest to the given key in
    /// ascending direction, wrapping around past the highest key.
    pub fn get(&self, key: Hashkey) -> Result<Box<dyn Resource>, HashringError> {
        let i = self.index_ceiling(key)?;
        Ok(self.nodes[i].elem.clone())
    }

    /// Returns the element with exactly the given key.
    pub fn get_exact(&self, key: Hashkey) -> Result<Box<dyn Resource>, HashringError> {
        if self.nodes.is_empty() {
            return Err(HashringError::Empty);
        }
        match self.locate(key) {
            Ok(i) => Ok(self.nodes[i].elem.clone()),
            Err(_) => Err(HashringError::NotFound(key)),
        }
    }

    /// Like [`get`](Self::get), but walks the ring to collect up to `num`
    /// distinct functional elements.  Requesting more elements than the ring
    /// holds is an error.
    pub fn get_many(
        &self,
        key: Hashkey,
        num: usize,
    ) -> Result<Vec<Box<dyn Resource>>, HashringError> {
        if num > self.nodes.len() {
            return Err(HashringError::NotEnough {
                wanted: num,
                have: self.nodes.len(),
            });
        }
        let start = self.index_ceiling(key)?;

        let mut out = Vec::with_capacity(num);
        for j in 0..self.nodes.len() {
            if out.len() == num {
                break;
            }
            let node = &self.nodes[(start + j) % self.nodes.len()];
            if !node.elem.test().is_functional() {
                tracing::debug!(
                    resource = %node.elem,
                    state = %node.elem.test().state,
                    "skipping non-functional resource",
                );
                continue;
            }
            out.push(node.elem.clone());
        }
        Ok(out)
    }

    /// All resources, in ring order.
    pub fn get_all(&self) -> Vec<Box<dyn Resource>> {
        self.nodes.iter().map(|n| n.elem.clone()).collect()
    }

    /// A new hashring holding only the elements that pass the predicate.
    pub fn filter<F>(&self, pred: F) -> Hashring
    where
        F: Fn(&dyn Resource) -> bool,
    {
        Hashring {
            nodes: self
                .nodes
                .iter()
                .filter(|n| pred(n.elem.as_ref()))
                .cloned()
                .collect(),
            on_add: None,
        }
    }

    /// Overwrites the test record of the resource with the given uid.
    pub fn set_test_record(
        &mut self,
        uid: Hashkey,
        record: crate::resource::TestRecord,
    ) -> Result<(), HashringError> {
        if self.nodes.is_empty() {
            return Err(HashringError::Empty);
        }
        match self.locate(uid) {
            Ok(i) => {
                self.nodes[i].elem.set_test(record);
                Ok(())
            }
            Err(_) => Err(HashringError::NotFound(uid)),
        }
    }

    /// Applies a diff: new resources are added, changed resources are
    /// updated, and gone resources are removed.
    pub fn apply_diff(&mut self, diff: ResourceDiff) {
        for (type_tag, queue) in diff.new {
            tracing::info!(num = queue.len(), %type_tag, "adding resources");
            for r in queue {
                let _ = self.add(r);
            }
        }
        for (type_tag, queue) in diff.changed {
            tracing::info!(num = queue.len(), %type_tag, "changing resources");
            for r in queue {
                self.add_or_update(r);
            }
        }
        for (type_tag, queue) in diff.gone {
            tracing::info!(num = queue.len(), %type_tag, "removing resources");
            for r in queue {
                let _ = self.remove(r.uid());
            }
        }
    }

    /// The resources that are 1) in `self` but not `other` (new), 2) in both
    /// but with changed oids (changed), and 3) in `other` but not `self`
    /// (gone).  `self` is the new information; `other` the state it is
    /// compared against.
    pub fn diff(&self, other: &Hashring) -> ResourceDiff {
        let mut diff = ResourceDiff::new();

        for node in &self.nodes {
            let r1 = &node.elem;
            match other.locate(r1.uid()) {
                Err(_) => diff.new.push(r1.clone()),
                Ok(i) => {
                    if other.nodes[i].elem.oid() != r1.oid() {
                        diff.changed.push(r1.clone());
                    }
                }
            }
        }

        for node in &other.nodes {
            let r2 = &node.elem;
            if self.locate(r2.uid()).is_err() {
                diff.gone.push(r2.clone());
            }
        }

        diff
    }

    /// Removes and returns resources that went unrefreshed for longer than
    /// their expiry.
    pub fn prune(&mut self) -> Vec<Box<dyn Resource>> {
        let now = Utc::now();
        let mut pruned = Vec::new();
        self.nodes.retain(|node| {
            if now.signed_duration_since(node.last_update) > node.elem.expiry() {
                pruned.push(node.elem.clone());
                false
            } else {
                true
            }
        });
        pruned
    }
}
