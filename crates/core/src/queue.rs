//! Ordered resource queues, per-type resource maps, and the diff type that
//! describes how a set of resources changed.

use crate::resource::{Hashkey, Resource};
use std::collections::hash_map;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("resource already present in queue")]
    Duplicate,
    #[error("resource not found in queue")]
    NotFound,
}

/// An ordered sequence of resources with unique uids.
#[derive(Clone, Debug, Default)]
pub struct ResourceQueue(VecDeque<Box<dyn Resource>>);

impl ResourceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends the given resource.  A resource whose uid is already present
    /// is rejected.
    pub fn enqueue(&mut self, r: Box<dyn Resource>) -> Result<(), QueueError> {
        if self.search(r.uid()).is_some() {
            return Err(QueueError::Duplicate);
        }
        self.0.push_back(r);
        Ok(())
    }

    /// Removes and returns the oldest resource.
    pub fn dequeue(&mut self) -> Result<Box<dyn Resource>, QueueError> {
        self.0.pop_front().ok_or(QueueError::Empty)
    }

    /// Removes the resource with the given uid.
    pub fn delete(&mut self, uid: Hashkey) -> Result<Box<dyn Resource>, QueueError> {
        match self.0.iter().position(|r| r.uid() == uid) {
            Some(i) => self.0.remove(i).ok_or(QueueError::NotFound),
            None => Err(QueueError::NotFound),
        }
    }

    /// Replaces the queued resource that shares the given resource's uid.
    pub fn update(&mut self, r: Box<dyn Resource>) -> Result<(), QueueError> {
        match self.0.iter().position(|old| old.uid() == r.uid()) {
            Some(i) => {
                self.0[i] = r;
                Ok(())
            }
            None => Err(QueueError::NotFound),
        }
    }

    pub fn search(&self, uid: Hashkey) -> Option<&dyn Resource> {
        self.0.iter().find(|r| r.uid() == uid).map(|r| r.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Resource> {
        self.0.iter().map(|r| r.as_ref())
    }
}

impl IntoIterator for ResourceQueue {
    type Item = Box<dyn Resource>;
    type IntoIter = std::collections::vec_deque::IntoIter<Box<dyn Resource>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Box<dyn Resource>> for ResourceQueue {
    fn from_iter<I: IntoIterator<Item = Box<dyn Resource>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Maps resource type tags to queues of resources of that type.
#[derive(Clone, Debug, Default)]
pub struct ResourceMap(HashMap<String, ResourceQueue>);

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The total number of resources across all types.
    pub fn total(&self) -> usize {
        self.0.values().map(ResourceQueue::len).sum()
    }

    pub fn queue(&self, type_tag: &str) -> Option<&ResourceQueue> {
        self.0.get(type_tag)
    }

    pub fn queue_mut(&mut self, type_tag: &str) -> &mut ResourceQueue {
        self.0.entry(type_tag.to_string()).or_default()
    }

    /// Appends the resource to the queue of its type.
    pub fn push(&mut self, r: Box<dyn Resource>) {
        self.queue_mut(r.type_tag()).0.push_back(r);
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, ResourceQueue> {
        self.0.iter()
    }

    /// Applies a diff: new resources are enqueued, changed resources are
    /// updated in place, and gone resources are deleted, in that order.
    /// Conflicts (duplicate new entries, missing changed or gone entries)
    /// are logged and skipped.
    pub fn apply(&mut self, diff: ResourceDiff) {
        for (type_tag, queue) in diff.new.0 {
            for r in queue {
                if let Err(err) = self.queue_mut(&type_tag).enqueue(r) {
                    tracing::warn!(%type_tag, %err, "skipping new resource");
                }
            }
        }
        for (type_tag, queue) in diff.changed.0 {
            for r in queue {
                if let Err(err) = self.queue_mut(&type_tag).update(r) {
                    tracing::warn!(%type_tag, %err, "skipping changed resource");
                }
            }
        }
        for (type_tag, queue) in diff.gone.0 {
            for r in queue {
                if let Err(err) = self.queue_mut(&type_tag).delete(r.uid()) {
                    tracing::warn!(%type_tag, %err, "skipping gone resource");
                }
            }
        }
    }
}

impl IntoIterator for ResourceMap {
    type Item = (String, ResourceQueue);
    type IntoIter = hash_map::IntoIter<String, ResourceQueue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The resources that are new, changed, and gone with respect to some prior
/// state.  Diffs are what the backend streams to distributors.
#[derive(Clone, Debug, Default)]
pub struct ResourceDiff {
    pub new: ResourceMap,
    pub changed: ResourceMap,
    pub gone: ResourceMap,
}

impl ResourceDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.new.total() == 0 && self.changed.total() == 0 && self.gone.total() == 0
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (desc, map) in [
            ("new", &self.new),
            ("changed", &self.changed),
            ("gone", &self.gone),
        ] {
            for (type_tag, queue) in map.iter() {
                parts.push(format!("{} {desc} {type_tag}", queue.len()));
            }
        }
        write!(f, "resource diff: {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::Dummy;

    #[test]
    fn enqueue_rejects_duplicates() {
        let mut q = ResourceQueue::new();
        q.enqueue(Box::new(Dummy::new(1, 1))).expect("first enqueue");
        assert_eq!(
            q.enqueue(Box::new(Dummy::new(2, 1))),
            Err(QueueError::Duplicate)
        );
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn dequeue_is_fifo() {
        let mut q = ResourceQueue::new();
        q.enqueue(Box::new(Dummy::new(1, 1))).expect("enqueue");
        q.enqueue(Box::new(Dummy::new(2, 2))).expect("enqueue");

        assert_eq!(q.dequeue().expect("non-empty").uid(), 1);
        assert_eq!(q.dequeue().expect("non-empty").uid(), 2);
        assert_eq!(q.dequeue().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn update_replaces_matching_uid() {
        let mut q = ResourceQueue::new();
        q.enqueue(Box::new(Dummy::new(1, 1))).expect("enqueue");

        q.update(Box::new(Dummy::new(9, 1))).expect("update");
        assert_eq!(q.search(1).expect("present").oid(), 9);

        assert_eq!(
            q.update(Box::new(Dummy::new(1, 42))),
            Err(QueueError::NotFound)
        );
    }

    #[test]
    fn delete_by_uid() {
        let mut q = ResourceQueue::new();
        q.enqueue(Box::new(Dummy::new(1, 1))).expect("enqueue");

        assert!(q.delete(1).is_ok());
        assert!(q.is_empty());
        assert_eq!(q.delete(1).unwrap_err(), QueueError::NotFound);
    }

    #[test]
    fn apply_runs_new_changed_gone_in_order() {
        let mut map = ResourceMap::new();
        map.push(Box::new(Dummy::new(1, 1)));
        map.push(Box::new(Dummy::new(2, 2)));

        let mut diff = ResourceDiff::new();
        diff.new.push(Box::new(Dummy::new(3, 3)));
        diff.changed.push(Box::new(Dummy::new(9, 1)));
        diff.gone.push(Box::new(Dummy::new(2, 2)));
        map.apply(diff);

        let queue = map.queue("dummy").expect("queue exists");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.search(1).expect("present").oid(), 9);
        assert!(queue.search(2).is_none());
        assert!(queue.search(3).is_some());
    }
}
