//! Core data model for ferry: resources, hashrings, and the deterministic
//! stencil that partitions resources among distributors.
//!
//! This crate is I/O-free.  The backend service, the distributor-side client,
//! and the distributors themselves all build on the types defined here.

pub mod bridge;
pub mod collection;
pub mod dummy;
pub mod hashring;
pub mod queue;
pub mod resource;
pub mod stencil;
pub mod transport;

pub use bridge::{hash_fingerprint, Bridge};
pub use collection::{BackendResources, EventRecipient};
pub use hashring::{Hashnode, Hashring, HashringError, OnAddHook};
pub use queue::{QueueError, ResourceDiff, ResourceMap, ResourceQueue};
pub use resource::{
    hashkey, Hashkey, Location, LocationSet, Resource, ResourceRequest, TestRecord, TestState,
};
pub use stencil::{Interval, SplitHashring, Stencil, StencilError};
pub use transport::Transport;
