//! Distributors: long-running consumers that each own a partition of the
//! resource space and hand resources to end users.
//!
//! Every distributor follows the backend's resource stream (via
//! `ferry-client`) and maintains local state from the diffs it receives.

pub mod https;
pub mod salmon;

pub use https::{hashkey_from_addr, HttpsDistributor, HTTPS_DIST_NAME};
pub use salmon::{Salmon, SalmonError, SALMON_DIST_NAME};
