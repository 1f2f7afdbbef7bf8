//! The resource abstraction and its supporting types.

use chrono::{DateTime, Duration, Utc};
use crc::{Crc, CRC_64_XZ};
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An index into a hashring.  Also serves as a resource's unique and object
/// identifier.
pub type Hashkey = u64;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Computes the CRC-64 hash key of the given bytes.
pub fn hashkey(data: &[u8]) -> Hashkey {
    CRC64.checksum(data)
}

/// The outcome of a resource's most recent functionality test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    #[default]
    Untested,
    Functional,
    Dysfunctional,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestState::Untested => write!(f, "untested"),
            TestState::Functional => write!(f, "functional"),
            TestState::Dysfunctional => write!(f, "dysfunctional"),
        }
    }
}

/// What we know about a resource's functionality.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(default)]
    pub state: TestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestRecord {
    pub fn is_functional(&self) -> bool {
        self.state == TestState::Functional
    }

    /// True if the resource was tested and the result is younger than the
    /// given maximum age.
    pub fn tested_within(&self, max_age: Duration) -> bool {
        if self.state == TestState::Untested {
            return false;
        }
        match self.last_tested {
            Some(t) => Utc::now().signed_duration_since(t) < max_age,
            None => false,
        }
    }
}

/// A physical or topological location: an ISO 3166-1 alpha-2 country code
/// plus an optional autonomous system number.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub country_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
}

impl Location {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
            asn: None,
        }
    }
}

/// The set of locations in which a resource is known to be blocked.
pub type LocationSet = BTreeSet<Location>;

/// A resource is an artifact that we hand out to users: a vanilla bridge, a
/// pluggable transport, or (in tests) a dummy.
///
/// Identity and versioning are separate concerns: two resources with the same
/// [`uid`](Resource::uid) denote the same real-world thing; their
/// [`oid`](Resource::oid) additionally captures the content, so an unchanged
/// uid with a changed oid means "same entity, new contents".  Equal oids
/// imply equal uids.
///
/// The `Display` implementation is the resource's canonical string
/// representation.  It keys the test pool's batches and is the line handed to
/// the external reachability tester, so it must be stable and deterministic.
pub trait Resource: fmt::Debug + fmt::Display + DynClone + Send + Sync {
    /// The resource's type tag, e.g. "obfs4".
    fn type_tag(&self) -> &str;

    /// The resource's unique identifier.
    fn uid(&self) -> Hashkey;

    /// The resource's object identifier, i.e. a hash over its contents.
    fn oid(&self) -> Hashkey;

    /// False if the resource misses fields that it needs to be usable.
    fn is_valid(&self) -> bool;

    /// How long the resource may go without a refresh before it is pruned.
    fn expiry(&self) -> Duration;

    fn test(&self) -> &TestRecord;

    fn set_test(&mut self, record: TestRecord);

    fn blocked_in(&self) -> &LocationSet;

    fn set_blocked_in(&mut self, locations: LocationSet);

    /// The bridge fingerprint, for resources that have one.
    fn fingerprint(&self) -> Option<&str> {
        None
    }

    /// Serializes the resource into its wire envelope, including its type
    /// tag.
    fn to_value(&self) -> serde_json::Result<serde_json::Value>;
}

dyn_clone::clone_trait_object!(Resource);

/// A distributor's request for resources.  Sent both for one-shot fetches
/// and to open a resource stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Name of the requesting distributor.
    pub request_origin: String,
    pub resource_types: Vec<String>,
}

impl ResourceRequest {
    pub fn new(origin: impl Into<String>, types: &[&str]) -> Self {
        Self {
            request_origin: origin.into(),
            resource_types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn has_resource_type(&self, type_tag: &str) -> bool {
        self.resource_types.iter().any(|t| t == type_tag)
    }
}
