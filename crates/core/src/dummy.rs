//! A trivial resource implementation for unit tests.

use crate::resource::{Hashkey, LocationSet, Resource, TestRecord, TestState};
use chrono::Duration;
use std::fmt;

/// A test-only resource with freely choosable identifiers.
#[derive(Clone, Debug)]
pub struct Dummy {
    pub oid: Hashkey,
    pub uid: Hashkey,
    pub expiry: Duration,
    pub test: TestRecord,
    pub blocked_in: LocationSet,
}

impl Dummy {
    pub fn new(oid: Hashkey, uid: Hashkey) -> Self {
        Self {
            oid,
            uid,
            expiry: Duration::hours(1),
            test: TestRecord {
                state: TestState::Functional,
                last_tested: None,
                error: None,
            },
            blocked_in: LocationSet::new(),
        }
    }
}

impl fmt::Display for Dummy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dummy-{}-{}", self.uid, self.oid)
    }
}

impl Resource for Dummy {
    fn type_tag(&self) -> &str {
        "dummy"
    }

    fn uid(&self) -> Hashkey {
        self.uid
    }

    fn oid(&self) -> Hashkey {
        self.oid
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn expiry(&self) -> Duration {
        self.expiry
    }

    fn test(&self) -> &TestRecord {
        &self.test
    }

    fn set_test(&mut self, record: TestRecord) {
        self.test = record;
    }

    fn blocked_in(&self) -> &LocationSet {
        &self.blocked_in
    }

    fn set_blocked_in(&mut self, locations: LocationSet) {
        self.blocked_in = locations;
    }

    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "type": "dummy",
            "uid": self.uid,
            "oid": self.oid,
        }))
    }
}
