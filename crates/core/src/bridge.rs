//! Vanilla Tor bridges.

use crate::resource::{hashkey, Hashkey, LocationSet, Resource, TestRecord};
use crate::transport::{tor_addr, BRIDGE_EXPIRY_HOURS, RESOURCE_TYPE_VANILLA};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Hashes a bridge's fingerprint the way Tor Metrics does for lookups: the
/// raw hex-decoded fingerprint bytes are run through SHA-1 and re-encoded as
/// upper-case hex.
pub fn hash_fingerprint(fingerprint: &str) -> Result<String, FingerprintError> {
    let raw = hex::decode(fingerprint.trim())?;
    let digest = Sha1::digest(&raw);
    Ok(hex::encode_upper(digest))
}

/// A vanilla Tor bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "LocationSet::is_empty")]
    pub blocked_in: LocationSet,
    #[serde(default)]
    pub test: TestRecord,
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            type_tag: RESOURCE_TYPE_VANILLA.to_string(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            fingerprint: String::new(),
            blocked_in: LocationSet::new(),
            test: TestRecord::default(),
        }
    }

    /// The bridge line handed to users and to the reachability tester.
    pub fn bridge_line(&self) -> String {
        format!(
            "{}:{} {}",
            tor_addr(&self.address),
            self.port,
            self.fingerprint
        )
        .trim()
        .to_string()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bridge_line())
    }
}

impl Resource for Bridge {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// A bridge's uid is derived from its type and its SHA-1-hashed
    /// fingerprint, so a bridge that changes its address or port keeps its
    /// identity.
    fn uid(&self) -> Hashkey {
        let hashed = match hash_fingerprint(&self.fingerprint) {
            Ok(hashed) => hashed,
            Err(err) => {
                tracing::warn!(fingerprint = %self.fingerprint, %err, "bug: unhashable fingerprint");
                self.fingerprint.clone()
            }
        };
        hashkey(format!("{}{}", self.type_tag, hashed).as_bytes())
    }

    fn oid(&self) -> Hashkey {
        hashkey(self.bridge_line().as_bytes())
    }

    fn is_valid(&self) -> bool {
        !self.type_tag.is_empty() && !self.address.is_unspecified() && self.port != 0
    }

    fn expiry(&self) -> Duration {
        Duration::hours(BRIDGE_EXPIRY_HOURS)
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

    fn fingerprint(&self) -> Option<&str> {
        Some(&self.fingerprint)
    }

    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINGERPRINT: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    fn bridge() -> Bridge {
        let mut b = Bridge::new();
        b.address = "1.2.3.4".parse().expect("valid address");
        b.port = 9001;
        b.fingerprint = FINGERPRINT.to_string();
        b
    }

    #[test]
    fn hashed_fingerprint_is_upper_hex() {
        let hashed = hash_fingerprint(FINGERPRINT).expect("valid fingerprint");
        assert_eq!(hashed.len(), 40);
        assert_ne!(hashed, FINGERPRINT);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hashed, hashed.to_uppercase());

        // Hashing is deterministic.
        assert_eq!(hashed, hash_fingerprint(FINGERPRINT).expect("valid"));
    }

    #[test]
    fn invalid_fingerprint_fails() {
        assert!(hash_fingerprint("not hex").is_err());
    }

    #[test]
    fn uid_survives_address_change() {
        let b1 = bridge();
        let mut b2 = bridge();
        b2.address = "5.6.7.8".parse().expect("valid address");

        assert_eq!(b1.uid(), b2.uid());
        assert_ne!(b1.oid(), b2.oid());
    }

    #[test]
    fn bridge_line_format() {
        assert_eq!(bridge().bridge_line(), format!("1.2.3.4:9001 {FINGERPRINT}"));
    }
}
