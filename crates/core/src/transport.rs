//! Pluggable-transport resources.

use crate::resource::{hashkey, Hashkey, LocationSet, Resource, TestRecord};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

pub const RESOURCE_TYPE_VANILLA: &str = "vanilla";
pub const RESOURCE_TYPE_OBFS2: &str = "obfs2";
pub const RESOURCE_TYPE_OBFS3: &str = "obfs3";
pub const RESOURCE_TYPE_OBFS4: &str = "obfs4";
pub const RESOURCE_TYPE_SCRAMBLESUIT: &str = "scramblesuit";
pub const RESOURCE_TYPE_MEEK: &str = "meek";
pub const RESOURCE_TYPE_SNOWFLAKE: &str = "snowflake";
pub const RESOURCE_TYPE_WEBSOCKET: &str = "websocket";
pub const RESOURCE_TYPE_FTE: &str = "fte";
pub const RESOURCE_TYPE_HTTPT: &str = "httpt";

/// The pluggable-transport type tags we know about.
pub const TRANSPORT_TYPES: &[&str] = &[
    RESOURCE_TYPE_OBFS2,
    RESOURCE_TYPE_OBFS3,
    RESOURCE_TYPE_OBFS4,
    RESOURCE_TYPE_SCRAMBLESUIT,
    RESOURCE_TYPE_MEEK,
    RESOURCE_TYPE_SNOWFLAKE,
    RESOURCE_TYPE_WEBSOCKET,
    RESOURCE_TYPE_FTE,
    RESOURCE_TYPE_HTTPT,
];

/// Bridges should upload new descriptors at least every 18 hours, so a
/// resource that went unrefreshed for longer than that is stale.
pub const BRIDGE_EXPIRY_HOURS: i64 = 18;

/// Formats an IP address the way Tor expects it in a bridge line: IPv6
/// addresses are enclosed in square brackets.
pub fn tor_addr(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// A Tor bridge's pluggable transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "LocationSet::is_empty")]
    pub blocked_in: LocationSet,
    #[serde(default)]
    pub test: TestRecord,
}

impl Transport {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            fingerprint: String::new(),
            params: BTreeMap::new(),
            blocked_in: LocationSet::new(),
            test: TestRecord::default(),
        }
    }
}

impl fmt::Display for Transport {
    /// The canonical bridge line.  `params` is an ordered map, so the
    /// key=value arguments come out sorted and the representation is
    /// deterministic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let line = format!(
            "{} {}:{} {} {}",
            self.type_tag,
            tor_addr(&self.address),
            self.port,
            self.fingerprint,
            args.join(" "),
        );
        write!(f, "{}", line.trim())
    }
}

impl Resource for Transport {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// A pluggable transport's uid equals its oid.  Some bridges run more
    /// than one transport of the same type, e.g.
    ///
    ///   obfs3 1.1.1.1:111 0123456789ABCDEF0123456789ABCDEF01234567
    ///   obfs3 2.2.2.2:222 0123456789ABCDEF0123456789ABCDEF01234567
    ///
    /// If a transport's uid were derived from its type and fingerprint
    /// alone, the two lines above would collide and shadow each other's
    /// updates.
    fn uid(&self) -> Hashkey {
        self.oid()
    }

    fn oid(&self) -> Hashkey {
        hashkey(self.to_string().as_bytes())
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

    fn obfs4() -> Transport {
        let mut t = Transport::new(RESOURCE_TYPE_OBFS4);
        t.address = "1.2.3.4".parse().expect("valid address");
        t.port = 443;
        t.fingerprint = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string();
        t.params.insert("iat-mode".to_string(), "0".to_string());
        t.params.insert("cert".to_string(), "c".to_string());
        t
    }

    #[test]
    fn canonical_line_sorts_params() {
        let t = obfs4();
        assert_eq!(
            t.to_string(),
            "obfs4 1.2.3.4:443 AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA cert=c iat-mode=0"
        );
    }

    #[test]
    fn canonical_line_trims_empty_fields() {
        let mut t = Transport::new(RESOURCE_TYPE_OBFS3);
        t.address = "10.0.0.1".parse().expect("valid address");
        t.port = 80;
        assert_eq!(t.to_string(), "obfs3 10.0.0.1:80");
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        let mut t = Transport::new(RESOURCE_TYPE_OBFS4);
        t.address = "2001:db8::1".parse().expect("valid address");
        t.port = 443;
        assert_eq!(t.to_string(), "obfs4 [2001:db8::1]:443");
    }

    #[test]
    fn uid_equals_oid() {
        let t = obfs4();
        assert_eq!(t.uid(), t.oid());
    }

    #[test]
    fn oid_changes_with_params() {
        let t1 = obfs4();
        let mut t2 = obfs4();
        t2.params.insert("iat-mode".to_string(), "1".to_string());
        assert_ne!(t1.oid(), t2.oid());
    }

    #[test]
    fn validity() {
        let t = obfs4();
        assert!(t.is_valid());

        let mut missing_port = obfs4();
        missing_port.port = 0;
        assert!(!missing_port.is_valid());

        let missing_addr = Transport::new(RESOURCE_TYPE_OBFS4);
        assert!(!missing_addr.is_valid());
    }

    #[test]
    fn wire_envelope_carries_type_tag() {
        let value = obfs4().to_value().expect("serializable");
        assert_eq!(value["type"], RESOURCE_TYPE_OBFS4);
        assert_eq!(value["port"], 443);
    }
}
