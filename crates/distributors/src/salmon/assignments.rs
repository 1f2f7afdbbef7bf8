//! The bidirectional mapping between users and the proxies assigned to
//! them.  Both directions are kept consistent by mutating them together.

use ferry_core::Hashkey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyAssignments {
    user_to_proxy: HashMap<String, BTreeSet<Hashkey>>,
    proxy_to_user: HashMap<Hashkey, BTreeSet<String>>,
}

impl ProxyAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the given proxy is assigned to the given user.
    pub fn add(&mut self, secret_id: &str, uid: Hashkey) {
        self.user_to_proxy
            .entry(secret_id.to_string())
            .or_default()
            .insert(uid);
        self.proxy_to_user
            .entry(uid)
            .or_default()
            .insert(secret_id.to_string());
    }

    /// The proxies assigned to the given user.
    pub fn proxies_of(&self, secret_id: &str) -> Vec<Hashkey> {
        self.user_to_proxy
            .get(secret_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The users the given proxy is assigned to.
    pub fn users_of(&self, uid: Hashkey) -> Vec<String> {
        self.proxy_to_user
            .get(&uid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_users(&self, uid: Hashkey) -> usize {
        self.proxy_to_user.get(&uid).map_or(0, BTreeSet::len)
    }

    pub fn is_assigned(&self, uid: Hashkey) -> bool {
        self.num_users(uid) > 0
    }

    /// All assigned proxies.
    pub fn proxies(&self) -> Vec<Hashkey> {
        self.proxy_to_user.keys().copied().collect()
    }

    /// Drops the proxy from both directions of the mapping.
    pub fn remove_proxy(&mut self, uid: Hashkey) {
        if let Some(users) = self.proxy_to_user.remove(&uid) {
            for secret_id in users {
                if let Some(set) = self.user_to_proxy.get_mut(&secret_id) {
                    set.remove(&uid);
                    if set.is_empty() {
                        self.user_to_proxy.remove(&secret_id);
                    }
                }
            }
        }
    }
}
