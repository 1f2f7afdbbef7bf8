//! Proxies as Salmon sees them: resources with a trust level.

use super::user::{Trust, UNTOUCHABLE_TRUST_LEVEL};
use ferry_core::Resource;

/// How many users a proxy accommodates before it is depleted.
pub const MAX_CLIENTS: usize = 10;

/// A circumvention proxy that is handed out to users.
#[derive(Clone, Debug)]
pub struct Proxy {
    pub resource: Box<dyn Resource>,
    pub trust: Trust,
    /// The user this proxy was first allocated for.
    pub reserved_for: Option<String>,
}

impl Proxy {
    pub fn new(resource: Box<dyn Resource>) -> Self {
        Self {
            resource,
            trust: 0,
            reserved_for: None,
        }
    }

    /// True if the proxy reached its capacity and can no longer accommodate
    /// new users.
    pub fn is_depleted(num_assigned_users: usize) -> bool {
        num_assigned_users >= MAX_CLIENTS
    }

    /// Raises the proxy's trust to the minimum trust of its assigned users
    /// (or to the untouchable level if it has none).  Proxy trust is
    /// monotonically non-decreasing; a would-be decrease means the proxy
    /// was handed to a user below its floor, which is a bug.
    pub fn update_trust(&mut self, user_trusts: &[Trust]) {
        let new_trust = user_trusts
            .iter()
            .copied()
            .min()
            .unwrap_or(UNTOUCHABLE_TRUST_LEVEL);

        if new_trust > self.trust {
            tracing::info!(
                old = self.trust,
                new = new_trust,
                "increasing proxy's trust level",
            );
            self.trust = new_trust;
        } else if new_trust < self.trust {
            tracing::warn!(
                floor = self.trust,
                new = new_trust,
                "bug: proxy was assigned to user with too low a trust level",
            );
        }
    }
}
