//! The Salmon distributor.
//!
//! Salmon hands proxies to users along an invite graph and holds users
//! accountable for the proxies they know: when a proxy gets blocked, every
//! user it was assigned to becomes a little more suspicious, and users whose
//! suspicion crosses a threshold are banned.  The theory is presented in the
//! PETS'16 Salmon paper.

mod assignments;
mod proxy;
mod user;

pub use assignments::ProxyAssignments;
pub use proxy::{Proxy, MAX_CLIENTS};
pub use user::{rand_base32, Trust, User, MAX_TRUST_LEVEL, UNTOUCHABLE_TRUST_LEVEL};

use chrono::{DateTime, Duration, Utc};
use ferry_api::registry::{RegistryError, ResourceRegistry};
use ferry_client::{FileStore, StoreError};
use ferry_core::{Hashkey, Resource, ResourceDiff, ResourceMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const SALMON_DIST_NAME: &str = "salmon";

/// The suspicion threshold at which users are banned.  The Salmon paper
/// calls it "T"; simulation results suggest 1/3.
pub const MAX_SUSPICION: f64 = 0.333;
/// How many proxies a user is entitled to.
pub const NUM_PROXIES_PER_USER: usize = 3;
/// Entropy, in bytes, behind an invite token.
pub const INVITATION_TOKEN_LENGTH: usize = 20;
/// Days until an unredeemed invite token expires.
pub const INVITATION_TOKEN_EXPIRY_DAYS: i64 = 7;
/// The cadence of trust promotion and token pruning.
pub const SALMON_TICK_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(60 * 60 * 24);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SalmonError {
    #[error("no such user")]
    UnknownUser,
    #[error("user is banned")]
    UserBanned,
    #[error("user's trust level is not high enough to issue invites")]
    InsufficientTrust,
    #[error("invalid invite token")]
    UnknownToken,
    #[error("invite token already expired")]
    ExpiredToken,
    #[error("invite token's issuer is no longer known")]
    StaleInviter,
    #[error("unsupported resource type `{0}`")]
    UnsupportedType(String),
    #[error("not enough entropy available")]
    Entropy,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("cannot encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What we remember about an issued invite token: who issued it and when.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenMetaInfo {
    pub inviter_secret_id: String,
    pub issue_time: DateTime<Utc>,
}

/// The proxies Salmon knows about: a per-type queue of not-yet-allocated
/// resources, and the proxies already handed to users, keyed by uid.
#[derive(Default)]
struct ProxyPool {
    unassigned: ResourceMap,
    assigned: HashMap<Hashkey, Proxy>,
}

/// The Salmon distributor's state.
///
/// Lock order is users, then proxies, then assignments; the token cache is
/// never held together with another lock.
pub struct Salmon {
    resource_types: Vec<String>,
    registry: ResourceRegistry,
    users: Mutex<HashMap<String, User>>,
    tokens: Mutex<HashMap<String, TokenMetaInfo>>,
    proxies: Mutex<ProxyPool>,
    assignments: Mutex<ProxyAssignments>,
}

impl Salmon {
    pub fn new(resource_types: Vec<String>) -> Self {
        tracing::info!("initialising {SALMON_DIST_NAME} distributor");
        Self {
            resource_types,
            registry: ResourceRegistry::new(),
            users: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            proxies: Mutex::new(ProxyPool::default()),
            assignments: Mutex::new(ProxyAssignments::new()),
        }
    }

    fn supports(&self, type_tag: &str) -> bool {
        self.resource_types.iter().any(|t| t == type_tag)
    }

    /// Creates a new user account.  If an inviter is given and known, the
    /// new user becomes part of the inviter's subtree.
    pub fn add_user(
        &self,
        trust: Trust,
        inviter_secret_id: Option<&str>,
    ) -> Result<String, SalmonError> {
        let mut user = User::new(trust)?;
        let secret_id = user.secret_id.clone();

        let mut users = self.users.lock();
        if let Some(inviter_id) = inviter_secret_id {
            if let Some(inviter) = users.get_mut(inviter_id) {
                inviter.invited.push(secret_id.clone());
                user.invited_by = Some(inviter_id.to_string());
            }
        }
        users.insert(secret_id.clone(), user);
        Ok(secret_id)
    }

    /// A copy of the given user's account.
    pub fn user(&self, secret_id: &str) -> Option<User> {
        self.users.lock().get(secret_id).cloned()
    }

    /// Returns an invitation token if the given user is allowed to issue
    /// invites.
    pub fn create_invite(&self, secret_id: &str) -> Result<String, SalmonError> {
        {
            let users = self.users.lock();
            let user = users.get(secret_id).ok_or(SalmonError::UnknownUser)?;
            if user.banned {
                return Err(SalmonError::UserBanned);
            }
            if user.trust < MAX_TRUST_LEVEL {
                return Err(SalmonError::InsufficientTrust);
            }
        }

        let mut tokens = self.tokens.lock();
        let token = loop {
            let candidate = rand_base32(INVITATION_TOKEN_LENGTH)?;
            if !tokens.contains_key(&candidate) {
                break candidate;
            }
            // A collision is astronomically unlikely; just draw again.
            tracing::info!("newly created token already exists; trying again");
        };
        tokens.insert(
            token.clone(),
            TokenMetaInfo {
                inviter_secret_id: secret_id.to_string(),
                issue_time: Utc::now(),
            },
        );
        tracing::info!(user = %secret_id, "user issued new invite token");
        Ok(token)
    }

    /// Redeems the given token, creating a new user one trust level below
    /// the inviter.  Tokens are single-use: any redemption attempt consumes
    /// the token, successful or not.
    pub fn redeem_invite(&self, token: &str) -> Result<String, SalmonError> {
        let meta = self
            .tokens
            .lock()
            .remove(token)
            .ok_or(SalmonError::UnknownToken)?;

        if Utc::now().signed_duration_since(meta.issue_time)
            > Duration::days(INVITATION_TOKEN_EXPIRY_DAYS)
        {
            return Err(SalmonError::ExpiredToken);
        }

        let inviter_trust = match self.users.lock().get(&meta.inviter_secret_id) {
            Some(inviter) => inviter.trust,
            None => {
                tracing::warn!("bug: could not find valid user for invite token");
                return Err(SalmonError::StaleInviter);
            }
        };

        self.add_user(inviter_trust - 1, Some(&meta.inviter_secret_id))
    }

    /// Removes expired tokens from the cache.
    pub fn prune_tokens(&self) {
        let mut tokens = self.tokens.lock();
        let prev_len = tokens.len();
        let now = Utc::now();
        tokens.retain(|token, meta| {
            let expired = now.signed_duration_since(meta.issue_time)
                > Duration::days(INVITATION_TOKEN_EXPIRY_DAYS);
            if expired {
                tracing::info!(%token, inviter = %meta.inviter_secret_id, "deleting expired token");
            }
            !expired
        });
        tracing::info!(from = prev_len, to = tokens.len(), "pruned token cache");
    }

    /// Attempts to return proxies of the given type for the given user.
    pub fn get_proxies(
        &self,
        secret_id: &str,
        type_tag: &str,
    ) -> Result<Vec<Box<dyn Resource>>, SalmonError> {
        if !self.supports(type_tag) {
            return Err(SalmonError::UnsupportedType(type_tag.to_string()));
        }

        let users = self.users.lock();
        let user = users.get(secret_id).ok_or(SalmonError::UnknownUser)?;
        if user.banned {
            return Err(SalmonError::UserBanned);
        }

        let mut pool = self.proxies.lock();
        let mut assignments = self.assignments.lock();

        // Does the user already have assigned proxies?
        let owned: Vec<Box<dyn Resource>> = assignments
            .proxies_of(secret_id)
            .into_iter()
            .filter_map(|uid| pool.assigned.get(&uid))
            .filter(|proxy| proxy.resource.type_tag() == type_tag)
            .map(|proxy| proxy.resource.clone())
            .collect();
        if !owned.is_empty() {
            return Ok(owned);
        }

        Ok(find_proxies(
            &users,
            &mut pool,
            &mut assignments,
            user,
            type_tag,
        ))
    }

    /// Marks the given proxy as blocked and adjusts the innocence scores of
    /// (and potentially bans) all assigned users.
    pub fn set_blocked(&self, uid: Hashkey) {
        let user_ids = self.assignments.lock().users_of(uid);
        let num_users = user_ids.len();
        if num_users == 0 {
            tracing::warn!(uid, "proxy marked as blocked but has no users");
            return;
        }

        let mut users = self.users.lock();
        for secret_id in user_ids {
            let Some(user) = users.get_mut(&secret_id) else {
                continue;
            };
            user.innocence_probs
                .push((num_users as f64 - 1.0) / num_users as f64);

            let suspicion = user.suspicion();
            if suspicion >= MAX_SUSPICION {
                tracing::info!(user = %secret_id, suspicion, "banning user");
                user.banned = true;
            }
        }
    }

    /// Applies a diff from the backend's resource stream.  New resources
    /// join the unassigned queue; changed resources update our copy and, if
    /// they picked up a fresh blocking location while assigned to users,
    /// trigger the suspicion machinery; gone resources are dropped.
    pub fn apply_diff(&self, diff: ResourceDiff) {
        tracing::info!(%diff, "processing diff");
        let mut newly_blocked = Vec::new();
        {
            let mut pool = self.proxies.lock();
            let mut assignments = self.assignments.lock();

            for (type_tag, queue) in diff.new {
                if !self.supports(&type_tag) {
                    continue;
                }
                for r in queue {
                    if pool.assigned.contains_key(&r.uid()) {
                        continue;
                    }
                    if let Err(err) = pool.unassigned.queue_mut(&type_tag).enqueue(r) {
                        tracing::debug!(%type_tag, %err, "skipping new resource");
                    }
                }
            }

            for (type_tag, queue) in diff.changed {
                if !self.supports(&type_tag) {
                    continue;
                }
                for r in queue {
                    let uid = r.uid();
                    if let Some(proxy) = pool.assigned.get_mut(&uid) {
                        let blocked_anew = r
                            .blocked_in()
                            .iter()
                            .any(|l| !proxy.resource.blocked_in().contains(l));
                        proxy.resource = r;
                        if blocked_anew && assignments.is_assigned(uid) {
                            newly_blocked.push(uid);
                        }
                    } else if let Err(err) = pool.unassigned.queue_mut(&type_tag).update(r) {
                        tracing::debug!(%type_tag, %err, "skipping changed resource");
                    }
                }
            }

            for (type_tag, queue) in diff.gone {
                if !self.supports(&type_tag) {
                    continue;
                }
                for r in queue {
                    let uid = r.uid();
                    if pool.assigned.remove(&uid).is_some() {
                        assignments.remove_proxy(uid);
                    } else if let Err(err) = pool.unassigned.queue_mut(&type_tag).delete(uid) {
                        tracing::debug!(%type_tag, %err, "skipping gone resource");
                    }
                }
            }
        }

        for uid in newly_blocked {
            self.set_blocked(uid);
        }
    }

    /// Seeds the unassigned queue, e.g. from a one-shot resource fetch at
    /// startup.
    pub fn seed_unassigned(&self, resources: Vec<Box<dyn Resource>>) {
        let mut pool = self.proxies.lock();
        for r in resources {
            if !self.supports(r.type_tag()) || pool.assigned.contains_key(&r.uid()) {
                continue;
            }
            let type_tag = r.type_tag().to_string();
            let _ = pool.unassigned.queue_mut(&type_tag).enqueue(r);
        }
    }

    /// One round of periodic maintenance: promote users, raise proxy trust
    /// floors, and prune the token cache.
    pub fn housekeeping_tick(&self) {
        {
            let mut users = self.users.lock();
            tracing::info!(num = users.len(), "updating trust levels of users");
            for user in users.values_mut() {
                user.update_trust();
            }

            let mut pool = self.proxies.lock();
            let assignments = self.assignments.lock();
            tracing::info!(num = pool.assigned.len(), "updating trust levels of proxies");
            for (uid, proxy) in pool.assigned.iter_mut() {
                let trusts: Vec<Trust> = assignments
                    .users_of(*uid)
                    .iter()
                    .filter_map(|id| users.get(id))
                    .map(|u| u.trust)
                    .collect();
                proxy.update_trust(&trusts);
            }
        }
        tracing::info!("pruning token cache");
        self.prune_tokens();
    }

    /// Spawns the periodic maintenance task.
    pub fn spawn_housekeeping(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let salmon = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SALMON_TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => salmon.housekeeping_tick(),
                }
            }
        })
    }

    /// Spawns the task that consumes the resource stream.
    pub fn spawn_stream(
        self: &Arc<Self>,
        mut diffs: UnboundedReceiver<ResourceDiff>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let salmon = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = diffs.recv() => {
                        let Some(diff) = received else { return };
                        salmon.apply_diff(diff);
                    }
                }
            }
        })
    }

    /// Persists the distributor's state.
    pub fn save(&self, store: &FileStore) -> Result<(), PersistError> {
        let state = {
            let users = self.users.lock();
            let tokens = self.tokens.lock();
            let pool = self.proxies.lock();
            let assignments = self.assignments.lock();

            let mut unassigned = HashMap::new();
            for (type_tag, queue) in pool.unassigned.iter() {
                let mut values = Vec::with_capacity(queue.len());
                for r in queue.iter() {
                    values.push(r.to_value()?);
                }
                unassigned.insert(type_tag.clone(), values);
            }

            let mut assigned = Vec::with_capacity(pool.assigned.len());
            for proxy in pool.assigned.values() {
                assigned.push(PersistedProxy {
                    resource: proxy.resource.to_value()?,
                    trust: proxy.trust,
                    reserved_for: proxy.reserved_for.clone(),
                });
            }

            PersistedState {
                users: users.clone(),
                tokens: tokens.clone(),
                assignments: assignments.clone(),
                unassigned,
                assigned,
            }
        };
        store.save(&state)?;
        Ok(())
    }

    /// Restores previously persisted state.  The invite graph's back
    /// references are rebuilt by walking the forward edges.
    pub fn load(&self, store: &FileStore) -> Result<(), PersistError> {
        let Some(mut state) = store.load::<PersistedState>()? else {
            return Ok(());
        };

        let edges: Vec<(String, String)> = state
            .users
            .iter()
            .flat_map(|(id, user)| {
                user.invited
                    .iter()
                    .map(|child| (id.clone(), child.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (parent, child) in edges {
            if let Some(user) = state.users.get_mut(&child) {
                user.invited_by = Some(parent);
            }
        }

        let mut unassigned = ResourceMap::new();
        for (_type_tag, values) in state.unassigned {
            for value in values {
                unassigned.push(self.registry.decode(value)?);
            }
        }
        let mut assigned = HashMap::new();
        for persisted in state.assigned {
            let resource = self.registry.decode(persisted.resource)?;
            assigned.insert(
                resource.uid(),
                Proxy {
                    resource,
                    trust: persisted.trust,
                    reserved_for: persisted.reserved_for,
                },
            );
        }

        *self.users.lock() = state.users;
        *self.tokens.lock() = state.tokens;
        {
            let mut pool = self.proxies.lock();
            pool.unassigned = unassigned;
            pool.assigned = assigned;
        }
        *self.assignments.lock() = state.assignments;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedProxy {
    resource: Value,
    trust: Trust,
    reserved_for: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    users: HashMap<String, User>,
    tokens: HashMap<String, TokenMetaInfo>,
    assignments: ProxyAssignments,
    unassigned: HashMap<String, Vec<Value>>,
    assigned: Vec<PersistedProxy>,
}

/// Collects proxies for the given user: first whatever the inviter's
/// subtree already holds, then fresh ones from the unassigned queue.  Every
/// returned proxy is associated with the user.
fn find_proxies(
    users: &HashMap<String, User>,
    pool: &mut ProxyPool,
    assignments: &mut ProxyAssignments,
    user: &User,
    type_tag: &str,
) -> Vec<Box<dyn Resource>> {
    let mut found: Vec<Hashkey> = Vec::new();

    if let Some(inviter_id) = &user.invited_by {
        if let Some(inviter) = users.get(inviter_id) {
            find_assigned_proxies(users, pool, assignments, inviter, type_tag, &mut found);
            found.truncate(NUM_PROXIES_PER_USER);
        }
    }

    if found.len() < NUM_PROXIES_PER_USER {
        let num_remaining = NUM_PROXIES_PER_USER - found.len();
        let queue = pool.unassigned.queue_mut(type_tag);
        let num_taken = num_remaining.min(queue.len());
        for _ in 0..num_taken {
            let Ok(r) = queue.dequeue() else {
                break;
            };
            let uid = r.uid();
            let mut proxy = Proxy::new(r);
            proxy.reserved_for = Some(user.secret_id.clone());
            pool.assigned.insert(uid, proxy);
            found.push(uid);
        }
        tracing::info!(
            allocated = num_taken,
            remaining = queue.len(),
            "not enough assigned proxies; allocated unassigned ones",
        );
    }

    let mut resources = Vec::with_capacity(found.len());
    for uid in found {
        assignments.add(&user.secret_id, uid);
        if let Some(proxy) = pool.assigned.get(&uid) {
            resources.push(proxy.resource.clone());
        }
    }
    resources
}

/// Depth-first traversal of the inviter's subtree, yielding non-depleted
/// proxies of the wanted type: the inviter's own first, then each
/// invitee's, recursively.
fn find_assigned_proxies(
    users: &HashMap<String, User>,
    pool: &ProxyPool,
    assignments: &ProxyAssignments,
    inviter: &User,
    type_tag: &str,
    found: &mut Vec<Hashkey>,
) {
    for uid in assignments.proxies_of(&inviter.secret_id) {
        if found.len() >= NUM_PROXIES_PER_USER {
            return;
        }
        let Some(proxy) = pool.assigned.get(&uid) else {
            continue;
        };
        if proxy.resource.type_tag() != type_tag {
            continue;
        }
        if Proxy::is_depleted(assignments.num_users(uid)) {
            continue;
        }
        if !found.contains(&uid) {
            found.push(uid);
        }
    }

    for invitee_id in &inviter.invited {
        if found.len() >= NUM_PROXIES_PER_USER {
            return;
        }
        if let Some(invitee) = users.get(invitee_id) {
            find_assigned_proxies(users, pool, assignments, invitee, type_tag, found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::transport::RESOURCE_TYPE_OBFS4;
    use ferry_core::{Location, LocationSet, Transport};
    use rand::Rng;

    fn salmon() -> Salmon {
        Salmon::new(vec![RESOURCE_TYPE_OBFS4.to_string()])
    }

    fn obfs4_resources(num: usize) -> Vec<Box<dyn Resource>> {
        let mut rng = rand::thread_rng();
        let mut resources: Vec<Box<dyn Resource>> = Vec::with_capacity(num);
        for _ in 0..num {
            let mut t = Transport::new(RESOURCE_TYPE_OBFS4);
            t.address = std::net::IpAddr::V4(std::net::Ipv4Addr::new(
                rng.gen_range(1..=223),
                rng.gen(),
                rng.gen(),
                rng.gen_range(1..=254),
            ));
            t.port = rng.gen_range(1..=u16::MAX);
            t.params.insert("iat-mode".to_string(), "0".to_string());
            t.params.insert("cert".to_string(), "foo".to_string());
            resources.push(Box::new(t));
        }
        resources
    }

    fn add_user_with_trust(salmon: &Salmon, trust: Trust) -> String {
        salmon.add_user(trust, None).expect("new user")
    }

    #[test]
    fn invite_requires_trust_and_standing() {
        let salmon = salmon();
        let user = add_user_with_trust(&salmon, 0);

        // New users are not allowed to invite.
        assert_eq!(
            salmon.create_invite(&user),
            Err(SalmonError::InsufficientTrust)
        );

        // Banned users are not allowed to invite.
        salmon.users.lock().get_mut(&user).expect("present").banned = true;
        assert_eq!(salmon.create_invite(&user), Err(SalmonError::UserBanned));
        salmon.users.lock().get_mut(&user).expect("present").banned = false;

        // Unknown users cannot invite at all.
        assert_eq!(
            salmon.create_invite("NoSuchUser"),
            Err(SalmonError::UnknownUser)
        );

        salmon.users.lock().get_mut(&user).expect("present").trust = MAX_TRUST_LEVEL;
        let token = salmon.create_invite(&user).expect("invite");
        assert!(!token.is_empty());
        assert_eq!(salmon.tokens.lock().len(), 1);
    }

    #[test]
    fn tokens_are_single_use() {
        let salmon = salmon();
        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);

        let token = salmon.create_invite(&admin).expect("invite");
        let invitee = salmon.redeem_invite(&token).expect("redeem");

        // The new user sits one trust level below the inviter.
        let user = salmon.user(&invitee).expect("present");
        assert_eq!(user.trust, UNTOUCHABLE_TRUST_LEVEL - 1);
        assert_eq!(user.invited_by.as_deref(), Some(admin.as_str()));
        assert!(salmon
            .user(&admin)
            .expect("present")
            .invited
            .contains(&invitee));

        // The invitee sits at the maximum trust level and may invite in
        // turn.
        assert!(salmon.create_invite(&invitee).is_ok());
        salmon.tokens.lock().clear();

        // The cache is empty again, and double redemption fails.
        assert!(salmon.tokens.lock().is_empty());
        assert_eq!(
            salmon.redeem_invite(&token),
            Err(SalmonError::UnknownToken)
        );
        assert_eq!(
            salmon.redeem_invite("ThisTokenDoesNotExist"),
            Err(SalmonError::UnknownToken)
        );
    }

    #[test]
    fn expired_tokens_cannot_be_redeemed() {
        let salmon = salmon();
        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);
        let token = salmon.create_invite(&admin).expect("invite");

        salmon
            .tokens
            .lock()
            .get_mut(&token)
            .expect("present")
            .issue_time = Utc::now() - Duration::days(INVITATION_TOKEN_EXPIRY_DAYS) - Duration::minutes(1);

        assert_eq!(salmon.redeem_invite(&token), Err(SalmonError::ExpiredToken));
        // The attempt consumed the token.
        assert!(salmon.tokens.lock().is_empty());
    }

    #[test]
    fn pruning_drops_expired_tokens() {
        let salmon = salmon();
        salmon.tokens.lock().insert(
            "DummyToken".to_string(),
            TokenMetaInfo {
                inviter_secret_id: "foo".to_string(),
                issue_time: Utc::now()
                    - Duration::days(INVITATION_TOKEN_EXPIRY_DAYS)
                    - Duration::minutes(1),
            },
        );
        salmon.tokens.lock().insert(
            "FreshToken".to_string(),
            TokenMetaInfo {
                inviter_secret_id: "foo".to_string(),
                issue_time: Utc::now(),
            },
        );

        salmon.prune_tokens();
        let tokens = salmon.tokens.lock();
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains_key("FreshToken"));
    }

    #[test]
    fn user_flow_yields_proxies() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(100));

        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);
        let token = salmon.create_invite(&admin).expect("invite");
        let user = salmon.redeem_invite(&token).expect("redeem");

        let proxies = salmon.get_proxies(&user, RESOURCE_TYPE_OBFS4).expect("proxies");
        assert_eq!(proxies.len(), NUM_PROXIES_PER_USER);

        // Asking again returns the same assignment.
        let again = salmon.get_proxies(&user, RESOURCE_TYPE_OBFS4).expect("proxies");
        let mut uids: Vec<_> = proxies.iter().map(|r| r.uid()).collect();
        let mut again_uids: Vec<_> = again.iter().map(|r| r.uid()).collect();
        uids.sort_unstable();
        again_uids.sort_unstable();
        assert_eq!(uids, again_uids);
    }

    #[test]
    fn get_proxies_guards_its_inputs() {
        let salmon = salmon();
        let user = add_user_with_trust(&salmon, 0);

        assert_eq!(
            salmon
                .get_proxies("NoSuchUser", RESOURCE_TYPE_OBFS4)
                .unwrap_err(),
            SalmonError::UnknownUser
        );
        assert_eq!(
            salmon.get_proxies(&user, "carrier-pigeon").unwrap_err(),
            SalmonError::UnsupportedType("carrier-pigeon".to_string())
        );

        salmon.users.lock().get_mut(&user).expect("present").banned = true;
        assert_eq!(
            salmon.get_proxies(&user, RESOURCE_TYPE_OBFS4).unwrap_err(),
            SalmonError::UserBanned
        );
    }

    #[test]
    fn invitees_inherit_their_inviters_proxies() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(100));

        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);
        let admin_proxies = salmon
            .get_proxies(&admin, RESOURCE_TYPE_OBFS4)
            .expect("proxies");

        let token = salmon.create_invite(&admin).expect("invite");
        let invitee = salmon.redeem_invite(&token).expect("redeem");
        let invitee_proxies = salmon
            .get_proxies(&invitee, RESOURCE_TYPE_OBFS4)
            .expect("proxies");

        // The invitee traverses the admin's subtree and shares its proxies.
        let admin_uids: std::collections::BTreeSet<_> =
            admin_proxies.iter().map(|r| r.uid()).collect();
        let invitee_uids: std::collections::BTreeSet<_> =
            invitee_proxies.iter().map(|r| r.uid()).collect();
        assert_eq!(admin_uids, invitee_uids);
    }

    #[test]
    fn depleted_proxies_are_passed_over() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(100));

        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);
        let admin_proxies = salmon
            .get_proxies(&admin, RESOURCE_TYPE_OBFS4)
            .expect("proxies");

        // Fill every admin proxy to capacity.
        {
            let mut assignments = salmon.assignments.lock();
            for r in &admin_proxies {
                for i in 0..MAX_CLIENTS {
                    assignments.add(&format!("filler-{i}"), r.uid());
                }
            }
        }

        let token = salmon.create_invite(&admin).expect("invite");
        let invitee = salmon.redeem_invite(&token).expect("redeem");
        let invitee_proxies = salmon
            .get_proxies(&invitee, RESOURCE_TYPE_OBFS4)
            .expect("proxies");

        // All inherited proxies are depleted, so fresh ones are allocated.
        let admin_uids: std::collections::BTreeSet<_> =
            admin_proxies.iter().map(|r| r.uid()).collect();
        for r in &invitee_proxies {
            assert!(!admin_uids.contains(&r.uid()));
        }
    }

    #[test]
    fn blocking_bans_suspicious_users() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(10));

        // One proxy, two users.
        let u1 = add_user_with_trust(&salmon, 0);
        let u2 = add_user_with_trust(&salmon, 0);
        let uid = {
            let proxies = salmon.get_proxies(&u1, RESOURCE_TYPE_OBFS4).expect("proxies");
            let uid = proxies[0].uid();
            salmon.assignments.lock().add(&u2, uid);
            uid
        };

        salmon.set_blocked(uid);

        // Two users share the blame: innocence 1/2 each, suspicion 0.5,
        // which meets the 0.333 threshold.
        for id in [&u1, &u2] {
            let user = salmon.user(id).expect("present");
            assert_eq!(user.innocence_probs, vec![0.5]);
            assert!(user.banned, "user {id} should be banned");
        }
    }

    #[test]
    fn blocked_diff_triggers_suspicion() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(1));

        let user = add_user_with_trust(&salmon, 0);
        let assigned = salmon
            .get_proxies(&user, RESOURCE_TYPE_OBFS4)
            .expect("proxies");
        assert_eq!(assigned.len(), 1);

        // A changed copy of the assigned proxy, now blocked in one location.
        let mut blocked = assigned[0].clone();
        let mut locations = LocationSet::new();
        locations.insert(Location::new("no"));
        blocked.set_blocked_in(locations);

        let mut diff = ResourceDiff::new();
        diff.changed.push(blocked);
        salmon.apply_diff(diff);

        // The sole assigned user carries all the blame and is banned.
        let user = salmon.user(&user).expect("present");
        assert_eq!(user.innocence_probs, vec![0.0]);
        assert!(user.banned);
    }

    #[test]
    fn unblocked_changes_do_not_raise_suspicion() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(1));

        let user = add_user_with_trust(&salmon, 0);
        let assigned = salmon
            .get_proxies(&user, RESOURCE_TYPE_OBFS4)
            .expect("proxies");

        let mut diff = ResourceDiff::new();
        diff.changed.push(assigned[0].clone());
        salmon.apply_diff(diff);

        let user = salmon.user(&user).expect("present");
        assert!(user.innocence_probs.is_empty());
        assert!(!user.banned);
    }

    #[test]
    fn housekeeping_raises_proxy_trust_floor() {
        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(3));

        let user = add_user_with_trust(&salmon, 4);
        let proxies = salmon.get_proxies(&user, RESOURCE_TYPE_OBFS4).expect("proxies");

        salmon.housekeeping_tick();
        {
            let pool = salmon.proxies.lock();
            for r in &proxies {
                assert_eq!(pool.assigned[&r.uid()].trust, 4);
            }
        }

        // A lower-trust co-assignee must never lower the floor.
        let low = add_user_with_trust(&salmon, 1);
        salmon.assignments.lock().add(&low, proxies[0].uid());
        salmon.housekeeping_tick();
        assert_eq!(salmon.proxies.lock().assigned[&proxies[0].uid()].trust, 4);
    }

    #[test]
    fn state_round_trips_through_the_store() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileStore::new(SALMON_DIST_NAME, dir.path());

        let salmon = salmon();
        salmon.seed_unassigned(obfs4_resources(10));
        let admin = add_user_with_trust(&salmon, UNTOUCHABLE_TRUST_LEVEL);
        let token = salmon.create_invite(&admin).expect("invite");
        let invitee = salmon.redeem_invite(&token).expect("redeem");
        let proxies = salmon
            .get_proxies(&invitee, RESOURCE_TYPE_OBFS4)
            .expect("proxies");
        let unredeemed = salmon.create_invite(&admin).expect("invite");
        salmon.save(&store).expect("save");

        let restored = Salmon::new(vec![RESOURCE_TYPE_OBFS4.to_string()]);
        restored.load(&store).expect("load");

        // The invite graph's back references are rebuilt from the forward
        // edges.
        let user = restored.user(&invitee).expect("present");
        assert_eq!(user.invited_by.as_deref(), Some(admin.as_str()));
        assert_eq!(user.trust, UNTOUCHABLE_TRUST_LEVEL - 1);

        // The unredeemed token survives, and assignments are intact.
        assert!(restored.tokens.lock().contains_key(&unredeemed));
        let again = restored
            .get_proxies(&invitee, RESOURCE_TYPE_OBFS4)
            .expect("proxies");
        let mut uids: Vec<_> = proxies.iter().map(|r| r.uid()).collect();
        let mut again_uids: Vec<_> = again.iter().map(|r| r.uid()).collect();
        uids.sort_unstable();
        again_uids.sort_unstable();
        assert_eq!(uids, again_uids);

        // A fresh store on an empty directory loads nothing.
        let empty_dir = tempfile::tempdir().expect("temp dir");
        let fresh = Salmon::new(vec![RESOURCE_TYPE_OBFS4.to_string()]);
        fresh
            .load(&FileStore::new(SALMON_DIST_NAME, empty_dir.path()))
            .expect("empty load");
        assert!(fresh.users.lock().is_empty());
    }
}
