//! Salmon user accounts and trust levels.

use super::SalmonError;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The level of trust we have in a user or proxy.
pub type Trust = i32;

/// The maximum trust level a user can get promoted to.  The Salmon paper
/// refers to it as "L" and argues that six is a good compromise.
pub const MAX_TRUST_LEVEL: Trust = 6;
/// Users invited directly by us are beyond promotion.
pub const UNTOUCHABLE_TRUST_LEVEL: Trust = MAX_TRUST_LEVEL + 1;
/// Entropy, in bytes, behind a user's secret id.
pub const USER_SECRET_ID_LENGTH: usize = 20;

/// A Base32 string over the given number of cryptographically secure random
/// bytes.
pub fn rand_base32(num_bytes: usize) -> Result<String, SalmonError> {
    let mut raw = vec![0u8; num_bytes];
    OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|_| SalmonError::Entropy)?;
    Ok(data_encoding::BASE32.encode(&raw))
}

/// A Salmon user account.  Users form an invite graph: `invited` holds the
/// accounts this user invited, and `invited_by` is the back reference.  Only
/// the forward edges are persisted; the back references are rebuilt after
/// loading.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub secret_id: String,
    #[serde(default)]
    pub banned: bool,
    /// One entry per proxy-blocking event the user was involved in.  The
    /// product of these is the probability of the user *not* being an
    /// agent; its complement is the user's suspicion.
    #[serde(default)]
    pub innocence_probs: Vec<f64>,
    pub trust: Trust,
    #[serde(skip)]
    pub invited_by: Option<String>,
    #[serde(default)]
    pub invited: Vec<String>,
    /// The last time the user got promoted to a higher trust level.
    pub last_promoted: DateTime<Utc>,
}

impl User {
    pub fn new(trust: Trust) -> Result<Self, SalmonError> {
        let secret_id = rand_base32(USER_SECRET_ID_LENGTH)?;
        tracing::info!(%secret_id, "created new user");
        Ok(Self {
            secret_id,
            banned: false,
            innocence_probs: Vec::new(),
            trust,
            invited_by: None,
            invited: Vec::new(),
            last_promoted: Utc::now(),
        })
    }

    /// The complement of the user's innocence.
    pub fn suspicion(&self) -> f64 {
        1.0 - self.innocence_probs.iter().product::<f64>()
    }

    /// Promotes the user's trust level if the time has come.  A promotion
    /// from level n to n+1 takes 2^(n+1) days; one level per call.
    pub fn update_trust(&mut self) {
        if self.trust >= MAX_TRUST_LEVEL {
            return;
        }

        let days_passed = Utc::now()
            .signed_duration_since(self.last_promoted)
            .num_days();
        let days_required = 1i64 << u64::from((self.trust + 1).unsigned_abs()).min(62);
        if days_passed >= days_required {
            self.trust += 1;
            self.last_promoted = Utc::now();
        }
    }
}
