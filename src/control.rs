//! Pause and resume gates for relay processing.
//!
//! Two scopes exist: per-user (every pair owned by that user) and
//! per-pair. A pause is either manual, which only an explicit resume
//! clears, or automatic with a cooldown deadline, after which the gate
//! reopens lazily on the next check. A manual pause is never cleared by
//! cooldown expiry. Manual pauses persist across restarts; automatic
//! ones do not.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Why processing is currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Manual,
    Auto { resume_at: DateTime<Utc> },
}

impl PauseState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            PauseState::Manual => false,
            PauseState::Auto { resume_at } => now >= *resume_at,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedPauses {
    users: Vec<String>,
    pairs: Vec<String>,
}

/// Pause gates keyed by user and by pair.
pub struct PauseController {
    users: DashMap<String, PauseState>,
    pairs: DashMap<String, PauseState>,
    cooldown: Duration,
    path: Option<PathBuf>,
}

impl PauseController {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            users: DashMap::new(),
            pairs: DashMap::new(),
            cooldown,
            path: None,
        }
    }

    /// Controller backed by a JSON file holding manual pauses.
    pub fn open(cooldown: Duration, path: PathBuf) -> std::io::Result<Self> {
        let controller = Self {
            users: DashMap::new(),
            pairs: DashMap::new(),
            cooldown,
            path: Some(path.clone()),
        };
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let persisted: PersistedPauses = serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            for user in persisted.users {
                controller.users.insert(user, PauseState::Manual);
            }
            for pair in persisted.pairs {
                controller.pairs.insert(pair, PauseState::Manual);
            }
            tracing::info!(
                users = controller.users.len(),
                pairs = controller.pairs.len(),
                "restored manual pauses"
            );
        }
        Ok(controller)
    }

    pub fn pause_user(&self, user: &str) {
        tracing::info!(user, "user paused");
        self.users.insert(user.to_string(), PauseState::Manual);
        self.persist();
    }

    pub fn resume_user(&self, user: &str) {
        tracing::info!(user, "user resumed");
        self.users.remove(user);
        self.persist();
    }

    pub fn pause_pair(&self, pair_id: &str) {
        tracing::info!(pair = pair_id, "pair paused");
        self.pairs.insert(pair_id.to_string(), PauseState::Manual);
        self.persist();
    }

    pub fn resume_pair(&self, pair_id: &str) {
        tracing::info!(pair = pair_id, "pair resumed");
        self.pairs.remove(pair_id);
        self.persist();
    }

    /// Automatic pause with cooldown. A standing manual pause wins and
    /// is left untouched.
    pub fn auto_pause_pair(&self, pair_id: &str) {
        let resume_at = Utc::now()
            + chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::zero());
        let mut entry = self
            .pairs
            .entry(pair_id.to_string())
            .or_insert(PauseState::Auto { resume_at });
        if let PauseState::Auto { resume_at: at } = entry.value_mut() {
            *at = resume_at;
        }
        tracing::warn!(
            pair = pair_id,
            cooldown_secs = self.cooldown.as_secs(),
            "pair auto-paused"
        );
    }

    /// Gate check for one pair owned by `user`. Expired automatic pauses
    /// are cleared here, on the read path.
    pub fn is_paused(&self, user: &str, pair_id: &str) -> bool {
        self.check_gate(&self.users, user) || self.check_gate(&self.pairs, pair_id)
    }

    pub fn pair_state(&self, pair_id: &str) -> Option<PauseState> {
        self.sweep_expired(&self.pairs, pair_id);
        self.pairs.get(pair_id).map(|r| *r.value())
    }

    pub fn user_state(&self, user: &str) -> Option<PauseState> {
        self.sweep_expired(&self.users, user);
        self.users.get(user).map(|r| *r.value())
    }

    fn check_gate(&self, gates: &DashMap<String, PauseState>, key: &str) -> bool {
        self.sweep_expired(gates, key);
        gates.contains_key(key)
    }

    fn sweep_expired(&self, gates: &DashMap<String, PauseState>, key: &str) {
        let now = Utc::now();
        let expired = gates.get(key).is_some_and(|s| s.is_expired(now));
        if expired {
            gates.remove(key);
            tracing::info!(key, "auto-pause cooldown elapsed, resumed");
        }
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        // Only manual pauses survive a restart
        let persisted = PersistedPauses {
            users: self
                .users
                .iter()
                .filter(|r| matches!(r.value(), PauseState::Manual))
                .map(|r| r.key().clone())
                .collect(),
            pairs: self
                .pairs
                .iter()
                .filter(|r| matches!(r.value(), PauseState::Manual))
                .map(|r| r.key().clone())
                .collect(),
        };
        let result = serde_json::to_string_pretty(&persisted)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist pauses");
        }
    }
}
