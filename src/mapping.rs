//! Durable mapping between source messages and delivered copies.
//!
//! Each entry tracks one (pair, source message) key through the state
//! machine `Delivered -> Delivered(edited)* -> Tombstoned`. All reads and
//! mutations of a single key must happen under that key's lock (see
//! [`MappingStore::key_lock`]) so edit and delete processing never
//! interleave for the same source message. The store persists to a JSON
//! file and reloads it at startup.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// (pair id, source message id)
pub type MappingKey = (String, i64);

/// One delivered copy of a source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRef {
    pub channel: String,
    pub message_id: i64,
}

/// Persisted mapping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMapping {
    pub pair_id: String,
    pub source_message_id: i64,
    pub destinations: Vec<DestinationRef>,
    pub edit_count: u32,
    pub trap_flag: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the source message was deleted and synchronization
    /// completed; the record lingers for audit until GC.
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl MessageMapping {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }
}

/// Concurrent mapping store with per-key serialization locks.
pub struct MappingStore {
    entries: DashMap<MappingKey, MessageMapping>,
    locks: DashMap<MappingKey, Arc<tokio::sync::Mutex<()>>>,
    path: Option<PathBuf>,
}

impl MappingStore {
    /// In-memory store, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            path: None,
        }
    }

    /// Open a store backed by a JSON file, loading any existing records.
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let entries = DashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let records: Vec<MessageMapping> = serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            for record in records {
                entries.insert((record.pair_id.clone(), record.source_message_id), record);
            }
            tracing::info!(count = entries.len(), path = %path.display(), "loaded message mappings");
        }
        Ok(Self {
            entries,
            locks: DashMap::new(),
            path: Some(path),
        })
    }

    /// Serialization lock for one mapping key. Hold it across the whole
    /// created/edited/deleted mutation, including the outbound calls.
    pub fn key_lock(&self, key: &MappingKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn get(&self, key: &MappingKey) -> Option<MessageMapping> {
        self.entries.get(key).map(|r| r.clone())
    }

    /// Whether a live (non-tombstoned) mapping exists for this key.
    pub fn is_delivered(&self, key: &MappingKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|m| !m.is_tombstoned())
    }

    /// Record a first successful delivery. Returns the stored record.
    pub fn insert_delivered(
        &self,
        pair_id: &str,
        source_message_id: i64,
        destinations: Vec<DestinationRef>,
    ) -> MessageMapping {
        let now = Utc::now();
        let mapping = MessageMapping {
            pair_id: pair_id.to_string(),
            source_message_id,
            destinations,
            edit_count: 0,
            trap_flag: false,
            created_at: now,
            updated_at: now,
            tombstoned_at: None,
        };
        self.entries
            .insert((pair_id.to_string(), source_message_id), mapping.clone());
        self.persist();
        mapping
    }

    /// Bump the edit counter. Returns the new count, or `None` when no
    /// live mapping exists. The counter is monotone: it grows even when
    /// the edit is subsequently blocked.
    pub fn record_edit(&self, key: &MappingKey) -> Option<u32> {
        let count = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.is_tombstoned() {
                return None;
            }
            entry.edit_count += 1;
            entry.updated_at = Utc::now();
            entry.edit_count
        };
        self.persist();
        Some(count)
    }

    /// Flag a mapping whose message tripped a trap.
    pub fn set_trap_flag(&self, key: &MappingKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.trap_flag = true;
            entry.updated_at = Utc::now();
        }
        self.persist();
    }

    /// Mark a mapping tombstoned after delete synchronization.
    pub fn tombstone(&self, key: &MappingKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.tombstoned_at = Some(Utc::now());
            entry.updated_at = Utc::now();
        }
        self.persist();
    }

    /// Drop tombstones older than `retention`. Returns how many were
    /// collected.
    pub fn collect_tombstones(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        let stale: Vec<MappingKey> = self
            .entries
            .iter()
            .filter(|r| r.tombstoned_at.is_some_and(|t| t < cutoff))
            .map(|r| r.key().clone())
            .collect();

        let removed = stale.len();
        for key in stale {
            self.entries.remove(&key);
            self.locks.remove(&key);
        }
        if removed > 0 {
            self.persist();
            tracing::debug!(removed, "collected tombstoned mappings");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let records: Vec<MessageMapping> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        let result = serde_json::to_string_pretty(&records)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist mappings");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(channel: &str, id: i64) -> DestinationRef {
        DestinationRef {
            channel: channel.into(),
            message_id: id,
        }
    }

    #[test]
    fn test_delivery_then_edit_counts() {
        let store = MappingStore::in_memory();
        let key = ("p1".to_string(), 100);

        assert!(!store.is_delivered(&key));
        let mapping = store.insert_delivered("p1", 100, vec![dest("@dest", 555)]);
        assert_eq!(mapping.edit_count, 0);
        assert!(store.is_delivered(&key));

        assert_eq!(store.record_edit(&key), Some(1));
        assert_eq!(store.record_edit(&key), Some(2));
        assert_eq!(store.get(&key).unwrap().edit_count, 2);
    }

    #[test]
    fn test_edit_on_unknown_key_is_none() {
        let store = MappingStore::in_memory();
        assert_eq!(store.record_edit(&("p1".to_string(), 9)), None);
    }

    #[test]
    fn test_tombstone_blocks_further_edits() {
        let store = MappingStore::in_memory();
        let key = ("p1".to_string(), 100);
        store.insert_delivered("p1", 100, vec![dest("@dest", 1)]);

        store.tombstone(&key);
        assert!(store.get(&key).unwrap().is_tombstoned());
        assert!(!store.is_delivered(&key));
        assert_eq!(store.record_edit(&key), None);
    }

    #[test]
    fn test_tombstone_gc() {
        let store = MappingStore::in_memory();
        let key = ("p1".to_string(), 100);
        store.insert_delivered("p1", 100, vec![dest("@dest", 1)]);
        store.tombstone(&key);

        // Fresh tombstones survive
        assert_eq!(store.collect_tombstones(Duration::from_secs(3600)), 0);
        assert_eq!(store.len(), 1);

        // Zero retention collects immediately
        assert_eq!(store.collect_tombstones(Duration::ZERO), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");

        {
            let store = MappingStore::open(path.clone()).unwrap();
            store.insert_delivered("p1", 100, vec![dest("@dest", 555), dest("@alt", 7)]);
            store.record_edit(&("p1".to_string(), 100));
        }

        let reloaded = MappingStore::open(path).unwrap();
        let mapping = reloaded.get(&("p1".to_string(), 100)).unwrap();
        assert_eq!(mapping.destinations.len(), 2);
        assert_eq!(mapping.edit_count, 1);
        assert!(!mapping.trap_flag);
    }

    #[tokio::test]
    async fn test_key_lock_is_shared() {
        let store = MappingStore::in_memory();
        let key = ("p1".to_string(), 1);
        let lock1 = store.key_lock(&key);
        let lock2 = store.key_lock(&key);
        assert!(Arc::ptr_eq(&lock1, &lock2));

        let _guard = lock1.lock().await;
        assert!(lock2.try_lock().is_err());
    }
}
