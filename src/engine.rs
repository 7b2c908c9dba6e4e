//! The relay engine: gates, traps, sanitization, delivery, and sync.
//!
//! A single consumer task drains the event channel, so events for any one
//! (pair, source message) key are processed in arrival order. Each event
//! walks the same pipeline: pause gate, mapping idempotence, trap
//! evaluation, sanitization, delivery, mapping update. A block at any
//! stage drops the event without side effects beyond the audit trail.

use crate::config::{ConfigStore, PairStatus};
use crate::control::PauseController;
use crate::error::RelayError;
use crate::events::{preview, RoutedMessage, SourceEvent};
use crate::mapping::{MappingKey, MappingStore};
use crate::router::{DeliveryClient, DeliveryRouter};
use crate::sanitize::sanitize;
use crate::trap::TrapDetector;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TOMBSTONE_RETENTION: Duration = Duration::from_secs(3600);
const GC_INTERVAL: Duration = Duration::from_secs(300);

/// Per-pair processing counters.
#[derive(Default)]
pub struct PairStats {
    pub relayed: AtomicU64,
    pub blocked: AtomicU64,
    pub edits_synced: AtomicU64,
    pub deletes_synced: AtomicU64,
    pub skipped: AtomicU64,
}

/// Point-in-time copy of a pair's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub relayed: u64,
    pub blocked: u64,
    pub edits_synced: u64,
    pub deletes_synced: u64,
    pub skipped: u64,
}

pub struct RelayEngine {
    config: Arc<ConfigStore>,
    mappings: Arc<MappingStore>,
    pauses: Arc<PauseController>,
    traps: TrapDetector,
    router: DeliveryRouter,
    stats: DashMap<String, Arc<PairStats>>,
}

impl RelayEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        client: Arc<dyn DeliveryClient>,
        mappings: Arc<MappingStore>,
        pauses: Arc<PauseController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            mappings,
            pauses,
            traps: TrapDetector::new(),
            router: DeliveryRouter::new(client),
            stats: DashMap::new(),
        })
    }

    /// Drain the event channel until it closes, collecting stale
    /// tombstones on a timer.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SourceEvent>) {
        let mut gc = tokio::time::interval(GC_INTERVAL);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => {
                            tracing::info!("event channel closed, engine stopping");
                            return;
                        }
                    }
                }
                _ = gc.tick() => {
                    self.mappings.collect_tombstones(TOMBSTONE_RETENTION);
                }
            }
        }
    }

    /// Process one routed event through the pipeline.
    pub async fn handle(&self, event: SourceEvent) {
        match event {
            SourceEvent::Created(msg) => self.handle_created(msg).await,
            SourceEvent::Edited(msg) => self.handle_edited(msg).await,
            SourceEvent::Deleted {
                pair_id,
                message_id,
                ..
            } => self.handle_deleted(&pair_id, message_id).await,
        }
    }

    async fn handle_created(&self, msg: RoutedMessage) {
        let snapshot = self.config.current();
        let Some(pair) = snapshot.pair(&msg.pair_id) else {
            tracing::debug!(pair = %msg.pair_id, "event for unconfigured pair dropped");
            return;
        };
        if pair.status != PairStatus::Active || self.pauses.is_paused(&pair.owner, &pair.id) {
            tracing::debug!(pair = %pair.id, message_id = msg.message_id, "pair gated, skipping");
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key: MappingKey = (pair.id.clone(), msg.message_id);
        let lock = self.mappings.key_lock(&key);
        let _guard = lock.lock().await;

        // Redelivery of a known source message is a duplicate, including
        // after a tombstone: a deleted message never comes back.
        if self.mappings.get(&key).is_some() {
            tracing::debug!(pair = %pair.id, message_id = msg.message_id, "duplicate ignored");
            return;
        }

        if self
            .traps
            .evaluate(&snapshot, &pair.id, &msg.text, msg.image.as_deref())
            .is_block()
        {
            self.pair_stats(&pair.id).blocked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let text = sanitize(&msg.text, &pair.strip);
        if text.is_empty() && msg.image.is_none() {
            tracing::debug!(
                pair = %pair.id,
                message_id = msg.message_id,
                "nothing left after sanitization, skipping"
            );
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The gate is re-checked at the delivery boundary: a pause raised
        // while this event waited on the key lock must stop the send.
        if self.pauses.is_paused(&pair.owner, &pair.id) {
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self
            .router
            .deliver(&snapshot, &pair, &text, msg.image.as_deref())
            .await
        {
            Ok(destinations) => {
                tracing::info!(
                    pair = %pair.id,
                    message_id = msg.message_id,
                    destinations = destinations.len(),
                    preview = %preview(&text, 48),
                    "relayed"
                );
                self.mappings
                    .insert_delivered(&pair.id, msg.message_id, destinations);
                self.pair_stats(&pair.id).relayed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    pair = %pair.id,
                    message_id = msg.message_id,
                    error = %e,
                    "message not relayed"
                );
            }
        }
    }

    async fn handle_edited(&self, msg: RoutedMessage) {
        let snapshot = self.config.current();
        let Some(pair) = snapshot.pair(&msg.pair_id) else {
            return;
        };
        if pair.status != PairStatus::Active || self.pauses.is_paused(&pair.owner, &pair.id) {
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key: MappingKey = (pair.id.clone(), msg.message_id);
        let lock = self.mappings.key_lock(&key);
        let _guard = lock.lock().await;

        // An edit for a message that was never delivered (blocked,
        // skipped, or unknown) is dropped, never treated as a creation.
        let Some(mapping) = self.mappings.get(&key).filter(|m| !m.is_tombstoned()) else {
            tracing::debug!(
                error = %RelayError::MappingNotFound {
                    pair: pair.id.clone(),
                    message_id: msg.message_id,
                },
                "edit dropped"
            );
            return;
        };

        // The edit counter grows even when the new content is blocked.
        let edit_count = self.mappings.record_edit(&key).unwrap_or(0);

        if self
            .traps
            .evaluate(&snapshot, &pair.id, &msg.text, msg.image.as_deref())
            .is_block()
        {
            self.mappings.set_trap_flag(&key);
            self.pair_stats(&pair.id).blocked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self
            .traps
            .evaluate_edit_count(&pair.id, &msg.text, edit_count, snapshot.limits.edit_threshold)
            .is_block()
        {
            self.mappings.set_trap_flag(&key);
            self.pauses.auto_pause_pair(&pair.id);
            self.pair_stats(&pair.id).blocked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let text = sanitize(&msg.text, &pair.strip);
        if text.is_empty() {
            tracing::debug!(
                pair = %pair.id,
                message_id = msg.message_id,
                "edit empty after sanitization, skipping"
            );
            return;
        }

        if self.pauses.is_paused(&pair.owner, &pair.id) {
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self
            .router
            .sync_edit(&snapshot, &pair, &mapping.destinations, &text)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    pair = %pair.id,
                    message_id = msg.message_id,
                    edit_count,
                    "edit synchronized"
                );
                self.pair_stats(&pair.id)
                    .edits_synced
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    pair = %pair.id,
                    message_id = msg.message_id,
                    error = %e,
                    "edit sync failed"
                );
            }
        }
    }

    async fn handle_deleted(&self, pair_id: &str, message_id: i64) {
        let snapshot = self.config.current();
        let Some(pair) = snapshot.pair(pair_id) else {
            return;
        };
        // Pause dominance covers deletions too: a paused pair makes no
        // outbound call and mutates no mapping.
        if pair.status != PairStatus::Active || self.pauses.is_paused(&pair.owner, &pair.id) {
            self.pair_stats(&pair.id).skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key: MappingKey = (pair.id.clone(), message_id);
        let lock = self.mappings.key_lock(&key);
        let _guard = lock.lock().await;

        let Some(mapping) = self.mappings.get(&key).filter(|m| !m.is_tombstoned()) else {
            tracing::debug!(pair = %pair.id, message_id, "deletion for unmapped message dropped");
            return;
        };

        match self
            .router
            .sync_delete(&snapshot, &pair, &mapping.destinations)
            .await
        {
            Ok(()) => {
                self.mappings.tombstone(&key);
                tracing::info!(pair = %pair.id, message_id, "deletion synchronized");
                self.pair_stats(&pair.id)
                    .deletes_synced
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Mapping stays live so the operator can re-trigger.
                tracing::error!(pair = %pair.id, message_id, error = %e, "delete sync failed");
            }
        }
    }

    // Control surface

    pub fn pause_pair(&self, pair_id: &str) {
        self.pauses.pause_pair(pair_id);
    }

    pub fn resume_pair(&self, pair_id: &str) {
        self.pauses.resume_pair(pair_id);
    }

    pub fn pause_user(&self, user: &str) {
        self.pauses.pause_user(user);
    }

    pub fn resume_user(&self, user: &str) {
        self.pauses.resume_user(user);
    }

    pub fn add_blocklist_entry(&self, entry: crate::config::BlocklistEntry) -> crate::error::RelayResult<()> {
        self.config.add_blocklist_entry(entry)
    }

    pub fn remove_blocklist_entry(&self, scope: &str, value: &str) -> crate::error::RelayResult<bool> {
        self.config.remove_blocklist_entry(scope, value)
    }

    pub fn trap_events(&self) -> Vec<crate::trap::TrapEvent> {
        self.traps.events()
    }

    pub fn mapping(&self, pair_id: &str, message_id: i64) -> Option<crate::mapping::MessageMapping> {
        self.mappings.get(&(pair_id.to_string(), message_id))
    }

    fn pair_stats(&self, pair_id: &str) -> Arc<PairStats> {
        self.stats
            .entry(pair_id.to_string())
            .or_default()
            .clone()
    }

    /// Counters for one pair.
    pub fn stats(&self, pair_id: &str) -> StatsSnapshot {
        self.stats
            .get(pair_id)
            .map(|s| StatsSnapshot {
                relayed: s.relayed.load(Ordering::Relaxed),
                blocked: s.blocked.load(Ordering::Relaxed),
                edits_synced: s.edits_synced.load(Ordering::Relaxed),
                deletes_synced: s.deletes_synced.load(Ordering::Relaxed),
                skipped: s.skipped.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn traps(&self) -> &TrapDetector {
        &self.traps
    }

    pub fn pauses(&self) -> &PauseController {
        &self.pauses
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockKind, BlocklistEntry, RelayConfig};
    use crate::error::RelayResult;
    use crate::test_utils::sample_config;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        next_id: AtomicI64,
        sends: Mutex<Vec<(String, String)>>,
        edits: Mutex<Vec<(String, i64, String)>>,
        deletes: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl DeliveryClient for RecordingClient {
        async fn send(
            &self,
            _credential: &SecretString,
            channel: &str,
            text: &str,
            _image: Option<&[u8]>,
        ) -> RelayResult<i64> {
            self.sends
                .lock()
                .unwrap()
                .push((channel.to_string(), text.to_string()));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn edit(
            &self,
            _credential: &SecretString,
            channel: &str,
            message_id: i64,
            text: &str,
        ) -> RelayResult<()> {
            self.edits
                .lock()
                .unwrap()
                .push((channel.to_string(), message_id, text.to_string()));
            Ok(())
        }

        async fn delete(
            &self,
            _credential: &SecretString,
            channel: &str,
            message_id: i64,
        ) -> RelayResult<()> {
            self.deletes
                .lock()
                .unwrap()
                .push((channel.to_string(), message_id));
            Ok(())
        }
    }

    fn engine_with(cfg: RelayConfig) -> (Arc<RelayEngine>, Arc<RecordingClient>) {
        let config = ConfigStore::new(cfg).unwrap();
        let client = Arc::new(RecordingClient::default());
        let pauses = Arc::new(PauseController::new(Duration::from_secs(150)));
        let engine = RelayEngine::new(
            config,
            Arc::clone(&client) as Arc<dyn DeliveryClient>,
            Arc::new(MappingStore::in_memory()),
            pauses,
        );
        (engine, client)
    }

    fn created(message_id: i64, text: &str) -> SourceEvent {
        SourceEvent::Created(RoutedMessage {
            pair_id: "p1".into(),
            session_id: "s1".into(),
            message_id,
            text: text.into(),
            image: None,
        })
    }

    fn edited(message_id: i64, text: &str) -> SourceEvent {
        SourceEvent::Edited(RoutedMessage {
            pair_id: "p1".into(),
            session_id: "s1".into(),
            message_id,
            text: text.into(),
            image: None,
        })
    }

    fn deleted(message_id: i64) -> SourceEvent {
        SourceEvent::Deleted {
            pair_id: "p1".into(),
            session_id: "s1".into(),
            message_id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_delivers_and_maps() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "hello there")).await;

        assert_eq!(client.sends.lock().unwrap().len(), 1);
        assert!(engine.mappings().is_delivered(&("p1".into(), 1)));
        assert_eq!(engine.stats("p1").relayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_created_ignored() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "hello")).await;
        engine.handle(created(1, "hello")).await;

        assert_eq!(client.sends.lock().unwrap().len(), 1);
        assert_eq!(engine.stats("p1").relayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_pair_skips_created() {
        let (engine, client) = engine_with(sample_config());
        engine.pauses().pause_pair("p1");
        engine.handle(created(1, "hello")).await;

        assert!(client.sends.lock().unwrap().is_empty());
        assert_eq!(engine.stats("p1").skipped, 1);

        engine.pauses().resume_pair("p1");
        engine.handle(created(1, "hello")).await;
        assert_eq!(engine.stats("p1").relayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trap_blocks_created() {
        let mut cfg = sample_config();
        cfg.blocklist.push(BlocklistEntry {
            scope: "global".into(),
            kind: BlockKind::TextPattern,
            value: "vip entry".into(),
            active: true,
        });
        let (engine, client) = engine_with(cfg);

        engine.handle(created(1, "Limited VIP Entry today")).await;
        assert!(client.sends.lock().unwrap().is_empty());
        assert_eq!(engine.stats("p1").blocked, 1);
        assert_eq!(engine.traps().events_for_pair("p1").len(), 1);

        // Blocked message was never mapped, so its edits are dropped too.
        engine.handle(edited(1, "now clean")).await;
        assert!(client.edits.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sanitized_text_is_delivered() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "signal!!! @trader")).await;

        let sends = client.sends.lock().unwrap();
        assert_eq!(sends[0].1, "signal!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mention_only_message_skipped() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "@just_a_mention")).await;

        assert!(client.sends.lock().unwrap().is_empty());
        assert_eq!(engine.stats("p1").skipped, 1);
        assert!(!engine.mappings().is_delivered(&("p1".into(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_synchronized_to_destinations() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "original")).await;
        engine.handle(edited(1, "updated text")).await;

        let edits = client.edits.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, "@dest");
        assert_eq!(edits[0].2, "updated text");
        assert_eq!(engine.stats("p1").edits_synced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_without_mapping_dropped() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(edited(99, "never created")).await;
        assert!(client.edits.lock().unwrap().is_empty());
        assert!(client.sends.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_threshold_blocks_and_auto_pauses() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "v0")).await;

        // Threshold 3: the first three edits sync, the fourth blocks.
        for i in 1..=3u32 {
            engine.handle(edited(1, &format!("v{i}"))).await;
        }
        assert_eq!(client.edits.lock().unwrap().len(), 3);
        assert!(!engine.pauses().is_paused("alice", "p1"));

        engine.handle(edited(1, "v4")).await;
        assert_eq!(client.edits.lock().unwrap().len(), 3);
        assert!(engine.pauses().is_paused("alice", "p1"));
        assert!(engine.mappings().get(&("p1".into(), 1)).unwrap().trap_flag);
        assert_eq!(engine.stats("p1").blocked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_synchronizes_and_tombstones() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "hello")).await;
        let dest_id = engine.mappings().get(&("p1".into(), 1)).unwrap().destinations[0].message_id;

        engine.handle(deleted(1)).await;
        assert_eq!(*client.deletes.lock().unwrap(), vec![("@dest".to_string(), dest_id)]);
        assert!(engine.mappings().get(&("p1".into(), 1)).unwrap().is_tombstoned());
        assert_eq!(engine.stats("p1").deletes_synced, 1);

        // Second deletion is a no-op, and the message never comes back.
        engine.handle(deleted(1)).await;
        assert_eq!(client.deletes.lock().unwrap().len(), 1);
        engine.handle(created(1, "hello")).await;
        assert_eq!(client.sends.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_pair_skips_delete() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "hello")).await;

        // No outbound call and no mapping mutation while paused.
        engine.pause_pair("p1");
        engine.handle(deleted(1)).await;
        assert!(client.deletes.lock().unwrap().is_empty());
        let mapping = engine.mapping("p1", 1).unwrap();
        assert!(!mapping.is_tombstoned());
        assert_eq!(engine.stats("p1").deletes_synced, 0);

        engine.resume_pair("p1");
        engine.handle(deleted(1)).await;
        assert_eq!(client.deletes.lock().unwrap().len(), 1);
        assert!(engine.mapping("p1", 1).unwrap().is_tombstoned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_pair_skips_edit_sync() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "hello")).await;

        engine.pause_pair("p1");
        engine.handle(edited(1, "revised")).await;
        assert!(client.edits.lock().unwrap().is_empty());
        assert_eq!(engine.stats("p1").edits_synced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_raised_mid_wait_stops_delivery() {
        let (engine, client) = engine_with(sample_config());

        // Hold the key lock so the handler parks before delivery.
        let lock = engine.mappings().key_lock(&("p1".into(), 1));
        let guard = lock.lock().await;
        let handler = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.handle(created(1, "hello")).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        engine.pause_pair("p1");
        drop(guard);
        handler.await.unwrap();

        assert!(client.sends.lock().unwrap().is_empty());
        assert!(engine.mapping("p1", 1).is_none());
        assert_eq!(engine.stats("p1").skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_blocklist_update_applies() {
        let (engine, client) = engine_with(sample_config());
        engine.handle(created(1, "vip entry today")).await;
        assert_eq!(client.sends.lock().unwrap().len(), 1);

        engine
            .add_blocklist_entry(BlocklistEntry {
                scope: "global".into(),
                kind: BlockKind::TextPattern,
                value: "vip entry".into(),
                active: true,
            })
            .unwrap();
        engine.handle(created(2, "vip entry again")).await;
        assert_eq!(client.sends.lock().unwrap().len(), 1);
        assert_eq!(engine.trap_events().len(), 1);
        assert!(engine.mapping("p1", 2).is_none());

        engine.remove_blocklist_entry("global", "vip entry").unwrap();
        engine.handle(created(3, "all clear")).await;
        assert_eq!(client.sends.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_processes_and_stops() {
        let (engine, client) = engine_with(sample_config());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(Arc::clone(&engine).run(rx));

        tx.send(created(1, "hello")).await.unwrap();
        tx.send(edited(1, "hello again")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(client.sends.lock().unwrap().len(), 1);
        assert_eq!(client.edits.lock().unwrap().len(), 1);
    }
}
