//! Trap detection: adversarial content planted to catch redistribution.
//!
//! Rules are applied in fixed order with first-match-wins semantics:
//! text patterns (global blocklist, then pair-scoped), image hashes,
//! then edit frequency. A block short-circuits the pipeline and records
//! exactly one [`TrapEvent`] in the append-only audit trail.

use crate::config::ConfigSnapshot;
use crate::events::preview;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

/// Which rule blocked the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCategory {
    Text,
    Image,
    EditFrequency,
}

impl std::fmt::Display for TrapCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrapCategory::Text => write!(f, "text"),
            TrapCategory::Image => write!(f, "image"),
            TrapCategory::EditFrequency => write!(f, "edit-frequency"),
        }
    }
}

/// Outcome of trap evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(TrapCategory),
}

impl Decision {
    pub fn is_block(&self) -> bool {
        matches!(self, Decision::Block(_))
    }
}

/// Append-only audit record for a blocked message. Carries a bounded
/// preview, never the full content.
#[derive(Debug, Clone)]
pub struct TrapEvent {
    pub id: String,
    pub pair_id: String,
    pub preview: String,
    pub category: TrapCategory,
    pub at: DateTime<Utc>,
}

const PREVIEW_CHARS: usize = 48;

/// Evaluates candidate messages against blocklists and edit counters.
#[derive(Default)]
pub struct TrapDetector {
    events: Mutex<Vec<TrapEvent>>,
}

impl TrapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate message content: text rules first, then image rules.
    /// Records a trap event on block.
    pub fn evaluate(
        &self,
        snapshot: &ConfigSnapshot,
        pair_id: &str,
        text: &str,
        image: Option<&[u8]>,
    ) -> Decision {
        if self.text_trap(snapshot, pair_id, text) {
            self.record(pair_id, text, TrapCategory::Text);
            return Decision::Block(TrapCategory::Text);
        }

        if let Some(bytes) = image {
            if let Some(hash) = self.image_trap(snapshot, pair_id, bytes) {
                tracing::warn!(pair = pair_id, hash = %hash, "image trap matched");
                self.record(pair_id, text, TrapCategory::Image);
                return Decision::Block(TrapCategory::Image);
            }
        }

        Decision::Allow
    }

    /// Edit-frequency rule. `edit_count` is the already-incremented
    /// counter from the mapping store; the count that *exceeds* the
    /// threshold blocks (threshold 3 blocks the 4th edit). The caller is
    /// responsible for signalling pause control on a block.
    pub fn evaluate_edit_count(
        &self,
        pair_id: &str,
        text: &str,
        edit_count: u32,
        threshold: u32,
    ) -> Decision {
        if edit_count > threshold {
            tracing::warn!(
                pair = pair_id,
                edit_count,
                threshold,
                "edit frequency trap"
            );
            self.record(pair_id, text, TrapCategory::EditFrequency);
            Decision::Block(TrapCategory::EditFrequency)
        } else {
            Decision::Allow
        }
    }

    fn text_trap(&self, snapshot: &ConfigSnapshot, pair_id: &str, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let normalized = normalize_for_match(text);

        // Global entries first, then pair-scoped.
        if snapshot
            .global_blocks
            .text
            .iter()
            .any(|m| m.matches(&normalized))
        {
            return true;
        }
        snapshot
            .pair_blocks(pair_id)
            .is_some_and(|b| b.text.iter().any(|m| m.matches(&normalized)))
    }

    /// Returns the matched hash if the image is a known trap.
    fn image_trap(
        &self,
        snapshot: &ConfigSnapshot,
        pair_id: &str,
        bytes: &[u8],
    ) -> Option<String> {
        let hash = image_fingerprint(bytes)?;
        let global_hit = snapshot.global_blocks.image_hashes.contains(&hash);
        let pair_hit = snapshot
            .pair_blocks(pair_id)
            .is_some_and(|b| b.image_hashes.contains(&hash));
        (global_hit || pair_hit).then_some(hash)
    }

    fn record(&self, pair_id: &str, text: &str, category: TrapCategory) {
        let event = TrapEvent {
            id: uuid::Uuid::new_v4().to_string(),
            pair_id: pair_id.to_string(),
            preview: preview(text, PREVIEW_CHARS),
            category,
            at: Utc::now(),
        };
        tracing::warn!(
            pair = pair_id,
            category = %category,
            preview = %event.preview,
            "trap detected, message blocked"
        );
        self.events.lock().expect("trap event lock").push(event);
    }

    /// Full audit trail, oldest first.
    pub fn events(&self) -> Vec<TrapEvent> {
        self.events.lock().expect("trap event lock").clone()
    }

    /// Audit trail filtered to one pair.
    pub fn events_for_pair(&self, pair_id: &str) -> Vec<TrapEvent> {
        self.events
            .lock()
            .expect("trap event lock")
            .iter()
            .filter(|e| e.pair_id == pair_id)
            .cloned()
            .collect()
    }
}

/// Canonical form for text matching: lowercased with whitespace runs
/// collapsed, so spacing tricks cannot evade a pattern.
pub fn normalize_for_match(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content hash of the re-encoded pixel data. Decoding and hashing raw
/// RGB8 (plus dimensions) means format conversion or metadata edits
/// cannot evade a match. Undecodable payloads yield no fingerprint.
pub fn image_fingerprint(bytes: &[u8]) -> Option<String> {
    let decoded = image::load_from_memory(bytes).ok()?;
    let rgb = decoded.to_rgb8();
    let mut hasher = Sha256::new();
    hasher.update(rgb.width().to_le_bytes());
    hasher.update(rgb.height().to_le_bytes());
    hasher.update(rgb.as_raw());
    Some(format!("{:x}", hasher.finalize()))
}
