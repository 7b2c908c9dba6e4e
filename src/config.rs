//! Relay configuration: routing pairs, strip rules, blocklists, sessions.
//!
//! Configuration is deserialized from TOML into the raw [`RelayConfig`]
//! shape, validated and compiled into an immutable [`ConfigSnapshot`], and
//! published through an [`arc_swap::ArcSwap`]. Pipeline stages read the
//! snapshot reference once per message, so a mid-flight reload can never
//! produce inconsistent decisions. A reload that fails validation keeps the
//! previous snapshot active.

use crate::error::{RelayError, RelayResult};
use arc_swap::ArcSwap;
use regex::{Regex, RegexBuilder};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub pairs: Vec<PairConfig>,

    #[serde(default)]
    pub sessions: Vec<SessionConfig>,

    #[serde(default)]
    pub blocklist: Vec<BlocklistEntry>,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Delivery credentials by name. Values may be env-var references
    /// like `${RELAY_BOT_TOKEN}`.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

/// One source -> destination(s) route.
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub id: String,
    pub owner: String,
    pub source_channel: String,
    pub destinations: Vec<String>,
    /// Name of the delivery credential in `[credentials]`.
    pub credential: String,
    #[serde(default)]
    pub strip_rules: StripRules,
    #[serde(default)]
    pub status: PairStatus,
}

/// Content filtering rules applied per pair.
#[derive(Debug, Clone, Deserialize)]
pub struct StripRules {
    #[serde(default = "default_true")]
    pub remove_mentions: bool,
    #[serde(default)]
    pub header_patterns: Vec<String>,
    #[serde(default)]
    pub footer_patterns: Vec<String>,
}

impl Default for StripRules {
    fn default() -> Self {
        Self {
            remove_mentions: true,
            header_patterns: Vec::new(),
            footer_patterns: Vec::new(),
        }
    }
}

/// Pair lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    #[default]
    Active,
    Paused,
    Error,
}

/// A credential context bound to one user.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    pub owner: String,
    /// Source channels this session listens on. Empty means "derive from
    /// the owner's pairs".
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub status: SessionStatus,
}

/// Session connectivity status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Inactive,
    Invalid,
}

/// A trap pattern to match messages against.
#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistEntry {
    /// `"global"` or a pair id.
    #[serde(default = "default_scope")]
    pub scope: String,
    pub kind: BlockKind,
    pub value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Blocklist entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    TextPattern,
    ImageHash,
    Regex,
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsConfig {
    /// Edits beyond this count block and auto-pause the pair.
    #[serde(default = "default_edit_threshold")]
    pub edit_threshold: u32,
    /// Cooldown before an auto-paused pair resumes.
    #[serde(default = "default_auto_resume")]
    pub auto_resume_secs: u64,
    /// Token-bucket rate per delivery credential.
    #[serde(default = "default_rate")]
    pub rate_per_minute: u32,
    #[serde(default = "default_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            edit_threshold: default_edit_threshold(),
            auto_resume_secs: default_auto_resume(),
            rate_per_minute: default_rate(),
            retry_attempts: default_attempts(),
            retry_base_delay_ms: default_base_delay(),
            retry_max_delay_ms: default_max_delay(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_edit_threshold() -> u32 {
    3
}

fn default_auto_resume() -> u64 {
    150
}

fn default_rate() -> u32 {
    20
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

/// A compiled text matcher. Patterns that fail to compile as regexes fall
/// back to case-insensitive substring matching instead of failing the
/// whole config.
#[derive(Debug, Clone)]
pub enum TextMatcher {
    Regex(Regex),
    Substring(String),
}

impl TextMatcher {
    /// Compile a pattern, falling back to substring matching on regex
    /// errors. `strict` forces a compile error instead of the fallback.
    pub fn compile(pattern: &str, strict: bool) -> RelayResult<Self> {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => Ok(TextMatcher::Regex(re)),
            Err(e) if strict => Err(RelayError::ConfigValidation(format!(
                "invalid regex {pattern:?}: {e}"
            ))),
            Err(_) => Ok(TextMatcher::Substring(pattern.to_lowercase())),
        }
    }

    /// Match anywhere in the text.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            TextMatcher::Regex(re) => re.is_match(text),
            TextMatcher::Substring(s) => text.to_lowercase().contains(s.as_str()),
        }
    }

    /// Match anchored at the start of the text.
    pub fn matches_start(&self, text: &str) -> bool {
        match self {
            TextMatcher::Regex(re) => re.find(text).is_some_and(|m| m.start() == 0),
            TextMatcher::Substring(s) => text.to_lowercase().starts_with(s.as_str()),
        }
    }
}

/// Strip rules with patterns compiled.
#[derive(Debug, Clone, Default)]
pub struct CompiledStripRules {
    pub remove_mentions: bool,
    pub headers: Vec<TextMatcher>,
    pub footers: Vec<TextMatcher>,
}

impl CompiledStripRules {
    fn compile(rules: &StripRules) -> RelayResult<Self> {
        let compile_all = |patterns: &[String]| -> RelayResult<Vec<TextMatcher>> {
            patterns
                .iter()
                .map(|p| TextMatcher::compile(p, false))
                .collect()
        };
        Ok(Self {
            remove_mentions: rules.remove_mentions,
            headers: compile_all(&rules.header_patterns)?,
            footers: compile_all(&rules.footer_patterns)?,
        })
    }
}

/// A pair with its strip rules compiled and credential resolved.
#[derive(Debug)]
pub struct CompiledPair {
    pub id: String,
    pub owner: String,
    pub source_channel: String,
    pub destinations: Vec<String>,
    pub credential: String,
    pub strip: CompiledStripRules,
    pub status: PairStatus,
}

/// Compiled blocklist for one scope.
#[derive(Debug, Default)]
pub struct CompiledBlocklist {
    pub text: Vec<TextMatcher>,
    pub image_hashes: HashSet<String>,
}

impl CompiledBlocklist {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.image_hashes.is_empty()
    }
}

/// Immutable, validated view of the configuration.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    pairs: HashMap<String, Arc<CompiledPair>>,
    /// (owner, source channel) -> pair id.
    by_source: HashMap<(String, String), String>,
    pub global_blocks: CompiledBlocklist,
    pair_blocks: HashMap<String, CompiledBlocklist>,
    pub sessions: Vec<SessionConfig>,
    pub limits: LimitsConfig,
    credentials: HashMap<String, SecretString>,
}

impl ConfigSnapshot {
    /// Validate and compile a raw config.
    pub fn compile(cfg: &RelayConfig) -> RelayResult<Self> {
        let mut pairs = HashMap::new();
        let mut by_source = HashMap::new();

        for pair in &cfg.pairs {
            if pair.id.trim().is_empty() {
                return Err(RelayError::ConfigValidation("pair id is empty".into()));
            }
            if pairs.contains_key(&pair.id) {
                return Err(RelayError::ConfigValidation(format!(
                    "duplicate pair id {:?}",
                    pair.id
                )));
            }
            validate_channel_ref(&pair.source_channel)?;
            if pair.destinations.is_empty() {
                return Err(RelayError::ConfigValidation(format!(
                    "pair {:?} has no destinations",
                    pair.id
                )));
            }
            for dest in &pair.destinations {
                validate_channel_ref(dest)?;
            }
            if !cfg.credentials.contains_key(&pair.credential) {
                return Err(RelayError::ConfigValidation(format!(
                    "pair {:?} references unknown credential {:?}",
                    pair.id, pair.credential
                )));
            }

            by_source.insert(
                (pair.owner.clone(), pair.source_channel.clone()),
                pair.id.clone(),
            );
            pairs.insert(
                pair.id.clone(),
                Arc::new(CompiledPair {
                    id: pair.id.clone(),
                    owner: pair.owner.clone(),
                    source_channel: pair.source_channel.clone(),
                    destinations: pair.destinations.clone(),
                    credential: pair.credential.clone(),
                    strip: CompiledStripRules::compile(&pair.strip_rules)?,
                    status: pair.status,
                }),
            );
        }

        let mut session_ids = HashSet::new();
        for session in &cfg.sessions {
            if session.id.trim().is_empty() {
                return Err(RelayError::ConfigValidation("session id is empty".into()));
            }
            if !session_ids.insert(session.id.clone()) {
                return Err(RelayError::ConfigValidation(format!(
                    "duplicate session id {:?}",
                    session.id
                )));
            }
        }

        let mut global_blocks = CompiledBlocklist::default();
        let mut pair_blocks: HashMap<String, CompiledBlocklist> = HashMap::new();
        for entry in &cfg.blocklist {
            if !entry.active {
                continue;
            }
            if entry.scope != "global" && !pairs.contains_key(&entry.scope) {
                return Err(RelayError::ConfigValidation(format!(
                    "blocklist entry scoped to unknown pair {:?}",
                    entry.scope
                )));
            }
            let target = if entry.scope == "global" {
                &mut global_blocks
            } else {
                pair_blocks.entry(entry.scope.clone()).or_default()
            };
            match entry.kind {
                BlockKind::TextPattern => {
                    target.text.push(TextMatcher::Substring(entry.value.to_lowercase()));
                }
                BlockKind::Regex => {
                    target.text.push(TextMatcher::compile(&entry.value, true)?);
                }
                BlockKind::ImageHash => {
                    target.image_hashes.insert(entry.value.to_lowercase());
                }
            }
        }

        let mut credentials = HashMap::new();
        for (name, value) in &cfg.credentials {
            credentials.insert(name.clone(), resolve_secret(name, value)?);
        }

        Ok(Self {
            pairs,
            by_source,
            global_blocks,
            pair_blocks,
            sessions: cfg.sessions.clone(),
            limits: cfg.limits,
            credentials,
        })
    }

    /// Look up a pair by id.
    pub fn pair(&self, id: &str) -> Option<Arc<CompiledPair>> {
        self.pairs.get(id).cloned()
    }

    /// Resolve the pair an incoming message belongs to.
    pub fn pair_for_source(&self, owner: &str, channel: &str) -> Option<Arc<CompiledPair>> {
        self.by_source
            .get(&(owner.to_string(), channel.to_string()))
            .and_then(|id| self.pairs.get(id))
            .cloned()
    }

    /// All configured pair ids.
    pub fn pair_ids(&self) -> Vec<String> {
        self.pairs.keys().cloned().collect()
    }

    /// Pair-scoped blocklist, if any entries exist for this pair.
    pub fn pair_blocks(&self, pair_id: &str) -> Option<&CompiledBlocklist> {
        self.pair_blocks.get(pair_id)
    }

    /// Resolved delivery credential by name.
    pub fn credential(&self, name: &str) -> Option<&SecretString> {
        self.credentials.get(name)
    }
}

/// Channel refs are `@username` or a (possibly negative) numeric chat id.
fn validate_channel_ref(channel: &str) -> RelayResult<()> {
    let ok = channel.strip_prefix('@').is_some_and(|rest| !rest.is_empty())
        || channel.strip_prefix('-').is_some_and(|rest| {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        })
        || (!channel.is_empty() && channel.chars().all(|c| c.is_ascii_digit()));
    if ok {
        Ok(())
    } else {
        Err(RelayError::ConfigValidation(format!(
            "channel must be @username or a chat id, got {channel:?}"
        )))
    }
}

/// Resolve `${ENV_VAR}` references in credential values.
fn resolve_secret(name: &str, value: &str) -> RelayResult<SecretString> {
    if let Some(var) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        match std::env::var(var) {
            Ok(resolved) => Ok(SecretString::from(resolved)),
            Err(_) => Err(RelayError::ConfigValidation(format!(
                "credential {name:?} references unset env var {var:?}"
            ))),
        }
    } else {
        Ok(SecretString::from(value.to_string()))
    }
}

/// Holds the raw config plus the published snapshot. All pipeline reads go
/// through [`ConfigStore::current`]; mutations re-validate and swap.
pub struct ConfigStore {
    raw: Mutex<RelayConfig>,
    snapshot: ArcSwap<ConfigSnapshot>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Build a store from an in-memory config.
    pub fn new(cfg: RelayConfig) -> RelayResult<Arc<Self>> {
        let snapshot = ConfigSnapshot::compile(&cfg)?;
        Ok(Arc::new(Self {
            raw: Mutex::new(cfg),
            snapshot: ArcSwap::from_pointee(snapshot),
            path: None,
        }))
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> RelayResult<Arc<Self>> {
        let cfg = read_config(path)?;
        let snapshot = ConfigSnapshot::compile(&cfg)?;
        Ok(Arc::new(Self {
            raw: Mutex::new(cfg),
            snapshot: ArcSwap::from_pointee(snapshot),
            path: Some(path.to_path_buf()),
        }))
    }

    /// Current published snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Re-read the config file. On any failure the previous snapshot
    /// stays active and the error is returned to the caller.
    pub fn reload(&self) -> RelayResult<()> {
        let path = self.path.as_ref().ok_or_else(|| {
            RelayError::ConfigValidation("no config file to reload from".into())
        })?;
        let cfg = read_config(path)?;
        let snapshot = ConfigSnapshot::compile(&cfg)?;
        *self.raw.lock().expect("config lock") = cfg;
        self.snapshot.store(Arc::new(snapshot));
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(())
    }

    /// Apply a mutation to the raw config, re-validate, and publish. A
    /// validation failure rolls the raw config back and leaves the
    /// published snapshot untouched.
    pub fn update<F>(&self, mutate: F) -> RelayResult<()>
    where
        F: FnOnce(&mut RelayConfig),
    {
        let mut raw = self.raw.lock().expect("config lock");
        let previous = raw.clone();
        mutate(&mut raw);
        match ConfigSnapshot::compile(&raw) {
            Ok(snapshot) => {
                self.snapshot.store(Arc::new(snapshot));
                Ok(())
            }
            Err(e) => {
                *raw = previous;
                Err(e)
            }
        }
    }

    /// Add a blocklist entry and publish a new snapshot.
    pub fn add_blocklist_entry(&self, entry: BlocklistEntry) -> RelayResult<()> {
        self.update(|cfg| cfg.blocklist.push(entry))
    }

    /// Remove blocklist entries matching scope and value. Returns whether
    /// anything was removed.
    pub fn remove_blocklist_entry(&self, scope: &str, value: &str) -> RelayResult<bool> {
        let mut removed = false;
        self.update(|cfg| {
            let before = cfg.blocklist.len();
            cfg.blocklist
                .retain(|e| !(e.scope == scope && e.value == value));
            removed = cfg.blocklist.len() != before;
        })?;
        Ok(removed)
    }
}

fn read_config(path: &Path) -> RelayResult<RelayConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| RelayError::ConfigValidation(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_config;

    #[test]
    fn test_compile_sample_config() {
        let store = ConfigStore::new(sample_config()).unwrap();
        let snap = store.current();

        let pair = snap.pair("p1").unwrap();
        assert_eq!(pair.source_channel, "@source");
        assert_eq!(pair.destinations, vec!["@dest".to_string()]);

        let resolved = snap.pair_for_source("alice", "@source").unwrap();
        assert_eq!(resolved.id, "p1");
        assert!(snap.pair_for_source("alice", "@unknown").is_none());
        assert!(snap.pair_for_source("bob", "@source").is_none());
    }

    #[test]
    fn test_unknown_credential_rejected() {
        let mut cfg = sample_config();
        cfg.pairs[0].credential = "nope".into();
        assert!(matches!(
            ConfigStore::new(cfg),
            Err(RelayError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_invalid_channel_ref_rejected() {
        let mut cfg = sample_config();
        cfg.pairs[0].source_channel = "no-at-sign".into();
        assert!(ConfigStore::new(cfg).is_err());
    }

    #[test]
    fn test_blocklist_scope_must_exist() {
        let mut cfg = sample_config();
        cfg.blocklist.push(BlocklistEntry {
            scope: "ghost-pair".into(),
            kind: BlockKind::TextPattern,
            value: "vip".into(),
            active: true,
        });
        assert!(ConfigStore::new(cfg).is_err());
    }

    #[test]
    fn test_inactive_entries_not_compiled() {
        let mut cfg = sample_config();
        cfg.blocklist.push(BlocklistEntry {
            scope: "global".into(),
            kind: BlockKind::TextPattern,
            value: "vip".into(),
            active: false,
        });
        let store = ConfigStore::new(cfg).unwrap();
        assert!(store.current().global_blocks.is_empty());
    }

    #[test]
    fn test_update_rolls_back_on_invalid() {
        let store = ConfigStore::new(sample_config()).unwrap();
        let before = store.current();

        let result = store.add_blocklist_entry(BlocklistEntry {
            scope: "missing".into(),
            kind: BlockKind::TextPattern,
            value: "x".into(),
            active: true,
        });
        assert!(result.is_err());

        // Published snapshot unchanged, and a subsequent valid update works.
        assert!(Arc::ptr_eq(&before, &store.current()));
        store
            .add_blocklist_entry(BlocklistEntry {
                scope: "global".into(),
                kind: BlockKind::TextPattern,
                value: "vip".into(),
                active: true,
            })
            .unwrap();
        assert_eq!(store.current().global_blocks.text.len(), 1);
    }

    #[test]
    fn test_remove_blocklist_entry() {
        let store = ConfigStore::new(sample_config()).unwrap();
        store
            .add_blocklist_entry(BlocklistEntry {
                scope: "global".into(),
                kind: BlockKind::TextPattern,
                value: "vip".into(),
                active: true,
            })
            .unwrap();
        assert!(store.remove_blocklist_entry("global", "vip").unwrap());
        assert!(!store.remove_blocklist_entry("global", "vip").unwrap());
        assert!(store.current().global_blocks.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_credential_resolution() {
        let mut cfg = sample_config();
        cfg.credentials
            .insert("main".into(), "${CHANRELAY_TEST_TOKEN}".into());

        std::env::set_var("CHANRELAY_TEST_TOKEN", "tok-from-env");
        let store = ConfigStore::new(cfg.clone()).unwrap();
        assert!(store.current().credential("main").is_some());

        std::env::remove_var("CHANRELAY_TEST_TOKEN");
        assert!(matches!(
            ConfigStore::new(cfg),
            Err(RelayError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_strict_regex_entries_fail_validation() {
        let mut cfg = sample_config();
        cfg.blocklist.push(BlocklistEntry {
            scope: "global".into(),
            kind: BlockKind::Regex,
            value: "[unclosed".into(),
            active: true,
        });
        assert!(ConfigStore::new(cfg).is_err());
    }

    #[test]
    fn test_strip_rule_regex_falls_back_to_substring() {
        let mut cfg = sample_config();
        cfg.pairs[0]
            .strip_rules
            .footer_patterns
            .push("[unclosed".into());
        let store = ConfigStore::new(cfg).unwrap();
        let pair = store.current().pair("p1").unwrap();
        assert!(matches!(pair.strip.footers[0], TextMatcher::Substring(_)));
    }

    #[test]
    fn test_matcher_semantics() {
        let re = TextMatcher::compile("shared by .*", false).unwrap();
        assert!(re.matches("Shared By @someone"));
        assert!(!re.matches("nothing here"));

        let sub = TextMatcher::Substring("vip entry".into());
        assert!(sub.matches("limited VIP Entry now"));
        assert!(sub.matches_start("VIP entry now"));
        assert!(!sub.matches_start("get the VIP entry"));
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            [limits]
            edit_threshold = 5

            [credentials]
            main = "tok-123"

            [[pairs]]
            id = "p1"
            owner = "alice"
            source_channel = "@src"
            destinations = ["@dst", "-1001234"]
            credential = "main"

            [pairs.strip_rules]
            remove_mentions = false
            footer_patterns = ["shared by .*"]

            [[blocklist]]
            kind = "text-pattern"
            value = "vip signal"

            [[sessions]]
            id = "s1"
            owner = "alice"
        "#;
        let cfg: RelayConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.limits.edit_threshold, 5);
        assert_eq!(cfg.limits.rate_per_minute, 20); // default preserved

        let snap = ConfigSnapshot::compile(&cfg).unwrap();
        let pair = snap.pair("p1").unwrap();
        assert!(!pair.strip.remove_mentions);
        assert_eq!(pair.destinations.len(), 2);
        assert_eq!(snap.global_blocks.text.len(), 1);
        assert_eq!(snap.sessions.len(), 1);
    }
}
