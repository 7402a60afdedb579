//! Core domain model and mapping resolution for jobfeed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobfeed-core";

/// Element name that delimits one listing when a feed does not override it.
pub const DEFAULT_RECORD_TAG: &str = "job";

/// Raw field names starting with this marker are source metadata, never data.
pub const RESERVED_FIELD_MARKER: char = '$';

/// Canonical name of the identity field.
pub const JOB_ID_FIELD: &str = "job_id";

/// The generic `id` guess. It sits in the candidate list because many feeds
/// use it, but nothing guarantees it is the publisher's listing identifier,
/// so hits on it are counted separately.
pub const GENERIC_ID_CANDIDATE: &str = "id";

/// Fallback job-id candidates, highest priority first.
pub const JOB_ID_CANDIDATES: [&str; 8] = [
    "job_id",
    "jobId",
    "jobid",
    GENERIC_ID_CANDIDATE,
    "external_id",
    "externalId",
    "url",
    "apply_url",
];

pub fn is_reserved_field(name: &str) -> bool {
    name.starts_with(RESERVED_FIELD_MARKER)
}

/// One `client_node -> internal_field` translation pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    #[serde(rename = "client_node", default)]
    pub source_field: String,
    #[serde(rename = "internal_field", default)]
    pub canonical_field: String,
}

impl MappingRule {
    pub fn new(source_field: impl Into<String>, canonical_field: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            canonical_field: canonical_field.into(),
        }
    }

    fn is_usable(&self) -> bool {
        let source = self.source_field.trim();
        !source.is_empty() && !self.canonical_field.trim().is_empty() && !is_reserved_field(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    None,
    /// Sniff the gzip magic bytes and decompress only when present.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Active,
    Inactive,
    Paused,
}

/// Client document as exposed by the configuration subsystem.
///
/// Legacy clients carry a single `feed_source_url` plus a client-level
/// `feed_node_mapping`; current clients carry a `feeds` list instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    #[serde(default)]
    pub internal_name: String,
    #[serde(default)]
    pub status: ClientStatus,
    #[serde(default)]
    pub feed_source_url: Option<String>,
    #[serde(default)]
    pub feed_node_mapping: Vec<MappingRule>,
    #[serde(default)]
    pub feeds: Vec<ClientFeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFeed {
    pub feed_source_url: String,
    #[serde(default)]
    pub feed_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub feed_node_mapping: Vec<MappingRule>,
    #[serde(default)]
    pub record_tag: Option<String>,
    #[serde(default)]
    pub compression: Compression,
}

fn default_true() -> bool {
    true
}

impl ClientRecord {
    pub fn is_active(&self) -> bool {
        self.status == ClientStatus::Active
    }

    /// Normalizes the legacy single-feed and the multi-feed shapes into one
    /// list. A non-empty `feeds` list wins over the legacy URL, and a URL is
    /// listed at most once per client.
    pub fn feed_configs(&self) -> Vec<FeedConfig> {
        let mut out: Vec<FeedConfig> = Vec::new();

        if !self.feeds.is_empty() {
            for feed in &self.feeds {
                let url = feed.feed_source_url.trim();
                if url.is_empty() || out.iter().any(|f| f.feed_url == url) {
                    continue;
                }
                out.push(FeedConfig {
                    client_id: self.client_id.clone(),
                    client_name: self.internal_name.clone(),
                    feed_name: feed.feed_name.clone(),
                    feed_url: url.to_string(),
                    mapping: feed.feed_node_mapping.clone(),
                    client_mapping: self.feed_node_mapping.clone(),
                    active: feed.is_active,
                    record_tag: feed
                        .record_tag
                        .as_deref()
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .unwrap_or(DEFAULT_RECORD_TAG)
                        .to_string(),
                    compression: feed.compression,
                });
            }
            return out;
        }

        if let Some(url) = self.feed_source_url.as_deref().map(str::trim) {
            if !url.is_empty() {
                out.push(FeedConfig {
                    client_id: self.client_id.clone(),
                    client_name: self.internal_name.clone(),
                    feed_name: None,
                    feed_url: url.to_string(),
                    mapping: Vec::new(),
                    client_mapping: self.feed_node_mapping.clone(),
                    active: true,
                    record_tag: DEFAULT_RECORD_TAG.to_string(),
                    compression: Compression::default(),
                });
            }
        }
        out
    }
}

/// Flattens every active feed of every active client.
pub fn enumerate_feeds(clients: &[ClientRecord]) -> Vec<FeedConfig> {
    clients
        .iter()
        .filter(|c| c.is_active())
        .flat_map(ClientRecord::feed_configs)
        .filter(|f| f.active)
        .collect()
}

/// One configured feed source, immutable for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedConfig {
    pub client_id: String,
    pub client_name: String,
    pub feed_name: Option<String>,
    pub feed_url: String,
    /// Feed-specific mapping.
    pub mapping: Vec<MappingRule>,
    /// Client-level legacy mapping, used only when `mapping` is empty.
    pub client_mapping: Vec<MappingRule>,
    pub active: bool,
    pub record_tag: String,
    pub compression: Compression,
}

impl FeedConfig {
    pub fn key(&self) -> FeedKey {
        FeedKey {
            client_id: self.client_id.clone(),
            feed_url: self.feed_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FeedKey {
    pub client_id: String,
    pub feed_url: String,
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.client_id, self.feed_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Feed,
    Client,
}

/// Ordered job-id candidates for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdRule {
    explicit: Option<String>,
    candidates: Vec<String>,
}

impl Default for JobIdRule {
    fn default() -> Self {
        Self::with_explicit(None)
    }
}

impl JobIdRule {
    pub fn with_explicit(explicit: Option<String>) -> Self {
        let mut candidates: Vec<String> = Vec::with_capacity(JOB_ID_CANDIDATES.len() + 1);
        if let Some(source) = &explicit {
            candidates.push(source.clone());
        }
        for name in JOB_ID_CANDIDATES {
            if !candidates.iter().any(|c| c == name) {
                candidates.push(name.to_string());
            }
        }
        Self {
            explicit,
            candidates,
        }
    }

    /// Source field explicitly mapped to `job_id`, if any.
    pub fn explicit(&self) -> Option<&str> {
        self.explicit.as_deref()
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }
}

/// Effective mapping for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub source: MappingSource,
    /// Field rules in configuration order, `job_id` rules excluded.
    pub rules: Vec<MappingRule>,
    pub job_id: JobIdRule,
}

/// Derives the effective mapping for a feed.
///
/// The feed-specific list is used exclusively when it has at least one usable
/// rule; otherwise the client-level list. Returns `None` when neither yields a
/// rule, which marks the feed as unmapped.
pub fn resolve_mapping(feed: &FeedConfig) -> Option<ResolvedMapping> {
    let (source, rules) = match usable_rules(&feed.mapping) {
        rules if !rules.is_empty() => (MappingSource::Feed, rules),
        _ => (MappingSource::Client, usable_rules(&feed.client_mapping)),
    };
    if rules.is_empty() {
        return None;
    }

    let mut explicit = None;
    let mut field_rules = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.canonical_field == JOB_ID_FIELD {
            explicit.get_or_insert(rule.source_field);
        } else {
            field_rules.push(rule);
        }
    }

    Some(ResolvedMapping {
        source,
        rules: field_rules,
        job_id: JobIdRule::with_explicit(explicit),
    })
}

fn usable_rules(rules: &[MappingRule]) -> Vec<MappingRule> {
    let mut out: Vec<MappingRule> = Vec::with_capacity(rules.len());
    for rule in rules.iter().filter(|r| r.is_usable()) {
        let rule = MappingRule::new(rule.source_field.trim(), rule.canonical_field.trim());
        if !out.contains(&rule) {
            out.push(rule);
        }
    }
    out
}

/// One record element as decoded from a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field unless the name is already present; the first value wins.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        match self.fields.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Like [`RawRecord::get`], but never returns reserved metadata fields.
    pub fn data_field(&self, name: &str) -> Option<&str> {
        if is_reserved_field(name) {
            return None;
        }
        self.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Normalized job row, identified by `(feed_id, job_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub feed_id: String,
    pub job_id: String,
    pub fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn key(&self) -> (&str, &str) {
        (&self.feed_id, &self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Per-feed result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionOutcome {
    pub client_id: String,
    pub feed_url: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub status: OutcomeStatus,
    /// Record elements encountered, including skipped ones.
    pub seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub id_fallbacks: u64,
    pub flushes: u64,
    pub error: Option<String>,
}

impl IngestionOutcome {
    pub fn new(key: &FeedKey, started_at: DateTime<Utc>) -> Self {
        Self {
            client_id: key.client_id.clone(),
            feed_url: key.feed_url.clone(),
            started_at,
            elapsed: Duration::ZERO,
            status: OutcomeStatus::Completed,
            seen: 0,
            inserted: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            id_fallbacks: 0,
            flushes: 0,
            error: None,
        }
    }

    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn mark_failed(&mut self, error: impl fmt::Display) {
        self.status = OutcomeStatus::Failed;
        self.error = Some(error.to_string());
    }
}
