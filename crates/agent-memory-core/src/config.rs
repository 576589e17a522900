//! Configuration accepted at `MemoryManager` construction. One struct per
//! concern, each `serde`-derived with `#[serde(default)]` and an explicit
//! `Default` impl.

use serde::{Deserialize, Serialize};

/// Per-section and total token budget for a packed `Bundle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    pub profile: u32,
    pub task: u32,
    pub recent_events: u32,
    pub chunks: u32,
    pub summary: u32,
    pub total: u32,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            profile: 200,
            task: 300,
            recent_events: 500,
            chunks: 800,
            summary: 400,
            total: 2200,
        }
    }
}

/// Conflict-resolution strategy for `WritePolicy::resolve_conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Latest,
    Confidence,
    Explicit,
    Manual,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::Latest
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicyConfig {
    pub min_confidence: f32,
    pub auto_summarise: bool,
    pub summarise_every_n_events: u32,
    pub summarise_token_threshold: u32,
    /// When `Some`, only these profile keys may be written.
    pub profile_whitelist: Option<Vec<String>>,
    pub conflict_strategy: ConflictStrategy,
    /// Half-life, in days, used by the temporal-decay ranking stage.
    pub time_decay_half_life_days: f32,
    /// Age, in days, past which a profile item is considered stale for
    /// conflict-resolution purposes.
    pub stale_threshold_days: f32,
}

impl Default for WritePolicyConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            auto_summarise: true,
            summarise_every_n_events: 20,
            summarise_token_threshold: 4000,
            profile_whitelist: None,
            conflict_strategy: ConflictStrategy::Latest,
            time_decay_half_life_days: 30.0,
            stale_threshold_days: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_recent_events: usize,
    pub max_chunks: usize,
    /// Recency window, in milliseconds, for "recent events".
    pub recent_events_window_ms: i64,
    pub enable_semantic: bool,
    pub enable_fts: bool,
    pub enable_vector: bool,
    pub enable_rerank: bool,
    pub mmr_lambda: f32,
    pub mmr_duplicate_threshold: f32,
    pub min_score: f32,
    pub fts_weight: f32,
    pub vector_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_recent_events: 10,
            max_chunks: 5,
            recent_events_window_ms: 30 * 60 * 1000,
            enable_semantic: true,
            enable_fts: true,
            enable_vector: true,
            enable_rerank: true,
            mmr_lambda: 0.7,
            mmr_duplicate_threshold: 0.8,
            min_score: 0.0,
            fts_weight: 0.3,
            vector_weight: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub max_context_tokens: u32,
    pub reserve_tokens: u32,
    pub soft_threshold_tokens: u32,
    pub hard_threshold_tokens: u32,
    pub min_events_since_flush: u32,
    /// Event types considered by `extract_flush_content`, as their
    /// `EventType::as_str()` tags.
    pub event_types_to_analyse: Vec<String>,
    pub flush_tags: Vec<String>,
    pub include_summary: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 128_000,
            reserve_tokens: 4_000,
            soft_threshold_tokens: 4_000,
            hard_threshold_tokens: 8_000,
            min_events_since_flush: 5,
            event_types_to_analyse: vec![
                "decision".to_string(),
                "tool_result".to_string(),
                "user_msg".to_string(),
            ],
            flush_tags: vec!["auto-flush".to_string(), "compaction".to_string()],
            include_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub dimension: usize,
    pub provider: String,
    pub model: String,
    /// Above this many cached rows the exact-scan fallback refuses with
    /// `VectorDisabled` rather than silently doing an O(N) scan.
    pub max_exact_scan_rows: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            provider: "local".to_string(),
            model: "default".to_string(),
            max_exact_scan_rows: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub token_budget: TokenBudgetConfig,
    pub write_policy: WritePolicyConfig,
    pub retrieval: RetrievalConfig,
    pub flush: FlushConfig,
    pub vector: VectorConfig,
    pub debug: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            token_budget: TokenBudgetConfig::default(),
            write_policy: WritePolicyConfig::default(),
            retrieval: RetrievalConfig::default(),
            flush: FlushConfig::default(),
            vector: VectorConfig::default(),
            debug: false,
        }
    }
}
