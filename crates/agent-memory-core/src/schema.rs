//! Wire types for every layer of the store: events, task state, summaries,
//! profile items, semantic chunks, the embedding cache, and the tree index.
//!
//! IDs are 128-bit UUIDs rendered as text; timestamps are Unix milliseconds;
//! confidence and scores are real numbers in `[0, 1]`.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current Unix-millisecond timestamp.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Event ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMsg,
    AssistantMsg,
    ToolCall,
    ToolResult,
    Decision,
    StateChange,
    MemoryWrite,
    MemoryRead,
    Error,
    System,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMsg => "user_msg",
            Self::AssistantMsg => "assistant_msg",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Decision => "decision",
            Self::StateChange => "state_change",
            Self::MemoryWrite => "memory_write",
            Self::MemoryRead => "memory_read",
            Self::Error => "error",
            Self::System => "system",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "user_msg" => Self::UserMsg,
            "assistant_msg" => Self::AssistantMsg,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "decision" => Self::Decision,
            "state_change" => Self::StateChange,
            "memory_write" => Self::MemoryWrite,
            "memory_read" => Self::MemoryRead,
            "error" => Self::Error,
            "system" => Self::System,
            _ => return None,
        })
    }
}

/// An entity mentioned by an event (a person, file, tool, concept, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A link from an event to an external artefact (file, URL, commit, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLink {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One atomic thing that happened. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub entities: Vec<EventEntity>,
    #[serde(default)]
    pub links: Vec<EventLink>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Caller-supplied fields for `EventStore::add`. The server assigns `id` and
/// `timestamp`; everything else is taken as given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    pub event_type: Option<EventType>,
    pub session_id: Option<String>,
    pub intent: Option<String>,
    pub summary: String,
    pub entities: Vec<EventEntity>,
    pub links: Vec<EventLink>,
    pub payload: serde_json::Value,
    pub parent_id: Option<Uuid>,
    pub tags: BTreeSet<String>,
}

/// Maximum length of `Event::summary`, per the invariant "`summary` is
/// non-empty and ≤~240 chars".
pub const EVENT_SUMMARY_MAX_CHARS: usize = 240;

/// Filters accepted by `EventStore::query`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub session_id: Option<String>,
    pub types: Option<Vec<EventType>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ── TaskState ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub kind: ConstraintKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Idempotency key for `complete_step`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: Uuid,
    pub goal: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub done: BTreeSet<String>,
    #[serde(default)]
    pub blocked: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    pub updated_at: i64,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Partial fields accepted by `TaskStore::create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCreateInput {
    pub goal: String,
    pub status: Option<TaskStatus>,
    pub constraints: Vec<Constraint>,
    pub plan: Vec<PlanStep>,
    pub session_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Field-level merge patch accepted by `TaskStore::update`. `version`, when
/// present, gates the optimistic-concurrency check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub version: Option<i64>,
    pub goal: Option<String>,
    pub status: Option<TaskStatus>,
    pub constraints: Option<Vec<Constraint>>,
    pub plan: Option<Vec<PlanStep>>,
    pub done: Option<BTreeSet<String>>,
    pub blocked: Option<BTreeSet<String>>,
    pub next_action: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// An immutable historical copy of a task state, keyed by version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub version: i64,
    pub state: TaskState,
    pub recorded_at: i64,
}

// ── Summary ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: Uuid,
    pub timestamp: i64,
    pub session_id: String,
    pub short: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub todos: Vec<Todo>,
    #[serde(default)]
    pub covered_event_ids: BTreeSet<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryInput {
    pub session_id: String,
    pub short: String,
    pub bullets: Vec<String>,
    pub decisions: Vec<Decision>,
    pub todos: Vec<Todo>,
    pub covered_event_ids: BTreeSet<Uuid>,
    pub token_count: Option<u32>,
}

// ── ProfileItem ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileItem {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: i64,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<Uuid>,
    pub explicit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSetInput {
    pub key: String,
    pub value: serde_json::Value,
    pub confidence: f32,
    pub source_event_id: Option<Uuid>,
    pub explicit: bool,
    pub expires_at: Option<i64>,
}

// ── SemanticChunk ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticChunk {
    pub id: Uuid,
    pub timestamp: i64,
    pub text: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkInput {
    pub text: String,
    pub tags: BTreeSet<String>,
    pub source_event_id: Option<Uuid>,
    pub source_type: Option<String>,
    pub session_id: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<serde_json::Value>,
}

/// Provenance tag attached to a search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Fts,
    Vector,
    Hybrid,
    Path,
    Name,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub chunk: SemanticChunk,
    pub score: f32,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkSearchOptions {
    pub tags: Option<Vec<String>>,
    pub session_id: Option<String>,
    pub limit: usize,
    /// Disable the vector leg of a hybrid search even if a backend/embedding
    /// is available.
    pub disable_vector: bool,
}

// ── EmbeddingCacheEntry ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingCacheEntry {
    pub vector: Vec<f32>,
    pub created_at: i64,
}

// ── Tree ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeType {
    Code,
    Doc,
    Event,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeRoot {
    pub id: Uuid,
    pub tree_type: TreeType,
    pub name: String,
    pub root_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub tree_type: TreeType,
    pub tree_root_id: Uuid,
    pub node_type: String,
    pub name: String,
    pub path: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub sort_order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeNodeInput {
    pub node_type: String,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub sort_order: Option<i64>,
    pub chunk_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClosureEntry {
    pub ancestor_id: Uuid,
    pub descendant_id: Uuid,
    pub depth: u32,
}

/// In-memory nested view produced by `TreeIndex::get_subtree`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSubtree {
    pub node: TreeNode,
    pub children: Vec<TreeSubtree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSearchResult {
    pub node: TreeNode,
    pub score: f32,
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<SemanticChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestors: Option<Vec<TreeNode>>,
}

/// Dedupe a set of tags (spec invariant: "tags are a set, duplicates
/// collapsed").
pub fn dedupe_tags(tags: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    tags.into_iter().collect::<HashSet<_>>().into_iter().collect()
}
