//! Layered episodic/task/profile/semantic memory store with hybrid
//! retrieval, write-policy-driven promotion, compaction/flush, and a
//! closure-table tree index.
//!
//! [`MemoryManager`] is the single entry point: it owns the database handle
//! and the embedding cache, and composes every store and pipeline below it.

pub mod cancel;
pub mod compaction;
pub mod config;
pub mod db;
pub mod embedding_cache;
pub mod error;
pub mod event_store;
pub mod manager;
pub mod profile_store;
pub mod ranking;
pub mod retriever;
pub mod schema;
pub mod semantic_store;
pub mod summary_store;
pub mod task_store;
pub mod tree;
pub mod write_policy;

pub use cancel::CancellationToken;
pub use config::ManagerConfig;
pub use error::{MemoryError, Result};
pub use manager::{EventObserver, FlushOptions, MemoryManager, ObserverId};
pub use retriever::{Bundle, BundleWarning, EmbedFn, RetrieveOptions};
pub use schema::{
    ChunkHit, ChunkInput, ChunkSearchOptions, Constraint, ConstraintKind, Decision, Event,
    EventEntity, EventInput, EventLink, EventQuery, EventType, MatchType, PlanStep, Priority,
    ProfileItem, ProfileSetInput, SemanticChunk, Summary, SummaryInput, TaskCreateInput,
    TaskSnapshot, TaskState, TaskStatus, TaskUpdate, TreeNode, TreeNodeInput, TreeRoot,
    TreeSearchResult, TreeSubtree, TreeType,
};
pub use task_store::StateReducer;
pub use write_policy::{ConflictResolution, Layer, WriteDecision, WritePolicy};
