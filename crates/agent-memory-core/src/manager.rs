//! `MemoryManager`: the single entry point hosting agents talk to. Owns the
//! database handle and the embedding cache, composes every store and
//! pipeline, and is the only place that knows how writes flow through the
//! write policy and reads flow through the retriever.
//!
//! One struct, one `open` constructor, everything else a thin delegating
//! method. `Debug` reports derived counts rather than dumping every field,
//! and observer callbacks are invoked fire-and-forget but logged on panic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::compaction::{CompactionController, CompactionOutcome, CompactionSnapshot, FlushCheck, HealthReport};
use crate::config::ManagerConfig;
use crate::db::Db;
use crate::embedding_cache::EmbeddingCache;
use crate::error::{MemoryError, Result};
use crate::event_store::EventStore;
use crate::profile_store::ProfileStore;
use crate::retriever::{Bundle, EmbedFn, RetrieveOptions, Retriever};
use crate::schema::{
    now_ms, ChunkHit, ChunkInput, ChunkSearchOptions, Event, EventInput, ProfileItem, ProfileSetInput, SemanticChunk, Summary,
    SummaryInput, TaskCreateInput, TaskState, TaskUpdate, TreeNode, TreeNodeInput, TreeRoot, TreeSearchResult, TreeSubtree, TreeType,
};
use crate::summary_store::SummaryStore;
use crate::task_store::TaskStore;
use crate::tree::TreeIndex;
use crate::write_policy::{Layer, WritePolicy};

/// Callback type for `on_event`. Receives the fully materialised `Event`
/// after it has been persisted.
pub type EventObserver = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by `on_event`; pass it to `MemoryManager::remove_observer`
/// to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// `force` flag accepted by `perform_flush`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    pub force: bool,
}

pub struct MemoryManager {
    events: EventStore,
    tasks: TaskStore,
    summaries: SummaryStore,
    profile: ProfileStore,
    semantic: crate::semantic_store::SemanticStore,
    tree: TreeIndex,
    compaction: CompactionController,
    write_policy: WritePolicy,
    retriever: Mutex<Retriever>,
    embedding_cache: Arc<Mutex<EmbeddingCache>>,
    embed: Mutex<Option<EmbedFn>>,
    config: ManagerConfig,
    session_id: Mutex<String>,
    observers: Mutex<Vec<(u64, EventObserver)>>,
    next_observer_id: AtomicU64,
    /// Per-session `(events_since_summary, tokens_since_summary)`, consulted
    /// by `write_policy.should_summarise` on every ingest.
    summary_counters: Mutex<HashMap<String, (u32, u32)>>,
}

impl MemoryManager {
    /// Opens (creating if absent) the SQLite store at `db_path` and a
    /// sibling `redb` embedding cache, and wires up every store, the write
    /// policy, the compaction controller, and the retriever per `config`.
    pub fn open(db_path: impl AsRef<Path>, config: ManagerConfig) -> Result<Self> {
        let db_path = db_path.as_ref();
        let db = Db::open(db_path)?;
        let cache_path = format!("{}.embeddings.redb", db_path.display());
        let embedding_cache = EmbeddingCache::open(&cache_path)?;

        let events = EventStore::new(db.clone());
        let tasks = TaskStore::new(db.clone());
        let summaries = SummaryStore::new(db.clone());
        let profile = ProfileStore::new(db.clone());
        let semantic = crate::semantic_store::SemanticStore::new(db.clone(), config.vector.clone());
        let semantic_for_retriever = crate::semantic_store::SemanticStore::new(db.clone(), config.vector.clone());
        let tree = TreeIndex::new(db.clone());
        let compaction = CompactionController::new(config.flush.clone());
        let write_policy = WritePolicy::new(config.write_policy.clone());
        let retriever = Retriever::new(
            events.clone(),
            tasks.clone(),
            summaries.clone(),
            profile.clone(),
            semantic_for_retriever,
            config.clone(),
        );

        debug!(db = %db_path.display(), cache = %cache_path, "memory manager opened");

        Ok(Self {
            events,
            tasks,
            summaries,
            profile,
            semantic,
            tree,
            compaction,
            write_policy,
            retriever: Mutex::new(retriever),
            embedding_cache: Arc::new(Mutex::new(embedding_cache)),
            embed: Mutex::new(None),
            config,
            session_id: Mutex::new(Uuid::new_v4().to_string()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            summary_counters: Mutex::new(HashMap::new()),
        })
    }

    /// Drops the manager, releasing the database handle and cache. Present
    /// for symmetry with `open`; `Drop` already releases both.
    pub fn close(self) {}

    // ── Ingestion ────────────────────────────────────────────────────────

    /// Persists `input` as a new `Event`, fans it out to observers, and
    /// consults the write policy for derived profile/semantic/summary
    /// writes. Observer and embedding-function failures are logged and do
    /// not fail the call; store-level failures propagate unchanged.
    pub fn record_event(&self, mut input: EventInput) -> Result<Event> {
        if input.session_id.is_none() {
            input.session_id = Some(self.get_session_id());
        }
        let event = self.events.add(input)?;

        self.compaction.record_event(default_token_estimate(&event.summary));
        self.notify_observers(&event);

        let decision = self.write_policy.decide_write(&event);
        if decision.should_write {
            for layer in &decision.target_layers {
                if let Err(err) = self.apply_write(*layer, &event) {
                    warn!(event_id = %event.id, layer = layer.as_str(), error = %err, "write-policy promotion failed");
                }
            }
        }

        if let Some(session_id) = &event.session_id {
            self.maybe_summarise(session_id, &event);
        }

        Ok(event)
    }

    fn apply_write(&self, layer: Layer, event: &Event) -> Result<()> {
        match layer {
            Layer::Semantic => {
                let embedding = self.compute_embedding(&event.summary);
                self.semantic.add(ChunkInput {
                    text: event.summary.clone(),
                    tags: event.tags.clone(),
                    source_event_id: Some(event.id),
                    source_type: Some(event.event_type.as_str().to_string()),
                    session_id: event.session_id.clone(),
                    embedding,
                    metadata: None,
                })?;
                Ok(())
            }
            Layer::Profile => {
                for pref in self.write_policy.extract_preferences(&event.summary) {
                    let key = pref.category.replace(' ', "_").replace(['\'', '.'], "");
                    if self.write_policy.validate_profile_key(&key).is_err() {
                        continue;
                    }
                    // "code_style" values of the shape `preferX` (e.g. from
                    // "always prefer TypeScript") are structured flags rather
                    // than plain strings, matching how a naming-convention
                    // style value (snake_case/camelCase/...) differs from a
                    // stated language preference.
                    let value = if key == "code_style" && pref.value.starts_with("prefer") {
                        let mut map = serde_json::Map::new();
                        map.insert(pref.value.clone(), serde_json::Value::Bool(true));
                        serde_json::Value::Object(map)
                    } else {
                        serde_json::Value::String(pref.value)
                    };
                    self.profile.set(ProfileSetInput {
                        key,
                        value,
                        confidence: pref.confidence,
                        source_event_id: Some(event.id),
                        explicit: false,
                        expires_at: None,
                    })?;
                }
                Ok(())
            }
            Layer::Summary => {
                // Summarisation itself is driven by `maybe_summarise`, which
                // consults dedicated event/token counters rather than
                // firing once per qualifying event.
                Ok(())
            }
        }
    }

    fn maybe_summarise(&self, session_id: &str, event: &Event) {
        let tokens = default_token_estimate(&event.summary);
        let (events_since, tokens_since) = {
            let mut counters = self.summary_counters.lock();
            let entry = counters.entry(session_id.to_string()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += tokens;
            *entry
        };

        let decision = self.write_policy.should_summarise(events_since, tokens_since);
        if !decision.should {
            return;
        }

        if let Err(err) = self.summarise_session(session_id) {
            warn!(session_id, error = %err, "auto-summarise failed");
            return;
        }
        self.summary_counters.lock().insert(session_id.to_string(), (0, 0));
    }

    fn summarise_session(&self, session_id: &str) -> Result<Summary> {
        let last_summary_ts = self.summaries.get_latest(session_id)?.map(|s| s.timestamp).unwrap_or(0);
        let events = self.events.query(crate::schema::EventQuery {
            session_id: Some(session_id.to_string()),
            since: Some(last_summary_ts),
            ..Default::default()
        })?;

        let (content, chunks) = self.compaction.extract_flush_content(&events, &self.write_policy);
        for chunk in chunks {
            self.semantic.add(chunk)?;
        }

        let short = content
            .summary
            .clone()
            .unwrap_or_else(|| format!("{} events summarised", events.len()));

        self.summaries.add(SummaryInput {
            session_id: session_id.to_string(),
            short,
            bullets: content.facts.clone(),
            decisions: content.decisions,
            todos: content.todos,
            covered_event_ids: events.iter().map(|e| e.id).collect(),
            token_count: Some(events.iter().map(|e| default_token_estimate(&e.summary)).sum()),
        })
    }

    pub fn create_task(&self, input: TaskCreateInput) -> Result<TaskState> {
        self.tasks.create(input)
    }

    pub fn update_task(&self, id: Uuid, update: TaskUpdate, action_id: Option<&str>) -> Result<TaskState> {
        self.tasks.update(id, update, action_id)
    }

    pub fn get_current_task(&self, session_id: Option<&str>) -> Result<Option<TaskState>> {
        self.tasks.get_current(session_id)
    }

    pub fn set_profile(&self, input: ProfileSetInput) -> Result<ProfileItem> {
        self.write_policy.validate_profile_key(&input.key)?;
        if let Some(existing) = self.profile.get(&input.key)? {
            let candidate = ProfileItem {
                key: input.key.clone(),
                value: input.value.clone(),
                updated_at: now_ms(),
                confidence: input.confidence,
                source_event_id: input.source_event_id,
                explicit: input.explicit,
                expires_at: input.expires_at,
            };
            let resolution = self.write_policy.resolve_conflict(existing, candidate);
            if resolution.needs_review {
                debug!(key = %input.key, "profile conflict flagged for manual review, old value kept");
                return Ok(resolution.winner);
            }
        }
        self.profile.set(input)
    }

    pub fn get_profile(&self, key: &str) -> Result<Option<ProfileItem>> {
        self.profile.get(key)
    }

    pub fn get_all_profiles(&self) -> Result<Vec<ProfileItem>> {
        self.profile.get_all()
    }

    pub fn add_chunk(&self, mut input: ChunkInput) -> Result<SemanticChunk> {
        if input.embedding.is_none() {
            input.embedding = self.compute_embedding(&input.text);
        }
        self.semantic.add(input)
    }

    /// Installs (or clears) the caller's embedding function. Every
    /// subsequent embedding computation is transparently cached by
    /// `(sha256(text), provider, model)`.
    pub fn set_embed_function(&self, f: Option<EmbedFn>) {
        *self.embed.lock() = f.clone();
        let wrapped = f.map(|raw| self.wrap_with_cache(raw));
        self.retriever.lock().set_embed_function(wrapped);
    }

    fn wrap_with_cache(&self, raw: EmbedFn) -> EmbedFn {
        let cache = self.embedding_cache.clone();
        let provider = self.config.vector.provider.clone();
        let model = self.config.vector.model.clone();
        Arc::new(move |text: &str| {
            if let Ok(Some(hit)) = cache.lock().get(text, &provider, &model) {
                return hit;
            }
            let vector = raw(text);
            if let Err(err) = cache.lock().put(text, &provider, &model, vector.clone()) {
                warn!(error = %err, "embedding cache write failed");
            }
            vector
        })
    }

    fn compute_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let embed = self.embed.lock().clone()?;
        Some(self.wrap_with_cache(embed)(text))
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    pub fn retrieve(&self, options: &RetrieveOptions) -> Result<Bundle> {
        self.retriever.lock().retrieve(options)
    }

    pub fn inject(&self, bundle: &Bundle) -> String {
        self.retriever.lock().inject(bundle)
    }

    pub fn search_chunks(&self, query: &str, options: &ChunkSearchOptions, cancel: Option<&CancellationToken>) -> Result<Vec<ChunkHit>> {
        self.retriever.lock().search_chunks(query, options, cancel)
    }

    // ── Tree ─────────────────────────────────────────────────────────────

    pub fn create_root(&self, tree_type: TreeType, name: &str, root_path: &str, metadata: Option<serde_json::Value>) -> Result<TreeRoot> {
        self.tree.create_root(tree_type, name, root_path, metadata)
    }

    pub fn create_node(&self, tree_root_id: Uuid, tree_type: TreeType, input: TreeNodeInput) -> Result<TreeNode> {
        self.tree.create_node(tree_root_id, tree_type, input)
    }

    pub fn create_nodes(&self, tree_root_id: Uuid, tree_type: TreeType, inputs: Vec<TreeNodeInput>) -> Result<Vec<TreeNode>> {
        inputs.into_iter().map(|input| self.tree.create_node(tree_root_id, tree_type, input)).collect()
    }

    pub fn get_node(&self, id: Uuid) -> Result<Option<TreeNode>> {
        self.tree.get_node(id)
    }

    pub fn get_node_by_path(&self, tree_root_id: Uuid, path: &str) -> Result<Option<TreeNode>> {
        self.tree.get_node_by_path(tree_root_id, path)
    }

    pub fn update_node(&self, id: Uuid, input: TreeNodeInput) -> Result<TreeNode> {
        self.tree.update_node(id, input)
    }

    pub fn delete_node(&self, id: Uuid) -> Result<usize> {
        self.tree.delete_subtree(id)
    }

    pub fn get_children(&self, node_id: Uuid) -> Result<Vec<TreeNode>> {
        self.tree.get_children(node_id)
    }

    pub fn get_ancestors(&self, node_id: Uuid) -> Result<Vec<TreeNode>> {
        self.tree.get_ancestors(node_id)
    }

    pub fn get_descendants(&self, node_id: Uuid, max_depth: Option<u32>) -> Result<Vec<TreeNode>> {
        self.tree.get_descendants(node_id, max_depth)
    }

    pub fn get_subtree(&self, node_id: Uuid) -> Result<Option<TreeSubtree>> {
        self.tree.get_subtree(node_id)
    }

    pub fn link_chunk(&self, node_id: Uuid, chunk_id: Uuid) -> Result<()> {
        self.tree.link_chunk(node_id, chunk_id)
    }

    pub fn search_in_subtree(
        &self,
        node_id: Uuid,
        query: &str,
        node_types: Option<&[String]>,
        attach_ancestors: bool,
        limit: usize,
    ) -> Result<Vec<TreeSearchResult>> {
        self.tree.search_in_subtree(node_id, query, &self.semantic, node_types, attach_ancestors, limit)
    }

    // ── Compaction ───────────────────────────────────────────────────────

    pub fn update_token_count(&self, tokens: u32) {
        self.compaction.set_current_tokens(tokens);
    }

    pub fn check_health(&self) -> HealthReport {
        self.compaction.health()
    }

    pub fn check_flush(&self) -> FlushCheck {
        self.compaction.check_flush(self.compaction.current_tokens(), self.compaction.events_since_flush())
    }

    pub fn should_compact(&self) -> bool {
        self.check_flush().should_flush
    }

    pub fn compact(&self, events: &[Event], estimated_tokens_freed: u32, force: bool, cancel: Option<&CancellationToken>) -> Result<CompactionOutcome> {
        let outcome = self.compaction.compact(events, &self.write_policy, estimated_tokens_freed, force, cancel)?;
        if outcome.success {
            for chunk in &outcome.chunks {
                self.semantic.add(chunk.clone())?;
            }
        }
        Ok(outcome)
    }

    pub fn perform_flush(&self, events: &[Event], options: FlushOptions) -> Result<CompactionOutcome> {
        let estimated = events.iter().map(|e| default_token_estimate(&e.summary)).sum();
        self.compact(events, estimated, options.force, None)
    }

    pub fn get_state(&self) -> CompactionSnapshot {
        self.compaction.get_state()
    }

    pub fn reset_state(&self) {
        self.compaction.reset_state();
    }

    // ── Observers ────────────────────────────────────────────────────────

    /// Registers a callback invoked with every persisted event. Returns an
    /// `ObserverId`; pass it to `remove_observer` to stop receiving events.
    pub fn on_event(&self, cb: impl Fn(&Event) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(cb)));
        ObserverId(id)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers.lock().retain(|(existing, _)| *existing != id.0);
    }

    fn notify_observers(&self, event: &Event) {
        let observers = self.observers.lock().clone();
        for (id, observer) in observers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(event)));
            if result.is_err() {
                warn!(observer_id = id, event_id = %event.id, "observer callback panicked");
            }
        }
    }

    // ── Session ──────────────────────────────────────────────────────────

    pub fn get_session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock() = id.into();
    }

    pub fn new_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.set_session_id(id.clone());
        id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

fn default_token_estimate(text: &str) -> u32 {
    crate::retriever::default_token_estimate(text)
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("session_id", &self.get_session_id())
            .field("observer_count", &self.observers.lock().len())
            .field("has_embed_fn", &self.embed.lock().is_some())
            .field("health", &self.check_health())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::compaction::HealthRecommendation;
    use crate::schema::{ChunkSearchOptions, EventType, PlanStep, TaskUpdate};

    fn manager() -> (tempfile::TempDir, MemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::open(dir.path().join("memory.sqlite3"), ManagerConfig::default()).unwrap();
        (dir, manager)
    }

    fn user_msg(summary: &str, session_id: &str) -> EventInput {
        EventInput {
            event_type: Some(EventType::UserMsg),
            session_id: Some(session_id.to_string()),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    /// Preference-bearing user messages get promoted to the profile, and
    /// `inject` renders both extracted keys.
    #[test]
    fn preference_messages_populate_profile_and_injection() -> Result<()> {
        let (_dir, mgr) = manager();
        mgr.set_session_id("s1");

        mgr.record_event(user_msg("from now on, use Chinese for replies", "s1"))?;
        mgr.record_event(user_msg("ok, got it", "s1"))?;
        mgr.record_event(user_msg("always prefer TypeScript over JavaScript", "s1"))?;

        let bundle = mgr.retrieve(&RetrieveOptions { session_id: Some("s1".into()), query: None, task_id: None, cancel: None })?;
        let keys: Vec<_> = bundle.profile.iter().map(|p| p.key.as_str()).collect();
        assert!(keys.contains(&"language"), "expected a language profile key, got {keys:?}");
        assert!(keys.contains(&"code_style"), "expected a code_style profile key, got {keys:?}");

        let language = bundle.profile.iter().find(|p| p.key == "language").unwrap();
        assert_eq!(language.value, serde_json::json!("Chinese"));

        let rendered = mgr.inject(&bundle);
        assert!(rendered.contains("language"));
        assert!(rendered.contains("code_style"));
        Ok(())
    }

    /// Once `current_tokens` crosses the soft threshold, `check_health` and
    /// `should_compact` agree, and `compact` clears the events-since-flush
    /// counter and reports a token reduction.
    #[test]
    fn compaction_triggers_past_soft_threshold() -> Result<()> {
        let mut config = ManagerConfig::default();
        config.flush.soft_threshold_tokens = 1000;
        config.flush.hard_threshold_tokens = 2000;
        config.flush.min_events_since_flush = 1;
        config.flush.max_context_tokens = 2000;
        config.flush.reserve_tokens = 0;
        let dir = tempfile::tempdir().unwrap();
        let mgr = MemoryManager::open(dir.path().join("memory.sqlite3"), config)?;
        mgr.set_session_id("s1");

        let mut events = Vec::new();
        for i in 0..10 {
            events.push(mgr.record_event(user_msg(&format!("event number {i}"), "s1"))?);
        }
        mgr.update_token_count(1500);

        assert_eq!(mgr.check_health().recommendation, HealthRecommendation::FlushSoon);
        assert!(mgr.should_compact());

        let tokens_before = mgr.get_state().current_tokens;
        let outcome = mgr.compact(&events, 500, false, None)?;
        assert!(outcome.success);
        assert!(outcome.tokens_reduced > 0);
        assert!(mgr.get_state().current_tokens < tokens_before);
        assert_eq!(mgr.get_state().events_since_flush, 0);
        Ok(())
    }

    /// `complete_step` is idempotent on a repeated `action_id`.
    #[test]
    fn complete_step_is_idempotent_on_action_id() -> Result<()> {
        let (_dir, mgr) = manager();
        let task = mgr.create_task(TaskCreateInput {
            goal: "ship the release".into(),
            status: None,
            constraints: vec![],
            plan: vec![
                PlanStep { id: "s1".into(), description: "write code".into(), status: crate::schema::TaskStatus::Pending, dependencies: Default::default(), result: None, action_id: None, blocked_by: None },
                PlanStep { id: "s2".into(), description: "write tests".into(), status: crate::schema::TaskStatus::Pending, dependencies: Default::default(), result: None, action_id: None, blocked_by: None },
            ],
            session_id: Some("s1".into()),
            metadata: None,
        })?;

        let mut current = task.clone();
        for _ in 0..3 {
            let outcome = crate::task_store::StateReducer::complete_step(&current, "s1", None, "A");
            current = mgr.update_task(
                task.id,
                TaskUpdate { plan: Some(outcome.plan), done: Some(outcome.done), blocked: Some(outcome.blocked), ..Default::default() },
                Some(&outcome.action_id),
            )?;
        }

        assert_eq!(current.done.len(), 1);
        assert_eq!(current.version, 2);
        Ok(())
    }

    /// A tag-scoped search over a small chunk set returns the clearly-best
    /// match first.
    #[test]
    fn tag_scoped_search_ranks_best_match_first() -> Result<()> {
        let (_dir, mgr) = manager();
        for (text, tag) in [
            ("React component model", "decision"),
            ("PostgreSQL ACID guarantees", "decision"),
            ("TypeScript type safety", "decision"),
        ] {
            mgr.add_chunk(ChunkInput {
                text: text.into(),
                tags: [tag.to_string()].into_iter().collect(),
                ..Default::default()
            })?;
        }

        let hits = mgr.search_chunks("React component", &ChunkSearchOptions { tags: Some(vec!["decision".into()]), limit: 5, ..Default::default() }, None)?;
        assert!(!hits.is_empty());
        assert!(hits[0].chunk.text.contains("React"));
        Ok(())
    }

    /// A long alternating event stream stays within both the retrieval's
    /// recent-events cap and the total token budget.
    #[test]
    fn large_event_stream_stays_within_budget() -> Result<()> {
        let mut config = ManagerConfig::default();
        config.token_budget.total = 3000;
        let dir = tempfile::tempdir().unwrap();
        let mgr = MemoryManager::open(dir.path().join("memory.sqlite3"), config)?;
        mgr.set_session_id("s1");

        let types = [EventType::UserMsg, EventType::ToolCall, EventType::ToolResult, EventType::AssistantMsg];
        for i in 0..200 {
            mgr.record_event(EventInput {
                event_type: Some(types[i % types.len()]),
                session_id: Some("s1".into()),
                summary: format!("event {i} of a long conversation about shipping a feature"),
                ..Default::default()
            })?;
        }

        let bundle = mgr.retrieve(&RetrieveOptions { session_id: Some("s1".into()), query: None, task_id: None, cancel: None })?;
        assert!(bundle.recent_events.len() <= mgr.config().retrieval.max_recent_events);
        assert!(bundle.total_tokens <= 3000);
        Ok(())
    }

    #[test]
    fn observer_receives_every_recorded_event() -> Result<()> {
        let (_dir, mgr) = manager();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = mgr.on_event(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        mgr.record_event(user_msg("first", "s1"))?;
        mgr.record_event(user_msg("second", "s1"))?;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        mgr.remove_observer(id);
        mgr.record_event(user_msg("third", "s1"))?;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn new_session_changes_session_id_and_tags_future_events() -> Result<()> {
        let (_dir, mgr) = manager();
        let first = mgr.get_session_id();
        let second = mgr.new_session();
        assert_ne!(first, second);

        let event = mgr.record_event(EventInput { event_type: Some(EventType::UserMsg), summary: "untagged".into(), ..Default::default() })?;
        assert_eq!(event.session_id.as_deref(), Some(second.as_str()));
        Ok(())
    }
}
