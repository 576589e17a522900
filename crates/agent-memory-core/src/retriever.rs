//! Bundle assembly: pulls current state from every store, ranks semantic
//! hits, and packs the result into a token-budgeted `Bundle` a caller can
//! render straight into a prompt.
//!
//! Gathers candidates, scores them, and packs the result under a budget
//! across five sections: profile, task, summary, chunks, and events.

use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::{ManagerConfig, TokenBudgetConfig};
use crate::error::Result;
use crate::event_store::EventStore;
use crate::profile_store::ProfileStore;
use crate::ranking::rank;
use crate::schema::{now_ms, ChunkHit, ChunkSearchOptions, Event, ProfileItem, Summary, TaskState};
use crate::semantic_store::SemanticStore;
use crate::summary_store::SummaryStore;
use crate::task_store::TaskStore;

/// Caller-supplied fn mapping free text to an embedding, used for the vector
/// leg of semantic search. `Arc`-wrapped so `MemoryManager` and the
/// `Retriever` it owns can share one instance.
pub type EmbedFn = std::sync::Arc<dyn Fn(&str) -> Vec<f32> + Send + Sync>;

/// Estimates a token count for a string. Defaults to `ceil(chars / 4)`;
/// callers may install a tokenizer-accurate estimator via
/// `Retriever::set_token_estimator`.
pub type TokenEstimator = Box<dyn Fn(&str) -> u32 + Send + Sync>;

fn default_token_estimate(s: &str) -> u32 {
    ((s.chars().count() as f64) / 4.0).ceil() as u32
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub session_id: Option<String>,
    pub query: Option<String>,
    pub task_id: Option<Uuid>,
    /// Checked before the semantic-search sub-step; a cancellation there
    /// surfaces `Err(MemoryError::Cancelled)` instead of a partial `Bundle`.
    pub cancel: Option<CancellationToken>,
}

/// Describes a section that got trimmed (or dropped) to fit its token
/// budget.
#[derive(Debug, Clone)]
pub struct BundleWarning {
    pub kind: String,
    pub message: String,
}

impl BundleWarning {
    fn overflow(section: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: "overflow".to_string(),
            message: format!("{section}: {}", detail.into()),
        }
    }
}

/// The packed context handed back by `Retriever::retrieve`.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub profile: Vec<ProfileItem>,
    pub task_state: Option<TaskState>,
    pub recent_events: Vec<Event>,
    pub retrieved_chunks: Vec<ChunkHit>,
    pub summary: Option<Summary>,
    pub warnings: Vec<BundleWarning>,
    pub total_tokens: u32,
    pub timestamp: i64,
}

/// Assembles a `Bundle` from the other stores and renders it as a
/// deterministic Markdown block.
pub struct Retriever {
    events: EventStore,
    tasks: TaskStore,
    summaries: SummaryStore,
    profile: ProfileStore,
    semantic: SemanticStore,
    config: ManagerConfig,
    embed: Option<EmbedFn>,
    token_estimator: Option<TokenEstimator>,
}

impl Retriever {
    pub fn new(
        events: EventStore,
        tasks: TaskStore,
        summaries: SummaryStore,
        profile: ProfileStore,
        semantic: SemanticStore,
        config: ManagerConfig,
    ) -> Self {
        Self {
            events,
            tasks,
            summaries,
            profile,
            semantic,
            config,
            embed: None,
            token_estimator: None,
        }
    }

    pub fn set_embed_function(&mut self, embed: Option<EmbedFn>) {
        self.embed = embed;
    }

    pub fn set_token_estimator(&mut self, estimator: Option<TokenEstimator>) {
        self.token_estimator = estimator;
    }

    fn estimate(&self, text: &str) -> u32 {
        match &self.token_estimator {
            Some(f) => f(text),
            None => default_token_estimate(text),
        }
    }

    pub fn search_chunks(&self, query: &str, options: &ChunkSearchOptions, cancel: Option<&CancellationToken>) -> Result<Vec<ChunkHit>> {
        if self.config.retrieval.enable_vector && !options.disable_vector {
            if let Some(embed) = &self.embed {
                let query_embedding = embed(query);
                return self.semantic.search_hybrid(
                    query,
                    Some(&query_embedding),
                    options,
                    self.config.retrieval.fts_weight,
                    self.config.retrieval.vector_weight,
                    cancel,
                );
            }
        }
        self.semantic.search_fts(query, options)
    }

    /// Runs the seven-step retrieval algorithm: profile, current task,
    /// recent events, latest summary, optional ranked semantic search, then
    /// greedy token-budget packing.
    pub fn retrieve(&self, options: &RetrieveOptions) -> Result<Bundle> {
        let now = now_ms();
        let budget = &self.config.token_budget;
        let mut warnings = Vec::new();

        // 1. profile
        let profile = self.profile.get_all()?;

        // 2. current task
        let task_state = match options.task_id {
            Some(id) => self.tasks.get(id)?,
            None => self.tasks.get_current(options.session_id.as_deref())?,
        };

        // 3. recent events: N most recent within window W for this session
        let window_ms = self.config.retrieval.recent_events_window_ms;
        let max_recent = self.config.retrieval.max_recent_events;
        let candidate_events = self.events.get_recent(max_recent, options.session_id.as_deref())?;
        let window_start = now - window_ms;
        let mut recent_events: Vec<Event> = candidate_events
            .into_iter()
            .filter(|e| e.timestamp >= window_start)
            .collect();
        recent_events.sort_by_key(|e| e.timestamp);

        // 4. latest summary
        let summary = match &options.session_id {
            Some(session_id) => self.summaries.get_latest(session_id)?,
            None => None,
        };

        // 5. semantic search, handed to the ranking pipeline
        let retrieved_chunks = match &options.query {
            Some(query) if !query.trim().is_empty() && self.config.retrieval.enable_semantic => {
                let search_options = ChunkSearchOptions {
                    session_id: options.session_id.clone(),
                    limit: self.config.retrieval.max_chunks.max(20),
                    ..Default::default()
                };
                let hits = self.search_chunks(query, &search_options, options.cancel.as_ref())?;
                let use_embeddings = self.embed.is_some();
                let (ranked, _stats) = rank(
                    hits,
                    now,
                    self.config.write_policy.time_decay_half_life_days,
                    self.config.retrieval.min_score,
                    self.config.retrieval.max_chunks,
                    self.config.retrieval.mmr_lambda,
                    self.config.retrieval.mmr_duplicate_threshold,
                    use_embeddings,
                );
                ranked.into_iter().map(|s| s.hit).collect()
            }
            _ => Vec::new(),
        };

        // 6-7. pack under budget and compute total_tokens
        let mut bundle = Bundle {
            profile,
            task_state,
            recent_events,
            retrieved_chunks,
            summary,
            warnings: Vec::new(),
            total_tokens: 0,
            timestamp: now,
        };

        self.pack_within_budget(&mut bundle, budget, &mut warnings);
        bundle.warnings = warnings;
        bundle.total_tokens = self.total_tokens(&bundle);

        Ok(bundle)
    }

    fn total_tokens(&self, bundle: &Bundle) -> u32 {
        self.section_tokens_profile(&bundle.profile)
            + bundle.task_state.as_ref().map(|t| self.section_tokens_task(t)).unwrap_or(0)
            + self.section_tokens_events(&bundle.recent_events)
            + self.section_tokens_chunks(&bundle.retrieved_chunks)
            + bundle.summary.as_ref().map(|s| self.section_tokens_summary(s)).unwrap_or(0)
    }

    fn section_tokens_profile(&self, items: &[ProfileItem]) -> u32 {
        items.iter().map(|p| self.estimate(&format!("{}: {}", p.key, p.value))).sum()
    }

    fn section_tokens_task(&self, task: &TaskState) -> u32 {
        self.estimate(&task.goal)
            + task.plan.iter().map(|s| self.estimate(&s.description)).sum::<u32>()
            + task.next_action.as_deref().map(|a| self.estimate(a)).unwrap_or(0)
    }

    fn section_tokens_events(&self, events: &[Event]) -> u32 {
        events.iter().map(|e| self.estimate(&e.summary)).sum()
    }

    fn section_tokens_chunks(&self, chunks: &[ChunkHit]) -> u32 {
        chunks.iter().map(|c| self.estimate(&c.chunk.text)).sum()
    }

    fn section_tokens_summary(&self, summary: &Summary) -> u32 {
        self.estimate(&summary.short) + summary.bullets.iter().map(|b| self.estimate(b)).sum::<u32>()
    }

    /// Greedy per-section trim: within a section, drop lowest-priority items
    /// (end of list) until it fits its own budget; if the grand total still
    /// overflows, trim whole sections in reverse priority order
    /// (profile -> task -> summary -> chunks -> recent_events).
    fn pack_within_budget(&self, bundle: &mut Bundle, budget: &TokenBudgetConfig, warnings: &mut Vec<BundleWarning>) {
        while self.section_tokens_profile(&bundle.profile) > budget.profile && !bundle.profile.is_empty() {
            bundle.profile.pop();
            warnings.push(BundleWarning::overflow("profile", "dropped lowest-priority item to fit budget"));
        }

        if let Some(task) = &bundle.task_state {
            if self.section_tokens_task(task) > budget.task {
                let mut trimmed = task.clone();
                while self.section_tokens_task(&trimmed) > budget.task && !trimmed.plan.is_empty() {
                    trimmed.plan.pop();
                }
                if self.section_tokens_task(&trimmed) > budget.task {
                    trimmed.next_action = None;
                }
                warnings.push(BundleWarning::overflow("task", "trimmed plan steps to fit budget"));
                bundle.task_state = Some(trimmed);
            }
        }

        if let Some(summary) = &bundle.summary {
            if self.section_tokens_summary(summary) > budget.summary {
                let mut trimmed = summary.clone();
                while self.section_tokens_summary(&trimmed) > budget.summary && !trimmed.bullets.is_empty() {
                    trimmed.bullets.pop();
                }
                warnings.push(BundleWarning::overflow("summary", "dropped bullets to fit budget"));
                bundle.summary = Some(trimmed);
            }
        }

        while self.section_tokens_chunks(&bundle.retrieved_chunks) > budget.chunks && !bundle.retrieved_chunks.is_empty() {
            bundle.retrieved_chunks.pop();
            warnings.push(BundleWarning::overflow("chunks", "dropped lowest-ranked chunk to fit budget"));
        }

        while self.section_tokens_events(&bundle.recent_events) > budget.recent_events && !bundle.recent_events.is_empty() {
            // Oldest events are least relevant; trim from the front.
            bundle.recent_events.remove(0);
            warnings.push(BundleWarning::overflow("recent_events", "dropped oldest event to fit budget"));
        }

        // Reverse-priority trim if the grand total still overflows.
        let priority_order: [&str; 5] = ["recent_events", "chunks", "summary", "task", "profile"];
        for section in priority_order {
            if self.total_tokens(bundle) <= budget.total {
                break;
            }
            match section {
                "recent_events" => {
                    while self.total_tokens(bundle) > budget.total && !bundle.recent_events.is_empty() {
                        bundle.recent_events.remove(0);
                        warnings.push(BundleWarning::overflow("recent_events", "trimmed further to fit total budget"));
                    }
                }
                "chunks" => {
                    while self.total_tokens(bundle) > budget.total && !bundle.retrieved_chunks.is_empty() {
                        bundle.retrieved_chunks.pop();
                        warnings.push(BundleWarning::overflow("chunks", "trimmed further to fit total budget"));
                    }
                }
                "summary" => {
                    if self.total_tokens(bundle) > budget.total && bundle.summary.is_some() {
                        bundle.summary = None;
                        warnings.push(BundleWarning::overflow("summary", "dropped entirely to fit total budget"));
                    }
                }
                "task" => {
                    if self.total_tokens(bundle) > budget.total && bundle.task_state.is_some() {
                        bundle.task_state = None;
                        warnings.push(BundleWarning::overflow("task", "dropped entirely to fit total budget"));
                    }
                }
                "profile" => {
                    while self.total_tokens(bundle) > budget.total && !bundle.profile.is_empty() {
                        bundle.profile.pop();
                        warnings.push(BundleWarning::overflow("profile", "trimmed further to fit total budget"));
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    /// Renders a `Bundle` into the fixed Markdown template callers prepend
    /// to a system prompt. Section headers are pinned: `## User
    /// Preferences`, `## Current Task`, `## Recent Events`, `## Relevant
    /// Context`, `## Summary`, `## Warnings`.
    pub fn inject(&self, bundle: &Bundle) -> String {
        let mut out = String::new();

        out.push_str("## User Preferences\n");
        if bundle.profile.is_empty() {
            out.push_str("(none)\n");
        } else {
            for item in &bundle.profile {
                out.push_str(&format!("- {}: {}\n", item.key, item.value));
            }
        }
        out.push('\n');

        out.push_str("## Current Task\n");
        match &bundle.task_state {
            Some(task) => {
                out.push_str(&format!("- Goal: {}\n", task.goal));
                out.push_str(&format!("- Status: {}\n", task.status.as_str()));
                if !task.plan.is_empty() {
                    out.push_str("- Plan:\n");
                    for step in &task.plan {
                        let marker = if task.done.contains(&step.id) { "x" } else { " " };
                        out.push_str(&format!("  - [{marker}] {}\n", step.description));
                    }
                }
                if let Some(next) = &task.next_action {
                    out.push_str(&format!("- Next: {next}\n"));
                }
            }
            None => out.push_str("(none)\n"),
        }
        out.push('\n');

        out.push_str("## Recent Events\n");
        if bundle.recent_events.is_empty() {
            out.push_str("(none)\n");
        } else {
            for event in &bundle.recent_events {
                out.push_str(&format!("- [{}] {}\n", event.event_type.as_str(), event.summary));
            }
        }
        out.push('\n');

        out.push_str("## Relevant Context\n");
        if bundle.retrieved_chunks.is_empty() {
            out.push_str("(none)\n");
        } else {
            for hit in &bundle.retrieved_chunks {
                out.push_str(&format!("- {}\n", hit.chunk.text));
            }
        }
        out.push('\n');

        out.push_str("## Summary\n");
        match &bundle.summary {
            Some(summary) => {
                out.push_str(&format!("{}\n", summary.short));
                for bullet in &summary.bullets {
                    out.push_str(&format!("- {bullet}\n"));
                }
            }
            None => out.push_str("(none)\n"),
        }
        out.push('\n');

        out.push_str("## Warnings\n");
        if bundle.warnings.is_empty() {
            out.push_str("(none)\n");
        } else {
            for warning in &bundle.warnings {
                out.push_str(&format!("- [{}] {}\n", warning.kind, warning.message));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::db::Db;
    use crate::schema::{ChunkInput, EventInput, EventType, ProfileSetInput, SummaryInput, TaskCreateInput};

    fn retriever() -> Retriever {
        let db = Db::open_in_memory().unwrap();
        Retriever::new(
            EventStore::new(db.clone()),
            TaskStore::new(db.clone()),
            SummaryStore::new(db.clone()),
            ProfileStore::new(db.clone()),
            SemanticStore::new(db, ManagerConfig::default().vector),
            ManagerConfig::default(),
        )
    }

    #[test]
    fn retrieve_packs_every_section() {
        let r = retriever();
        r.profile
            .set(ProfileSetInput { key: "name".into(), value: serde_json::json!("Ada"), confidence: 1.0, source_event_id: None, explicit: true, expires_at: None })
            .unwrap();
        r.tasks
            .create(TaskCreateInput { goal: "ship it".into(), status: None, constraints: vec![], plan: vec![], session_id: Some("s1".into()), metadata: None })
            .unwrap();
        r.events
            .add(EventInput { event_type: Some(EventType::UserMsg), session_id: Some("s1".into()), summary: "hello".into(), ..Default::default() })
            .unwrap();
        r.summaries
            .add(SummaryInput { session_id: "s1".into(), short: "did stuff".into(), ..Default::default() })
            .unwrap();
        r.semantic
            .add(ChunkInput { text: "rust memory safety notes".into(), session_id: Some("s1".into()), ..Default::default() })
            .unwrap();

        let bundle = r
            .retrieve(&RetrieveOptions { session_id: Some("s1".into()), query: Some("rust memory".into()), task_id: None, cancel: None })
            .unwrap();

        assert_eq!(bundle.profile.len(), 1);
        assert!(bundle.task_state.is_some());
        assert_eq!(bundle.recent_events.len(), 1);
        assert!(bundle.summary.is_some());
        assert!(!bundle.retrieved_chunks.is_empty());
        assert!(bundle.total_tokens > 0);
    }

    #[test]
    fn inject_contains_pinned_headers() {
        let r = retriever();
        let bundle = r.retrieve(&RetrieveOptions::default()).unwrap();
        let rendered = r.inject(&bundle);
        for header in ["## User Preferences", "## Current Task", "## Recent Events", "## Relevant Context", "## Summary", "## Warnings"] {
            assert!(rendered.contains(header), "missing header {header}");
        }
    }

    #[test]
    fn empty_query_skips_semantic_search() {
        let r = retriever();
        r.semantic.add(ChunkInput { text: "irrelevant".into(), ..Default::default() }).unwrap();
        let bundle = r.retrieve(&RetrieveOptions { session_id: None, query: None, task_id: None, cancel: None }).unwrap();
        assert!(bundle.retrieved_chunks.is_empty());
    }

    #[test]
    fn overflowing_profile_is_trimmed_with_warning() {
        let r = retriever();
        for i in 0..50 {
            r.profile
                .set(ProfileSetInput { key: format!("k{i}"), value: serde_json::json!("x".repeat(100)), confidence: 1.0, source_event_id: None, explicit: true, expires_at: None })
                .unwrap();
        }
        let bundle = r.retrieve(&RetrieveOptions::default()).unwrap();
        assert!(bundle.warnings.iter().any(|w| w.message.starts_with("profile")));
    }
}
