//! Compaction and flush controller: tracks context-token pressure, decides
//! when to flush, and extracts durable content from events before they are
//! discarded.

use parking_lot::Mutex;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::cancel::{check_cancelled, CancellationToken};
use crate::config::FlushConfig;
use crate::error::Result;
use crate::schema::{now_ms, ChunkInput, Decision, Event, EventType, Todo};
use crate::write_policy::WritePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthRecommendation {
    None,
    FlushSoon,
    FlushNow,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub used_fraction: f32,
    pub recommendation: HealthRecommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Disabled,
    TooFewEvents,
    ThresholdNotReached,
    SoftThresholdExceeded,
    HardThresholdExceeded,
    ManualTrigger,
    SessionEnd,
    AlreadyInProgress,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::TooFewEvents => "too_few_events",
            Self::ThresholdNotReached => "threshold_not_reached",
            Self::SoftThresholdExceeded => "soft_threshold_exceeded",
            Self::HardThresholdExceeded => "hard_threshold_exceeded",
            Self::ManualTrigger => "manual_trigger",
            Self::SessionEnd => "session_end",
            Self::AlreadyInProgress => "already_in_progress",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushCheck {
    pub should_flush: bool,
    pub reason: FlushReason,
    pub urgency: f32,
}

#[derive(Debug, Clone, Default)]
pub struct FlushContent {
    pub decisions: Vec<Decision>,
    pub facts: Vec<String>,
    pub todos: Vec<Todo>,
    pub preferences: Vec<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompactionHistoryEntry {
    pub timestamp: i64,
    pub events_compacted: usize,
    pub chunks_written: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub chunks: Vec<ChunkInput>,
    pub tokens_reduced: u32,
}

#[derive(Debug, Clone, Default)]
struct CompactionState {
    current_tokens: u32,
    event_count: u64,
    events_since_flush: u32,
    last_flush_timestamp: Option<i64>,
    history: Vec<CompactionHistoryEntry>,
    compaction_in_progress: bool,
}

pub struct CompactionController {
    config: FlushConfig,
    state: Arc<Mutex<CompactionState>>,
    on_compaction: Option<Box<dyn Fn(&CompactionHistoryEntry) + Send + Sync>>,
}

impl CompactionController {
    pub fn new(config: FlushConfig) -> Self {
        Self { config, state: Arc::new(Mutex::new(CompactionState::default())), on_compaction: None }
    }

    pub fn with_callback(config: FlushConfig, on_compaction: Box<dyn Fn(&CompactionHistoryEntry) + Send + Sync>) -> Self {
        Self { config, state: Arc::new(Mutex::new(CompactionState::default())), on_compaction: Some(on_compaction) }
    }

    pub fn record_event(&self, tokens: u32) {
        let mut state = self.state.lock();
        state.event_count += 1;
        state.events_since_flush += 1;
        state.current_tokens += tokens;
    }

    /// Overwrites the tracked context-token count, for callers (the host
    /// application's own tokenizer) that know the absolute figure rather
    /// than a per-event delta.
    pub fn set_current_tokens(&self, tokens: u32) {
        self.state.lock().current_tokens = tokens;
    }

    pub fn current_tokens(&self) -> u32 {
        self.state.lock().current_tokens
    }

    pub fn events_since_flush(&self) -> u32 {
        self.state.lock().events_since_flush
    }

    pub fn health(&self) -> HealthReport {
        let state = self.state.lock();
        let available = self.config.max_context_tokens.saturating_sub(self.config.reserve_tokens).max(1);
        let used_fraction = state.current_tokens as f32 / available as f32;
        let recommendation = if used_fraction >= 0.95 {
            HealthRecommendation::Critical
        } else if used_fraction >= 0.80 {
            HealthRecommendation::FlushNow
        } else if used_fraction >= 0.60 {
            HealthRecommendation::FlushSoon
        } else {
            HealthRecommendation::None
        };
        HealthReport { used_fraction, recommendation }
    }

    pub fn check_flush(&self, current_tokens: u32, events_since_flush: u32) -> FlushCheck {
        if events_since_flush < self.config.min_events_since_flush {
            return FlushCheck { should_flush: false, reason: FlushReason::TooFewEvents, urgency: 0.0 };
        }

        if current_tokens >= self.config.hard_threshold_tokens {
            return FlushCheck { should_flush: true, reason: FlushReason::HardThresholdExceeded, urgency: 1.0 };
        }
        if current_tokens >= self.config.soft_threshold_tokens {
            let span = (self.config.hard_threshold_tokens - self.config.soft_threshold_tokens).max(1) as f32;
            let progress = (current_tokens - self.config.soft_threshold_tokens) as f32 / span;
            let urgency = 0.5 + 0.5 * progress.clamp(0.0, 1.0);
            return FlushCheck { should_flush: true, reason: FlushReason::SoftThresholdExceeded, urgency };
        }

        let urgency = 0.5 * (current_tokens as f32 / self.config.soft_threshold_tokens.max(1) as f32).clamp(0.0, 1.0);
        FlushCheck { should_flush: false, reason: FlushReason::ThresholdNotReached, urgency }
    }

    /// Rule-extract durable content from a batch of events, and turn each
    /// non-empty bucket into a tagged `SemanticChunk` input ready for the
    /// semantic store.
    pub fn extract_flush_content(&self, events: &[Event], write_policy: &WritePolicy) -> (FlushContent, Vec<ChunkInput>) {
        let relevant: Vec<&Event> = events
            .iter()
            .filter(|e| self.config.event_types_to_analyse.iter().any(|t| t == e.event_type.as_str()))
            .collect();

        let mut content = FlushContent::default();

        for event in &relevant {
            match event.event_type {
                EventType::Decision => content.decisions.push(Decision {
                    description: event.summary.clone(),
                    reasoning: event.intent.clone(),
                    timestamp: event.timestamp,
                    source_event_id: Some(event.id),
                }),
                EventType::ToolResult => {
                    let substantial = match &event.payload {
                        serde_json::Value::String(s) => s.len() > 200,
                        serde_json::Value::Null => false,
                        _ => true,
                    };
                    if substantial {
                        content.facts.push(event.summary.clone());
                    }
                }
                EventType::UserMsg => {
                    if let Some(todo) = extract_todo(&event.summary) {
                        content.todos.push(Todo { description: todo, priority: None, due_date: None, completed: false });
                    }
                    for pref in write_policy.extract_preferences(&event.summary) {
                        content.preferences.push(format!("{}: {}", pref.category, pref.value));
                    }
                }
                _ => {}
            }
        }

        let user_msgs: Vec<&str> = relevant
            .iter()
            .filter(|e| e.event_type == EventType::UserMsg)
            .map(|e| e.summary.as_str())
            .collect();
        let tool_names: Vec<&str> = relevant
            .iter()
            .filter(|e| e.event_type == EventType::ToolResult)
            .filter_map(|e| e.intent.as_deref())
            .collect();

        if self.config.include_summary && (!user_msgs.is_empty() || !content.decisions.is_empty() || !tool_names.is_empty()) {
            let mut parts = Vec::new();
            if !user_msgs.is_empty() {
                parts.push(format!("User asked about: {}", user_msgs.join("; ")));
            }
            if !content.decisions.is_empty() {
                parts.push(format!(
                    "Decisions made: {}",
                    content.decisions.iter().map(|d| d.description.as_str()).collect::<Vec<_>>().join("; ")
                ));
            }
            if !tool_names.is_empty() {
                parts.push(format!("Tools used: {}", tool_names.join(", ")));
            }
            content.summary = Some(parts.join(". "));
        }

        let mut chunks = Vec::new();
        let mut push_bucket = |bucket: &str, text: String| {
            if text.trim().is_empty() {
                return;
            }
            chunks.push(ChunkInput {
                text,
                tags: ["auto-flush".to_string(), "compaction".to_string(), bucket.to_string()].into_iter().collect(),
                source_type: Some("flush".into()),
                ..Default::default()
            });
        };

        if !content.decisions.is_empty() {
            push_bucket("decisions", content.decisions.iter().map(|d| d.description.clone()).collect::<Vec<_>>().join("\n"));
        }
        if !content.facts.is_empty() {
            push_bucket("facts", content.facts.join("\n"));
        }
        if !content.todos.is_empty() {
            push_bucket("todos", content.todos.iter().map(|t| t.description.clone()).collect::<Vec<_>>().join("\n"));
        }
        if let Some(summary) = &content.summary {
            push_bucket("summary", summary.clone());
        }

        (content, chunks)
    }

    /// Reentrancy-guarded compaction. `estimated_tokens_freed` is the
    /// caller's estimate of how many tokens the compacted events represented.
    /// A zero-length event list fails with `success:false` unless `force` is
    /// set — there is nothing to extract and nothing to free.
    ///
    /// `cancel`, if given, is checked after content extraction and before
    /// the state/history commit; a cancellation there leaves the previous
    /// state untouched and returns `Err(MemoryError::Cancelled)`.
    pub fn compact(&self, events: &[Event], write_policy: &WritePolicy, estimated_tokens_freed: u32, force: bool, cancel: Option<&CancellationToken>) -> Result<CompactionOutcome> {
        {
            let mut state = self.state.lock();
            if state.compaction_in_progress {
                return Ok(CompactionOutcome {
                    success: false,
                    reason: Some(FlushReason::AlreadyInProgress.as_str().to_string()),
                    chunks: Vec::new(),
                    tokens_reduced: 0,
                });
            }
            state.compaction_in_progress = true;
        }

        if events.is_empty() && !force {
            self.state.lock().compaction_in_progress = false;
            return Ok(CompactionOutcome {
                success: false,
                reason: Some(FlushReason::TooFewEvents.as_str().to_string()),
                chunks: Vec::new(),
                tokens_reduced: 0,
            });
        }

        let result = (|| -> Result<CompactionOutcome> {
            let (_, chunks) = self.extract_flush_content(events, write_policy);
            check_cancelled(cancel)?;
            let tokens_before = self.state.lock().current_tokens;
            let tokens_after = tokens_before.saturating_sub(estimated_tokens_freed);

            {
                let mut state = self.state.lock();
                state.current_tokens = tokens_after;
                state.events_since_flush = 0;
                state.last_flush_timestamp = Some(now_ms());

                let entry = CompactionHistoryEntry {
                    timestamp: now_ms(),
                    events_compacted: events.len(),
                    chunks_written: chunks.len(),
                    tokens_before,
                    tokens_after,
                };
                state.history.push(entry.clone());
                if state.history.len() > 10 {
                    state.history.remove(0);
                }

                if let Some(callback) = &self.on_compaction {
                    callback(&entry);
                }
            }

            Ok(CompactionOutcome {
                success: true,
                reason: None,
                chunks,
                tokens_reduced: tokens_before.saturating_sub(tokens_after),
            })
        })();

        self.state.lock().compaction_in_progress = false;
        result
    }

    pub fn reset_after_flush(&self) {
        let mut state = self.state.lock();
        state.events_since_flush = 0;
        state.last_flush_timestamp = Some(now_ms());
    }

    pub fn history(&self) -> Vec<CompactionHistoryEntry> {
        self.state.lock().history.clone()
    }

    pub fn is_compaction_in_progress(&self) -> bool {
        self.state.lock().compaction_in_progress
    }

    /// Snapshot of the controller's bookkeeping, for callers that want to
    /// inspect (or persist) compaction state directly.
    pub fn get_state(&self) -> CompactionSnapshot {
        let state = self.state.lock();
        CompactionSnapshot {
            current_tokens: state.current_tokens,
            event_count: state.event_count,
            events_since_flush: state.events_since_flush,
            last_flush_timestamp: state.last_flush_timestamp,
            compaction_in_progress: state.compaction_in_progress,
        }
    }

    /// Full reset: zeroes token/event counters and history. Distinct from
    /// `reset_after_flush`, which only clears the events-since-flush count.
    pub fn reset_state(&self) {
        let mut state = self.state.lock();
        *state = CompactionState::default();
    }
}

/// Public snapshot of the controller's internal counters, returned by
/// `get_state`.
#[derive(Debug, Clone, Default)]
pub struct CompactionSnapshot {
    pub current_tokens: u32,
    pub event_count: u64,
    pub events_since_flush: u32,
    pub last_flush_timestamp: Option<i64>,
    pub compaction_in_progress: bool,
}

fn todo_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(please|can you|could you)\b").unwrap(),
            Regex::new(r"(?i)\b(don'?t forget to|remember to)\b").unwrap(),
            Regex::new(r"(?i)\b(todo|task)\s*:").unwrap(),
        ]
    })
}

fn extract_todo(text: &str) -> Option<String> {
    if todo_patterns().iter().any(|re| re.is_match(text)) {
        Some(text.to_string())
    } else {
        None
    }
}

impl std::fmt::Debug for CompactionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionController").field("health", &self.health()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WritePolicyConfig;
    use crate::schema::now_ms as ts;
    use uuid::Uuid;

    fn controller() -> CompactionController {
        CompactionController::new(FlushConfig::default())
    }

    fn event(event_type: EventType, summary: &str, payload: serde_json::Value, intent: Option<&str>) -> Event {
        Event {
            id: Uuid::new_v4(),
            timestamp: ts(),
            event_type,
            session_id: None,
            intent: intent.map(String::from),
            summary: summary.into(),
            entities: Vec::new(),
            links: Vec::new(),
            payload,
            parent_id: None,
            tags: Default::default(),
        }
    }

    #[test]
    fn check_flush_rejects_too_few_events() {
        let check = controller().check_flush(10_000, 1);
        assert!(!check.should_flush);
        assert_eq!(check.reason, FlushReason::TooFewEvents);
    }

    #[test]
    fn check_flush_hard_threshold_is_max_urgency() {
        let check = controller().check_flush(9000, 10);
        assert!(check.should_flush);
        assert_eq!(check.reason, FlushReason::HardThresholdExceeded);
        assert_eq!(check.urgency, 1.0);
    }

    #[test]
    fn check_flush_soft_threshold_urgency_is_between_half_and_one() {
        let check = controller().check_flush(6000, 10);
        assert!(check.should_flush);
        assert_eq!(check.reason, FlushReason::SoftThresholdExceeded);
        assert!(check.urgency > 0.5 && check.urgency < 1.0);
    }

    #[test]
    fn extract_flush_content_buckets_decisions_and_todos() {
        let controller = controller();
        let policy = WritePolicy::new(WritePolicyConfig::default());
        let events = vec![
            event(EventType::Decision, "use SQLite", serde_json::Value::Null, None),
            event(EventType::UserMsg, "please remember to rotate the keys", serde_json::Value::Null, None),
        ];
        let (content, chunks) = controller.extract_flush_content(&events, &policy);
        assert_eq!(content.decisions.len(), 1);
        assert_eq!(content.todos.len(), 1);
        assert!(chunks.iter().any(|c| c.tags.contains("decisions")));
        assert!(chunks.iter().any(|c| c.tags.contains("todos")));
    }

    #[test]
    fn compact_is_single_flight() {
        let controller = Arc::new(controller());
        let policy = WritePolicy::new(WritePolicyConfig::default());
        controller.state.lock().compaction_in_progress = true;
        let outcome = controller.compact(&[], &policy, 100, true, None).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("already_in_progress"));
    }

    #[test]
    fn compact_resets_events_since_flush_and_records_history() {
        let controller = controller();
        let policy = WritePolicy::new(WritePolicyConfig::default());
        controller.record_event(500);
        let outcome = controller.compact(&[event(EventType::Decision, "d", serde_json::Value::Null, None)], &policy, 200, false, None).unwrap();
        assert!(outcome.success);
        assert_eq!(controller.state.lock().events_since_flush, 0);
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn compact_rejects_empty_events_unless_forced() {
        let controller = controller();
        let policy = WritePolicy::new(WritePolicyConfig::default());
        let outcome = controller.compact(&[], &policy, 0, false, None).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("too_few_events"));
        assert!(!controller.is_compaction_in_progress());

        let forced = controller.compact(&[], &policy, 0, true, None).unwrap();
        assert!(forced.success);
    }

    #[test]
    fn compact_honours_cancellation_and_clears_in_progress_flag() {
        let controller = controller();
        let policy = WritePolicy::new(WritePolicyConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = controller
            .compact(&[event(EventType::Decision, "d", serde_json::Value::Null, None)], &policy, 200, false, Some(&token))
            .unwrap_err();
        assert!(matches!(err, crate::error::MemoryError::Cancelled));
        assert!(!controller.is_compaction_in_progress());
        assert!(controller.history().is_empty());
    }
}
