//! Write-policy engine: decides which layers an event is promoted to,
//! resolves profile conflicts, and extracts durable preferences from raw
//! text.
//!
//! Layer targeting is a set of independent, additive rules whose outputs
//! are merged, rather than a single monolithic classifier.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{ConflictStrategy, WritePolicyConfig};
use crate::error::{MemoryError, Result};
use crate::schema::{Event, EventType, ProfileItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Profile,
    Semantic,
    Summary,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Semantic => "semantic",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteDecision {
    pub should_write: bool,
    pub target_layers: BTreeSet<Layer>,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub winner: ProfileItem,
    pub reason: String,
    pub needs_review: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractedPreference {
    pub category: String,
    pub value: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct SummariseDecision {
    pub should: bool,
    pub reason: String,
}

pub struct WritePolicy {
    config: WritePolicyConfig,
}

fn preference_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (Regex::new(r"(?i)\balways use\b").unwrap(), "always use"),
            (Regex::new(r"(?i)\bprefer[s]?\b").unwrap(), "prefer"),
            (Regex::new(r"(?i)\bdon'?t ever\b").unwrap(), "don't ever"),
            (Regex::new(r"(?i)\bfrom now on\b").unwrap(), "from now on"),
            (Regex::new(r"(?i)\bremember (that|to)\b").unwrap(), "remember that/to"),
            (Regex::new(r"(?i)\buse .*(format|style|language)\b").unwrap(), "use ... format/style/language"),
            (Regex::new(r"(?i)\bi (like|prefer|want|need)\b").unwrap(), "i like/prefer/want/need"),
        ]
    })
}

impl WritePolicy {
    pub fn new(config: WritePolicyConfig) -> Self {
        Self { config }
    }

    pub fn decide_write(&self, event: &Event) -> WriteDecision {
        let mut layers = BTreeSet::new();
        let mut confidence = 0.0f32;
        let mut reasons = Vec::new();

        match event.event_type {
            EventType::Decision => {
                layers.insert(Layer::Semantic);
                layers.insert(Layer::Summary);
                confidence = confidence.max(0.9);
                reasons.push("decision event");
            }
            EventType::StateChange => {
                layers.insert(Layer::Semantic);
                confidence = confidence.max(0.8);
                reasons.push("state_change event");
            }
            EventType::ToolResult => {
                let substantial = match &event.payload {
                    serde_json::Value::String(s) => s.len() > 200,
                    serde_json::Value::Null => false,
                    _ => true,
                };
                if substantial {
                    layers.insert(Layer::Semantic);
                    confidence = confidence.max(0.7);
                    reasons.push("substantial tool_result payload");
                }
            }
            EventType::UserMsg => {
                if matches_preference_pattern(&event.summary) {
                    layers.insert(Layer::Profile);
                    confidence = confidence.max(0.8);
                    reasons.push("preference-indicator phrase");
                }
            }
            _ => {}
        }

        let should_write = !layers.is_empty() && confidence >= self.config.min_confidence;
        WriteDecision {
            should_write,
            target_layers: layers,
            confidence,
            reason: if reasons.is_empty() {
                "no matching rule".to_string()
            } else {
                reasons.join("; ")
            },
        }
    }

    pub fn resolve_conflict(&self, old: ProfileItem, new: ProfileItem) -> ConflictResolution {
        match self.config.conflict_strategy {
            ConflictStrategy::Latest => ConflictResolution {
                winner: new,
                reason: "latest strategy: new value wins".into(),
                needs_review: false,
            },
            ConflictStrategy::Confidence => {
                if new.confidence >= old.confidence {
                    ConflictResolution { winner: new, reason: "new confidence >= old".into(), needs_review: false }
                } else {
                    ConflictResolution { winner: old, reason: "old confidence higher".into(), needs_review: false }
                }
            }
            ConflictStrategy::Explicit => {
                if new.explicit && !old.explicit {
                    ConflictResolution { winner: new, reason: "new value is explicit".into(), needs_review: false }
                } else if old.explicit && !new.explicit {
                    ConflictResolution { winner: old, reason: "old value is explicit".into(), needs_review: false }
                } else {
                    ConflictResolution { winner: new, reason: "both (or neither) explicit: latest wins".into(), needs_review: false }
                }
            }
            ConflictStrategy::Manual => ConflictResolution {
                winner: old,
                reason: "manual strategy: held pending review".into(),
                needs_review: true,
            },
        }
    }

    pub fn validate_profile_key(&self, key: &str) -> Result<()> {
        if let Some(whitelist) = &self.config.profile_whitelist {
            if !whitelist.iter().any(|k| k == key) {
                return Err(MemoryError::ProfileKeyNotAllowed(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn extract_preferences(&self, content: &str) -> Vec<ExtractedPreference> {
        let mut out = Vec::new();

        if let Some(language) = extract_one(
            content,
            r"(?i)\buse\s+(rust|python|typescript|javascript|go|java|c\+\+|chinese|english|spanish|french|german|japanese|korean)\b",
        ) {
            out.push(ExtractedPreference { category: "language".into(), value: language, confidence: 0.8 });
        }
        if let Some(lang) = extract_one(
            content,
            r"(?i)\balways prefer\s+(rust|python|typescript|javascript|go|java|c\+\+)\b",
        ) {
            out.push(ExtractedPreference { category: "code_style".into(), value: format!("prefer{lang}"), confidence: 0.8 });
        }
        if let Some(fmt) = extract_one(content, r"(?i)\b(json|yaml|markdown|plain text|xml)\s+format\b") {
            out.push(ExtractedPreference { category: "format".into(), value: fmt, confidence: 0.75 });
        }
        if let Some(style) = extract_one(content, r"(?i)\b(concise|verbose|terse|detailed)\b") {
            out.push(ExtractedPreference { category: "verbosity".into(), value: style, confidence: 0.6 });
        }
        if let Some(tone) = extract_one(content, r"(?i)\b(formal|casual|friendly|professional)\s+tone\b") {
            out.push(ExtractedPreference { category: "tone".into(), value: tone, confidence: 0.6 });
        }
        if let Some(code_style) = extract_one(content, r"(?i)\b(snake_case|camelCase|PascalCase|kebab-case)\b") {
            out.push(ExtractedPreference { category: "code_style".into(), value: code_style, confidence: 0.7 });
        }

        out
    }

    pub fn should_summarise(&self, event_count_since_last: u32, token_count_since_last: u32) -> SummariseDecision {
        if !self.config.auto_summarise {
            return SummariseDecision { should: false, reason: "auto_summarise disabled".into() };
        }
        if event_count_since_last >= self.config.summarise_every_n_events {
            return SummariseDecision { should: true, reason: "event count threshold reached".into() };
        }
        if token_count_since_last >= self.config.summarise_token_threshold {
            return SummariseDecision { should: true, reason: "token count threshold reached".into() };
        }
        SummariseDecision { should: false, reason: "below both thresholds".into() }
    }
}

fn matches_preference_pattern(text: &str) -> bool {
    preference_patterns().iter().any(|(re, _)| re.is_match(text))
}

fn extract_one(content: &str, pattern: &str) -> Option<String> {
    Regex::new(pattern).ok()?.captures(content).map(|c| {
        c.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| c.get(0).unwrap().as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::now_ms;
    use uuid::Uuid;

    fn policy() -> WritePolicy {
        WritePolicy::new(WritePolicyConfig::default())
    }

    fn event(event_type: EventType, summary: &str, payload: serde_json::Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            event_type,
            session_id: None,
            intent: None,
            summary: summary.into(),
            entities: Vec::new(),
            links: Vec::new(),
            payload,
            parent_id: None,
            tags: Default::default(),
        }
    }

    #[test]
    fn decision_events_target_semantic_and_summary() {
        let decision = policy().decide_write(&event(EventType::Decision, "chose SQLite", serde_json::Value::Null));
        assert!(decision.should_write);
        assert!(decision.target_layers.contains(&Layer::Semantic));
        assert!(decision.target_layers.contains(&Layer::Summary));
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn short_tool_result_string_is_not_written() {
        let decision = policy().decide_write(&event(EventType::ToolResult, "ok", serde_json::json!("short")));
        assert!(!decision.should_write);
    }

    #[test]
    fn long_tool_result_string_is_written() {
        let long = "x".repeat(201);
        let decision = policy().decide_write(&event(EventType::ToolResult, "ok", serde_json::json!(long)));
        assert!(decision.should_write);
        assert!(decision.target_layers.contains(&Layer::Semantic));
    }

    #[test]
    fn preference_phrase_targets_profile() {
        let decision = policy().decide_write(&event(EventType::UserMsg, "from now on use snake_case", serde_json::Value::Null));
        assert!(decision.target_layers.contains(&Layer::Profile));
        assert_eq!(decision.confidence, 0.8);
    }

    #[test]
    fn latest_strategy_always_prefers_new() {
        let old = ProfileItem { key: "k".into(), value: serde_json::json!(1), updated_at: 0, confidence: 0.9, source_event_id: None, explicit: true, expires_at: None };
        let new = ProfileItem { key: "k".into(), value: serde_json::json!(2), updated_at: 1, confidence: 0.1, source_event_id: None, explicit: false, expires_at: None };
        let resolution = policy().resolve_conflict(old, new.clone());
        assert_eq!(resolution.winner.value, new.value);
        assert!(!resolution.needs_review);
    }

    #[test]
    fn manual_strategy_holds_for_review() {
        let mut config = WritePolicyConfig::default();
        config.conflict_strategy = ConflictStrategy::Manual;
        let policy = WritePolicy::new(config);
        let old = ProfileItem { key: "k".into(), value: serde_json::json!(1), updated_at: 0, confidence: 0.5, source_event_id: None, explicit: false, expires_at: None };
        let new = ProfileItem { key: "k".into(), value: serde_json::json!(2), updated_at: 1, confidence: 0.9, source_event_id: None, explicit: true, expires_at: None };
        let resolution = policy.resolve_conflict(old.clone(), new);
        assert_eq!(resolution.winner.value, old.value);
        assert!(resolution.needs_review);
    }

    #[test]
    fn validate_profile_key_enforces_whitelist() {
        let mut config = WritePolicyConfig::default();
        config.profile_whitelist = Some(vec!["name".into()]);
        let policy = WritePolicy::new(config);
        assert!(policy.validate_profile_key("name").is_ok());
        assert!(matches!(policy.validate_profile_key("other"), Err(MemoryError::ProfileKeyNotAllowed(_))));
    }

    #[test]
    fn extract_preferences_finds_language_and_style() {
        let prefs = policy().extract_preferences("please use rust and snake_case naming, keep it concise");
        let categories: Vec<_> = prefs.iter().map(|p| p.category.as_str()).collect();
        assert!(categories.contains(&"language"));
        assert!(categories.contains(&"code_style"));
        assert!(categories.contains(&"verbosity"));
    }

    #[test]
    fn extract_preferences_finds_natural_language_and_always_prefer() {
        let prefs = policy().extract_preferences("use Chinese");
        assert!(prefs.iter().any(|p| p.category == "language" && p.value.eq_ignore_ascii_case("chinese")));

        let prefs = policy().extract_preferences("always prefer TypeScript");
        assert!(prefs.iter().any(|p| p.category == "code_style" && p.value == "preferTypeScript"));
    }

    #[test]
    fn should_summarise_triggers_on_event_count() {
        let decision = policy().should_summarise(20, 0);
        assert!(decision.should);
    }

    #[test]
    fn should_summarise_respects_disabled_flag() {
        let mut config = WritePolicyConfig::default();
        config.auto_summarise = false;
        let policy = WritePolicy::new(config);
        assert!(!policy.should_summarise(1000, 100_000).should);
    }
}
