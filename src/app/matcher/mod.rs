pub mod audit;
pub mod logcat;
pub mod stack;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::config::MatcherSettings;
use crate::app::error::AppError;
use crate::app::models::{EventExpectation, LogEvent, MatchKind, OutputPayload, PatternMatch};
use crate::app::supervisor::pipeline::LineObserver;

use self::audit::EventAudit;
use self::logcat::parse_logcat_line;
use self::stack::{pattern_id_for, StackCollector};

/// Serialized form of a line pattern, as stored in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternSpec {
    Keyword {
        id: String,
        keyword: String,
        #[serde(default)]
        exact_match: bool,
    },
    /// Dotted path into a JSON object embedded in the log message.
    Field { id: String, path: String, value: String },
    Regex { id: String, pattern: String },
}

#[derive(Debug, Clone)]
enum Rule {
    Keyword { keyword: String, exact_match: bool },
    Field { path: Vec<String>, value: String },
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: String,
    rule: Rule,
}

impl Pattern {
    pub fn compile(spec: &PatternSpec, trace_id: &str) -> Result<Self, AppError> {
        let pattern = match spec {
            PatternSpec::Keyword {
                id,
                keyword,
                exact_match,
            } => Pattern::keyword(id, keyword, *exact_match),
            PatternSpec::Field { id, path, value } => {
                let path: Vec<String> = path
                    .split('.')
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string)
                    .collect();
                Pattern {
                    id: id.clone(),
                    rule: Rule::Field {
                        path,
                        value: value.clone(),
                    },
                }
            }
            PatternSpec::Regex { id, pattern } => {
                let regex = Regex::new(pattern).map_err(|err| {
                    AppError::validation(format!("Invalid pattern {id}: {err}"), trace_id)
                })?;
                Pattern {
                    id: id.clone(),
                    rule: Rule::Regex(regex),
                }
            }
        };
        if pattern.id.trim().is_empty() {
            return Err(AppError::validation("Pattern id is required", trace_id));
        }
        Ok(pattern)
    }

    pub fn keyword(id: &str, keyword: &str, exact_match: bool) -> Self {
        Pattern {
            id: id.to_string(),
            rule: Rule::Keyword {
                keyword: keyword.to_string(),
                exact_match,
            },
        }
    }

    pub fn from_expectation(expectation: &EventExpectation) -> Self {
        Pattern::keyword(
            &format!("event:{}", expectation.keyword),
            &expectation.keyword,
            expectation.exact_match,
        )
    }

    pub fn matches(&self, message: &str, embedded: Option<&Value>, event_field: &str) -> bool {
        match &self.rule {
            Rule::Keyword {
                keyword,
                exact_match: false,
            } => message.contains(keyword.as_str()),
            Rule::Keyword {
                keyword,
                exact_match: true,
            } => {
                let event_name = embedded
                    .and_then(|value| value.get(event_field))
                    .map(value_as_text);
                event_name.as_deref() == Some(keyword.as_str()) || message.trim() == keyword
            }
            Rule::Field { path, value } => embedded
                .and_then(|root| lookup_path(root, path))
                .map(|found| value_as_text(found) == *value)
                .unwrap_or(false),
            Rule::Regex(regex) => regex.is_match(message),
        }
    }
}

/// Parses the outermost `{...}` span of a message as a JSON object.
pub fn extract_embedded_json(message: &str) -> Option<Value> {
    let start = message.find('{')?;
    let end = message.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&message[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn lookup_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Per-stream matcher: configured patterns, event expectations with their
/// audit, and the crash stack collector.
pub struct LogMatcher {
    event_field: String,
    patterns: Vec<Pattern>,
    expectations: Vec<Pattern>,
    audit: Arc<Mutex<EventAudit>>,
    stack: StackCollector,
}

impl LogMatcher {
    pub fn new(
        settings: &MatcherSettings,
        expectations: &[EventExpectation],
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let patterns = settings
            .patterns
            .iter()
            .map(|spec| Pattern::compile(spec, trace_id))
            .collect::<Result<Vec<_>, _>>()?;
        let expectations: Vec<EventExpectation> = expectations
            .iter()
            .filter(|expectation| !expectation.keyword.trim().is_empty())
            .cloned()
            .collect();
        Ok(Self {
            event_field: settings.event_field.clone(),
            patterns,
            expectations: expectations.iter().map(Pattern::from_expectation).collect(),
            audit: Arc::new(Mutex::new(EventAudit::new(&expectations))),
            stack: StackCollector::new(settings.max_block_lines, settings.quiet_period_ms),
        })
    }

    /// Shared view of the audit, readable while the stream is running.
    pub fn audit_handle(&self) -> Arc<Mutex<EventAudit>> {
        Arc::clone(&self.audit)
    }

    /// Returns the id of the first pattern that matched the line (for
    /// tagging) and every match the line produced.
    pub fn push_line(&mut self, line: &str, now: DateTime<Utc>) -> (Option<String>, Vec<PatternMatch>) {
        let parsed = parse_logcat_line(line);
        let mut matches = self.stack.push(line, &parsed, now);
        let mut tag = stack::header_kind(parsed.message).map(|kind| pattern_id_for(kind).to_string());

        let embedded = extract_embedded_json(parsed.message);
        let event_match = |pattern: &Pattern| PatternMatch {
            pattern_id: pattern.id.clone(),
            kind: MatchKind::Event,
            line: line.to_string(),
            block: Vec::new(),
            timestamp: now,
        };

        for pattern in &self.patterns {
            if pattern.matches(parsed.message, embedded.as_ref(), &self.event_field) {
                tag.get_or_insert_with(|| pattern.id.clone());
                matches.push(event_match(pattern));
            }
        }

        let mut audit = match self.audit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (index, pattern) in self.expectations.iter().enumerate() {
            if pattern.matches(parsed.message, embedded.as_ref(), &self.event_field) {
                audit.record(index, now);
                tag.get_or_insert_with(|| pattern.id.clone());
                matches.push(event_match(pattern));
            }
        }

        (tag, matches)
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<PatternMatch> {
        self.stack.tick(now)
    }

    pub fn finish(&mut self) -> Option<PatternMatch> {
        self.stack.finish()
    }
}

impl LineObserver for LogMatcher {
    fn on_line(&mut self, event: &mut LogEvent) -> Vec<OutputPayload> {
        let (tag, matches) = self.push_line(&event.line, event.timestamp);
        if event.tag.is_none() {
            event.tag = tag;
        }
        matches.into_iter().map(OutputPayload::Match).collect()
    }

    fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<OutputPayload> {
        self.tick(now).map(OutputPayload::Match).into_iter().collect()
    }

    fn on_finish(&mut self) -> Vec<OutputPayload> {
        self.finish().map(OutputPayload::Match).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expectation(keyword: &str, exact_match: bool) -> EventExpectation {
        EventExpectation {
            id: None,
            keyword: keyword.to_string(),
            description: None,
            exact_match,
            created_at: None,
        }
    }

    #[test]
    fn exact_keyword_matches_embedded_event_name() {
        let pattern = Pattern::keyword("open", "app_open", true);
        let message = r#"Tracker: {"event":"app_open","props":{"screen":"home"}}"#;
        let embedded = extract_embedded_json(message);
        assert!(pattern.matches(message, embedded.as_ref(), "event"));

        let other = r#"Tracker: {"event":"app_open_later"}"#;
        let embedded = extract_embedded_json(other);
        assert!(!pattern.matches(other, embedded.as_ref(), "event"));
        assert!(pattern.matches("  app_open ", None, "event"));
    }

    #[test]
    fn substring_keyword_and_regex_rules() {
        assert!(Pattern::keyword("k", "timeout", false).matches("socket timeout after 3s", None, "event"));
        let regex = Pattern::compile(
            &PatternSpec::Regex {
                id: "gc".to_string(),
                pattern: r"GC freed \d+".to_string(),
            },
            "trace-m1",
        )
        .expect("regex");
        assert!(regex.matches("Background concurrent GC freed 1234(56KB)", None, "event"));
    }

    #[test]
    fn field_rule_follows_dotted_path() {
        let pattern = Pattern::compile(
            &PatternSpec::Field {
                id: "home".to_string(),
                path: "props.screen".to_string(),
                value: "home".to_string(),
            },
            "trace-m2",
        )
        .expect("field");
        let message = r#"{"event":"view","props":{"screen":"home","n":[1,2]}}"#;
        assert!(pattern.matches(message, extract_embedded_json(message).as_ref(), "event"));
        assert!(!pattern.matches("no json here", None, "event"));
    }

    #[test]
    fn invalid_regex_is_a_validation_error() {
        let err = Pattern::compile(
            &PatternSpec::Regex {
                id: "bad".to_string(),
                pattern: "(".to_string(),
            },
            "trace-m3",
        )
        .expect_err("invalid");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn matcher_tags_lines_and_feeds_the_audit() {
        let settings = MatcherSettings::default();
        let mut matcher = LogMatcher::new(
            &settings,
            &[expectation("app_open", true), expectation("  ", true), expectation("checkout", false)],
            "trace-m4",
        )
        .expect("matcher");
        let now = Utc::now();
        let line = r#"08-24 14:22:33.123  1234  5678 I Analytics: {"event":"app_open"}"#;
        let (tag, matches) = matcher.push_line(line, now);
        assert_eq!(tag.as_deref(), Some("event:app_open"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, MatchKind::Event);

        let report = matcher.audit_handle().lock().expect("audit").report("s-1");
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].seen_count, 1);
        assert_eq!(report.missing, vec!["checkout".to_string()]);
    }

    #[test]
    fn crash_header_tags_the_line_and_block_arrives_on_finish() {
        let mut matcher = LogMatcher::new(&MatcherSettings::default(), &[], "trace-m5").expect("matcher");
        let now = Utc::now();
        let (tag, matches) = matcher.push_line(
            "08-24 14:22:33.100  4321  4321 E AndroidRuntime: FATAL EXCEPTION: main",
            now,
        );
        assert_eq!(tag.as_deref(), Some("crash"));
        assert!(matches.is_empty());
        let block = matcher.finish().expect("block");
        assert_eq!(block.kind, MatchKind::Crash);
    }
}
