use chrono::{DateTime, Duration, Utc};

use crate::app::matcher::logcat::LogcatLine;
use crate::app::models::{MatchKind, PatternMatch};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    kind: MatchKind,
    header: String,
    tag: Option<String>,
    lines: Vec<String>,
    started_at: DateTime<Utc>,
    last_line_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CollectorState {
    Idle,
    Collecting(Block),
    Emitted,
}

pub fn pattern_id_for(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Event => "event",
        MatchKind::Crash => "crash",
        MatchKind::Anr => "anr",
        MatchKind::NativeCrash => "native_crash",
    }
}

/// Recognises the first line of a crash, ANR or native crash report.
pub fn header_kind(message: &str) -> Option<MatchKind> {
    let message = message.trim_start();
    if message.starts_with("FATAL EXCEPTION") {
        Some(MatchKind::Crash)
    } else if message.starts_with("ANR in") {
        Some(MatchKind::Anr)
    } else if message.starts_with("*** *** ***") {
        Some(MatchKind::NativeCrash)
    } else {
        None
    }
}

/// Aggregates multi-line crash reports into single matches.
///
/// A block opens on a header line and closes on the first of: a blank
/// message, the next header, a line from another tag, `max_lines`, or
/// `quiet_period` without new lines (checked by `tick`).
#[derive(Debug)]
pub struct StackCollector {
    state: CollectorState,
    max_lines: usize,
    quiet_period: Duration,
}

impl StackCollector {
    pub fn new(max_lines: usize, quiet_period_ms: u64) -> Self {
        Self {
            state: CollectorState::Idle,
            max_lines: max_lines.max(1),
            quiet_period: Duration::milliseconds(quiet_period_ms.min(i64::MAX as u64) as i64),
        }
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, CollectorState::Collecting(_))
    }

    pub fn push(&mut self, raw: &str, parsed: &LogcatLine<'_>, now: DateTime<Utc>) -> Vec<PatternMatch> {
        let mut emitted = Vec::new();
        let header = header_kind(parsed.message);

        if let CollectorState::Collecting(block) = &mut self.state {
            let tag_changed = match (&block.tag, parsed.tag) {
                (Some(current), Some(next)) => current != next,
                _ => false,
            };
            if header.is_some() || tag_changed {
                emitted.extend(self.emit());
            } else if parsed.message.trim().is_empty() {
                emitted.extend(self.emit());
                return emitted;
            } else {
                block.lines.push(raw.to_string());
                block.last_line_at = now;
                if block.lines.len() >= self.max_lines {
                    emitted.extend(self.emit());
                }
                return emitted;
            }
        }

        match header {
            Some(kind) => {
                self.state = CollectorState::Collecting(Block {
                    kind,
                    header: raw.to_string(),
                    tag: parsed.tag.map(str::to_string),
                    lines: vec![raw.to_string()],
                    started_at: now,
                    last_line_at: now,
                });
                if self.max_lines == 1 {
                    emitted.extend(self.emit());
                }
            }
            None => {
                if self.state == CollectorState::Emitted {
                    self.state = CollectorState::Idle;
                }
            }
        }
        emitted
    }

    /// Closes a block that has been quiet for the quiet period.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<PatternMatch> {
        match &self.state {
            CollectorState::Collecting(block) if now - block.last_line_at >= self.quiet_period => {
                self.emit()
            }
            _ => None,
        }
    }

    /// Flushes whatever is being collected; used when the stream ends.
    pub fn finish(&mut self) -> Option<PatternMatch> {
        self.emit()
    }

    fn emit(&mut self) -> Option<PatternMatch> {
        match std::mem::replace(&mut self.state, CollectorState::Emitted) {
            CollectorState::Collecting(block) => Some(PatternMatch {
                pattern_id: pattern_id_for(block.kind).to_string(),
                kind: block.kind,
                line: block.header,
                block: block.lines,
                timestamp: block.started_at,
            }),
            previous => {
                self.state = previous;
                None
            }
        }
    }
}
