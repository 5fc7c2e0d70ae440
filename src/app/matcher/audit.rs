use chrono::{DateTime, Utc};

use crate::app::models::{AuditEntry, AuditReport, EventExpectation};

/// Running tally of how often each expected event showed up in a stream.
#[derive(Debug, Clone, Default)]
pub struct EventAudit {
    entries: Vec<AuditEntry>,
}

impl EventAudit {
    pub fn new(expectations: &[EventExpectation]) -> Self {
        let entries = expectations
            .iter()
            .map(|expectation| AuditEntry {
                keyword: expectation.keyword.clone(),
                description: expectation.description.clone(),
                exact_match: expectation.exact_match,
                seen_count: 0,
                first_seen: None,
                last_seen: None,
            })
            .collect();
        Self { entries }
    }

    pub fn record(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.seen_count += 1;
            entry.first_seen.get_or_insert(at);
            entry.last_seen = Some(at);
        }
    }

    pub fn report(&self, session_id: &str) -> AuditReport {
        AuditReport {
            session_id: session_id.to_string(),
            missing: self
                .entries
                .iter()
                .filter(|entry| entry.seen_count == 0)
                .map(|entry| entry.keyword.clone())
                .collect(),
            entries: self.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn expectation(keyword: &str) -> EventExpectation {
        EventExpectation {
            id: None,
            keyword: keyword.to_string(),
            description: None,
            exact_match: true,
            created_at: None,
        }
    }

    #[test]
    fn report_tracks_counts_and_missing_keywords() {
        let mut audit = EventAudit::new(&[expectation("app_open"), expectation("purchase")]);
        let start = Utc::now();
        audit.record(0, start);
        audit.record(0, start + Duration::seconds(5));
        audit.record(7, start);

        let report = audit.report("s-1");
        assert_eq!(report.entries[0].seen_count, 2);
        assert_eq!(report.entries[0].first_seen, Some(start));
        assert_eq!(report.entries[0].last_seen, Some(start + Duration::seconds(5)));
        assert_eq!(report.missing, vec!["purchase".to_string()]);
    }
}
