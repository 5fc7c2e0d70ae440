use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::app::error::AppError;
use crate::app::models::{EventExpectation, PackageRecord};
use crate::app::scheduler::relock;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event_expectations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    keyword TEXT NOT NULL,
    description TEXT,
    exact_match INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_name TEXT NOT NULL UNIQUE,
    activity_name TEXT,
    last_used TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_packages_last_used ON packages(last_used);
";

pub const DEFAULT_PACKAGE_LIMIT: usize = 20;

/// Event expectation rules and recently used packages, kept in SQLite.
pub struct RulesStore {
    conn: Mutex<Connection>,
}

impl RulesStore {
    pub fn open(path: &Path, trace_id: &str) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create rules dir: {err}"), trace_id)
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|err| AppError::system(format!("Failed to open rules database: {err}"), trace_id))?;
        Self::with_connection(conn, trace_id)
    }

    pub fn open_in_memory(trace_id: &str) -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| AppError::system(format!("Failed to open rules database: {err}"), trace_id))?;
        Self::with_connection(conn, trace_id)
    }

    fn with_connection(conn: Connection, trace_id: &str) -> Result<Self, AppError> {
        conn.execute_batch(SCHEMA)
            .map_err(|err| db_error("initialise rules schema", err, trace_id))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn list_expectations(&self, trace_id: &str) -> Result<Vec<EventExpectation>, AppError> {
        let conn = relock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT id, keyword, description, exact_match, created_at
                 FROM event_expectations ORDER BY id ASC",
            )
            .map_err(|err| db_error("prepare expectation query", err, trace_id))?;
        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(4)?;
                Ok(EventExpectation {
                    id: Some(row.get(0)?),
                    keyword: row.get(1)?,
                    description: row.get(2)?,
                    exact_match: row.get::<_, i64>(3)? != 0,
                    created_at: parse_timestamp(&created_at),
                })
            })
            .map_err(|err| db_error("query expectations", err, trace_id))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| db_error("read expectations", err, trace_id))
    }

    /// Swaps the whole rule set in one transaction. Rules with a blank
    /// keyword are dropped; ids and creation times are assigned here.
    pub fn replace_expectations(
        &self,
        rules: &[EventExpectation],
        trace_id: &str,
    ) -> Result<Vec<EventExpectation>, AppError> {
        {
            let mut conn = relock(&self.conn);
            let tx = conn
                .transaction()
                .map_err(|err| db_error("start expectation transaction", err, trace_id))?;
            tx.execute("DELETE FROM event_expectations", [])
                .map_err(|err| db_error("clear expectations", err, trace_id))?;
            let now = timestamp(Utc::now());
            let mut inserted = 0usize;
            {
                let mut insert = tx
                    .prepare(
                        "INSERT INTO event_expectations (keyword, description, exact_match, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(|err| db_error("prepare expectation insert", err, trace_id))?;
                for rule in rules {
                    let keyword = rule.keyword.trim();
                    if keyword.is_empty() {
                        continue;
                    }
                    let description = rule
                        .description
                        .as_deref()
                        .map(str::trim)
                        .filter(|value| !value.is_empty());
                    insert
                        .execute(params![keyword, description, rule.exact_match as i64, now])
                        .map_err(|err| db_error("insert expectation", err, trace_id))?;
                    inserted += 1;
                }
            }
            tx.commit()
                .map_err(|err| db_error("commit expectations", err, trace_id))?;
            info!(trace_id = %trace_id, count = inserted, "event expectations replaced");
        }
        self.list_expectations(trace_id)
    }

    /// Most recently used first.
    pub fn list_packages(&self, limit: usize, trace_id: &str) -> Result<Vec<PackageRecord>, AppError> {
        let limit = if limit == 0 { DEFAULT_PACKAGE_LIMIT } else { limit };
        let conn = relock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT package_name, activity_name, last_used
                 FROM packages ORDER BY last_used DESC, id DESC LIMIT ?1",
            )
            .map_err(|err| db_error("prepare package query", err, trace_id))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let last_used: String = row.get(2)?;
                Ok(PackageRecord {
                    package_name: row.get(0)?,
                    activity_name: row.get(1)?,
                    last_used: parse_timestamp(&last_used).unwrap_or_else(Utc::now),
                })
            })
            .map_err(|err| db_error("query packages", err, trace_id))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| db_error("read packages", err, trace_id))
    }

    /// Adds `package_name` only while the package list is still empty.
    /// Returns whether a row was inserted.
    pub fn seed_package(&self, package_name: &str, trace_id: &str) -> Result<bool, AppError> {
        let package_name = package_name.trim();
        if package_name.is_empty() {
            return Ok(false);
        }
        let conn = relock(&self.conn);
        let inserted = conn
            .execute(
                "INSERT INTO packages (package_name, activity_name, last_used)
                 SELECT ?1, NULL, ?2 WHERE NOT EXISTS (SELECT 1 FROM packages)",
                params![package_name, timestamp(Utc::now())],
            )
            .map_err(|err| db_error("seed package", err, trace_id))?;
        if inserted > 0 {
            info!(trace_id = %trace_id, package = %package_name, "seeded default package");
        }
        Ok(inserted > 0)
    }

    /// Inserts or bumps `last_used`. A missing activity keeps the stored one.
    pub fn touch_package(
        &self,
        package_name: &str,
        activity_name: Option<&str>,
        trace_id: &str,
    ) -> Result<PackageRecord, AppError> {
        let package_name = package_name.trim();
        if package_name.is_empty() {
            return Err(AppError::validation("package_name is required", trace_id));
        }
        let activity_name = activity_name.map(str::trim).filter(|value| !value.is_empty());
        let now = Utc::now();
        let conn = relock(&self.conn);
        conn.execute(
            "INSERT INTO packages (package_name, activity_name, last_used) VALUES (?1, ?2, ?3)
             ON CONFLICT(package_name) DO UPDATE SET
                 last_used = excluded.last_used,
                 activity_name = COALESCE(excluded.activity_name, packages.activity_name)",
            params![package_name, activity_name, timestamp(now)],
        )
        .map_err(|err| db_error("upsert package", err, trace_id))?;

        let stored: Option<Option<String>> = conn
            .query_row(
                "SELECT activity_name FROM packages WHERE package_name = ?1",
                params![package_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| db_error("read package", err, trace_id))?;
        Ok(PackageRecord {
            package_name: package_name.to_string(),
            activity_name: stored.flatten(),
            last_used: now,
        })
    }
}

/// Fixed-width so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn db_error(action: &str, err: rusqlite::Error, trace_id: &str) -> AppError {
    AppError::system(format!("Failed to {action}: {err}"), trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(keyword: &str, exact_match: bool) -> EventExpectation {
        EventExpectation {
            id: None,
            keyword: keyword.to_string(),
            description: Some(format!("{keyword} fired")),
            exact_match,
            created_at: None,
        }
    }

    #[test]
    fn replace_skips_blank_keywords_and_reassigns_ids() {
        let store = RulesStore::open_in_memory("trace-r1").expect("store");
        let first = store
            .replace_expectations(&[rule("app_open", true), rule("   ", true), rule("purchase", false)], "trace-r1")
            .expect("replace");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].keyword, "app_open");
        assert!(first[0].exact_match);
        assert!(!first[1].exact_match);
        assert!(first.iter().all(|rule| rule.id.is_some() && rule.created_at.is_some()));

        let second = store
            .replace_expectations(&[rule("login", true)], "trace-r2")
            .expect("replace again");
        assert_eq!(second.len(), 1);
        assert_eq!(store.list_expectations("trace-r3").expect("list"), second);
    }

    #[test]
    fn touch_package_upserts_and_orders_by_recency() {
        let store = RulesStore::open_in_memory("trace-r4").expect("store");
        store
            .touch_package("com.example.one", Some("com.example.one/.Main"), "trace-r4")
            .expect("touch one");
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.touch_package("com.example.two", None, "trace-r4").expect("touch two");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let bumped = store.touch_package("com.example.one", None, "trace-r4").expect("bump");
        assert_eq!(bumped.activity_name.as_deref(), Some("com.example.one/.Main"));

        let packages = store.list_packages(10, "trace-r5").expect("list");
        let names: Vec<&str> = packages.iter().map(|record| record.package_name.as_str()).collect();
        assert_eq!(names, vec!["com.example.one", "com.example.two"]);
        assert_eq!(store.list_packages(1, "trace-r5").expect("limited").len(), 1);

        let err = store.touch_package("  ", None, "trace-r6").expect_err("blank");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn rules_survive_reopening_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("rules.sqlite3");
        {
            let store = RulesStore::open(&path, "trace-r7").expect("open");
            store.replace_expectations(&[rule("boot", true)], "trace-r7").expect("replace");
        }
        let reopened = RulesStore::open(&path, "trace-r8").expect("reopen");
        let rules = reopened.list_expectations("trace-r8").expect("list");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].keyword, "boot");
    }

    #[test]
    fn seed_package_only_fills_an_empty_list() {
        let store = RulesStore::open_in_memory("trace-r9").expect("store");
        assert!(!store.seed_package("  ", "trace-r9").expect("blank"));
        assert!(store.seed_package("com.example.app", "trace-r9").expect("seed"));
        assert!(!store.seed_package("com.example.app", "trace-r9").expect("again"));
        assert!(!store.seed_package("com.example.other", "trace-r9").expect("not empty"));

        let packages = store.list_packages(10, "trace-r9").expect("list");
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].package_name, "com.example.app");
        assert_eq!(packages[0].activity_name, None);
    }
}
