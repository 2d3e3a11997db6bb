//! SQLite-backed store — the subsystem's single database.
//!
//! One connection behind a mutex, WAL mode for concurrent reads. The
//! orchestrator reads time-tracking data (users, projects, tasks, entries,
//! payroll) and owns the AI-side tables (credentials, feature settings,
//! user preferences, usage log). Schema migration beyond these tables is a
//! collaborator concern.

pub mod credentials;
pub mod features;
pub mod payroll;
pub mod timesheet;
pub mod usage;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path).context("Failed to open tempo-ai database")?;
        Self::init(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                key_preview TEXT NOT NULL,
                label TEXT,
                notes TEXT,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                usage_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_by INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ai_feature_settings (
                feature_id TEXT PRIMARY KEY,
                feature_name TEXT NOT NULL,
                description TEXT,
                is_enabled BOOLEAN NOT NULL DEFAULT 1,
                requires_api_key BOOLEAN NOT NULL DEFAULT 0,
                api_provider TEXT,
                config_json TEXT,
                updated_by INTEGER,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS user_ai_preferences (
                user_id INTEGER NOT NULL,
                feature_id TEXT NOT NULL,
                is_enabled BOOLEAN NOT NULL,
                admin_override BOOLEAN NOT NULL DEFAULT 0,
                admin_override_enabled BOOLEAN,
                admin_override_by INTEGER,
                updated_at TEXT,
                PRIMARY KEY (user_id, feature_id)
            );

            CREATE TABLE IF NOT EXISTS ai_usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                feature_id TEXT NOT NULL,
                api_provider TEXT,
                tokens_used INTEGER,
                estimated_cost REAL,
                request_at TEXT NOT NULL,
                response_time_ms INTEGER,
                success BOOLEAN NOT NULL DEFAULT 1,
                error_message TEXT,
                request_metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                expected_hours_per_week REAL NOT NULL DEFAULT 40.0
            );

            CREATE TABLE IF NOT EXISTS team_members (
                team_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY (team_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                team_id INTEGER,
                is_archived BOOLEAN NOT NULL DEFAULT 0,
                budget_total REAL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'TODO'
            );

            CREATE TABLE IF NOT EXISTS time_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                project_id INTEGER NOT NULL,
                task_id INTEGER,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_seconds INTEGER,
                description TEXT,
                is_running BOOLEAN NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS payroll_periods (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                period_type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payroll_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payroll_period_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                regular_hours REAL NOT NULL DEFAULT 0,
                overtime_hours REAL NOT NULL DEFAULT 0,
                gross_amount REAL NOT NULL DEFAULT 0,
                FOREIGN KEY (payroll_period_id) REFERENCES payroll_periods(id)
            );

            CREATE TABLE IF NOT EXISTS pay_rates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                base_rate REAL NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                effective_from TEXT NOT NULL,
                effective_to TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_api_keys_provider ON api_keys(provider, is_active);
            CREATE INDEX IF NOT EXISTS idx_usage_log_feature ON ai_usage_log(feature_id, request_at);
            CREATE INDEX IF NOT EXISTS idx_usage_log_user ON ai_usage_log(user_id, request_at);
            CREATE INDEX IF NOT EXISTS idx_entries_user_time ON time_entries(user_id, start_time);
            CREATE INDEX IF NOT EXISTS idx_entries_project ON time_entries(project_id);
            ",
        )?;

        let store = Self { db: Mutex::new(db) };
        store.seed_default_features()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let store = Store::open_in_memory().unwrap();
        let db = store.conn();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'api_keys'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        drop(store);
        // Reopen is idempotent
        Store::open(&dir.path().join("test.db")).unwrap();
    }
}
