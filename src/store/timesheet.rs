//! Read-side queries over the time-tracking tables.
//!
//! The orchestrator never mutates this data except for the single NLP
//! confirmation write; everything else is owned by the main application,
//! which shares the database.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::Serialize;

use crate::error::AiResult;

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub expected_hours_per_week: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub team_id: Option<i64>,
    pub is_archived: bool,
    pub budget_total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub status: String,
}

/// A time entry joined with project and task names, as the engines consume it.
#[derive(Debug, Clone, Serialize)]
pub struct EntryJoined {
    pub id: i64,
    pub project_id: i64,
    pub project_name: String,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl EntryJoined {
    /// Worked hours: explicit duration wins, otherwise end − start.
    pub fn hours(&self) -> f64 {
        if let Some(secs) = self.duration_seconds {
            return secs as f64 / 3600.0;
        }
        match self.end_time {
            Some(end) => (end - self.start_time).num_seconds() as f64 / 3600.0,
            None => 0.0,
        }
    }
}

/// Per-day aggregate used by the baseline builder.
#[derive(Debug, Clone)]
pub struct DayAggregate {
    pub date: NaiveDate,
    pub hours: f64,
    pub entry_count: i64,
    pub avg_entry_minutes: f64,
    pub start_hour: f64,
    pub end_hour: f64,
}

fn parse_ts(s: String) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_default()
}

// Hours expression that tolerates entries without a stored duration.
const HOURS_EXPR: &str = "COALESCE(duration_seconds, \
    CAST((julianday(end_time) - julianday(start_time)) * 86400 AS INTEGER), 0)";

impl Store {
    // ── Users ───────────────────────────────────────────────────────

    pub fn user(&self, user_id: i64) -> AiResult<Option<UserRow>> {
        let db = self.conn();
        let row = db
            .query_row(
                "SELECT id, name, is_active, expected_hours_per_week FROM users WHERE id = ?1",
                params![user_id],
                |r| {
                    Ok(UserRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        is_active: r.get(2)?,
                        expected_hours_per_week: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Active users, optionally restricted to a team.
    pub fn active_users(&self, team_id: Option<i64>) -> AiResult<Vec<UserRow>> {
        let db = self.conn();
        let map = |r: &rusqlite::Row<'_>| {
            Ok(UserRow {
                id: r.get(0)?,
                name: r.get(1)?,
                is_active: r.get(2)?,
                expected_hours_per_week: r.get(3)?,
            })
        };
        let rows = match team_id {
            Some(team) => {
                let mut stmt = db.prepare(
                    "SELECT u.id, u.name, u.is_active, u.expected_hours_per_week FROM users u \
                     JOIN team_members tm ON tm.user_id = u.id \
                     WHERE u.is_active = 1 AND tm.team_id = ?1 ORDER BY u.id",
                )?;
                let rows = stmt.query_map(params![team], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT id, name, is_active, expected_hours_per_week FROM users \
                     WHERE is_active = 1 ORDER BY id",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    // ── Projects and tasks ──────────────────────────────────────────

    pub fn project(&self, project_id: i64) -> AiResult<Option<ProjectRow>> {
        let db = self.conn();
        let row = db
            .query_row(
                "SELECT id, name, team_id, is_archived, budget_total FROM projects WHERE id = ?1",
                params![project_id],
                |r| {
                    Ok(ProjectRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        team_id: r.get(2)?,
                        is_archived: r.get(3)?,
                        budget_total: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn active_projects(&self, limit: i64) -> AiResult<Vec<ProjectRow>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT id, name, team_id, is_archived, budget_total FROM projects \
             WHERE is_archived = 0 ORDER BY name LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| {
            Ok(ProjectRow {
                id: r.get(0)?,
                name: r.get(1)?,
                team_id: r.get(2)?,
                is_archived: r.get(3)?,
                budget_total: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Projects for a budget scan: one project, a team's, or a bounded batch.
    pub fn projects_for_scope(
        &self,
        project_id: Option<i64>,
        team_id: Option<i64>,
        limit: i64,
    ) -> AiResult<Vec<ProjectRow>> {
        if let Some(id) = project_id {
            return Ok(self.project(id)?.into_iter().collect());
        }
        let db = self.conn();
        let map = |r: &rusqlite::Row<'_>| {
            Ok(ProjectRow {
                id: r.get(0)?,
                name: r.get(1)?,
                team_id: r.get(2)?,
                is_archived: r.get(3)?,
                budget_total: r.get(4)?,
            })
        };
        let rows = match team_id {
            Some(team) => {
                let mut stmt = db.prepare(
                    "SELECT id, name, team_id, is_archived, budget_total FROM projects \
                     WHERE team_id = ?1 AND is_archived = 0 ORDER BY name",
                )?;
                let rows = stmt.query_map(params![team], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT id, name, team_id, is_archived, budget_total FROM projects \
                     WHERE is_archived = 0 ORDER BY name LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub fn tasks_for_active_projects(&self) -> AiResult<Vec<TaskRow>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT t.id, t.project_id, t.name, t.status FROM tasks t \
             JOIN projects p ON p.id = t.project_id WHERE p.is_archived = 0",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(TaskRow {
                id: r.get(0)?,
                project_id: r.get(1)?,
                name: r.get(2)?,
                status: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn project_task_stats(&self, project_id: i64) -> AiResult<(i64, i64)> {
        let db = self.conn();
        let stats = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'DONE' THEN 1 ELSE 0 END), 0) \
             FROM tasks WHERE project_id = ?1",
            params![project_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(stats)
    }

    // ── Time entries ────────────────────────────────────────────────

    /// The user's most recent entries since `since`, newest first,
    /// joined with project and task names.
    pub fn recent_entries(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> AiResult<Vec<EntryJoined>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT e.id, e.project_id, p.name, e.task_id, t.name, e.description, \
                    e.start_time, e.end_time, e.duration_seconds
             FROM time_entries e
             JOIN projects p ON p.id = e.project_id
             LEFT JOIN tasks t ON t.id = e.task_id
             WHERE e.user_id = ?1 AND e.start_time >= ?2
             ORDER BY e.start_time DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user_id, since.to_rfc3339(), limit], |r| {
            Ok(EntryJoined {
                id: r.get(0)?,
                project_id: r.get(1)?,
                project_name: r.get(2)?,
                task_id: r.get(3)?,
                task_name: r.get(4)?,
                description: r.get(5)?,
                start_time: parse_ts(r.get(6)?),
                end_time: r.get::<_, Option<String>>(7)?.map(parse_ts),
                duration_seconds: r.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Completed entries for a user with start dates inside `[start, end]`.
    pub fn completed_entries_between(
        &self,
        user_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<Vec<EntryJoined>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT e.id, e.project_id, p.name, e.task_id, t.name, e.description, \
                    e.start_time, e.end_time, e.duration_seconds
             FROM time_entries e
             JOIN projects p ON p.id = e.project_id
             LEFT JOIN tasks t ON t.id = e.task_id
             WHERE e.user_id = ?1 AND e.end_time IS NOT NULL \
               AND date(e.start_time) >= ?2 AND date(e.start_time) <= ?3
             ORDER BY e.start_time",
        )?;
        let rows = stmt.query_map(
            params![user_id, start.to_string(), end.to_string()],
            |r| {
                Ok(EntryJoined {
                    id: r.get(0)?,
                    project_id: r.get(1)?,
                    project_name: r.get(2)?,
                    task_id: r.get(3)?,
                    task_name: r.get(4)?,
                    description: r.get(5)?,
                    start_time: parse_ts(r.get(6)?),
                    end_time: r.get::<_, Option<String>>(7)?.map(parse_ts),
                    duration_seconds: r.get(8)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `(date, project_id, entry_count)` groups with more than `min_count`
    /// entries for the same project on the same day.
    pub fn duplicate_entry_groups(
        &self,
        user_id: i64,
        since: NaiveDate,
        min_count: i64,
    ) -> AiResult<Vec<(String, i64, i64)>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT date(start_time), project_id, COUNT(*) FROM time_entries \
             WHERE user_id = ?1 AND date(start_time) >= ?2 \
             GROUP BY date(start_time), project_id HAVING COUNT(*) > ?3",
        )?;
        let rows = stmt.query_map(params![user_id, since.to_string(), min_count], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total worked hours for a user between two dates (inclusive).
    pub fn user_hours_between(
        &self,
        user_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<f64> {
        let db = self.conn();
        let secs: i64 = db.query_row(
            &format!(
                "SELECT COALESCE(SUM({HOURS_EXPR}), 0) FROM time_entries \
                 WHERE user_id = ?1 AND date(start_time) >= ?2 AND date(start_time) <= ?3"
            ),
            params![user_id, start.to_string(), end.to_string()],
            |r| r.get(0),
        )?;
        Ok(secs as f64 / 3600.0)
    }

    /// `(date, hours)` per worked day since a date.
    pub fn user_daily_hours(&self, user_id: i64, since: NaiveDate) -> AiResult<Vec<(NaiveDate, f64)>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT date(start_time), SUM({HOURS_EXPR}) FROM time_entries \
             WHERE user_id = ?1 AND date(start_time) >= ?2 \
             GROUP BY date(start_time) ORDER BY date(start_time)"
        ))?;
        let rows = stmt.query_map(params![user_id, since.to_string()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (d, secs) = row?;
            if let Ok(date) = d.parse::<NaiveDate>() {
                out.push((date, secs as f64 / 3600.0));
            }
        }
        Ok(out)
    }

    /// Per-day aggregates for the statistical baseline.
    pub fn user_day_aggregates(&self, user_id: i64, since: NaiveDate) -> AiResult<Vec<DayAggregate>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT date(start_time),
                    SUM({HOURS_EXPR}),
                    COUNT(*),
                    AVG({HOURS_EXPR}) / 60.0,
                    MIN(CAST(strftime('%H', start_time) AS REAL) + \
                        CAST(strftime('%M', start_time) AS REAL) / 60.0),
                    MAX(COALESCE(CAST(strftime('%H', end_time) AS REAL) + \
                        CAST(strftime('%M', end_time) AS REAL) / 60.0, 0))
             FROM time_entries \
             WHERE user_id = ?1 AND end_time IS NOT NULL AND date(start_time) >= ?2 \
             GROUP BY date(start_time) ORDER BY date(start_time)"
        ))?;
        let rows = stmt.query_map(params![user_id, since.to_string()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, f64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (d, secs, count, avg_min, start_h, end_h) = row?;
            if let Ok(date) = d.parse::<NaiveDate>() {
                out.push(DayAggregate {
                    date,
                    hours: secs as f64 / 3600.0,
                    entry_count: count,
                    avg_entry_minutes: avg_min,
                    start_hour: start_h,
                    end_hour: end_h,
                });
            }
        }
        Ok(out)
    }

    pub fn distinct_work_days(&self, user_id: i64, since: NaiveDate) -> AiResult<i64> {
        let db = self.conn();
        let days: i64 = db.query_row(
            "SELECT COUNT(DISTINCT date(start_time)) FROM time_entries \
             WHERE user_id = ?1 AND date(start_time) >= ?2",
            params![user_id, since.to_string()],
            |r| r.get(0),
        )?;
        Ok(days)
    }

    // ── Multi-user aggregates (reporting) ───────────────────────────

    pub fn group_hours_between(
        &self,
        user_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<f64> {
        if user_ids.is_empty() {
            return Ok(0.0);
        }
        let db = self.conn();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT COALESCE(SUM({HOURS_EXPR}), 0) FROM time_entries \
             WHERE user_id IN ({placeholders}) AND date(start_time) >= ? AND date(start_time) <= ?"
        );
        let mut args: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        args.push(start.to_string());
        args.push(end.to_string());
        let secs: i64 = db.query_row(&sql, params_from_iter(args.iter()), |r| r.get(0))?;
        Ok(secs as f64 / 3600.0)
    }

    pub fn group_project_count(
        &self,
        user_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<i64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let db = self.conn();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(DISTINCT project_id) FROM time_entries \
             WHERE user_id IN ({placeholders}) AND date(start_time) >= ? AND date(start_time) <= ?"
        );
        let mut args: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        args.push(start.to_string());
        args.push(end.to_string());
        let count: i64 = db.query_row(&sql, params_from_iter(args.iter()), |r| r.get(0))?;
        Ok(count)
    }

    /// Top projects by hours, `(name, hours)` descending.
    pub fn group_top_projects(
        &self,
        user_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
        limit: i64,
    ) -> AiResult<Vec<(String, f64)>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        let db = self.conn();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT p.name, SUM({HOURS_EXPR}) FROM time_entries e \
             JOIN projects p ON p.id = e.project_id \
             WHERE e.user_id IN ({placeholders}) \
               AND date(e.start_time) >= ? AND date(e.start_time) <= ? \
             GROUP BY p.id, p.name ORDER BY 2 DESC LIMIT {limit}"
        );
        let mut args: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        args.push(start.to_string());
        args.push(end.to_string());
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        Ok(rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(name, secs)| (name, secs as f64 / 3600.0))
            .collect())
    }

    pub fn group_daily_hours(
        &self,
        user_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<Vec<(NaiveDate, f64)>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        let db = self.conn();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT date(start_time), SUM({HOURS_EXPR}) FROM time_entries \
             WHERE user_id IN ({placeholders}) AND date(start_time) >= ? AND date(start_time) <= ? \
             GROUP BY date(start_time) ORDER BY date(start_time)"
        );
        let mut args: Vec<String> = user_ids.iter().map(|id| id.to_string()).collect();
        args.push(start.to_string());
        args.push(end.to_string());
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (d, secs) = row?;
            if let Ok(date) = d.parse::<NaiveDate>() {
                out.push((date, secs as f64 / 3600.0));
            }
        }
        Ok(out)
    }

    // ── Project-level aggregates ────────────────────────────────────

    pub fn project_total_hours(&self, project_id: i64) -> AiResult<f64> {
        let db = self.conn();
        let secs: i64 = db.query_row(
            &format!("SELECT COALESCE(SUM({HOURS_EXPR}), 0) FROM time_entries WHERE project_id = ?1"),
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(secs as f64 / 3600.0)
    }

    pub fn project_hours_between(
        &self,
        project_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<f64> {
        let db = self.conn();
        let secs: i64 = db.query_row(
            &format!(
                "SELECT COALESCE(SUM({HOURS_EXPR}), 0) FROM time_entries \
                 WHERE project_id = ?1 AND date(start_time) >= ?2 AND date(start_time) <= ?3"
            ),
            params![project_id, start.to_string(), end.to_string()],
            |r| r.get(0),
        )?;
        Ok(secs as f64 / 3600.0)
    }

    pub fn project_first_entry_date(&self, project_id: i64) -> AiResult<Option<NaiveDate>> {
        let db = self.conn();
        let date: Option<String> = db
            .query_row(
                "SELECT date(MIN(start_time)) FROM time_entries WHERE project_id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(date.and_then(|d| d.parse().ok()))
    }

    pub fn project_contributor_count(&self, project_id: i64) -> AiResult<i64> {
        let db = self.conn();
        let count: i64 = db.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM time_entries WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Mean active pay rate across the project's contributors.
    pub fn project_blended_rate(&self, project_id: i64) -> AiResult<Option<f64>> {
        let db = self.conn();
        let rate: Option<f64> = db.query_row(
            "SELECT AVG(pr.base_rate) FROM pay_rates pr \
             WHERE pr.is_active = 1 AND pr.user_id IN \
               (SELECT DISTINCT user_id FROM time_entries WHERE project_id = ?1)",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(rate)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert a completed time entry (the NLP confirmation path).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_time_entry(
        &self,
        user_id: i64,
        project_id: i64,
        task_id: Option<i64>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
        description: &str,
    ) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO time_entries \
             (user_id, project_id, task_id, start_time, end_time, duration_seconds, description, is_running)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                user_id,
                project_id,
                task_id,
                start_time.to_rfc3339(),
                end_time.map(|t| t.to_rfc3339()),
                duration_seconds,
                description,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    // ── Fixture helpers for embedding and tests ─────────────────────

    pub fn insert_user(&self, name: &str, expected_hours_per_week: f64) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO users (name, is_active, expected_hours_per_week) VALUES (?1, 1, ?2)",
            params![name, expected_hours_per_week],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn insert_team_member(&self, team_id: i64, user_id: i64) -> AiResult<()> {
        let db = self.conn();
        db.execute(
            "INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?1, ?2)",
            params![team_id, user_id],
        )?;
        Ok(())
    }

    pub fn insert_project(&self, name: &str, team_id: Option<i64>, budget: Option<f64>) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO projects (name, team_id, is_archived, budget_total) VALUES (?1, ?2, 0, ?3)",
            params![name, team_id, budget],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn insert_task(&self, project_id: i64, name: &str, status: &str) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO tasks (project_id, name, status) VALUES (?1, ?2, ?3)",
            params![project_id, name, status],
        )?;
        Ok(db.last_insert_rowid())
    }
}
