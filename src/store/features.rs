//! Feature setting and user preference rows.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AiResult;

use super::Store;

/// Recognized feature ids, seeded on first open.
pub const KNOWN_FEATURES: &[(&str, &str, &str, bool, Option<&str>)] = &[
    (
        "ai_suggestions",
        "Smart Suggestions",
        "Project and task suggestions from work patterns",
        true,
        Some("gemini"),
    ),
    (
        "ai_anomaly_alerts",
        "Anomaly Alerts",
        "Unusual time-tracking pattern detection",
        false,
        None,
    ),
    (
        "ai_payroll_forecast",
        "Payroll Forecasting",
        "Payroll, overtime, budget and cash-flow projections",
        false,
        None,
    ),
    (
        "ai_nlp_entry",
        "Natural Language Entry",
        "Free-text time entry parsing",
        true,
        Some("gemini"),
    ),
    (
        "ai_report_summaries",
        "Report Summaries",
        "AI-written report narratives and insights",
        true,
        Some("gemini"),
    ),
    (
        "ai_task_estimation",
        "Task Estimation",
        "Duration estimates for planned tasks",
        true,
        Some("gemini"),
    ),
];

#[derive(Debug, Clone, Serialize)]
pub struct FeatureSetting {
    pub feature_id: String,
    pub feature_name: String,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub requires_api_key: bool,
    pub api_provider: Option<String>,
    pub updated_by: Option<i64>,
    pub updated_at: Option<String>,
}

/// One user's toggle for one feature. `is_enabled` is always the user's
/// own choice; an active override carries its value separately so lifting
/// it restores the user's preference.
#[derive(Debug, Clone, Serialize)]
pub struct UserPreference {
    pub user_id: i64,
    pub feature_id: String,
    pub is_enabled: bool,
    pub admin_override: bool,
    pub admin_override_enabled: Option<bool>,
    pub admin_override_by: Option<i64>,
}

impl UserPreference {
    /// The value that wins resolution for this row.
    pub fn effective_enabled(&self) -> bool {
        if self.admin_override {
            self.admin_override_enabled.unwrap_or(self.is_enabled)
        } else {
            self.is_enabled
        }
    }
}

fn row_to_setting(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureSetting> {
    Ok(FeatureSetting {
        feature_id: row.get(0)?,
        feature_name: row.get(1)?,
        description: row.get(2)?,
        is_enabled: row.get(3)?,
        requires_api_key: row.get(4)?,
        api_provider: row.get(5)?,
        updated_by: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_pref(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserPreference> {
    Ok(UserPreference {
        user_id: row.get(0)?,
        feature_id: row.get(1)?,
        is_enabled: row.get(2)?,
        admin_override: row.get(3)?,
        admin_override_enabled: row.get(4)?,
        admin_override_by: row.get(5)?,
    })
}

impl Store {
    pub(super) fn seed_default_features(&self) -> anyhow::Result<()> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO ai_feature_settings \
             (feature_id, feature_name, description, is_enabled, requires_api_key, api_provider)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
        )?;
        for (id, name, desc, requires_key, provider) in KNOWN_FEATURES {
            stmt.execute(params![id, name, desc, requires_key, provider])?;
        }
        Ok(())
    }

    pub fn feature_setting(&self, feature_id: &str) -> AiResult<Option<FeatureSetting>> {
        let db = self.conn();
        let setting = db
            .query_row(
                "SELECT feature_id, feature_name, description, is_enabled, requires_api_key, \
                 api_provider, updated_by, updated_at
                 FROM ai_feature_settings WHERE feature_id = ?1",
                params![feature_id],
                row_to_setting,
            )
            .optional()?;
        Ok(setting)
    }

    pub fn all_feature_settings(&self) -> AiResult<Vec<FeatureSetting>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT feature_id, feature_name, description, is_enabled, requires_api_key, \
             api_provider, updated_by, updated_at
             FROM ai_feature_settings ORDER BY feature_name",
        )?;
        let rows = stmt.query_map([], row_to_setting)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Flip the global toggle. Returns the updated row, or `None` when the
    /// feature id is unknown.
    pub fn update_feature_setting(
        &self,
        feature_id: &str,
        enabled: bool,
        updated_by: i64,
    ) -> AiResult<Option<FeatureSetting>> {
        {
            let db = self.conn();
            let rows = db.execute(
                "UPDATE ai_feature_settings SET is_enabled = ?1, updated_by = ?2, updated_at = ?3 \
                 WHERE feature_id = ?4",
                params![enabled, updated_by, Utc::now().to_rfc3339(), feature_id],
            )?;
            if rows == 0 {
                return Ok(None);
            }
        }
        self.feature_setting(feature_id)
    }

    pub fn user_preference(&self, user_id: i64, feature_id: &str) -> AiResult<Option<UserPreference>> {
        let db = self.conn();
        let pref = db
            .query_row(
                "SELECT user_id, feature_id, is_enabled, admin_override, \
                 admin_override_enabled, admin_override_by \
                 FROM user_ai_preferences WHERE user_id = ?1 AND feature_id = ?2",
                params![user_id, feature_id],
                row_to_pref,
            )
            .optional()?;
        Ok(pref)
    }

    pub fn user_preferences(&self, user_id: i64) -> AiResult<Vec<UserPreference>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT user_id, feature_id, is_enabled, admin_override, \
             admin_override_enabled, admin_override_by \
             FROM user_ai_preferences WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_pref)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Write the user's own toggle, leaving any override columns alone.
    pub fn set_preference_value(
        &self,
        user_id: i64,
        feature_id: &str,
        is_enabled: bool,
    ) -> AiResult<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO user_ai_preferences (user_id, feature_id, is_enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, feature_id) DO UPDATE SET
                is_enabled = excluded.is_enabled,
                updated_at = excluded.updated_at",
            params![user_id, feature_id, is_enabled, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Install an admin override. The user's own `is_enabled` is preserved
    /// (a fresh row starts at the default ON).
    pub fn set_override(
        &self,
        user_id: i64,
        feature_id: &str,
        enabled: bool,
        admin_id: i64,
    ) -> AiResult<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO user_ai_preferences \
             (user_id, feature_id, is_enabled, admin_override, admin_override_enabled, \
              admin_override_by, updated_at)
             VALUES (?1, ?2, 1, 1, ?3, ?4, ?5)
             ON CONFLICT(user_id, feature_id) DO UPDATE SET
                admin_override = 1,
                admin_override_enabled = excluded.admin_override_enabled,
                admin_override_by = excluded.admin_override_by,
                updated_at = excluded.updated_at",
            params![user_id, feature_id, enabled, admin_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn clear_override(&self, user_id: i64, feature_id: &str) -> AiResult<()> {
        let db = self.conn();
        db.execute(
            "UPDATE user_ai_preferences SET admin_override = 0, admin_override_enabled = NULL, \
             admin_override_by = NULL, updated_at = ?1 \
             WHERE user_id = ?2 AND feature_id = ?3",
            params![Utc::now().to_rfc3339(), user_id, feature_id],
        )?;
        Ok(())
    }

    /// Users with the feature effectively on: everyone active minus explicit
    /// opt-outs.
    pub fn count_users_with_feature_enabled(&self, feature_id: &str) -> AiResult<(i64, i64)> {
        let db = self.conn();
        let total: i64 =
            db.query_row("SELECT COUNT(*) FROM users WHERE is_active = 1", [], |r| r.get(0))?;
        let disabled: i64 = db.query_row(
            "SELECT COUNT(*) FROM user_ai_preferences WHERE feature_id = ?1 AND is_enabled = 0",
            params![feature_id],
            |r| r.get(0),
        )?;
        Ok((total - disabled, total))
    }
}
