//! Append-only AI usage ledger and its aggregates.
//!
//! Insertions are strictly in arrival order; readers see eventually
//! consistent aggregates. Retention is a collaborator concern.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use crate::error::AiResult;

use super::Store;

/// One usage event. `api_provider` is empty for cache-served and
/// pattern-only requests.
#[derive(Debug, Clone, Default)]
pub struct UsageRecord<'a> {
    pub user_id: Option<i64>,
    pub feature_id: &'a str,
    pub api_provider: Option<&'a str>,
    pub tokens_used: Option<i64>,
    pub estimated_cost: Option<f64>,
    pub response_time_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureUsageStats {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub period_days: i64,
}

impl Store {
    pub fn append_usage(&self, record: &UsageRecord<'_>) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO ai_usage_log \
             (user_id, feature_id, api_provider, tokens_used, estimated_cost, request_at, \
              response_time_ms, success, error_message, request_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.user_id,
                record.feature_id,
                record.api_provider,
                record.tokens_used,
                record.estimated_cost,
                Utc::now().to_rfc3339(),
                record.response_time_ms,
                record.success,
                record.error_message,
                record.metadata.as_ref().map(|m| m.to_string()),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Usage statistics for one feature over the past N days.
    pub fn feature_usage_stats(&self, feature_id: &str, days: i64) -> AiResult<FeatureUsageStats> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let db = self.conn();
        let (total, tokens, cost, avg_ms, successes): (i64, i64, f64, f64, i64) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(tokens_used), 0),
                    COALESCE(SUM(estimated_cost), 0.0),
                    COALESCE(AVG(response_time_ms), 0.0),
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0)
             FROM ai_usage_log WHERE feature_id = ?1 AND request_at >= ?2",
            params![feature_id, cutoff],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
        )?;

        Ok(FeatureUsageStats {
            total_requests: total,
            total_tokens: tokens,
            total_cost: cost,
            avg_response_time_ms: avg_ms,
            success_rate: if total > 0 {
                successes as f64 / total as f64 * 100.0
            } else {
                100.0
            },
            period_days: days,
        })
    }

    /// Per-feature usage for one user over the past N days.
    pub fn user_usage_stats(&self, user_id: i64, days: i64) -> AiResult<serde_json::Value> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT feature_id, COUNT(*), COALESCE(SUM(tokens_used), 0), \
             COALESCE(SUM(estimated_cost), 0.0)
             FROM ai_usage_log WHERE user_id = ?1 AND request_at >= ?2
             GROUP BY feature_id",
        )?;

        let mut features: HashMap<String, serde_json::Value> = HashMap::new();
        let mut total_tokens: i64 = 0;
        let mut total_cost = 0.0;
        let rows = stmt.query_map(params![user_id, cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        for row in rows {
            let (feature, count, tokens, cost) = row?;
            total_tokens += tokens;
            total_cost += cost;
            features.insert(
                feature,
                json!({"request_count": count, "tokens_used": tokens, "estimated_cost": cost}),
            );
        }

        Ok(json!({
            "user_id": user_id,
            "period_days": days,
            "total_tokens": total_tokens,
            "total_cost": total_cost,
            "features": features,
        }))
    }

    /// Overall summary for the admin dashboard.
    pub fn usage_summary(&self, days: i64) -> AiResult<serde_json::Value> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let db = self.conn();
        let (total, tokens, cost, unique_users): (i64, i64, f64, i64) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(tokens_used), 0),
                    COALESCE(SUM(estimated_cost), 0.0),
                    COUNT(DISTINCT user_id)
             FROM ai_usage_log WHERE request_at >= ?1",
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut stmt = db.prepare(
            "SELECT feature_id, COUNT(*), COALESCE(SUM(tokens_used), 0), \
             COALESCE(SUM(estimated_cost), 0.0)
             FROM ai_usage_log WHERE request_at >= ?1 GROUP BY feature_id",
        )?;
        let mut features: HashMap<String, serde_json::Value> = HashMap::new();
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        for row in rows {
            let (feature, count, tok, c) = row?;
            features.insert(
                feature,
                json!({"request_count": count, "tokens_used": tok, "cost": c}),
            );
        }

        Ok(json!({
            "period_days": days,
            "total_requests": total,
            "total_tokens": tokens,
            "total_cost": cost,
            "unique_users": unique_users,
            "features": features,
        }))
    }

    #[cfg(test)]
    pub fn usage_count_for(&self, user_id: i64, feature_id: &str) -> i64 {
        let db = self.conn();
        db.query_row(
            "SELECT COUNT(*) FROM ai_usage_log WHERE user_id = ?1 AND feature_id = ?2",
            params![user_id, feature_id],
            |r| r.get(0),
        )
        .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn usage_count_with_provider(&self, user_id: i64, feature_id: &str) -> i64 {
        let db = self.conn();
        db.query_row(
            "SELECT COUNT(*) FROM ai_usage_log \
             WHERE user_id = ?1 AND feature_id = ?2 AND api_provider IS NOT NULL",
            params![user_id, feature_id],
            |r| r.get(0),
        )
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_feature_stats() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_usage(&UsageRecord {
                user_id: Some(7),
                feature_id: "ai_suggestions",
                api_provider: Some("gemini"),
                tokens_used: Some(120),
                estimated_cost: Some(0.002),
                response_time_ms: Some(340),
                success: true,
                ..Default::default()
            })
            .unwrap();
        store
            .append_usage(&UsageRecord {
                user_id: Some(7),
                feature_id: "ai_suggestions",
                success: false,
                error_message: Some("all AI providers failed"),
                ..Default::default()
            })
            .unwrap();

        let stats = store.feature_usage_stats("ai_suggestions", 30).unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 120);
        assert!((stats.success_rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_user_stats_and_summary() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            store
                .append_usage(&UsageRecord {
                    user_id: Some(1),
                    feature_id: "ai_nlp_entry",
                    tokens_used: Some(10),
                    success: true,
                    ..Default::default()
                })
                .unwrap();
        }
        store
            .append_usage(&UsageRecord {
                user_id: Some(2),
                feature_id: "ai_report_summaries",
                success: true,
                ..Default::default()
            })
            .unwrap();

        let user = store.user_usage_stats(1, 30).unwrap();
        assert_eq!(user["total_tokens"], 30);
        assert_eq!(user["features"]["ai_nlp_entry"]["request_count"], 3);

        let summary = store.usage_summary(30).unwrap();
        assert_eq!(summary["total_requests"], 4);
        assert_eq!(summary["unique_users"], 2);
    }

    #[test]
    fn test_metadata_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_usage(&UsageRecord {
                user_id: Some(3),
                feature_id: "ai_suggestions",
                success: true,
                metadata: Some(json!({"accepted": true, "suggestion_project_id": 42})),
                ..Default::default()
            })
            .unwrap();
        let db = store.conn();
        let raw: String = db
            .query_row(
                "SELECT request_metadata FROM ai_usage_log WHERE user_id = 3",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["suggestion_project_id"], 42);
    }
}
