//! Suggestion engine — pattern-first, AI-second project/task suggestions.
//!
//! Four pattern strategies run against the user's recent history; the
//! provider is only consulted when they leave room under the requested
//! limit. Candidates carry their provenance so callers can tell where a
//! value came from.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::AiCache;
use crate::config::AiConfig;
use crate::context::{SuggestionFeatures, TimeContext, TimeOfDay, UserContext};
use crate::error::{AiError, AiResult};
use crate::features::FeatureGate;
use crate::prompts;
use crate::providers::client::{AiClient, GenerateRequest};
use crate::store::usage::UsageRecord;
use crate::store::Store;

const FEATURE_ID: &str = "ai_suggestions";

/// Where a suggestion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionSource {
    Pattern,
    Recent,
    Ai,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub project_id: i64,
    pub project_name: String,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
    pub suggested_description: Option<String>,
    pub confidence: f64,
    pub reason: String,
    pub source: SuggestionSource,
}

pub struct SuggestionEngine {
    store: Arc<Store>,
    cache: Arc<AiCache>,
    gate: Arc<FeatureGate>,
    client: Arc<AiClient>,
    cfg: Arc<AiConfig>,
}

impl SuggestionEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<AiCache>,
        gate: Arc<FeatureGate>,
        client: Arc<AiClient>,
        cfg: Arc<AiConfig>,
    ) -> Self {
        Self {
            store,
            cache,
            gate,
            client,
            cfg,
        }
    }

    /// Produce up to `limit` ranked suggestions for a user.
    pub async fn suggest(
        &self,
        user_id: i64,
        partial_description: Option<&str>,
        limit: usize,
        use_ai: bool,
    ) -> AiResult<Value> {
        let status = self.gate.status(FEATURE_ID, user_id)?;
        if !status.is_enabled {
            return Ok(json!({
                "suggestions": [],
                "enabled": false,
                "reason": status.reason,
            }));
        }

        let (allowed, count) = self.cache.check_rate_limit(user_id, 1);
        if !allowed {
            return Ok(json!({
                "suggestions": [],
                "enabled": true,
                "rate_limited": true,
                "message": format!("Rate limit exceeded ({count} requests this minute)"),
            }));
        }

        let time = TimeContext::now();
        let cache_context = json!({
            "user_id": user_id,
            "hour": time.hour,
            "day": time.day_of_week,
            "partial": partial_description.unwrap_or(""),
        });

        if let Some(cached) = self.cache.get_suggestions(user_id, &cache_context) {
            tracing::debug!(user_id, "Serving suggestions from cache");
            self.gate.log_usage(&UsageRecord {
                user_id: Some(user_id),
                feature_id: FEATURE_ID,
                success: true,
                metadata: Some(json!({"cache_hit": true})),
                ..Default::default()
            });
            return Ok(cached);
        }

        let user_context = self.build_user_context(user_id)?;
        let mut suggestions = self.pattern_suggestions(&user_context, &time, partial_description);

        let mut provider_used: Option<String> = None;
        let mut tokens_used: Option<i64> = None;
        if use_ai && suggestions.len() < limit && self.client.any_available() {
            match self
                .ai_suggestions(&user_context, &time, partial_description)
                .await
            {
                Ok((ai_suggestions, provider, tokens)) => {
                    provider_used = Some(provider);
                    tokens_used = Some(tokens);
                    let existing: Vec<i64> = suggestions.iter().map(|s| s.project_id).collect();
                    for s in ai_suggestions {
                        if !existing.contains(&s.project_id) {
                            suggestions.push(s);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "AI suggestions failed, using pattern-only");
                }
            }
        }

        // Rank, trim, and drop weak candidates
        suggestions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        suggestions.truncate(limit);
        suggestions.retain(|s| s.confidence >= self.cfg.suggestion_confidence_threshold);

        let total_found = suggestions.len();
        let result = json!({
            "suggestions": suggestions,
            "enabled": true,
            "total_found": total_found,
            "context": {
                "time_of_day": time.time_of_day.as_str(),
                "day_of_week": time.day_of_week,
            },
        });

        if total_found > 0 {
            self.cache.set_suggestions(user_id, &cache_context, &result);
        }

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            api_provider: provider_used.as_deref(),
            tokens_used,
            success: true,
            ..Default::default()
        });

        Ok(result)
    }

    fn build_user_context(&self, user_id: i64) -> AiResult<UserContext> {
        let user = self
            .store
            .user(user_id)?
            .ok_or_else(|| AiError::NotFound(format!("user {user_id}")))?;
        let since = Utc::now() - Duration::days(self.cfg.suggestion_lookback_days);
        let entries = self.store.recent_entries(user_id, since, 100)?;
        let projects = self.store.active_projects(50)?;
        Ok(UserContext::new(
            user_id,
            user.name,
            user.expected_hours_per_week,
            entries,
            projects,
        ))
    }

    fn pattern_suggestions(
        &self,
        user: &UserContext,
        time: &TimeContext,
        partial_description: Option<&str>,
    ) -> Vec<Suggestion> {
        let features = SuggestionFeatures::compute(&user.recent_entries, partial_description);
        let project_names: HashMap<i64, &str> = user
            .active_projects
            .iter()
            .map(|p| (p.id, p.name.as_str()))
            .collect();
        let mut suggestions: Vec<Suggestion> = Vec::new();

        // Frequency: top projects by recent usage share
        for (project_id, _) in user.most_common_projects.iter().take(3) {
            if let Some(name) = project_names.get(project_id) {
                let share = features.project_frequencies.get(project_id).copied().unwrap_or(0.0);
                suggestions.push(Suggestion {
                    project_id: *project_id,
                    project_name: name.to_string(),
                    task_id: None,
                    task_name: None,
                    suggested_description: None,
                    confidence: (0.5 + share * 0.5).min(0.9),
                    reason: "Frequently used project".into(),
                    source: SuggestionSource::Pattern,
                });
            }
        }

        // Time-slot: what this user works on at this time of day
        let slot = match time.time_of_day {
            TimeOfDay::EarlyMorning | TimeOfDay::Morning => Some("morning"),
            TimeOfDay::Afternoon => Some("afternoon"),
            TimeOfDay::Evening => Some("evening"),
            TimeOfDay::Night => None,
        };
        if let Some(slot) = slot {
            if let Some(slot_projects) = features.time_slot_patterns.get(slot) {
                for project_id in slot_projects.iter().take(2) {
                    if suggestions.iter().any(|s| s.project_id == *project_id) {
                        continue;
                    }
                    if let Some(name) = project_names.get(project_id) {
                        suggestions.push(Suggestion {
                            project_id: *project_id,
                            project_name: name.to_string(),
                            task_id: None,
                            task_name: None,
                            suggested_description: None,
                            confidence: 0.6,
                            reason: format!("Often used in the {slot}"),
                            source: SuggestionSource::Pattern,
                        });
                    }
                }
            }
        }

        // Recency: the most recent entry carries task and description through
        if let Some(recent) = user.recent_entries.first() {
            if !suggestions.iter().any(|s| s.project_id == recent.project_id) {
                if let Some(name) = project_names.get(&recent.project_id) {
                    suggestions.push(Suggestion {
                        project_id: recent.project_id,
                        project_name: name.to_string(),
                        task_id: recent.task_id,
                        task_name: recent.task_name.clone(),
                        suggested_description: recent.description.clone(),
                        confidence: 0.7,
                        reason: "Your most recent entry".into(),
                        source: SuggestionSource::Recent,
                    });
                }
            }
        }

        // Keyword: match the partial description against recent entries
        if !features.description_keywords.is_empty() {
            for entry in user.recent_entries.iter().take(20) {
                let desc = entry.description.as_deref().unwrap_or("").to_lowercase();
                let matches = features
                    .description_keywords
                    .iter()
                    .filter(|kw| desc.contains(kw.as_str()))
                    .count();
                if matches == 0 {
                    continue;
                }
                if suggestions.iter().any(|s| s.project_id == entry.project_id) {
                    continue;
                }
                if let Some(name) = project_names.get(&entry.project_id) {
                    suggestions.push(Suggestion {
                        project_id: entry.project_id,
                        project_name: name.to_string(),
                        task_id: entry.task_id,
                        task_name: entry.task_name.clone(),
                        suggested_description: entry.description.clone(),
                        confidence: 0.5 + matches as f64 * 0.1,
                        reason: "Matches your description".into(),
                        source: SuggestionSource::Pattern,
                    });
                    break;
                }
            }
        }

        suggestions
    }

    /// Ask the provider for candidates; only projects in the active set are
    /// kept. Returns the accepted suggestions plus provider accounting.
    async fn ai_suggestions(
        &self,
        user: &UserContext,
        time: &TimeContext,
        partial_description: Option<&str>,
    ) -> AiResult<(Vec<Suggestion>, String, i64)> {
        let outcome = self
            .client
            .generate(&GenerateRequest {
                system_prompt: prompts::suggestion_system_prompt(),
                user_prompt: prompts::suggestion_user_prompt(user, time, partial_description),
                max_tokens: Some(500),
                ..Default::default()
            })
            .await?;

        let project_names: HashMap<i64, &str> = user
            .active_projects
            .iter()
            .map(|p| (p.id, p.name.as_str()))
            .collect();

        let mut suggestions = Vec::new();
        if let Some(items) = outcome.parsed["suggestions"].as_array() {
            for item in items.iter().take(5) {
                let project_id = match item["project_id"].as_i64() {
                    Some(id) if project_names.contains_key(&id) => id,
                    _ => continue,
                };
                suggestions.push(Suggestion {
                    project_id,
                    project_name: item["project_name"]
                        .as_str()
                        .unwrap_or(project_names[&project_id])
                        .to_string(),
                    task_id: item["task_id"].as_i64(),
                    task_name: item["task_name"].as_str().map(String::from),
                    suggested_description: item["suggested_description"].as_str().map(String::from),
                    confidence: item["confidence"].as_f64().unwrap_or(0.5),
                    reason: item["reason"].as_str().unwrap_or("AI suggested").to_string(),
                    source: SuggestionSource::Ai,
                });
            }
        }

        Ok((suggestions, outcome.provider, outcome.usage.total()))
    }

    /// Record whether a suggestion was taken; feeds future ranking work.
    pub fn record_feedback(
        &self,
        user_id: i64,
        suggestion_project_id: i64,
        accepted: bool,
        actual_project_id: Option<i64>,
    ) -> AiResult<()> {
        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(json!({
                "suggestion_project_id": suggestion_project_id,
                "accepted": accepted,
                "actual_project_id": actual_project_id,
            })),
            ..Default::default()
        });
        Ok(())
    }
}
