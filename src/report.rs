//! Report summaries: weekly metrics with derived insights and an AI
//! narrative (with a deterministic fallback), project health scoring and
//! per-user insights.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::anomaly::baseline::round2;
use crate::error::{AiError, AiResult};
use crate::features::FeatureGate;
use crate::prompts;
use crate::providers::client::{AiClient, GenerateRequest};
use crate::store::usage::UsageRecord;
use crate::store::Store;

const FEATURE_ID: &str = "ai_report_summaries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Productivity,
    ProjectHealth,
    TeamPerformance,
    Workload,
    Trend,
    Recommendation,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub title: String,
    pub description: String,
    pub severity: InsightSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_label: Option<String>,
    pub action_items: Vec<String>,
}

struct WeeklyMetrics {
    week_start: NaiveDate,
    week_end: NaiveDate,
    user_count: usize,
    total_hours: f64,
    last_week_hours: f64,
    hours_change_pct: f64,
    projects_count: i64,
    top_projects: Vec<(String, f64)>,
    daily_hours: Vec<(NaiveDate, f64)>,
    avg_daily_hours: f64,
    max_daily_hours: f64,
    min_daily_hours: f64,
}

impl WeeklyMetrics {
    fn to_json(&self) -> Value {
        json!({
            "week_start": self.week_start.to_string(),
            "week_end": self.week_end.to_string(),
            "user_count": self.user_count,
            "total_hours": round2(self.total_hours),
            "last_week_hours": round2(self.last_week_hours),
            "hours_change_pct": round2(self.hours_change_pct),
            "projects_count": self.projects_count,
            "top_projects": self.top_projects
                .iter()
                .map(|(name, hours)| json!({"name": name, "hours": round2(*hours)}))
                .collect::<Vec<_>>(),
            "daily_hours": self.daily_hours
                .iter()
                .map(|(date, hours)| json!({"date": date.to_string(), "hours": round2(*hours)}))
                .collect::<Vec<_>>(),
            "avg_daily_hours": round2(self.avg_daily_hours),
            "max_daily_hours": round2(self.max_daily_hours),
            "min_daily_hours": round2(self.min_daily_hours),
        })
    }
}

pub struct ReportSummarizer {
    store: Arc<Store>,
    gate: Arc<FeatureGate>,
    client: Arc<AiClient>,
}

impl ReportSummarizer {
    pub fn new(store: Arc<Store>, gate: Arc<FeatureGate>, client: Arc<AiClient>) -> Self {
        Self { store, gate, client }
    }

    fn disabled(&self, user_id: i64) -> AiResult<Option<Value>> {
        let status = self.gate.status(FEATURE_ID, user_id)?;
        if status.is_enabled {
            return Ok(None);
        }
        Ok(Some(json!({
            "success": false,
            "enabled": false,
            "reason": status.reason,
        })))
    }

    // ── Weekly summary ──────────────────────────────────────────────

    pub async fn weekly_report(
        &self,
        user_id: i64,
        team_id: Option<i64>,
        use_ai: bool,
    ) -> AiResult<Value> {
        if let Some(disabled) = self.disabled(user_id)? {
            return Ok(disabled);
        }

        let today = Utc::now().date_naive();
        let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        let week_end = week_start + Duration::days(6);

        let user_ids: Vec<i64> = match team_id {
            Some(team) => self.store.active_users(Some(team))?.iter().map(|u| u.id).collect(),
            None => vec![user_id],
        };

        let metrics = self.gather_weekly_metrics(&user_ids, week_start, week_end)?;
        let insights = derive_insights(&metrics);

        let (summary_text, provider_used) = if use_ai && self.client.any_available() {
            match self.ai_summary(&metrics, &insights).await {
                Ok((text, provider)) => (text, Some(provider)),
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "AI summary failed, using template");
                    (template_summary(&metrics), None)
                }
            }
        } else {
            (template_summary(&metrics), None)
        };

        let highlights = extract_highlights(&metrics);
        let attention: Vec<Value> = insights
            .iter()
            .filter(|i| i.severity != InsightSeverity::Info)
            .map(|i| {
                json!({
                    "title": i.title,
                    "description": i.description,
                    "severity": i.severity,
                    "actions": i.action_items,
                })
            })
            .collect();
        let recommendations = derive_recommendations(&metrics, &insights);

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            api_provider: provider_used.as_deref(),
            success: true,
            metadata: Some(json!({"period": "weekly", "used_ai": provider_used.is_some()})),
            ..Default::default()
        });

        Ok(json!({
            "success": true,
            "enabled": true,
            "summary": {
                "period_start": week_start.to_string(),
                "period_end": week_end.to_string(),
                "summary_text": summary_text,
                "highlights": highlights,
                "attention_needed": attention,
                "recommendations": recommendations,
                "insights": insights,
                "metrics": metrics.to_json(),
                "generated_at": Utc::now().to_rfc3339(),
            },
        }))
    }

    fn gather_weekly_metrics(
        &self,
        user_ids: &[i64],
        week_start: NaiveDate,
        week_end: NaiveDate,
    ) -> AiResult<WeeklyMetrics> {
        let total_hours = self.store.group_hours_between(user_ids, week_start, week_end)?;
        let last_week_hours = self.store.group_hours_between(
            user_ids,
            week_start - Duration::days(7),
            week_end - Duration::days(7),
        )?;
        let hours_change_pct = if last_week_hours > 0.0 {
            (total_hours - last_week_hours) / last_week_hours * 100.0
        } else {
            0.0
        };

        let projects_count = self.store.group_project_count(user_ids, week_start, week_end)?;
        let top_projects = self.store.group_top_projects(user_ids, week_start, week_end, 5)?;
        let daily_hours = self.store.group_daily_hours(user_ids, week_start, week_end)?;

        let (avg, max, min) = if daily_hours.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let hours: Vec<f64> = daily_hours.iter().map(|(_, h)| *h).collect();
            (
                hours.iter().sum::<f64>() / hours.len() as f64,
                hours.iter().copied().fold(0.0, f64::max),
                hours.iter().copied().fold(f64::INFINITY, f64::min),
            )
        };

        Ok(WeeklyMetrics {
            week_start,
            week_end,
            user_count: user_ids.len(),
            total_hours,
            last_week_hours,
            hours_change_pct,
            projects_count,
            top_projects,
            daily_hours,
            avg_daily_hours: avg,
            max_daily_hours: max,
            min_daily_hours: if min.is_finite() { min } else { 0.0 },
        })
    }

    async fn ai_summary(
        &self,
        metrics: &WeeklyMetrics,
        insights: &[Insight],
    ) -> AiResult<(String, String)> {
        let observations: Vec<String> = insights.iter().take(3).map(|i| i.description.clone()).collect();
        let outcome = self
            .client
            .generate(&GenerateRequest {
                system_prompt: prompts::summary_system_prompt(),
                user_prompt: prompts::weekly_summary_prompt(
                    metrics.total_hours,
                    metrics.hours_change_pct,
                    metrics.projects_count,
                    metrics.avg_daily_hours,
                    metrics.top_projects.first().map(|(name, _)| name.as_str()),
                    &observations,
                    Utc::now(),
                ),
                max_tokens: Some(200),
                ..Default::default()
            })
            .await?;

        let text = outcome.parsed["raw_text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| outcome.raw_response.trim().to_string());
        if text.is_empty() {
            return Err(AiError::InvalidResponse {
                provider: outcome.provider,
                message: "empty summary".into(),
            });
        }
        Ok((text, outcome.provider))
    }

    // ── Project health ──────────────────────────────────────────────

    pub fn project_health(&self, user_id: i64, project_id: i64) -> AiResult<Value> {
        if let Some(disabled) = self.disabled(user_id)? {
            return Ok(disabled);
        }

        let project = self
            .store
            .project(project_id)?
            .ok_or_else(|| AiError::NotFound(format!("project {project_id}")))?;

        let today = Utc::now().date_naive();
        let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        let last_week_start = week_start - Duration::days(7);

        let total_hours = self.store.project_total_hours(project_id)?;
        let this_week = self.store.project_hours_between(project_id, week_start, today)?;
        let last_week =
            self.store
                .project_hours_between(project_id, last_week_start, week_start - Duration::days(1))?;

        let activity_trend = if last_week > 0.0 {
            if this_week > last_week * 1.1 {
                "increasing"
            } else if this_week < last_week * 0.9 {
                "decreasing"
            } else {
                "stable"
            }
        } else {
            "new"
        };

        let (total_tasks, completed_tasks) = self.store.project_task_stats(project_id)?;
        let completion_rate = if total_tasks > 0 {
            completed_tasks as f64 / total_tasks as f64
        } else {
            0.0
        };
        let contributor_count = self.store.project_contributor_count(project_id)?;

        let health_score = health_score(completion_rate, activity_trend, contributor_count);

        let mut insights: Vec<Insight> = Vec::new();
        match activity_trend {
            "increasing" => insights.push(Insight {
                insight_type: InsightType::Trend,
                title: "Increasing Activity".into(),
                description: "Project activity has increased over the past week".into(),
                severity: InsightSeverity::Info,
                metric_value: None,
                metric_label: None,
                action_items: vec![],
            }),
            "decreasing" => insights.push(Insight {
                insight_type: InsightType::Trend,
                title: "Decreasing Activity".into(),
                description: "Project activity has decreased - consider a status check".into(),
                severity: InsightSeverity::Warning,
                metric_value: None,
                metric_label: None,
                action_items: vec![],
            }),
            _ => {}
        }
        if total_tasks > 0 && completion_rate < 0.3 {
            insights.push(Insight {
                insight_type: InsightType::ProjectHealth,
                title: "Low Task Completion".into(),
                description: format!(
                    "Only {:.0}% of tasks completed",
                    completion_rate * 100.0
                ),
                severity: InsightSeverity::Warning,
                metric_value: Some(round2(completion_rate * 100.0)),
                metric_label: Some("% complete".into()),
                action_items: vec![
                    "Review blocked tasks".into(),
                    "Reassess task priorities".into(),
                ],
            });
        }
        if contributor_count == 1 {
            insights.push(Insight {
                insight_type: InsightType::Workload,
                title: "Single Contributor".into(),
                description: "Only one person is logging time on this project".into(),
                severity: InsightSeverity::Info,
                metric_value: None,
                metric_label: None,
                action_items: vec!["Consider knowledge sharing sessions".into()],
            });
        }

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(json!({"report": "project_health", "project_id": project_id})),
            ..Default::default()
        });

        Ok(json!({
            "success": true,
            "enabled": true,
            "project_id": project_id,
            "project_name": project.name,
            "health_score": health_score,
            "health_status": health_status(health_score),
            "metrics": {
                "total_hours": round2(total_hours),
                "this_week_hours": round2(this_week),
                "last_week_hours": round2(last_week),
                "activity_trend": activity_trend,
                "total_tasks": total_tasks,
                "completed_tasks": completed_tasks,
                "task_completion_rate": round2(completion_rate),
                "contributor_count": contributor_count,
            },
            "insights": insights,
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }

    // ── User insights ───────────────────────────────────────────────

    pub fn user_insights(&self, user_id: i64, target_user_id: Option<i64>) -> AiResult<Value> {
        if let Some(disabled) = self.disabled(user_id)? {
            return Ok(disabled);
        }

        let target = target_user_id.unwrap_or(user_id);
        let user = self
            .store
            .user(target)?
            .ok_or_else(|| AiError::NotFound(format!("user {target}")))?;

        let today = Utc::now().date_naive();
        let thirty_days_ago = today - Duration::days(30);
        let daily = self.store.user_daily_hours(target, thirty_days_ago)?;
        let total_hours: f64 = daily.iter().map(|(_, h)| h).sum();
        let work_days = daily.len().max(1);
        let avg_daily = total_hours / work_days as f64;
        let active_projects =
            self.store.group_project_count(&[target], thirty_days_ago, today)?;

        // Last two seven-day slices, most recent last
        let week1 = self.store.user_hours_between(
            target,
            today - Duration::days(14),
            today - Duration::days(8),
        )?;
        let week2 = self.store.user_hours_between(target, today - Duration::days(7), today)?;
        let productivity_trend = if week1 > 0.0 {
            if week2 > week1 * 1.1 {
                "improving"
            } else if week2 < week1 * 0.9 {
                "declining"
            } else {
                "stable"
            }
        } else {
            "new"
        };

        let mut insights: Vec<Insight> = Vec::new();
        if avg_daily > 10.0 {
            insights.push(Insight {
                insight_type: InsightType::Workload,
                title: "High Work Hours".into(),
                description: format!("Average {avg_daily:.1} hours/day - consider workload review"),
                severity: InsightSeverity::Warning,
                metric_value: Some(round2(avg_daily)),
                metric_label: Some("hours/day".into()),
                action_items: vec!["Review task priorities".into(), "Consider delegation".into()],
            });
        } else if avg_daily < 4.0 && user.expected_hours_per_week >= 40.0 && total_hours > 0.0 {
            insights.push(Insight {
                insight_type: InsightType::Workload,
                title: "Low Logged Hours".into(),
                description: format!("Average {avg_daily:.1} hours/day logged"),
                severity: InsightSeverity::Info,
                metric_value: Some(round2(avg_daily)),
                metric_label: Some("hours/day".into()),
                action_items: vec!["Ensure all time is being logged".into()],
            });
        }
        if productivity_trend == "improving" {
            insights.push(Insight {
                insight_type: InsightType::Productivity,
                title: "Improving Productivity".into(),
                description: "Time logging consistency has improved".into(),
                severity: InsightSeverity::Info,
                metric_value: None,
                metric_label: None,
                action_items: vec![],
            });
        }
        if active_projects > 5 {
            insights.push(Insight {
                insight_type: InsightType::Workload,
                title: "Many Active Projects".into(),
                description: format!("Working on {active_projects} projects - may impact focus"),
                severity: InsightSeverity::Info,
                metric_value: Some(active_projects as f64),
                metric_label: Some("projects".into()),
                action_items: vec![],
            });
        }

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(json!({"report": "user_insights", "target_user_id": target})),
            ..Default::default()
        });

        Ok(json!({
            "success": true,
            "enabled": true,
            "user_id": target,
            "metrics": {
                "user_name": user.name,
                "expected_hours": user.expected_hours_per_week,
                "total_hours_30d": round2(total_hours),
                "avg_daily_hours": round2(avg_daily),
                "active_projects": active_projects,
                "productivity_trend": productivity_trend,
            },
            "insights": insights,
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }
}

// ── Derivations ─────────────────────────────────────────────────────

fn derive_insights(metrics: &WeeklyMetrics) -> Vec<Insight> {
    let mut insights = Vec::new();

    if metrics.hours_change_pct > 20.0 {
        insights.push(Insight {
            insight_type: InsightType::Trend,
            title: "Hours Increased".into(),
            description: format!(
                "Time logged increased {:.0}% vs last week",
                metrics.hours_change_pct
            ),
            severity: InsightSeverity::Info,
            metric_value: Some(round2(metrics.hours_change_pct)),
            metric_label: Some("% change".into()),
            action_items: vec![],
        });
    } else if metrics.hours_change_pct < -20.0 {
        insights.push(Insight {
            insight_type: InsightType::Trend,
            title: "Hours Decreased".into(),
            description: format!(
                "Time logged decreased {:.0}% vs last week",
                metrics.hours_change_pct.abs()
            ),
            severity: InsightSeverity::Warning,
            metric_value: Some(round2(metrics.hours_change_pct)),
            metric_label: Some("% change".into()),
            action_items: vec![],
        });
    }

    if metrics.max_daily_hours > 10.0 {
        insights.push(Insight {
            insight_type: InsightType::Workload,
            title: "Long Work Day".into(),
            description: format!("Peak day had {:.1} hours logged", metrics.max_daily_hours),
            severity: if metrics.max_daily_hours > 12.0 {
                InsightSeverity::Critical
            } else {
                InsightSeverity::Warning
            },
            metric_value: Some(round2(metrics.max_daily_hours)),
            metric_label: Some("hours".into()),
            action_items: vec![],
        });
    }

    if metrics.projects_count > 5 {
        insights.push(Insight {
            insight_type: InsightType::Workload,
            title: "Multi-Project Week".into(),
            description: format!("Work spread across {} projects", metrics.projects_count),
            severity: InsightSeverity::Info,
            metric_value: Some(metrics.projects_count as f64),
            metric_label: Some("projects".into()),
            action_items: vec!["Consider focusing on fewer projects for better efficiency".into()],
        });
    }

    insights
}

fn template_summary(metrics: &WeeklyMetrics) -> String {
    let mut parts = vec![format!(
        "This week you logged {:.1} hours across {} projects.",
        metrics.total_hours, metrics.projects_count
    )];
    if metrics.hours_change_pct > 10.0 {
        parts.push(format!(
            "That's {:.0}% more than last week.",
            metrics.hours_change_pct
        ));
    } else if metrics.hours_change_pct < -10.0 {
        parts.push(format!(
            "That's {:.0}% less than last week.",
            metrics.hours_change_pct.abs()
        ));
    }
    parts.join(" ")
}

fn extract_highlights(metrics: &WeeklyMetrics) -> Vec<String> {
    let mut highlights = Vec::new();
    if metrics.total_hours > 0.0 {
        highlights.push(format!("Logged {:.1} hours this week", metrics.total_hours));
    }
    if let Some((name, hours)) = metrics.top_projects.first() {
        highlights.push(format!("Most time on: {name} ({hours:.1}h)"));
    }
    if metrics.hours_change_pct.abs() > 10.0 {
        let direction = if metrics.hours_change_pct > 0.0 { "up" } else { "down" };
        highlights.push(format!(
            "Productivity {direction} {:.0}% vs last week",
            metrics.hours_change_pct.abs()
        ));
    }
    highlights.truncate(5);
    highlights
}

fn derive_recommendations(metrics: &WeeklyMetrics, insights: &[Insight]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut recommendations = Vec::new();
    let mut push = |rec: String, seen: &mut HashSet<String>, out: &mut Vec<String>| {
        if seen.insert(rec.clone()) {
            out.push(rec);
        }
    };

    for insight in insights {
        for action in &insight.action_items {
            push(action.clone(), &mut seen, &mut recommendations);
        }
    }
    if metrics.avg_daily_hours > 9.0 {
        push(
            "Consider reviewing workload distribution".into(),
            &mut seen,
            &mut recommendations,
        );
    }
    if metrics.projects_count > 6 {
        push(
            "Try to focus on fewer projects for better efficiency".into(),
            &mut seen,
            &mut recommendations,
        );
    }
    recommendations.truncate(5);
    recommendations
}

/// Start at 100 and deduct for weak completion, fading activity and
/// bus-factor risk.
fn health_score(completion_rate: f64, activity_trend: &str, contributors: i64) -> i64 {
    let mut score = 100.0;
    score -= ((0.5 - completion_rate) * 40.0).max(0.0);
    match activity_trend {
        "decreasing" => score -= 15.0,
        "new" => score -= 5.0,
        _ => {}
    }
    if contributors == 1 {
        score -= 10.0;
    }
    (score.clamp(0.0, 100.0)) as i64
}

fn health_status(score: i64) -> &'static str {
    if score >= 80 {
        "healthy"
    } else if score >= 60 {
        "moderate"
    } else if score >= 40 {
        "at_risk"
    } else {
        "critical"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiConfig;
    use crate::providers::client::mock::{MockAdapter, Script};
    use crate::providers::registry::CredentialRegistry;
    use crate::providers::ProviderAdapter;
    use crate::vault::Vault;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<Store>,
        summarizer: ReportSummarizer,
        user_id: i64,
        project: i64,
    }

    fn fixture_with(script: Script) -> Fixture {
        let cfg = Arc::new(AiConfig::for_tests());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vault = Arc::new(Vault::new(&cfg.master_encryption_key).unwrap());
        let registry = Arc::new(CredentialRegistry::new(store.clone(), vault));
        registry
            .create("gemini", "AIzaSyTest0123456789xyz".into(), None, None, None)
            .unwrap();
        let mut adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("gemini", Box::new(MockAdapter::new("gemini", script)));
        let client = Arc::new(AiClient::new(adapters, registry, &cfg));
        let gate = Arc::new(FeatureGate::new(store.clone()));

        let user_id = store.insert_user("Dana", 40.0).unwrap();
        let project = store.insert_project("Apollo", None, None).unwrap();
        let summarizer = ReportSummarizer::new(store.clone(), gate, client);
        Fixture {
            store,
            summarizer,
            user_id,
            project,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Script::Unavailable)
    }

    fn log_hours(f: &Fixture, date: NaiveDate, hours: f64) {
        let start = date.and_hms_opt(9, 0, 0).unwrap().and_utc();
        f.store
            .insert_time_entry(
                f.user_id,
                f.project,
                None,
                start,
                Some(start + Duration::seconds((hours * 3600.0) as i64)),
                Some((hours * 3600.0) as i64),
                "work",
            )
            .unwrap();
    }

    fn this_monday() -> NaiveDate {
        let today = Utc::now().date_naive();
        today - Duration::days(today.weekday().num_days_from_monday() as i64)
    }

    #[tokio::test]
    async fn test_weekly_report_template_fallback() {
        let f = fixture();
        // Current week: two days of work. Only use days up to today so
        // metrics are stable regardless of the weekday the test runs on.
        let monday = this_monday();
        log_hours(&f, monday, 6.0);
        // Last week for the comparison
        log_hours(&f, monday - Duration::days(7), 8.0);

        let report = f.summarizer.weekly_report(f.user_id, None, false).await.unwrap();
        assert_eq!(report["success"], true);
        let summary = &report["summary"];
        assert_eq!(summary["metrics"]["total_hours"], 6.0);
        assert_eq!(summary["metrics"]["last_week_hours"], 8.0);
        assert_eq!(summary["metrics"]["projects_count"], 1);
        let text = summary["summary_text"].as_str().unwrap();
        assert!(text.contains("6.0 hours"));
        assert!(text.contains("less than last week"), "text: {text}");
        assert!(!summary["highlights"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_weekly_report_ai_narrative() {
        let f = fixture_with(Script::Succeed(
            "A solid week with steady focus on Apollo.".into(),
        ));
        log_hours(&f, this_monday(), 5.0);
        let report = f.summarizer.weekly_report(f.user_id, None, true).await.unwrap();
        let text = report["summary"]["summary_text"].as_str().unwrap();
        assert_eq!(text, "A solid week with steady focus on Apollo.");
        // The narrative call was attributed to the provider in the ledger
        assert_eq!(f.store.usage_count_with_provider(f.user_id, FEATURE_ID), 1);
    }

    #[tokio::test]
    async fn test_weekly_report_provider_failure_degrades() {
        let f = fixture_with(Script::RateLimit);
        log_hours(&f, this_monday(), 5.0);
        let report = f.summarizer.weekly_report(f.user_id, None, true).await.unwrap();
        assert_eq!(report["success"], true);
        let text = report["summary"]["summary_text"].as_str().unwrap();
        assert!(text.contains("This week you logged"));
        assert_eq!(f.store.usage_count_with_provider(f.user_id, FEATURE_ID), 0);
    }

    #[test]
    fn test_insight_bands() {
        let base = WeeklyMetrics {
            week_start: NaiveDate::from_ymd_opt(2026, 7, 6).unwrap(),
            week_end: NaiveDate::from_ymd_opt(2026, 7, 12).unwrap(),
            user_count: 1,
            total_hours: 45.0,
            last_week_hours: 30.0,
            hours_change_pct: 50.0,
            projects_count: 7,
            top_projects: vec![("Apollo".into(), 20.0)],
            daily_hours: vec![],
            avg_daily_hours: 9.5,
            max_daily_hours: 13.0,
            min_daily_hours: 5.0,
        };
        let insights = derive_insights(&base);

        let titles: Vec<&str> = insights.iter().map(|i| i.title.as_str()).collect();
        assert!(titles.contains(&"Hours Increased"));
        assert!(titles.contains(&"Long Work Day"));
        assert!(titles.contains(&"Multi-Project Week"));

        let long_day = insights.iter().find(|i| i.title == "Long Work Day").unwrap();
        assert_eq!(long_day.severity, InsightSeverity::Critical);

        let recommendations = derive_recommendations(&base, &insights);
        assert!(recommendations.iter().any(|r| r.contains("fewer projects")));
        assert!(recommendations.iter().any(|r| r.contains("workload distribution")));
        // Deduplicated
        let unique: HashSet<&String> = recommendations.iter().collect();
        assert_eq!(unique.len(), recommendations.len());
    }

    #[test]
    fn test_insight_decrease_warning() {
        let metrics = WeeklyMetrics {
            week_start: NaiveDate::from_ymd_opt(2026, 7, 6).unwrap(),
            week_end: NaiveDate::from_ymd_opt(2026, 7, 12).unwrap(),
            user_count: 1,
            total_hours: 10.0,
            last_week_hours: 30.0,
            hours_change_pct: -66.7,
            projects_count: 1,
            top_projects: vec![],
            daily_hours: vec![],
            avg_daily_hours: 2.0,
            max_daily_hours: 4.0,
            min_daily_hours: 1.0,
        };
        let insights = derive_insights(&metrics);
        let decrease = insights.iter().find(|i| i.title == "Hours Decreased").unwrap();
        assert_eq!(decrease.severity, InsightSeverity::Warning);
    }

    #[test]
    fn test_health_score_bands() {
        // Full completion, active, team: perfect
        assert_eq!(health_score(1.0, "stable", 3), 100);
        // Weak completion costs up to 20, decreasing 15, solo 10
        assert_eq!(health_score(0.0, "decreasing", 1), 55);
        assert_eq!(health_score(0.25, "new", 1), 75);
        assert_eq!(health_status(85), "healthy");
        assert_eq!(health_status(65), "moderate");
        assert_eq!(health_status(45), "at_risk");
        assert_eq!(health_status(20), "critical");
    }

    #[test]
    fn test_project_health_report() {
        let f = fixture();
        f.store.insert_task(f.project, "Design", "DONE").unwrap();
        f.store.insert_task(f.project, "Build", "TODO").unwrap();
        f.store.insert_task(f.project, "Ship", "TODO").unwrap();
        f.store.insert_task(f.project, "Docs", "TODO").unwrap();
        log_hours(&f, this_monday(), 6.0);

        let health = f.summarizer.project_health(f.user_id, f.project).unwrap();
        assert_eq!(health["success"], true);
        assert_eq!(health["project_name"], "Apollo");
        assert_eq!(health["metrics"]["total_tasks"], 4);
        assert_eq!(health["metrics"]["completed_tasks"], 1);
        // 25% completion, "new" activity, single contributor
        assert_eq!(health["health_score"], 75);
        assert_eq!(health["health_status"], "moderate");

        let insights = health["insights"].as_array().unwrap();
        assert!(insights.iter().any(|i| i["title"] == "Low Task Completion"));
        assert!(insights.iter().any(|i| i["title"] == "Single Contributor"));
    }

    #[test]
    fn test_project_health_unknown_project() {
        let f = fixture();
        let err = f.summarizer.project_health(f.user_id, 999).unwrap_err();
        assert!(matches!(err, AiError::NotFound(_)));
    }

    #[test]
    fn test_user_insights_heavy_load() {
        let f = fixture();
        let today = Utc::now().date_naive();
        for i in 0..10 {
            log_hours(&f, today - Duration::days(i), 11.0);
        }
        let insights = f.summarizer.user_insights(f.user_id, None).unwrap();
        assert_eq!(insights["success"], true);
        assert!(insights["metrics"]["avg_daily_hours"].as_f64().unwrap() > 10.0);
        let items = insights["insights"].as_array().unwrap();
        assert!(items.iter().any(|i| i["title"] == "High Work Hours"));
    }

    #[test]
    fn test_user_insights_for_other_user() {
        let f = fixture();
        let other = f.store.insert_user("Lee", 40.0).unwrap();
        let insights = f.summarizer.user_insights(f.user_id, Some(other)).unwrap();
        assert_eq!(insights["user_id"], other);
        assert_eq!(insights["metrics"]["user_name"], "Lee");
        assert_eq!(insights["metrics"]["productivity_trend"], "new");
    }

    #[tokio::test]
    async fn test_disabled_without_credential() {
        let cfg = Arc::new(AiConfig::for_tests());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vault = Arc::new(Vault::new(&cfg.master_encryption_key).unwrap());
        let registry = Arc::new(CredentialRegistry::new(store.clone(), vault));
        let adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        let client = Arc::new(AiClient::new(adapters, registry, &cfg));
        let gate = Arc::new(FeatureGate::new(store.clone()));
        let user_id = store.insert_user("Dana", 40.0).unwrap();
        let summarizer = ReportSummarizer::new(store, gate, client);

        let report = summarizer.weekly_report(user_id, None, true).await.unwrap();
        assert_eq!(report["enabled"], false);
        assert_eq!(report["reason"], "requires gemini key");
    }
}
