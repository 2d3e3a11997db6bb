//! Anomaly detection over time-tracking data.
//!
//! Rule detectors always run; the statistical stage joins in when the
//! user has enough history to train on. Findings carry a severity and are
//! aggregated across a team sorted critical first.

pub mod baseline;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::AiCache;
use crate::config::AiConfig;
use crate::error::{AiError, AiResult};
use crate::features::FeatureGate;
use crate::store::usage::UsageRecord;
use crate::store::Store;

use baseline::{build_vectors, round2, OutlierModel, UserBaseline, FEATURE_NAMES};

const FEATURE_ID: &str = "ai_anomaly_alerts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Sort rank: critical < warning < info.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    ExtendedDay,
    ConsecutiveLongDays,
    WeekendSpike,
    MissingTime,
    DuplicateEntry,
    BurnoutRisk,
    StatisticalOutlier,
    PatternDeviation,
    BehavioralChange,
    WorkloadImbalance,
    TimePatternAnomaly,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub severity: Severity,
    pub user_id: i64,
    pub user_name: String,
    pub description: String,
    pub detected_at: chrono::DateTime<Utc>,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Per-day aggregation and the derived metrics the detectors read.
#[derive(Debug, Default)]
pub struct AnomalyFeatures {
    pub user_id: i64,
    pub user_name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub daily_hours: BTreeMap<NaiveDate, f64>,
    pub daily_entry_counts: BTreeMap<NaiveDate, i64>,

    pub total_hours: f64,
    pub avg_hours_per_day: f64,
    pub max_hours_day: f64,
    pub min_hours_day: f64,
    pub days_worked: usize,
    pub weekend_hours: f64,
    pub consecutive_long_days: u32,
    pub days_over_threshold: u32,
    pub missing_weekdays: Vec<NaiveDate>,
}

impl AnomalyFeatures {
    pub fn compute_metrics(&mut self, long_day_threshold: f64) {
        if !self.daily_hours.is_empty() {
            let hours: Vec<f64> = self.daily_hours.values().copied().collect();
            self.total_hours = hours.iter().sum();
            self.days_worked = hours.iter().filter(|h| **h > 0.0).count();
            self.avg_hours_per_day = if self.days_worked > 0 {
                self.total_hours / self.days_worked as f64
            } else {
                0.0
            };
            self.max_hours_day = hours.iter().copied().fold(0.0, f64::max);
            self.min_hours_day = hours
                .iter()
                .copied()
                .filter(|h| *h > 0.0)
                .fold(f64::INFINITY, f64::min);
            if self.min_hours_day == f64::INFINITY {
                self.min_hours_day = 0.0;
            }

            self.weekend_hours = self
                .daily_hours
                .iter()
                .filter(|(date, _)| matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
                .map(|(_, h)| h)
                .sum();

            // Longest streak of logged days at or over the threshold.
            // Iterates logged days only, so an absent weekend does not
            // break a Friday-to-Monday streak.
            let mut current = 0u32;
            let mut max = 0u32;
            for hours in self.daily_hours.values() {
                if *hours >= long_day_threshold {
                    current += 1;
                    self.days_over_threshold += 1;
                    max = max.max(current);
                } else {
                    current = 0;
                }
            }
            self.consecutive_long_days = max;
        }

        // Weekdays with under an hour logged. Saturdays and Sundays are
        // never counted as missing.
        let mut date = self.period_start;
        while date <= self.period_end {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
                && self.daily_hours.get(&date).copied().unwrap_or(0.0) < 1.0
            {
                self.missing_weekdays.push(date);
            }
            date += Duration::days(1);
        }
    }

    pub fn summary_json(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "user_name": self.user_name,
            "period_start": self.period_start.to_string(),
            "period_end": self.period_end.to_string(),
            "total_hours": round2(self.total_hours),
            "avg_hours_per_day": round2(self.avg_hours_per_day),
            "max_hours_day": round2(self.max_hours_day),
            "min_hours_day": round2(self.min_hours_day),
            "days_worked": self.days_worked,
            "weekend_hours": round2(self.weekend_hours),
            "consecutive_long_days": self.consecutive_long_days,
            "days_over_threshold": self.days_over_threshold,
            "missing_days_count": self.missing_weekdays.len(),
        })
    }
}

pub struct AnomalyDetector {
    store: Arc<Store>,
    cache: Arc<AiCache>,
    gate: Arc<FeatureGate>,
    cfg: Arc<AiConfig>,
}

impl AnomalyDetector {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<AiCache>,
        gate: Arc<FeatureGate>,
        cfg: Arc<AiConfig>,
    ) -> Self {
        Self {
            store,
            cache,
            gate,
            cfg,
        }
    }

    /// Scan one user's recent window. Cached per `(today, user)` for the
    /// anomaly TTL.
    pub fn scan_user(&self, user_id: i64, period_days: i64) -> AiResult<Value> {
        let today = Utc::now().date_naive();
        let status = self.gate.status(FEATURE_ID, user_id)?;
        if !status.is_enabled {
            return Ok(json!({
                "anomalies": [],
                "enabled": false,
                "reason": status.reason,
                "scan_date": today.to_string(),
                "period_days": period_days,
                "user_id": user_id,
            }));
        }

        let cache_date = today.to_string();
        if let Some(cached) = self.cache.get_anomalies(&cache_date, Some(user_id)) {
            self.gate.log_usage(&UsageRecord {
                user_id: Some(user_id),
                feature_id: FEATURE_ID,
                success: true,
                metadata: Some(json!({"cache_hit": true})),
                ..Default::default()
            });
            return Ok(cached);
        }

        let features = self.build_features(user_id, period_days, today)?;
        let mut findings = Vec::new();
        findings.extend(self.detect_extended_days(&features));
        findings.extend(self.detect_consecutive_long_days(&features));
        findings.extend(self.detect_weekend_spikes(&features));
        findings.extend(self.detect_missing_time(&features));
        findings.extend(self.detect_duplicates(&features)?);
        findings.extend(self.detect_burnout_risk(&features));
        findings.extend(self.detect_statistical_outliers(&features, today)?);

        let result = json!({
            "user_id": user_id,
            "user_name": features.user_name,
            "anomalies": findings,
            "summary": features.summary_json(),
            "scan_date": cache_date,
            "period_days": period_days,
            "enabled": true,
        });

        self.cache.set_anomalies(&cache_date, Some(user_id), &result);
        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            ..Default::default()
        });

        Ok(result)
    }

    /// Scan every active user (optionally one team), aggregating findings
    /// sorted by severity.
    pub fn scan_all(&self, team_id: Option<i64>, period_days: i64) -> AiResult<Value> {
        let today = Utc::now().date_naive();
        let setting = self.store.feature_setting(FEATURE_ID)?;
        if !setting.map(|s| s.is_enabled).unwrap_or(false) {
            return Ok(json!({
                "anomalies": [],
                "enabled": false,
                "scan_date": today.to_string(),
                "period_days": period_days,
                "reason": "disabled by administrator",
            }));
        }

        let users = self.store.active_users(team_id)?;
        let mut all: Vec<Value> = Vec::new();
        let mut users_scanned = 0usize;
        let mut users_with_findings = 0usize;

        for user in &users {
            let scan = self.scan_user(user.id, period_days)?;
            users_scanned += 1;
            if let Some(findings) = scan["anomalies"].as_array() {
                if !findings.is_empty() {
                    users_with_findings += 1;
                    all.extend(findings.iter().cloned());
                }
            }
        }

        all.sort_by_key(|finding| match finding["severity"].as_str() {
            Some("critical") => 0,
            Some("warning") => 1,
            Some("info") => 2,
            _ => 3,
        });

        let count = |severity: &str| {
            all.iter()
                .filter(|f| f["severity"].as_str() == Some(severity))
                .count()
        };
        let statistics = json!({
            "users_scanned": users_scanned,
            "users_with_anomalies": users_with_findings,
            "total_anomalies": all.len(),
            "critical_count": count("critical"),
            "warning_count": count("warning"),
            "info_count": count("info"),
        });

        Ok(json!({
            "anomalies": all,
            "statistics": statistics,
            "scan_date": today.to_string(),
            "period_days": period_days,
            "enabled": true,
        }))
    }

    fn build_features(
        &self,
        user_id: i64,
        period_days: i64,
        today: NaiveDate,
    ) -> AiResult<AnomalyFeatures> {
        let user = self
            .store
            .user(user_id)?
            .ok_or_else(|| AiError::NotFound(format!("user {user_id}")))?;

        let period_start = today - Duration::days(period_days);
        let entries = self.store.completed_entries_between(user_id, period_start, today)?;

        let mut features = AnomalyFeatures {
            user_id,
            user_name: user.name,
            period_start,
            period_end: today,
            ..Default::default()
        };
        for entry in &entries {
            let date = entry.start_time.date_naive();
            *features.daily_hours.entry(date).or_default() += entry.hours();
            *features.daily_entry_counts.entry(date).or_default() += 1;
        }
        features.compute_metrics(self.cfg.anomaly_long_day_hours);
        Ok(features)
    }

    // ── Rule detectors ──────────────────────────────────────────────

    fn detect_extended_days(&self, features: &AnomalyFeatures) -> Vec<Finding> {
        let threshold = self.cfg.anomaly_extended_day_hours;
        features
            .daily_hours
            .iter()
            .filter(|(_, hours)| **hours >= threshold)
            .map(|(date, hours)| Finding {
                finding_type: FindingType::ExtendedDay,
                severity: if *hours < 14.0 {
                    Severity::Warning
                } else {
                    Severity::Critical
                },
                user_id: features.user_id,
                user_name: features.user_name.clone(),
                description: format!("Extended work day: {hours:.1} hours on {date}"),
                detected_at: Utc::now(),
                details: json!({
                    "date": date.to_string(),
                    "hours": round2(*hours),
                    "threshold": threshold,
                }),
                recommendation: Some(
                    "Consider taking breaks and maintaining work-life balance".into(),
                ),
                confidence: None,
            })
            .collect()
    }

    fn detect_consecutive_long_days(&self, features: &AnomalyFeatures) -> Vec<Finding> {
        if features.consecutive_long_days < self.cfg.anomaly_consecutive_long_days {
            return vec![];
        }
        vec![Finding {
            finding_type: FindingType::ConsecutiveLongDays,
            severity: Severity::Critical,
            user_id: features.user_id,
            user_name: features.user_name.clone(),
            description: format!(
                "{} consecutive days with {}+ hours",
                features.consecutive_long_days, self.cfg.anomaly_long_day_hours,
            ),
            detected_at: Utc::now(),
            details: json!({
                "consecutive_days": features.consecutive_long_days,
                "threshold_hours": self.cfg.anomaly_long_day_hours,
                "threshold_days": self.cfg.anomaly_consecutive_long_days,
            }),
            recommendation: Some(
                "This pattern may indicate burnout risk. Consider workload review.".into(),
            ),
            confidence: None,
        }]
    }

    fn detect_weekend_spikes(&self, features: &AnomalyFeatures) -> Vec<Finding> {
        if features.weekend_hours < self.cfg.anomaly_weekend_hours {
            return vec![];
        }
        vec![Finding {
            finding_type: FindingType::WeekendSpike,
            severity: if features.weekend_hours < 8.0 {
                Severity::Info
            } else {
                Severity::Warning
            },
            user_id: features.user_id,
            user_name: features.user_name.clone(),
            description: format!("Weekend work spike: {:.1} hours", features.weekend_hours),
            detected_at: Utc::now(),
            details: json!({
                "weekend_hours": round2(features.weekend_hours),
                "threshold": self.cfg.anomaly_weekend_hours,
            }),
            recommendation: Some(
                "Ensure weekend work is planned and compensated appropriately".into(),
            ),
            confidence: None,
        }]
    }

    fn detect_missing_time(&self, features: &AnomalyFeatures) -> Vec<Finding> {
        if features.missing_weekdays.len() < 2 {
            return vec![];
        }
        vec![Finding {
            finding_type: FindingType::MissingTime,
            severity: Severity::Info,
            user_id: features.user_id,
            user_name: features.user_name.clone(),
            description: format!(
                "Missing time entries for {} weekdays",
                features.missing_weekdays.len(),
            ),
            detected_at: Utc::now(),
            details: json!({
                "missing_days": features.missing_weekdays
                    .iter()
                    .take(5)
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>(),
                "total_missing": features.missing_weekdays.len(),
            }),
            recommendation: Some("Consider filling in missing time entries".into()),
            confidence: None,
        }]
    }

    fn detect_duplicates(&self, features: &AnomalyFeatures) -> AiResult<Vec<Finding>> {
        let groups =
            self.store
                .duplicate_entry_groups(features.user_id, features.period_start, 3)?;
        Ok(groups
            .into_iter()
            .map(|(date, project_id, count)| Finding {
                finding_type: FindingType::DuplicateEntry,
                severity: Severity::Info,
                user_id: features.user_id,
                user_name: features.user_name.clone(),
                description: format!("Multiple entries ({count}) for same project on {date}"),
                detected_at: Utc::now(),
                details: json!({
                    "date": date,
                    "project_id": project_id,
                    "entry_count": count,
                }),
                recommendation: Some(
                    "Review entries for potential duplicates or consolidation".into(),
                ),
                confidence: None,
            })
            .collect())
    }

    fn detect_burnout_risk(&self, features: &AnomalyFeatures) -> Vec<Finding> {
        let mut score = 0u32;
        let mut factors: Vec<String> = Vec::new();

        if features.avg_hours_per_day > 9.0 {
            score += 20;
            factors.push(format!("High avg hours ({:.1}h/day)", features.avg_hours_per_day));
        }
        if features.consecutive_long_days >= 3 {
            score += 30;
            factors.push(format!("{} consecutive long days", features.consecutive_long_days));
        }
        if features.weekend_hours > 4.0 {
            score += 15;
            factors.push(format!("Weekend work ({:.1}h)", features.weekend_hours));
        }
        if features.max_hours_day > 12.0 {
            score += 20;
            factors.push(format!("Max {:.1}h in single day", features.max_hours_day));
        }
        if features.days_worked == 7 {
            score += 15;
            factors.push("No days off in period".into());
        }

        if score < 40 {
            return vec![];
        }
        vec![Finding {
            finding_type: FindingType::BurnoutRisk,
            severity: if score >= 60 {
                Severity::Critical
            } else {
                Severity::Warning
            },
            user_id: features.user_id,
            user_name: features.user_name.clone(),
            description: format!("Potential burnout risk detected (score: {score}/100)"),
            detected_at: Utc::now(),
            details: json!({
                "risk_score": score,
                "risk_factors": factors,
                "period_stats": features.summary_json(),
            }),
            recommendation: Some(
                "Consider discussing workload and wellbeing with manager. \
                 Regular breaks and time off are important for sustained productivity."
                    .into(),
            ),
            confidence: None,
        }]
    }

    // ── Statistical stage ───────────────────────────────────────────

    /// Outlier scoring against the user's baseline. Degrades to nothing
    /// when history is shorter than the training minimum.
    fn detect_statistical_outliers(
        &self,
        features: &AnomalyFeatures,
        today: NaiveDate,
    ) -> AiResult<Vec<Finding>> {
        let baseline_start = today - Duration::days(self.cfg.baseline_days);
        let history = self.store.user_day_aggregates(features.user_id, baseline_start)?;
        let user_baseline = UserBaseline::compute(features.user_id, &history);
        let vectors = build_vectors(&history, &user_baseline);

        let model = match OutlierModel::train(&vectors, self.cfg.min_samples_for_ml_anomaly) {
            Some(model) => model,
            None => {
                tracing::debug!(
                    user_id = features.user_id,
                    samples = vectors.len(),
                    "Insufficient history for statistical stage"
                );
                return Ok(vec![]);
            }
        };

        let mut findings = Vec::new();
        for vector in vectors
            .iter()
            .filter(|v| v.date >= features.period_start && v.date <= features.period_end)
        {
            if !model.is_outlier(vector) {
                continue;
            }
            let (score, worst) = model.score(vector);

            let finding_type = match FEATURE_NAMES[worst] {
                "daily_hours" | "hours_deviation" => FindingType::WorkloadImbalance,
                "start_hour" | "end_hour" | "time_deviation" => FindingType::TimePatternAnomaly,
                "entry_count" | "avg_entry_duration_minutes" => FindingType::PatternDeviation,
                _ => FindingType::StatisticalOutlier,
            };

            findings.push(Finding {
                finding_type,
                severity: if score > 2.5 {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                user_id: features.user_id,
                user_name: features.user_name.clone(),
                description: format!(
                    "Unusual day on {}: {} deviates from baseline",
                    vector.date, FEATURE_NAMES[worst],
                ),
                detected_at: Utc::now(),
                details: json!({
                    "date": vector.date.to_string(),
                    "score": round2(score),
                    "dominant_feature": FEATURE_NAMES[worst],
                    "baseline": user_baseline.to_json(),
                }),
                recommendation: None,
                confidence: Some(round2(OutlierModel::confidence(score))),
            });
        }

        // Behavioral change: the window's average drifted well away from
        // the baseline average.
        if user_baseline.data_points >= self.cfg.min_samples_for_ml_anomaly
            && features.days_worked > 0
            && user_baseline.std_daily_hours > 0.0
        {
            let deviation = (features.avg_hours_per_day - user_baseline.avg_daily_hours).abs();
            if deviation > user_baseline.std_daily_hours * 2.0 {
                let direction = if features.avg_hours_per_day > user_baseline.avg_daily_hours {
                    "increase"
                } else {
                    "decrease"
                };
                findings.push(Finding {
                    finding_type: FindingType::BehavioralChange,
                    severity: Severity::Warning,
                    user_id: features.user_id,
                    user_name: features.user_name.clone(),
                    description: format!(
                        "Sustained {direction} in daily hours vs baseline ({:.1}h vs {:.1}h)",
                        features.avg_hours_per_day, user_baseline.avg_daily_hours,
                    ),
                    detected_at: Utc::now(),
                    details: json!({
                        "baseline_avg": round2(user_baseline.avg_daily_hours),
                        "recent_avg": round2(features.avg_hours_per_day),
                        "change": round2(features.avg_hours_per_day - user_baseline.avg_daily_hours),
                    }),
                    recommendation: None,
                    confidence: Some(
                        (deviation / (user_baseline.std_daily_hours * 3.0)).clamp(0.0, 1.0),
                    ),
                });
            }
        }

        Ok(findings)
    }
}
