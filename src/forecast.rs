//! Predictive analytics: payroll, overtime risk, project budgets and
//! cash flow. Time-series math only — weighted moving averages, trend
//! ratios and standard-deviation intervals; no provider calls.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::anomaly::baseline::{mean, round2, std_dev};
use crate::cache::{fingerprint, AiCache};
use crate::error::AiResult;
use crate::features::FeatureGate;
use crate::store::payroll::PayrollPeriodTotals;
use crate::store::usage::UsageRecord;
use crate::store::Store;

const FEATURE_ID: &str = "ai_payroll_forecast";

/// Applied when a project has no budget recorded.
const DEFAULT_PROJECT_BUDGET: f64 = 50_000.0;
/// Blended hourly rate fallback when contributors have no pay rates.
const DEFAULT_BLENDED_RATE: f64 = 50.0;
/// Hourly rate fallback for overtime cost estimates.
const DEFAULT_PAY_RATE: f64 = 25.0;
const OVERTIME_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Stable => "stable",
            Trend::Decreasing => "decreasing",
        }
    }
}

/// Next payroll period after `last_end`, by type.
pub fn next_period(last_end: NaiveDate, period_type: &str) -> (NaiveDate, NaiveDate) {
    let start = last_end + Duration::days(1);
    let end = match period_type {
        "weekly" => start + Duration::days(6),
        "bi_weekly" => start + Duration::days(13),
        "semi_monthly" => {
            if start.day() <= 15 {
                start.with_day(15).unwrap_or(start)
            } else {
                last_day_of_month(start)
            }
        }
        _ => last_day_of_month(start),
    };
    (start, end)
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date) - Duration::days(1)
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub struct Forecaster {
    store: Arc<Store>,
    cache: Arc<AiCache>,
    gate: Arc<FeatureGate>,
}

impl Forecaster {
    pub fn new(store: Arc<Store>, cache: Arc<AiCache>, gate: Arc<FeatureGate>) -> Self {
        Self { store, cache, gate }
    }

    fn gated(&self, user_id: i64, empty_key: &str) -> AiResult<Option<Value>> {
        let status = self.gate.status(FEATURE_ID, user_id)?;
        if status.is_enabled {
            return Ok(None);
        }
        Ok(Some(json!({
            empty_key: [],
            "enabled": false,
            "reason": status.reason,
        })))
    }

    fn log(&self, user_id: i64, metadata: Value) {
        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(metadata),
            ..Default::default()
        });
    }

    // ── Payroll ─────────────────────────────────────────────────────

    pub fn forecast_payroll(
        &self,
        user_id: i64,
        period_type: &str,
        periods_ahead: usize,
        include_overtime: bool,
    ) -> AiResult<Value> {
        if let Some(disabled) = self.gated(user_id, "forecasts")? {
            return Ok(disabled);
        }

        let cache_entity = fingerprint(&json!({
            "period_type": period_type,
            "periods_ahead": periods_ahead,
        }));
        if let Some(cached) = self.cache.get_forecast("payroll", &cache_entity) {
            self.log(user_id, json!({"forecast": "payroll", "cache_hit": true}));
            return Ok(cached);
        }

        let history = self.store.payroll_history(period_type, 12)?;
        if history.len() < 3 {
            return Ok(json!({
                "forecasts": [],
                "enabled": true,
                "message": "Insufficient historical data (need at least 3 periods)",
            }));
        }

        let mut forecasts = Vec::with_capacity(periods_ahead);
        let mut last_end = history.last().map(|p| p.period_end).unwrap_or_default();
        for _ in 0..periods_ahead {
            let (start, end) = next_period(last_end, period_type);
            forecasts.push(payroll_forecast(&history, start, end, include_overtime));
            last_end = end;
        }

        let result = json!({
            "forecasts": forecasts,
            "enabled": true,
            "period_type": period_type,
            "historical_periods_used": history.len(),
            "generated_at": Utc::now().to_rfc3339(),
        });

        self.cache.set_forecast("payroll", &cache_entity, &result);
        self.log(user_id, json!({"forecast": "payroll"}));
        Ok(result)
    }

    // ── Overtime risk ───────────────────────────────────────────────

    pub fn assess_overtime_risk(
        &self,
        user_id: i64,
        days_ahead: i64,
        team_id: Option<i64>,
    ) -> AiResult<Value> {
        if let Some(disabled) = self.gated(user_id, "risks")? {
            return Ok(disabled);
        }

        let today = Utc::now().date_naive();
        let week_start = monday_of(today);
        let week_end = week_start + Duration::days(6);
        let users = self.store.active_users(team_id)?;

        let mut risks: Vec<Value> = Vec::new();
        for user in &users {
            let current_hours = self.store.user_hours_between(user.id, week_start, today)?;
            let daily = self
                .store
                .user_daily_hours(user.id, today - Duration::days(30))?;
            let avg_daily = if daily.is_empty() {
                8.0
            } else {
                mean(&daily.iter().map(|(_, h)| *h).collect::<Vec<_>>())
            };

            let days_left = (week_end - today).num_days().max(0);
            let projected = current_hours + avg_daily * days_left as f64;
            let threshold = user.expected_hours_per_week;

            let (risk, recommendation) = if projected > threshold * 1.2 {
                (
                    RiskLevel::Critical,
                    format!(
                        "Urgent: Reduce workload. Projected {:.1}h overtime",
                        projected - threshold
                    ),
                )
            } else if projected > threshold * 1.1 {
                (
                    RiskLevel::High,
                    format!(
                        "Review workload distribution. Likely to exceed threshold by {:.1}h",
                        projected - threshold
                    ),
                )
            } else if projected > threshold {
                (RiskLevel::Medium, "Minor overtime expected. Monitor daily".into())
            } else {
                (RiskLevel::Low, "On track for normal hours".into())
            };

            if risk == RiskLevel::Low {
                continue;
            }

            let rate = self
                .store
                .active_pay_rate(user.id, today)?
                .unwrap_or(DEFAULT_PAY_RATE);
            let overtime_hours = (projected - threshold).max(0.0);
            risks.push(json!({
                "user_id": user.id,
                "user_name": user.name,
                "current_hours": round2(current_hours),
                "projected_hours": round2(projected),
                "overtime_threshold": threshold,
                "risk_level": risk,
                "projected_overtime": round2(overtime_hours),
                "estimated_cost": round2(overtime_hours * rate * OVERTIME_MULTIPLIER),
                "recommendation": recommendation,
            }));
        }

        risks.sort_by_key(|r| match r["risk_level"].as_str() {
            Some("critical") => 0,
            Some("high") => 1,
            Some("medium") => 2,
            _ => 3,
        });

        self.log(user_id, json!({"forecast": "overtime_risk"}));
        let users_at_risk = risks.len();
        Ok(json!({
            "risks": risks,
            "enabled": true,
            "period": format!("{week_start} to {week_end}"),
            "days_ahead": days_ahead,
            "users_assessed": users.len(),
            "users_at_risk": users_at_risk,
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }

    // ── Project budget ──────────────────────────────────────────────

    pub fn forecast_project_budget(
        &self,
        user_id: i64,
        project_id: Option<i64>,
        team_id: Option<i64>,
    ) -> AiResult<Value> {
        if let Some(disabled) = self.gated(user_id, "forecasts")? {
            return Ok(disabled);
        }

        let today = Utc::now().date_naive();
        let projects = self.store.projects_for_scope(project_id, team_id, 20)?;

        let mut forecasts: Vec<Value> = Vec::new();
        for project in &projects {
            let first_entry = match self.store.project_first_entry_date(project.id)? {
                Some(date) => date,
                None => continue,
            };
            let total_hours = self.store.project_total_hours(project.id)?;
            let rate = self
                .store
                .project_blended_rate(project.id)?
                .unwrap_or(DEFAULT_BLENDED_RATE);
            let spent = total_hours * rate;

            let days_active = (today - first_entry).num_days().max(1);
            let burn_daily = spent / days_active as f64;

            let budget = project.budget_total.unwrap_or(DEFAULT_PROJECT_BUDGET);
            let (days_remaining, projected_completion, projected_total) = if burn_daily > 0.0 {
                let days = (((budget - spent) / burn_daily) as i64).clamp(0, 3650);
                (days, today + Duration::days(days), spent + burn_daily * days as f64)
            } else {
                (365, today + Duration::days(365), spent)
            };

            let utilization = if budget > 0.0 { spent / budget * 100.0 } else { 0.0 };
            let (risk, recommendations): (RiskLevel, Vec<&str>) = if utilization > 90.0 {
                (
                    RiskLevel::Critical,
                    vec![
                        "Project approaching budget limit",
                        "Review remaining scope for cuts",
                        "Request budget increase if necessary",
                    ],
                )
            } else if utilization > 75.0 {
                (
                    RiskLevel::High,
                    vec!["Monitor spending closely", "Prioritize critical deliverables"],
                )
            } else if utilization > 50.0 {
                (RiskLevel::Medium, vec!["On track but continue monitoring"])
            } else {
                (RiskLevel::Low, vec!["Budget utilization healthy"])
            };

            forecasts.push(json!({
                "project_id": project.id,
                "project_name": project.name,
                "budget_total": round2(budget),
                "spent_to_date": round2(spent),
                "projected_total": round2(projected_total),
                "burn_rate_daily": round2(burn_daily),
                "days_remaining": days_remaining,
                "projected_completion": projected_completion.to_string(),
                "budget_utilization_pct": round2(utilization),
                "risk_level": risk,
                "recommendations": recommendations,
            }));
        }

        forecasts.sort_by_key(|f| match f["risk_level"].as_str() {
            Some("critical") => 0,
            Some("high") => 1,
            Some("medium") => 2,
            _ => 3,
        });

        self.log(user_id, json!({"forecast": "project_budget"}));
        Ok(json!({
            "forecasts": forecasts,
            "enabled": true,
            "projects_analyzed": projects.len(),
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }

    // ── Cash flow ───────────────────────────────────────────────────

    pub fn forecast_cash_flow(&self, user_id: i64, weeks_ahead: usize) -> AiResult<Value> {
        if let Some(disabled) = self.gated(user_id, "forecast")? {
            return Ok(disabled);
        }

        let history = self.store.payroll_history("bi_weekly", 6)?;
        if history.is_empty() {
            return Ok(json!({
                "forecast": [],
                "enabled": true,
                "message": "Insufficient payroll history",
            }));
        }

        let avg_payroll = mean(&history.iter().map(|p| p.gross_amount).collect::<Vec<_>>());
        let current_week = monday_of(Utc::now().date_naive());

        let mut forecast = Vec::with_capacity(weeks_ahead);
        for i in 0..weeks_ahead {
            let week_start = current_week + Duration::weeks(i as i64);
            let week_end = week_start + Duration::days(6);
            // Payroll lands every other week, starting this week
            let is_payroll_week = i % 2 == 0;
            let paid_so_far = (i / 2) + usize::from(is_payroll_week);
            forecast.push(json!({
                "week_start": week_start.to_string(),
                "week_end": week_end.to_string(),
                "is_payroll_week": is_payroll_week,
                "projected_payroll": if is_payroll_week { round2(avg_payroll) } else { 0.0 },
                "cumulative": round2(avg_payroll * paid_so_far as f64),
            }));
        }

        self.log(user_id, json!({"forecast": "cash_flow"}));
        Ok(json!({
            "forecast": forecast,
            "enabled": true,
            "average_payroll": round2(avg_payroll),
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }
}

/// Weighted-moving-average forecast for one upcoming period.
fn payroll_forecast(
    history: &[PayrollPeriodTotals],
    period_start: NaiveDate,
    period_end: NaiveDate,
    include_overtime: bool,
) -> Value {
    let amounts: Vec<f64> = history.iter().map(|p| p.gross_amount).collect();
    let regular_hours: Vec<f64> = history.iter().map(|p| p.regular_hours).collect();
    let overtime_hours: Vec<f64> = history.iter().map(|p| p.overtime_hours).collect();

    // Weights 1..N, oldest to newest
    let total_weight: f64 = (1..=amounts.len()).sum::<usize>() as f64;
    let weighted_avg: f64 = amounts
        .iter()
        .enumerate()
        .map(|(i, a)| a * (i + 1) as f64)
        .sum::<f64>()
        / total_weight;

    let (trend, trend_factor) = if amounts.len() >= 3 {
        let recent = mean(&amounts[amounts.len() - 3..]);
        let older = if amounts.len() > 3 {
            mean(&amounts[..amounts.len() - 3])
        } else {
            amounts[0]
        };
        if older > 0.0 && recent > older * 1.05 {
            (Trend::Increasing, recent / older)
        } else if older > 0.0 && recent < older * 0.95 {
            (Trend::Decreasing, recent / older)
        } else {
            (Trend::Stable, 1.0)
        }
    } else {
        (Trend::Stable, 1.0)
    };

    let predicted_total = weighted_avg * trend_factor;

    let regular_sum: f64 = regular_hours.iter().sum();
    let overtime_sum: f64 = overtime_hours.iter().sum();
    let regular_share = regular_sum / (regular_sum + overtime_sum).max(1.0);
    let predicted_regular = predicted_total * regular_share;
    let predicted_overtime = if include_overtime {
        predicted_total - predicted_regular
    } else {
        0.0
    };

    let amount_mean = mean(&amounts);
    let (std, confidence) = if amounts.len() >= 3 {
        let std = std_dev(&amounts, amount_mean);
        let confidence = if amount_mean > 0.0 {
            (1.0 - std / amount_mean).clamp(0.5, 1.0)
        } else {
            0.5
        };
        (std, confidence)
    } else {
        (amount_mean * 0.15, 0.5)
    };

    let margin = std * 1.96;
    let lower_bound = (predicted_total - margin).max(0.0);
    let upper_bound = predicted_total + margin;

    let mut factors: Vec<Value> = Vec::new();
    match trend {
        Trend::Increasing => factors.push(json!({
            "factor": "trend",
            "description": "Payroll costs trending upward",
            "impact": "positive",
        })),
        Trend::Decreasing => factors.push(json!({
            "factor": "trend",
            "description": "Payroll costs trending downward",
            "impact": "negative",
        })),
        Trend::Stable => {}
    }
    if !overtime_hours.is_empty() && mean(&overtime_hours) > 5.0 {
        factors.push(json!({
            "factor": "overtime",
            "description": "Significant overtime observed",
            "impact": "positive",
        }));
    }

    json!({
        "period_start": period_start.to_string(),
        "period_end": period_end.to_string(),
        "predicted_total": round2(predicted_total),
        "predicted_regular": round2(predicted_regular),
        "predicted_overtime": round2(predicted_overtime),
        "confidence": (confidence * 1000.0).round() / 1000.0,
        "lower_bound": round2(lower_bound),
        "upper_bound": round2(upper_bound),
        "trend": trend.as_str(),
        "factors": factors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiConfig;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct Fixture {
        store: Arc<Store>,
        forecaster: Forecaster,
        user_id: i64,
    }

    fn fixture() -> Fixture {
        let cfg = Arc::new(AiConfig::for_tests());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(AiCache::in_memory(&cfg));
        let gate = Arc::new(FeatureGate::new(store.clone()));
        gate.set_global(FEATURE_ID, true, 1).unwrap();
        let user_id = store.insert_user("Dana", 40.0).unwrap();
        let forecaster = Forecaster::new(store.clone(), cache, gate);
        Fixture {
            store,
            forecaster,
            user_id,
        }
    }

    fn seed_payroll(store: &Store, amounts: &[f64]) {
        let mut start = date(2026, 1, 5);
        for amount in amounts {
            let end = start + Duration::days(13);
            let period = store
                .insert_payroll_period("bi_weekly", "paid", start, end)
                .unwrap();
            store
                .insert_payroll_entry(period, 1, 72.0, 8.0, *amount)
                .unwrap();
            start = end + Duration::days(1);
        }
    }

    #[test]
    fn test_period_date_math() {
        assert_eq!(
            next_period(date(2026, 7, 5), "weekly"),
            (date(2026, 7, 6), date(2026, 7, 12))
        );
        assert_eq!(
            next_period(date(2026, 7, 5), "bi_weekly"),
            (date(2026, 7, 6), date(2026, 7, 19))
        );
        // Semi-monthly partitions at day 15
        assert_eq!(
            next_period(date(2026, 6, 30), "semi_monthly"),
            (date(2026, 7, 1), date(2026, 7, 15))
        );
        assert_eq!(
            next_period(date(2026, 7, 15), "semi_monthly"),
            (date(2026, 7, 16), date(2026, 7, 31))
        );
        // Monthly runs to the last day of the month, December included
        assert_eq!(
            next_period(date(2026, 7, 31), "monthly"),
            (date(2026, 8, 1), date(2026, 8, 31))
        );
        assert_eq!(
            next_period(date(2026, 11, 30), "monthly"),
            (date(2026, 12, 1), date(2026, 12, 31))
        );
    }

    #[test]
    fn test_payroll_forecast_increasing_trend() {
        let f = fixture();
        seed_payroll(&f.store, &[2000.0, 2000.0, 2000.0, 2600.0, 2600.0, 2600.0]);

        let result = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 2, true)
            .unwrap();
        assert_eq!(result["enabled"], true);
        assert_eq!(result["historical_periods_used"], 6);

        let forecasts = result["forecasts"].as_array().unwrap();
        assert_eq!(forecasts.len(), 2);
        let first = &forecasts[0];
        assert_eq!(first["trend"], "increasing");

        let predicted = first["predicted_total"].as_f64().unwrap();
        // WMA ≈ 2428.57, trend factor 1.3
        assert!((predicted - 3157.14).abs() < 1.0, "predicted {predicted}");

        let confidence = first["confidence"].as_f64().unwrap();
        assert!((0.5..=1.0).contains(&confidence));
        assert!(first["lower_bound"].as_f64().unwrap() <= predicted);
        assert!(first["upper_bound"].as_f64().unwrap() >= predicted);

        // Overtime split follows the historical share (72 regular / 8 OT)
        let regular = first["predicted_regular"].as_f64().unwrap();
        let overtime = first["predicted_overtime"].as_f64().unwrap();
        assert!((regular + overtime - predicted).abs() < 0.02);
        assert!(overtime > 0.0);

        // Consecutive forecast periods chain without gaps
        let first_end: NaiveDate = forecasts[0]["period_end"].as_str().unwrap().parse().unwrap();
        let second_start: NaiveDate =
            forecasts[1]["period_start"].as_str().unwrap().parse().unwrap();
        assert_eq!(second_start, first_end + Duration::days(1));
    }

    #[test]
    fn test_payroll_forecast_stable_and_bounds() {
        let f = fixture();
        seed_payroll(&f.store, &[2400.0, 2400.0, 2400.0, 2400.0]);
        let result = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 1, false)
            .unwrap();
        let first = &result["forecasts"][0];
        assert_eq!(first["trend"], "stable");
        assert_eq!(first["predicted_overtime"], 0.0);
        // Zero variance: full confidence, tight interval
        assert_eq!(first["confidence"], 1.0);
        assert_eq!(first["lower_bound"], first["predicted_total"]);
    }

    #[test]
    fn test_payroll_requires_history() {
        let f = fixture();
        seed_payroll(&f.store, &[2000.0, 2100.0]);
        let result = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 1, true)
            .unwrap();
        assert_eq!(result["forecasts"].as_array().unwrap().len(), 0);
        assert!(result["message"]
            .as_str()
            .unwrap()
            .contains("Insufficient historical data"));
    }

    #[test]
    fn test_payroll_forecast_cached() {
        let f = fixture();
        seed_payroll(&f.store, &[2000.0, 2000.0, 2000.0, 2000.0]);
        let first = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 1, true)
            .unwrap();
        let second = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 1, true)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(f.store.usage_count_for(f.user_id, FEATURE_ID), 2);
    }

    #[test]
    fn test_overtime_risk_flags_heavy_week() {
        let f = fixture();
        let today = Utc::now().date_naive();
        f.store.insert_pay_rate(f.user_id, 30.0, date(2026, 1, 1)).unwrap();
        // 12-hour days for the last ten days
        for i in 0..10 {
            let day = today - Duration::days(i);
            let start = day.and_hms_opt(7, 0, 0).unwrap().and_utc();
            f.store
                .insert_time_entry(
                    f.user_id,
                    f.store.insert_project(&format!("P{i}"), None, None).unwrap(),
                    None,
                    start,
                    Some(start + Duration::hours(12)),
                    Some(12 * 3600),
                    "grind",
                )
                .unwrap();
        }

        let result = f.forecaster.assess_overtime_risk(f.user_id, 7, None).unwrap();
        assert_eq!(result["enabled"], true);
        let risks = result["risks"].as_array().unwrap();
        assert_eq!(risks.len(), 1, "one user at risk");
        let risk = &risks[0];
        assert_eq!(risk["risk_level"], "critical");
        assert!(risk["projected_hours"].as_f64().unwrap() > 48.0);
        // Cost = overtime × rate × 1.5
        let overtime = risk["projected_overtime"].as_f64().unwrap();
        let cost = risk["estimated_cost"].as_f64().unwrap();
        assert!((cost - overtime * 30.0 * 1.5).abs() < 0.02);
    }

    #[test]
    fn test_overtime_risk_quiet_user_not_listed() {
        let f = fixture();
        // Light, steady history well clear of the weekly threshold
        let project = f.store.insert_project("Calm", None, None).unwrap();
        let today = Utc::now().date_naive();
        for i in 15..20 {
            let start = (today - Duration::days(i)).and_hms_opt(9, 0, 0).unwrap().and_utc();
            f.store
                .insert_time_entry(f.user_id, project, None, start, Some(start + Duration::hours(4)), Some(4 * 3600), "steady")
                .unwrap();
        }
        let result = f.forecaster.assess_overtime_risk(f.user_id, 7, None).unwrap();
        assert_eq!(result["risks"].as_array().unwrap().len(), 0);
        assert_eq!(result["users_assessed"], 1);
    }

    #[test]
    fn test_project_budget_over_budget_is_critical() {
        let f = fixture();
        let project = f.store.insert_project("Apollo", None, Some(1000.0)).unwrap();
        let start = (Utc::now() - Duration::days(10)).date_naive().and_hms_opt(9, 0, 0).unwrap().and_utc();
        f.store
            .insert_time_entry(f.user_id, project, None, start, Some(start + Duration::hours(30)), Some(30 * 3600), "push")
            .unwrap();

        let result = f
            .forecaster
            .forecast_project_budget(f.user_id, Some(project), None)
            .unwrap();
        let forecasts = result["forecasts"].as_array().unwrap();
        assert_eq!(forecasts.len(), 1);
        let fc = &forecasts[0];
        // 30h at the 50.00 fallback rate = 1500 spent on a 1000 budget
        assert_eq!(fc["spent_to_date"], 1500.0);
        assert_eq!(fc["risk_level"], "critical");
        assert_eq!(fc["recommendations"].as_array().unwrap().len(), 3);
        assert!(fc["budget_utilization_pct"].as_f64().unwrap() > 100.0);
    }

    #[test]
    fn test_project_budget_uses_contributor_rates_and_default_budget() {
        let f = fixture();
        let project = f.store.insert_project("Beta", None, None).unwrap();
        f.store.insert_pay_rate(f.user_id, 20.0, date(2026, 1, 1)).unwrap();
        let start = (Utc::now() - Duration::days(5)).date_naive().and_hms_opt(9, 0, 0).unwrap().and_utc();
        f.store
            .insert_time_entry(f.user_id, project, None, start, Some(start + Duration::hours(10)), Some(10 * 3600), "steady")
            .unwrap();

        let result = f
            .forecaster
            .forecast_project_budget(f.user_id, Some(project), None)
            .unwrap();
        let fc = &result["forecasts"][0];
        assert_eq!(fc["budget_total"], DEFAULT_PROJECT_BUDGET);
        // 10h at the user's 20.00 rate
        assert_eq!(fc["spent_to_date"], 200.0);
        assert_eq!(fc["risk_level"], "low");
    }

    #[test]
    fn test_projects_without_entries_skipped() {
        let f = fixture();
        f.store.insert_project("Empty", None, Some(5000.0)).unwrap();
        let result = f.forecaster.forecast_project_budget(f.user_id, None, None).unwrap();
        assert_eq!(result["forecasts"].as_array().unwrap().len(), 0);
        assert_eq!(result["projects_analyzed"], 1);
    }

    #[test]
    fn test_cash_flow_biweekly_cadence() {
        let f = fixture();
        seed_payroll(&f.store, &[2000.0, 2200.0, 2400.0]);
        let result = f.forecaster.forecast_cash_flow(f.user_id, 4).unwrap();
        assert_eq!(result["average_payroll"], 2200.0);
        let weeks = result["forecast"].as_array().unwrap();
        assert_eq!(weeks.len(), 4);
        assert_eq!(weeks[0]["is_payroll_week"], true);
        assert_eq!(weeks[1]["is_payroll_week"], false);
        assert_eq!(weeks[2]["is_payroll_week"], true);
        assert_eq!(weeks[0]["projected_payroll"], 2200.0);
        assert_eq!(weeks[1]["projected_payroll"], 0.0);
        assert_eq!(weeks[0]["cumulative"], 2200.0);
        assert_eq!(weeks[1]["cumulative"], 2200.0);
        assert_eq!(weeks[2]["cumulative"], 4400.0);
    }

    #[test]
    fn test_cash_flow_without_history() {
        let f = fixture();
        let result = f.forecaster.forecast_cash_flow(f.user_id, 4).unwrap();
        assert_eq!(result["forecast"].as_array().unwrap().len(), 0);
        assert!(result["message"].as_str().unwrap().contains("Insufficient"));
    }

    #[test]
    fn test_disabled_feature_short_circuits() {
        let f = fixture();
        f.forecaster.gate.set_global(FEATURE_ID, false, 1).unwrap();
        let result = f
            .forecaster
            .forecast_payroll(f.user_id, "bi_weekly", 1, true)
            .unwrap();
        assert_eq!(result["enabled"], false);
        let result = f.forecaster.assess_overtime_risk(f.user_id, 7, None).unwrap();
        assert_eq!(result["enabled"], false);
    }
}
