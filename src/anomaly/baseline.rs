//! Per-user behavioral baselines and deviation-based outlier scoring.
//!
//! The statistical stage is optional: it needs enough day-samples to train
//! on, and a scan never fails because history is thin — it just returns
//! the rule-based findings alone.

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use serde::Serialize;
use serde_json::json;

use crate::store::timesheet::DayAggregate;

/// Rolling statistics describing a user's typical day. Recomputed when
/// older than a day.
#[derive(Debug, Clone, Serialize)]
pub struct UserBaseline {
    pub user_id: i64,
    pub avg_daily_hours: f64,
    pub std_daily_hours: f64,
    pub typical_start_hour: f64,
    pub typical_end_hour: f64,
    pub preferred_weekdays: Vec<String>,
    pub avg_entry_duration_minutes: f64,
    pub entries_per_day: f64,
    pub data_points: usize,
    pub calculated_at: chrono::DateTime<Utc>,
}

impl UserBaseline {
    pub fn is_fresh(&self) -> bool {
        (Utc::now() - self.calculated_at).num_days() < 1
    }

    /// Neutral defaults for users with no usable history.
    pub fn default_for(user_id: i64) -> Self {
        Self {
            user_id,
            avg_daily_hours: 8.0,
            std_daily_hours: 1.5,
            typical_start_hour: 9.0,
            typical_end_hour: 17.0,
            preferred_weekdays: vec![
                "monday".into(),
                "tuesday".into(),
                "wednesday".into(),
                "thursday".into(),
                "friday".into(),
            ],
            avg_entry_duration_minutes: 60.0,
            entries_per_day: 4.0,
            data_points: 0,
            calculated_at: Utc::now(),
        }
    }

    pub fn compute(user_id: i64, days: &[DayAggregate]) -> Self {
        if days.is_empty() {
            return Self::default_for(user_id);
        }

        let hours: Vec<f64> = days.iter().map(|d| d.hours).collect();
        let avg = mean(&hours);
        let std = std_dev(&hours, avg);

        let mut weekday_counts: Vec<(Weekday, usize)> = Vec::new();
        for day in days {
            let wd = day.date.weekday();
            match weekday_counts.iter_mut().find(|(w, _)| *w == wd) {
                Some((_, c)) => *c += 1,
                None => weekday_counts.push((wd, 1)),
            }
        }
        weekday_counts.sort_by(|a, b| b.1.cmp(&a.1));
        let preferred = weekday_counts
            .iter()
            .filter(|(_, c)| *c * 2 >= days.len() / 5)
            .map(|(w, _)| crate::context::weekday_name(*w).to_string())
            .collect();

        Self {
            user_id,
            avg_daily_hours: avg,
            std_daily_hours: std,
            typical_start_hour: mean(&days.iter().map(|d| d.start_hour).collect::<Vec<_>>()),
            typical_end_hour: mean(&days.iter().map(|d| d.end_hour).collect::<Vec<_>>()),
            preferred_weekdays: preferred,
            avg_entry_duration_minutes: mean(
                &days.iter().map(|d| d.avg_entry_minutes).collect::<Vec<_>>(),
            ),
            entries_per_day: mean(&days.iter().map(|d| d.entry_count as f64).collect::<Vec<_>>()),
            data_points: days.len(),
            calculated_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "user_id": self.user_id,
            "avg_daily_hours": round2(self.avg_daily_hours),
            "std_daily_hours": round2(self.std_daily_hours),
            "typical_start_hour": round2(self.typical_start_hour),
            "typical_end_hour": round2(self.typical_end_hour),
            "preferred_weekdays": self.preferred_weekdays,
            "avg_entry_duration_minutes": round2(self.avg_entry_duration_minutes),
            "entries_per_day": round2(self.entries_per_day),
            "data_points": self.data_points,
        })
    }
}

/// One day expressed as the detector's feature vector.
#[derive(Debug, Clone)]
pub struct DayVector {
    pub date: NaiveDate,
    pub features: [f64; 10],
}

pub const FEATURE_NAMES: [&str; 10] = [
    "daily_hours",
    "entry_count",
    "avg_entry_duration_minutes",
    "start_hour",
    "end_hour",
    "span_hours",
    "weekend_flag",
    "consecutive_days",
    "hours_deviation",
    "time_deviation",
];

pub fn build_vectors(days: &[DayAggregate], baseline: &UserBaseline) -> Vec<DayVector> {
    let mut vectors = Vec::with_capacity(days.len());
    let mut consecutive = 0.0;
    let mut prev_date: Option<NaiveDate> = None;

    for day in days {
        consecutive = match prev_date {
            Some(prev) if (day.date - prev).num_days() == 1 => consecutive + 1.0,
            _ => 0.0,
        };
        prev_date = Some(day.date);

        let std = if baseline.std_daily_hours > 0.0 {
            baseline.std_daily_hours
        } else {
            1.0
        };
        let hours_deviation = (day.hours - baseline.avg_daily_hours) / std;
        let time_deviation = (day.start_hour - baseline.typical_start_hour).abs() / 2.0;
        let weekend = matches!(day.date.weekday(), Weekday::Sat | Weekday::Sun);

        vectors.push(DayVector {
            date: day.date,
            features: [
                day.hours,
                day.entry_count as f64,
                day.avg_entry_minutes,
                day.start_hour,
                day.end_hour,
                (day.end_hour - day.start_hour).max(0.0),
                if weekend { 1.0 } else { 0.0 },
                consecutive,
                hours_deviation,
                time_deviation,
            ],
        });
    }
    vectors
}

/// Deviation-ensemble outlier model. Trains per-feature location and
/// spread from history, then scores a day by its mean absolute deviation
/// across features — the isolation idea (unusual along many axes at once
/// is easy to separate) without a model dependency.
#[derive(Debug)]
pub struct OutlierModel {
    means: [f64; 10],
    stds: [f64; 10],
}

/// Mean |z| above which a day is flagged.
const SCORE_THRESHOLD: f64 = 1.5;
/// Per-feature deviations are capped so one wild axis cannot dominate.
const Z_CAP: f64 = 4.0;

impl OutlierModel {
    /// `None` when there are fewer than `min_samples` training days.
    pub fn train(history: &[DayVector], min_samples: usize) -> Option<Self> {
        if history.len() < min_samples {
            return None;
        }
        let mut means = [0.0; 10];
        let mut stds = [0.0; 10];
        for i in 0..10 {
            let column: Vec<f64> = history.iter().map(|v| v.features[i]).collect();
            means[i] = mean(&column);
            stds[i] = std_dev(&column, means[i]).max(1e-6);
        }
        Some(Self { means, stds })
    }

    /// Score in deviation units plus the index of the dominant feature.
    pub fn score(&self, vector: &DayVector) -> (f64, usize) {
        let mut total = 0.0;
        let mut worst = 0usize;
        let mut worst_z = 0.0;
        for i in 0..10 {
            let z = ((vector.features[i] - self.means[i]) / self.stds[i])
                .abs()
                .min(Z_CAP);
            total += z;
            if z > worst_z {
                worst_z = z;
                worst = i;
            }
        }
        (total / 10.0, worst)
    }

    pub fn is_outlier(&self, vector: &DayVector) -> bool {
        self.score(vector).0 > SCORE_THRESHOLD
    }

    /// Confidence in `[0, 1]` derived from how far past the threshold a
    /// score lands.
    pub fn confidence(score: f64) -> f64 {
        ((score - SCORE_THRESHOLD) / (Z_CAP - SCORE_THRESHOLD)).clamp(0.0, 1.0)
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
