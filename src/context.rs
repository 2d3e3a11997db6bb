//! Feature engineering — the contexts and derived signals the engines
//! consume.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use crate::store::timesheet::{EntryJoined, ProjectRow};

/// Five-bucket time-of-day categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    /// 05:00 – 08:59
    EarlyMorning,
    /// 09:00 – 11:59
    Morning,
    /// 12:00 – 16:59
    Afternoon,
    /// 17:00 – 20:59
    Evening,
    /// 21:00 – 04:59
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=8 => TimeOfDay::EarlyMorning,
            9..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=20 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::EarlyMorning => "early_morning",
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Moment-of-request context for predictions.
#[derive(Debug, Clone, Serialize)]
pub struct TimeContext {
    pub current_datetime: DateTime<Utc>,
    pub day_of_week: String,
    pub time_of_day: TimeOfDay,
    pub is_weekend: bool,
    pub hour: u32,
    pub minute: u32,
}

impl TimeContext {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let weekday = dt.weekday();
        Self {
            current_datetime: dt,
            day_of_week: weekday_name(weekday).to_string(),
            time_of_day: TimeOfDay::from_hour(dt.hour()),
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
            hour: dt.hour(),
            minute: dt.minute(),
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }
}

/// A user's recent activity as suggestion input.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: i64,
    pub user_name: String,
    pub expected_hours_per_week: f64,
    pub recent_entries: Vec<EntryJoined>,
    pub active_projects: Vec<ProjectRow>,
    /// `(project_id, count)` ordered by count descending, top five.
    pub most_common_projects: Vec<(i64, usize)>,
}

impl UserContext {
    pub fn new(
        user_id: i64,
        user_name: String,
        expected_hours_per_week: f64,
        recent_entries: Vec<EntryJoined>,
        active_projects: Vec<ProjectRow>,
    ) -> Self {
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for entry in &recent_entries {
            *counts.entry(entry.project_id).or_default() += 1;
        }
        let mut most_common: Vec<(i64, usize)> = counts.into_iter().collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        most_common.truncate(5);

        Self {
            user_id,
            user_name,
            expected_hours_per_week,
            recent_entries,
            active_projects,
            most_common_projects: most_common,
        }
    }

    pub fn summary_json(&self) -> serde_json::Value {
        json!({
            "user_id": self.user_id,
            "user_name": self.user_name,
            "expected_hours_per_week": self.expected_hours_per_week,
            "recent_entries_count": self.recent_entries.len(),
            "active_projects_count": self.active_projects.len(),
            "most_common_projects": self.most_common_projects
                .iter()
                .map(|(id, count)| json!({"project_id": id, "count": count}))
                .collect::<Vec<_>>(),
        })
    }
}

/// Derived signals for the pattern stage of the suggestion engine.
#[derive(Debug, Default)]
pub struct SuggestionFeatures {
    /// Share of recent entries per project, in `[0, 1]`.
    pub project_frequencies: HashMap<i64, f64>,
    /// Project ids per coarse slot (morning / afternoon / evening),
    /// most frequent first.
    pub time_slot_patterns: HashMap<&'static str, Vec<i64>>,
    pub description_keywords: Vec<String>,
}

/// Keyword-extraction stop words; anything this short or common carries no
/// signal for matching descriptions.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "on", "in", "at", "for", "to",
];

impl SuggestionFeatures {
    pub fn compute(entries: &[EntryJoined], partial_description: Option<&str>) -> Self {
        let mut features = Self::default();
        features.compute_project_frequencies(entries);
        features.compute_time_slot_patterns(entries);
        if let Some(partial) = partial_description {
            features.extract_keywords(partial);
        }
        features
    }

    fn compute_project_frequencies(&mut self, entries: &[EntryJoined]) {
        if entries.is_empty() {
            return;
        }
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for entry in entries {
            *counts.entry(entry.project_id).or_default() += 1;
        }
        let total: usize = counts.values().sum();
        self.project_frequencies = counts
            .into_iter()
            .map(|(pid, count)| (pid, count as f64 / total as f64))
            .collect();
    }

    fn compute_time_slot_patterns(&mut self, entries: &[EntryJoined]) {
        let mut patterns: HashMap<&'static str, HashMap<i64, usize>> = HashMap::new();
        for entry in entries {
            let hour = entry.start_time.hour();
            let slot = if (5..12).contains(&hour) {
                "morning"
            } else if (12..17).contains(&hour) {
                "afternoon"
            } else {
                "evening"
            };
            *patterns.entry(slot).or_default().entry(entry.project_id).or_default() += 1;
        }
        self.time_slot_patterns = patterns
            .into_iter()
            .map(|(slot, counts)| {
                let mut projects: Vec<(i64, usize)> = counts.into_iter().collect();
                projects.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                (slot, projects.into_iter().map(|(pid, _)| pid).collect())
            })
            .collect();
    }

    fn extract_keywords(&mut self, partial: &str) {
        self.description_keywords = partial
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
            .map(String::from)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(project_id: i64, hour: u32, desc: &str) -> EntryJoined {
        EntryJoined {
            id: 0,
            project_id,
            project_name: format!("P{project_id}"),
            task_id: None,
            task_name: None,
            description: Some(desc.to_string()),
            start_time: Utc.with_ymd_and_hms(2026, 7, 6, hour, 0, 0).unwrap(),
            end_time: None,
            duration_seconds: Some(3600),
        }
    }

    #[test]
    fn test_time_of_day_buckets() {
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::EarlyMorning);
        assert_eq!(TimeOfDay::from_hour(8), TimeOfDay::EarlyMorning);
        assert_eq!(TimeOfDay::from_hour(9), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(11), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(16), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(17), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(20), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(21), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(4), TimeOfDay::Night);
    }

    #[test]
    fn test_time_context_weekend() {
        // 2026-07-04 is a Saturday
        let dt = Utc.with_ymd_and_hms(2026, 7, 4, 10, 30, 0).unwrap();
        let ctx = TimeContext::from_datetime(dt);
        assert!(ctx.is_weekend);
        assert_eq!(ctx.day_of_week, "saturday");
        assert_eq!(ctx.time_of_day, TimeOfDay::Morning);
        assert_eq!(ctx.hour, 10);
        assert_eq!(ctx.minute, 30);

        // 2026-07-06 is a Monday
        let ctx = TimeContext::from_datetime(Utc.with_ymd_and_hms(2026, 7, 6, 22, 0, 0).unwrap());
        assert!(!ctx.is_weekend);
        assert_eq!(ctx.day_of_week, "monday");
        assert_eq!(ctx.time_of_day, TimeOfDay::Night);
    }

    #[test]
    fn test_project_frequencies_normalized() {
        let entries = vec![entry(1, 9, "a"), entry(1, 10, "b"), entry(2, 11, "c"), entry(1, 14, "d")];
        let features = SuggestionFeatures::compute(&entries, None);
        assert!((features.project_frequencies[&1] - 0.75).abs() < 1e-9);
        assert!((features.project_frequencies[&2] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_time_slot_patterns_ordered() {
        let entries = vec![
            entry(1, 9, "a"),
            entry(1, 10, "b"),
            entry(2, 9, "c"),
            entry(3, 14, "d"),
        ];
        let features = SuggestionFeatures::compute(&entries, None);
        assert_eq!(features.time_slot_patterns["morning"], vec![1, 2]);
        assert_eq!(features.time_slot_patterns["afternoon"], vec![3]);
        assert!(!features.time_slot_patterns.contains_key("evening"));
    }

    #[test]
    fn test_keyword_extraction_strips_stop_words() {
        let features =
            SuggestionFeatures::compute(&[], Some("Working on the API for review"));
        assert_eq!(features.description_keywords, vec!["working", "api", "review"]);
    }

    #[test]
    fn test_most_common_projects() {
        let entries = vec![entry(2, 9, "a"), entry(2, 10, "b"), entry(5, 11, "c")];
        let ctx = UserContext::new(7, "Dana".into(), 40.0, entries, vec![]);
        assert_eq!(ctx.most_common_projects[0], (2, 2));
        assert_eq!(ctx.most_common_projects[1], (5, 1));
    }
}
