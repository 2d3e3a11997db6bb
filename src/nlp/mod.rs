//! Natural-language time entry parsing.
//!
//! Rule-based extraction runs first: ordered duration patterns, date
//! keywords, fuzzy project/task matching. The provider is only consulted
//! when rule confidence lands below the refinement threshold, and its
//! answer backfills rather than replaces. Parsing "Log 2 hours on Project
//! Alpha yesterday" must work offline.

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::AiConfig;
use crate::error::{AiError, AiResult};
use crate::features::FeatureGate;
use crate::prompts;
use crate::providers::client::{AiClient, GenerateRequest};
use crate::store::timesheet::{ProjectRow, TaskRow};
use crate::store::usage::UsageRecord;
use crate::store::Store;

const FEATURE_ID: &str = "ai_nlp_entry";
/// Below this rule-based score the AI refinement stage is consulted.
const AI_REFINEMENT_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseResult {
    pub original_text: String,
    pub project_id: Option<i64>,
    pub project_name: Option<String>,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
    pub duration_seconds: Option<i64>,
    pub duration_display: Option<String>,
    pub start_time: Option<chrono::DateTime<Utc>>,
    pub end_time: Option<chrono::DateTime<Utc>>,
    pub description: Option<String>,
    pub confidence: f64,
    pub confidence_level: Option<ConfidenceLevel>,
    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub parsed_entities: Vec<Value>,
    pub suggestions: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ParsedDuration {
    pub seconds: i64,
    pub original_text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ParsedDate {
    pub date: NaiveDate,
    pub original_text: String,
    pub confidence: f64,
}

enum DurationRule {
    HoursMinutes,
    AndAHalf,
    Hours,
    Minutes,
    Fixed(i64),
}

/// Compiled pattern tables. Combined hour+minute forms are matched before
/// bare hours so `parse(format(n)) == n` holds for round durations.
struct Patterns {
    durations: Vec<(Regex, DurationRule)>,
    iso_date: Regex,
    slash_date: Regex,
    month_day: Regex,
}

impl Patterns {
    fn build() -> Self {
        let durations = vec![
            (Regex::new(r"\b(\d{1,2}):(\d{2})\b").unwrap(), DurationRule::HoursMinutes),
            (Regex::new(r"\b(\d+)h\s*(\d+)m?\b").unwrap(), DurationRule::HoursMinutes),
            (
                Regex::new(r"\b(\d+)\s+and\s+a\s+half\s+hours?\b").unwrap(),
                DurationRule::AndAHalf,
            ),
            (
                Regex::new(r"\b(\d+(?:\.\d+)?)\s*(?:hours?|hrs?|h)\b").unwrap(),
                DurationRule::Hours,
            ),
            (
                Regex::new(r"\b(\d+(?:\.\d+)?)\s*(?:minutes?|mins?|m)\b").unwrap(),
                DurationRule::Minutes,
            ),
            (
                Regex::new(r"\bhalf\s+(?:an?\s+)?hours?\b").unwrap(),
                DurationRule::Fixed(1800),
            ),
            (
                Regex::new(r"\bquarter\s+hours?\b").unwrap(),
                DurationRule::Fixed(900),
            ),
        ];
        Self {
            durations,
            iso_date: Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap(),
            slash_date: Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{4}))?\b").unwrap(),
            month_day: Regex::new(
                r"\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})\b",
            )
            .unwrap(),
        }
    }
}

const DAYS_OF_WEEK: &[(&str, u32)] = &[
    ("monday", 0),
    ("tuesday", 1),
    ("tues", 1),
    ("tue", 1),
    ("wednesday", 2),
    ("wed", 2),
    ("thursday", 3),
    ("thurs", 3),
    ("thu", 3),
    ("friday", 4),
    ("fri", 4),
    ("saturday", 5),
    ("sat", 5),
    ("sunday", 6),
    ("sun", 6),
];

const FILLER_WORDS: &[&str] = &[
    "on", "for", "at", "in", "worked", "log", "logged", "spent", "doing",
];

const DATE_KEYWORDS: &[&str] = &[
    "today",
    "yesterday",
    "tomorrow",
    "last week",
    "this morning",
    "this afternoon",
    "this evening",
];

// ── Pure parsing helpers ────────────────────────────────────────────

pub fn format_duration(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if parts.is_empty() {
        "0m".to_string()
    } else {
        parts.join(" ")
    }
}

/// difflib-style similarity: find the longest common block, recurse on
/// both sides, ratio = 2·matched / (len_a + len_b).
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (mut best_len, mut best_a, mut best_b) = (0usize, 0usize, 0usize);
    for i in 0..a.len() {
        for j in 0..b.len() {
            let mut len = 0;
            while i + len < a.len() && j + len < b.len() && a[i + len] == b[j + len] {
                len += 1;
            }
            if len > best_len {
                best_len = len;
                best_a = i;
                best_b = j;
            }
        }
    }
    if best_len == 0 {
        return 0;
    }
    best_len
        + matching_chars(&a[..best_a], &b[..best_b])
        + matching_chars(&a[best_a + best_len..], &b[best_b + best_len..])
}

pub struct NlParser {
    store: Arc<Store>,
    gate: Arc<FeatureGate>,
    client: Arc<AiClient>,
    cfg: Arc<AiConfig>,
    patterns: Patterns,
}

impl NlParser {
    pub fn new(
        store: Arc<Store>,
        gate: Arc<FeatureGate>,
        client: Arc<AiClient>,
        cfg: Arc<AiConfig>,
    ) -> Self {
        Self {
            store,
            gate,
            client,
            cfg,
            patterns: Patterns::build(),
        }
    }

    /// Parse free text into a structured time entry proposal.
    pub async fn parse_entry(
        &self,
        user_id: i64,
        text: &str,
        timezone: &str,
        use_ai: bool,
    ) -> AiResult<Value> {
        let status = self.gate.status(FEATURE_ID, user_id)?;
        if !status.is_enabled {
            return Ok(json!({
                "success": false,
                "enabled": false,
                "reason": status.reason,
            }));
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(AiError::BadInput("empty input".into()));
        }

        let projects = self.store.active_projects(50)?;
        let tasks = self.store.tasks_for_active_projects()?;
        let today = Utc::now().date_naive();

        let mut result = self.rule_parse(text, today, &projects, &tasks);

        let mut used_ai = false;
        if use_ai && result.confidence < AI_REFINEMENT_THRESHOLD && self.client.any_available() {
            match self.refine_with_ai(text, today, &projects, &result).await {
                Ok(Some(refined)) => {
                    result = refined;
                    used_ai = true;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "AI refinement failed, keeping rule parse");
                }
            }
        }

        if result.confidence < self.cfg.nlp_confidence_threshold {
            result.needs_clarification = true;
            result.clarification_question = Some(clarification_question(&result));
        }

        if result.project_id.is_none() && !projects.is_empty() {
            result.suggestions = projects
                .iter()
                .take(5)
                .map(|p| json!({"id": p.id, "name": p.name}))
                .collect();
        }

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(json!({
                "confidence": result.confidence,
                "used_ai": used_ai,
                "timezone": timezone,
            })),
            ..Default::default()
        });

        Ok(json!({
            "success": true,
            "enabled": true,
            "result": result,
        }))
    }

    /// Rule-based pipeline: duration, date, project, task, description,
    /// weighted confidence.
    fn rule_parse(
        &self,
        text: &str,
        today: NaiveDate,
        projects: &[ProjectRow],
        tasks: &[TaskRow],
    ) -> ParseResult {
        let mut result = ParseResult {
            original_text: text.to_string(),
            ..Default::default()
        };

        if let Some(duration) = self.parse_duration(text) {
            result.duration_seconds = Some(duration.seconds);
            result.duration_display = Some(format_duration(duration.seconds));
            result.parsed_entities.push(json!({
                "type": "duration",
                "value": duration.seconds,
                "display": result.duration_display,
                "original": duration.original_text,
                "confidence": duration.confidence,
            }));
        }

        let parsed_date = self.parse_date(text, today);
        let entry_date = match &parsed_date {
            Some(d) => {
                result.parsed_entities.push(json!({
                    "type": "date",
                    "value": d.date.to_string(),
                    "original": d.original_text,
                    "confidence": d.confidence,
                }));
                d.date
            }
            None => today,
        };
        result.start_time = Some(Utc.from_utc_datetime(&entry_date.and_hms_opt(0, 0, 0).unwrap()));
        if let Some(secs) = result.duration_seconds {
            result.end_time = result.start_time.map(|s| s + Duration::seconds(secs));
        }

        if let Some((project, score)) = match_project(text, projects) {
            result.project_id = Some(project.id);
            result.project_name = Some(project.name.clone());
            result.parsed_entities.push(json!({
                "type": "project",
                "value": project.name,
                "id": project.id,
                "confidence": score,
            }));

            if let Some((task, task_score)) = match_task(text, tasks, project.id) {
                result.task_id = Some(task.id);
                result.task_name = Some(task.name.clone());
                result.parsed_entities.push(json!({
                    "type": "task",
                    "value": task.name,
                    "id": task.id,
                    "confidence": task_score,
                }));
            }
        }

        result.description = Some(self.extract_description(text, &result));
        result.confidence = calculate_confidence(&result);
        result.confidence_level = Some(ConfidenceLevel::from_score(result.confidence));
        result
    }

    pub fn parse_duration(&self, text: &str) -> Option<ParsedDuration> {
        let lower = text.to_lowercase();
        for (pattern, rule) in &self.patterns.durations {
            let captures = match pattern.captures(&lower) {
                Some(c) => c,
                None => continue,
            };
            let seconds = match rule {
                DurationRule::HoursMinutes => {
                    let hours: i64 = captures[1].parse().ok()?;
                    let minutes: i64 = captures[2].parse().ok()?;
                    hours * 3600 + minutes * 60
                }
                DurationRule::AndAHalf => {
                    let hours: i64 = captures[1].parse().ok()?;
                    hours * 3600 + 1800
                }
                DurationRule::Hours => {
                    let hours: f64 = captures[1].parse().ok()?;
                    (hours * 3600.0) as i64
                }
                DurationRule::Minutes => {
                    let minutes: f64 = captures[1].parse().ok()?;
                    (minutes * 60.0) as i64
                }
                DurationRule::Fixed(secs) => *secs,
            };
            return Some(ParsedDuration {
                seconds,
                original_text: captures[0].to_string(),
                confidence: 0.9,
            });
        }
        None
    }

    pub fn parse_date(&self, text: &str, today: NaiveDate) -> Option<ParsedDate> {
        let lower = text.to_lowercase();

        for keyword in DATE_KEYWORDS {
            if !lower.contains(keyword) {
                continue;
            }
            let date = match *keyword {
                "yesterday" => today - Duration::days(1),
                "tomorrow" => today + Duration::days(1),
                "last week" => today - Duration::weeks(1),
                _ => today,
            };
            return Some(ParsedDate {
                date,
                original_text: keyword.to_string(),
                confidence: 0.95,
            });
        }

        // Day names resolve to the most recent past occurrence; a same-day
        // mention means last week. A "next" prefix flips forward.
        for (day_name, day_num) in DAYS_OF_WEEK {
            let pattern = Regex::new(&format!(r"\b{day_name}\b")).ok()?;
            if !pattern.is_match(&lower) {
                continue;
            }
            let today_num = today.weekday().num_days_from_monday();
            let target = if lower.contains(&format!("next {day_name}")) {
                let ahead = (*day_num + 7 - today_num) % 7;
                today + Duration::days(if ahead == 0 { 7 } else { ahead as i64 })
            } else {
                let back = (today_num + 7 - *day_num) % 7;
                today - Duration::days(if back == 0 { 7 } else { back as i64 })
            };
            return Some(ParsedDate {
                date: target,
                original_text: day_name.to_string(),
                confidence: 0.85,
            });
        }

        // Explicit dates, once duration tokens are stripped out of the way.
        let mut cleaned = lower.clone();
        for (pattern, _) in &self.patterns.durations {
            cleaned = pattern.replace_all(&cleaned, " ").into_owned();
        }
        self.parse_explicit_date(&cleaned, today)
            .filter(|d| d.date != today)
    }

    fn parse_explicit_date(&self, text: &str, today: NaiveDate) -> Option<ParsedDate> {
        if let Some(c) = self.patterns.iso_date.captures(text) {
            let date = NaiveDate::from_ymd_opt(
                c[1].parse().ok()?,
                c[2].parse().ok()?,
                c[3].parse().ok()?,
            )?;
            return Some(ParsedDate {
                date,
                original_text: c[0].to_string(),
                confidence: 0.7,
            });
        }
        if let Some(c) = self.patterns.slash_date.captures(text) {
            let year = c
                .get(3)
                .and_then(|y| y.as_str().parse().ok())
                .unwrap_or_else(|| today.year());
            let date = NaiveDate::from_ymd_opt(year, c[1].parse().ok()?, c[2].parse().ok()?)?;
            return Some(ParsedDate {
                date,
                original_text: c[0].to_string(),
                confidence: 0.7,
            });
        }
        if let Some(c) = self.patterns.month_day.captures(text) {
            let month = 1 + ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"]
                .iter()
                .position(|m| *m == &c[1])? as u32;
            let date = NaiveDate::from_ymd_opt(today.year(), month, c[2].parse().ok()?)?;
            return Some(ParsedDate {
                date,
                original_text: c[0].to_string(),
                confidence: 0.7,
            });
        }
        None
    }

    /// What is left after the matched tokens are removed.
    fn extract_description(&self, text: &str, result: &ParseResult) -> String {
        let mut description = text.to_string();

        // The duration match was recorded verbatim; drop that span
        if let Some(original) = result
            .parsed_entities
            .iter()
            .find(|e| e["type"] == "duration")
            .and_then(|e| e["original"].as_str())
        {
            description = replace_word(&description, original);
        }
        for keyword in DATE_KEYWORDS {
            description = replace_word(&description, keyword);
        }
        for (day_name, _) in DAYS_OF_WEEK {
            description = replace_word(&description, day_name);
        }
        if let Some(name) = &result.project_name {
            description = replace_word(&description, name);
        }
        if let Some(name) = &result.task_name {
            description = replace_word(&description, name);
        }
        for filler in FILLER_WORDS {
            description = replace_word(&description, filler);
        }

        description.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// AI refinement for low-confidence rule parses: strict-JSON prompt,
    /// provider answer mapped back to the active project set, rule fields
    /// backfilled.
    async fn refine_with_ai(
        &self,
        text: &str,
        today: NaiveDate,
        projects: &[ProjectRow],
        rule_result: &ParseResult,
    ) -> AiResult<Option<ParseResult>> {
        let names: Vec<String> = projects.iter().take(10).map(|p| p.name.clone()).collect();
        let outcome = self
            .client
            .generate(&GenerateRequest {
                system_prompt: prompts::nlp_system_prompt(),
                user_prompt: prompts::nlp_user_prompt(text, today, &names),
                temperature: Some(0.1),
                max_tokens: Some(300),
                ..Default::default()
            })
            .await?;

        let data = extract_json_object(&outcome.parsed);
        let data = match data {
            Some(d) => d,
            None => return Ok(None),
        };

        let mut refined = ParseResult {
            original_text: text.to_string(),
            ..Default::default()
        };

        let hours = data["duration_hours"].as_f64().unwrap_or(0.0);
        let minutes = data["duration_minutes"].as_f64().unwrap_or(0.0);
        if hours > 0.0 || minutes > 0.0 {
            let secs = (hours * 3600.0 + minutes * 60.0) as i64;
            refined.duration_seconds = Some(secs);
            refined.duration_display = Some(format_duration(secs));
            refined.parsed_entities.push(json!({
                "type": "duration", "value": secs, "confidence": 0.8, "original": "ai",
            }));
        } else if let Some(secs) = rule_result.duration_seconds {
            refined.duration_seconds = Some(secs);
            refined.duration_display = rule_result.duration_display.clone();
            refined.parsed_entities.push(json!({
                "type": "duration", "value": secs, "confidence": 0.9, "original": "rule",
            }));
        }

        if let Some(ai_name) = data["project_name"].as_str() {
            let ai_lower = ai_name.to_lowercase();
            let matched = projects
                .iter()
                .find(|p| p.name.to_lowercase() == ai_lower)
                .or_else(|| {
                    projects
                        .iter()
                        .find(|p| p.name.to_lowercase().contains(&ai_lower))
                });
            if let Some(project) = matched {
                refined.project_id = Some(project.id);
                refined.project_name = Some(project.name.clone());
                refined.parsed_entities.push(json!({
                    "type": "project", "value": project.name, "id": project.id, "confidence": 0.8,
                }));
            }
        }
        if refined.project_id.is_none() {
            refined.project_id = rule_result.project_id;
            refined.project_name = rule_result.project_name.clone();
            if let Some(entity) = rule_result
                .parsed_entities
                .iter()
                .find(|e| e["type"] == "project")
            {
                refined.parsed_entities.push(entity.clone());
            }
        }

        refined.description = data["description"]
            .as_str()
            .map(String::from)
            .or_else(|| rule_result.description.clone());

        let date = data["date"]
            .as_str()
            .and_then(|d| d.parse::<NaiveDate>().ok());
        refined.start_time = match date {
            Some(d) => Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap())),
            None => rule_result.start_time,
        };
        if let (Some(start), Some(secs)) = (refined.start_time, refined.duration_seconds) {
            refined.end_time = Some(start + Duration::seconds(secs));
        }

        refined.confidence = (calculate_confidence(&refined) + 0.15).min(1.0);
        refined.confidence_level = Some(ConfidenceLevel::from_score(refined.confidence));
        Ok(Some(refined))
    }

    /// Write the confirmed entry. Requires a project and either a duration
    /// or a start time; a present duration must be at least one minute.
    pub fn confirm_entry(
        &self,
        user_id: i64,
        parsed: &Value,
        overrides: Option<&Value>,
    ) -> AiResult<Value> {
        let mut merged = parsed.clone();
        if let (Some(base), Some(extra)) = (merged.as_object_mut(), overrides.and_then(Value::as_object))
        {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }

        let project_id = merged["project_id"]
            .as_i64()
            .ok_or_else(|| AiError::BadInput("project is required".into()))?;
        let duration_seconds = merged["duration_seconds"].as_i64();
        let start_time = merged["start_time"]
            .as_str()
            .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok());
        if duration_seconds.is_none() && start_time.is_none() {
            return Err(AiError::BadInput("duration or start time is required".into()));
        }
        if let Some(secs) = duration_seconds {
            if secs < 60 {
                return Err(AiError::BadInput("duration must be at least one minute".into()));
            }
        }
        if self.store.project(project_id)?.is_none() {
            return Err(AiError::NotFound(format!("project {project_id}")));
        }

        let start = start_time.unwrap_or_else(Utc::now);
        let end = merged["end_time"]
            .as_str()
            .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok())
            .or_else(|| duration_seconds.map(|secs| start + Duration::seconds(secs)));

        let entry_id = self.store.insert_time_entry(
            user_id,
            project_id,
            merged["task_id"].as_i64(),
            start,
            end,
            duration_seconds,
            merged["description"].as_str().unwrap_or(""),
        )?;

        self.gate.log_usage(&UsageRecord {
            user_id: Some(user_id),
            feature_id: FEATURE_ID,
            success: true,
            metadata: Some(json!({"confirmed_entry_id": entry_id})),
            ..Default::default()
        });

        Ok(json!({
            "success": true,
            "time_entry_id": entry_id,
            "message": "Time entry created successfully",
        }))
    }
}

/// Weighted confidence: duration 0.3, project 0.4, task 0.2, date 0.1.
fn calculate_confidence(result: &ParseResult) -> f64 {
    let entity_confidence = |kind: &str| -> Option<f64> {
        result
            .parsed_entities
            .iter()
            .find(|e| e["type"] == kind)
            .and_then(|e| e["confidence"].as_f64())
    };

    let duration_score = if result.duration_seconds.is_some() { 0.9 } else { 0.0 };
    let project_score = if result.project_id.is_some() {
        entity_confidence("project").unwrap_or(0.5)
    } else {
        0.0
    };
    let task_score = if result.task_id.is_some() {
        entity_confidence("task").unwrap_or(0.5)
    } else {
        0.3
    };
    let date_score = if entity_confidence("date").is_some() { 0.9 } else { 0.5 };

    duration_score * 0.3 + project_score * 0.4 + task_score * 0.2 + date_score * 0.1
}

fn clarification_question(result: &ParseResult) -> String {
    let mut missing = Vec::new();
    if result.duration_seconds.is_none() {
        missing.push("how long");
    }
    if result.project_id.is_none() {
        missing.push("which project");
    }
    if missing.is_empty() {
        "Could you provide more details?".to_string()
    } else {
        format!("Could you clarify {}?", missing.join(" and "))
    }
}

/// Best project match: containment scores 0.95, otherwise the larger of
/// sequence similarity and word-hit share, kept above 0.3.
fn match_project<'a>(text: &str, projects: &'a [ProjectRow]) -> Option<(&'a ProjectRow, f64)> {
    let text_lower = text.to_lowercase();
    let mut best: Option<(&ProjectRow, f64)> = None;

    for project in projects {
        let name_lower = project.name.to_lowercase();
        if text_lower.contains(&name_lower) {
            return Some((project, 0.95));
        }

        let ratio = sequence_ratio(&name_lower, &text_lower);
        let words: Vec<&str> = name_lower.split_whitespace().filter(|w| w.len() > 2).collect();
        let word_score = if words.is_empty() {
            0.0
        } else {
            words.iter().filter(|w| text_lower.contains(*w)).count() as f64 / words.len() as f64
        };

        let score = ratio.max(word_score);
        if score > 0.3 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((project, score));
        }
    }
    best
}

/// Task match restricted to the matched project's tasks.
fn match_task<'a>(text: &str, tasks: &'a [TaskRow], project_id: i64) -> Option<(&'a TaskRow, f64)> {
    let text_lower = text.to_lowercase();
    let mut best: Option<(&TaskRow, f64)> = None;

    for task in tasks.iter().filter(|t| t.project_id == project_id) {
        let name_lower = task.name.to_lowercase();
        if text_lower.contains(&name_lower) {
            return Some((task, 0.95));
        }
        let score = sequence_ratio(&name_lower, &text_lower);
        if score >= 0.4 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((task, score));
        }
    }
    best
}

fn replace_word(text: &str, word: &str) -> String {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))) {
        Ok(pattern) => pattern.replace_all(text, " ").into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Pull the first JSON object out of a parsed provider response, whether
/// it arrived as structured JSON or embedded in raw text.
fn extract_json_object(parsed: &Value) -> Option<Value> {
    if parsed.is_object() && !parsed.get("raw_text").map(Value::is_string).unwrap_or(false) {
        return Some(parsed.clone());
    }
    let raw = parsed.get("raw_text")?.as_str()?;
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    serde_json::from_str(&raw[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::client::mock::{MockAdapter, Script};
    use crate::providers::registry::CredentialRegistry;
    use crate::providers::ProviderAdapter;
    use crate::vault::Vault;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<Store>,
        parser: NlParser,
        user_id: i64,
        alpha: i64,
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
        let alpha = store.insert_project("Project Alpha", None, None).unwrap();
        store.insert_project("Website Redesign", None, None).unwrap();

        let parser = NlParser::new(store.clone(), gate, client, cfg);
        Fixture {
            store,
            parser,
            user_id,
            alpha,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Script::Unavailable)
    }

    #[tokio::test]
    async fn test_parse_log_two_hours_yesterday() {
        let f = fixture();
        let response = f
            .parser
            .parse_entry(f.user_id, "Log 2 hours on Project Alpha yesterday", "UTC", false)
            .await
            .unwrap();
        assert_eq!(response["success"], true);
        let result = &response["result"];

        assert_eq!(result["duration_seconds"], 7200);
        assert_eq!(result["project_id"], f.alpha);
        assert_eq!(result["project_name"], "Project Alpha");
        assert!(result["confidence"].as_f64().unwrap() >= 0.8);
        assert_eq!(result["confidence_level"], "high");
        assert_eq!(result["needs_clarification"], false);

        let yesterday = (Utc::now().date_naive() - Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let start: chrono::DateTime<Utc> =
            result["start_time"].as_str().unwrap().parse().unwrap();
        let end: chrono::DateTime<Utc> = result["end_time"].as_str().unwrap().parse().unwrap();
        assert_eq!(start, yesterday);
        assert_eq!(end, yesterday + Duration::hours(2));
    }

    #[test]
    fn test_duration_patterns() {
        let f = fixture();
        let cases = [
            ("worked 2 hours on it", 7200),
            ("2h of work", 7200),
            ("3 hrs", 10800),
            ("45 minutes of triage", 2700),
            ("45 min fixing", 2700),
            ("30m standup", 1800),
            ("1:30 pairing", 5400),
            ("1h30m pairing", 5400),
            ("1h 30m pairing", 5400),
            ("2 and a half hours", 9000),
            ("half an hour", 1800),
            ("half hour", 1800),
            ("quarter hour", 900),
            ("1.5 hours", 5400),
        ];
        for (text, expected) in cases {
            let parsed = f.parser.parse_duration(text).unwrap_or_else(|| panic!("no match: {text}"));
            assert_eq!(parsed.seconds, expected, "text: {text}");
        }
        assert!(f.parser.parse_duration("no numbers here").is_none());
    }

    #[test]
    fn test_duration_format_parse_idempotent() {
        let f = fixture();
        for n in (60..=36_000).step_by(60) {
            let formatted = format_duration(n);
            let parsed = f
                .parser
                .parse_duration(&formatted)
                .unwrap_or_else(|| panic!("no match for {formatted}"));
            assert_eq!(parsed.seconds, n, "round-trip of {formatted}");
        }
    }

    #[test]
    fn test_date_keywords() {
        let f = fixture();
        let today = NaiveDate::from_ymd_opt(2026, 7, 8).unwrap(); // a Wednesday

        let d = f.parser.parse_date("log yesterday", today).unwrap();
        assert_eq!(d.date, today - Duration::days(1));
        let d = f.parser.parse_date("planned for tomorrow", today).unwrap();
        assert_eq!(d.date, today + Duration::days(1));
        let d = f.parser.parse_date("did this last week", today).unwrap();
        assert_eq!(d.date, today - Duration::weeks(1));
        let d = f.parser.parse_date("this morning standup", today).unwrap();
        assert_eq!(d.date, today);
        assert!(f.parser.parse_date("nothing datelike", today).is_none());
    }

    #[test]
    fn test_day_of_week_resolution() {
        let f = fixture();
        let wednesday = NaiveDate::from_ymd_opt(2026, 7, 8).unwrap();

        // Monday resolves to the most recent past Monday
        let d = f.parser.parse_date("on monday", wednesday).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 6).unwrap());
        // Same-day name means one week back
        let d = f.parser.parse_date("on wednesday", wednesday).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
        // "next" flips forward
        let d = f.parser.parse_date("next friday", wednesday).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 10).unwrap());
        // Abbreviations work
        let d = f.parser.parse_date("last fri standup", wednesday).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 3).unwrap());
    }

    #[test]
    fn test_explicit_date_fallback() {
        let f = fixture();
        let today = NaiveDate::from_ymd_opt(2026, 7, 8).unwrap();
        let d = f.parser.parse_date("2 hours on 2026-07-01", today).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
        // An explicit date equal to today is ignored (default handles it)
        assert!(f.parser.parse_date("on 2026-07-08", today).is_none());
        let d = f.parser.parse_date("did it jul 3", today).unwrap();
        assert_eq!(d.date, NaiveDate::from_ymd_opt(2026, 7, 3).unwrap());
    }

    #[test]
    fn test_project_matching_modes() {
        let projects = vec![
            ProjectRow {
                id: 1,
                name: "Project Alpha".into(),
                team_id: None,
                is_archived: false,
                budget_total: None,
            },
            ProjectRow {
                id: 2,
                name: "Website Redesign".into(),
                team_id: None,
                is_archived: false,
                budget_total: None,
            },
        ];

        // Containment
        let (p, score) = match_project("worked on project alpha today", &projects).unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(score, 0.95);

        // Word-hit ratio ("website" appears, "redesign" does not)
        let (p, score) = match_project("fixed the website header", &projects).unwrap();
        assert_eq!(p.id, 2);
        assert!(score >= 0.5);

        // Nothing relevant
        assert!(match_project("zzz qqq vvv kkk", &projects).is_none());
    }

    #[test]
    fn test_task_matching_scoped_to_project() {
        let tasks = vec![
            TaskRow {
                id: 10,
                project_id: 1,
                name: "code review".into(),
                status: "TODO".into(),
            },
            TaskRow {
                id: 11,
                project_id: 2,
                name: "code review".into(),
                status: "TODO".into(),
            },
        ];
        let (task, score) = match_task("did code review for alpha", &tasks, 1).unwrap();
        assert_eq!(task.id, 10);
        assert_eq!(score, 0.95);
        assert!(match_task("zzz qqq vvv", &tasks, 1).is_none());
    }

    #[test]
    fn test_sequence_ratio_behaviour() {
        assert!((sequence_ratio("abc", "abc") - 1.0).abs() < 1e-9);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
        let close = sequence_ratio("project alpha", "project alpah");
        assert!(close > 0.8);
        let far = sequence_ratio("alpha", "zzzzz");
        assert!(far < 0.2);
    }

    #[tokio::test]
    async fn test_description_strips_matched_tokens() {
        let f = fixture();
        let response = f
            .parser
            .parse_entry(
                f.user_id,
                "Log 2 hours on Project Alpha yesterday fixing the login flow",
                "UTC",
                false,
            )
            .await
            .unwrap();
        let description = response["result"]["description"].as_str().unwrap();
        assert!(description.contains("fixing the login flow"));
        assert!(!description.to_lowercase().contains("alpha"));
        assert!(!description.to_lowercase().contains("yesterday"));
        assert!(!description.to_lowercase().contains("2 hours"));
    }

    #[tokio::test]
    async fn test_low_confidence_asks_for_clarification() {
        let f = fixture();
        let response = f
            .parser
            .parse_entry(f.user_id, "did some stuff", "UTC", false)
            .await
            .unwrap();
        let result = &response["result"];
        assert_eq!(result["needs_clarification"], true);
        let question = result["clarification_question"].as_str().unwrap();
        assert!(question.contains("how long"));
        assert!(question.contains("which project"));
        // Unmatched project: suggestions offered
        assert!(!result["suggestions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_is_bad_input() {
        let f = fixture();
        let err = f
            .parser
            .parse_entry(f.user_id, "   ", "UTC", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));
    }

    #[tokio::test]
    async fn test_ai_refinement_backfills() {
        let f = fixture_with(Script::Succeed(
            r#"{"duration_hours": 1, "duration_minutes": 30, "project_name": "project alpha", "description": "debug session", "date": "2026-07-01"}"#.into(),
        ));
        // Vague text: rule confidence is low, so the provider is consulted
        let response = f
            .parser
            .parse_entry(f.user_id, "spent some time debugging", "UTC", true)
            .await
            .unwrap();
        let result = &response["result"];
        assert_eq!(result["duration_seconds"], 5400);
        assert_eq!(result["project_id"], f.alpha);
        assert_eq!(result["description"], "debug session");
        assert!(result["start_time"].as_str().unwrap().starts_with("2026-07-01"));
        // Confidence got the refinement boost
        assert!(result["confidence"].as_f64().unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_confirm_entry_roundtrip() {
        let f = fixture();
        let parsed = json!({
            "project_id": f.alpha,
            "duration_seconds": 7200,
            "start_time": "2026-07-07T00:00:00+00:00",
            "end_time": "2026-07-07T02:00:00+00:00",
            "description": "writeup",
        });
        let confirmed = f.parser.confirm_entry(f.user_id, &parsed, None).unwrap();
        assert_eq!(confirmed["success"], true);
        let entry_id = confirmed["time_entry_id"].as_i64().unwrap();
        assert!(entry_id > 0);

        let entries = f
            .store
            .completed_entries_between(
                f.user_id,
                NaiveDate::from_ymd_opt(2026, 7, 7).unwrap(),
                NaiveDate::from_ymd_opt(2026, 7, 7).unwrap(),
            )
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration_seconds, Some(7200));
        assert_eq!(entries[0].description.as_deref(), Some("writeup"));
    }

    #[tokio::test]
    async fn test_confirm_entry_validation() {
        let f = fixture();
        // Missing project
        let err = f
            .parser
            .confirm_entry(f.user_id, &json!({"duration_seconds": 3600}), None)
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));

        // Missing both duration and start
        let err = f
            .parser
            .confirm_entry(f.user_id, &json!({"project_id": f.alpha}), None)
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));

        // Sub-minute duration
        let err = f
            .parser
            .confirm_entry(
                f.user_id,
                &json!({"project_id": f.alpha, "duration_seconds": 30}),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));

        // Unknown project
        let err = f
            .parser
            .confirm_entry(
                f.user_id,
                &json!({"project_id": 999, "duration_seconds": 3600}),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_confirm_entry_overrides_win() {
        let f = fixture();
        let parsed = json!({
            "project_id": f.alpha,
            "duration_seconds": 3600,
            "description": "draft",
        });
        let overrides = json!({"description": "final", "duration_seconds": 5400});
        let confirmed = f
            .parser
            .confirm_entry(f.user_id, &parsed, Some(&overrides))
            .unwrap();
        assert_eq!(confirmed["success"], true);

        let today = Utc::now().date_naive();
        let entries = f
            .store
            .completed_entries_between(f.user_id, today, today)
            .unwrap();
        assert_eq!(entries[0].duration_seconds, Some(5400));
        assert_eq!(entries[0].description.as_deref(), Some("final"));
    }

    #[tokio::test]
    async fn test_disabled_feature_structured_response() {
        let f = fixture();
        f.parser.gate.set_global(FEATURE_ID, false, 1).unwrap();
        let response = f
            .parser
            .parse_entry(f.user_id, "2h on alpha", "UTC", false)
            .await
            .unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["enabled"], false);
    }
}
