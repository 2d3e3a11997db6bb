//! Prompt builders for the AI stages. Centralized so the JSON contracts
//! the engines parse against live next to the text that requests them.

use chrono::{DateTime, NaiveDate, Utc};

use crate::context::{TimeContext, UserContext};

// ── Suggestions ─────────────────────────────────────────────────────

pub fn suggestion_system_prompt() -> String {
    r#"You are an intelligent assistant for a time tracking application.
Your job is to suggest the most likely project and task a user wants to work on based on:
1. Their historical work patterns
2. Current time of day and day of week
3. Recent activity
4. Any partial description they've entered

Respond ONLY with valid JSON in this exact format:
{
  "suggestions": [
    {
      "project_id": <int>,
      "project_name": "<string>",
      "task_id": <int or null>,
      "task_name": "<string or null>",
      "suggested_description": "<string>",
      "confidence": <float 0.0-1.0>,
      "reason": "<brief explanation>"
    }
  ]
}

Rules:
- Return 3-5 suggestions ordered by confidence (highest first)
- Confidence should reflect how likely this is what the user wants
- Only suggest projects the user has access to
- Be concise in reasons (max 50 chars)"#
        .to_string()
}

pub fn suggestion_user_prompt(
    user: &UserContext,
    time: &TimeContext,
    partial_description: Option<&str>,
) -> String {
    let recent = if user.recent_entries.is_empty() {
        "No recent entries".to_string()
    } else {
        user.recent_entries
            .iter()
            .take(10)
            .map(|e| {
                format!(
                    "- {}/{}: {} ({:.1}h on {})",
                    e.project_name,
                    e.task_name.as_deref().unwrap_or("No task"),
                    e.description.as_deref().unwrap_or("No description"),
                    e.hours(),
                    crate::context::weekday_name(chrono::Datelike::weekday(&e.start_time)),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let projects = if user.active_projects.is_empty() {
        "No projects available".to_string()
    } else {
        user.active_projects
            .iter()
            .take(15)
            .map(|p| format!("- ID:{} {}", p.id, p.name))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut prompt = format!(
        "User: {}\nCurrent time: {:02}:{:02} on {}\n\nRecent time entries:\n{recent}\n\nAvailable projects:\n{projects}\n",
        user.user_name, time.hour, time.minute, time.day_of_week,
    );
    if let Some(partial) = partial_description {
        prompt.push_str(&format!("\nUser is typing: \"{partial}\"\n"));
    }
    prompt.push_str("\nSuggest the most likely project/task combinations:");
    prompt
}

// ── NLP parsing ─────────────────────────────────────────────────────

pub fn nlp_system_prompt() -> String {
    "You are a precise time entry parser. Return only valid JSON.".to_string()
}

pub fn nlp_user_prompt(text: &str, today: NaiveDate, project_names: &[String]) -> String {
    format!(
        r#"Parse this time entry request and extract the relevant information.

User said: "{text}"

Available projects: {}

Extract:
1. Duration (in hours and minutes)
2. Project name (must match one from the list above)
3. Task description
4. Date (relative to today: {today})

Return a JSON object with:
{{
    "duration_hours": number,
    "duration_minutes": number,
    "project_name": string or null,
    "description": string,
    "date": "YYYY-MM-DD" or null
}}

Be precise. If unsure, set to null."#,
        project_names.join(", "),
    )
}

// ── Report summaries ────────────────────────────────────────────────

pub fn summary_system_prompt() -> String {
    "You are a professional productivity assistant. Write clear, concise summaries.".to_string()
}

pub fn weekly_summary_prompt(
    total_hours: f64,
    change_pct: f64,
    project_count: i64,
    avg_daily_hours: f64,
    top_project: Option<&str>,
    observations: &[String],
    generated_at: DateTime<Utc>,
) -> String {
    let observation_lines = if observations.is_empty() {
        "- Steady week".to_string()
    } else {
        observations
            .iter()
            .map(|o| format!("- {o}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"Generate a brief, professional weekly summary for a time tracking application.

Data (as of {}):
- Total hours: {total_hours:.1}
- Change from last week: {change_pct:.0}%
- Projects worked on: {project_count}
- Average daily hours: {avg_daily_hours:.1}
- Top project: {}

Key observations:
{observation_lines}

Write 2-3 sentences summarizing this week's activity. Be concise and actionable."#,
        generated_at.format("%Y-%m-%d"),
        top_project.unwrap_or("N/A"),
    )
}
