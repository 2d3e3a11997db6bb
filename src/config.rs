//! Runtime configuration, loaded from the environment with defaults.

use std::path::PathBuf;
use std::time::Duration;

/// All tunables for the AI subsystem. Constructed once at startup and
/// shared behind `Arc`.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub socket_path: PathBuf,

    /// PBKDF2 input for credential encryption; must be at least 32 bytes.
    pub master_encryption_key: String,

    // Provider defaults
    pub gemini_model: String,
    pub openai_model: String,
    pub gemini_temperature: f32,
    pub gemini_max_tokens: u32,
    /// Per-call timeout for the OpenAI path, in seconds.
    pub openai_timeout_secs: u64,

    // Suggestions
    pub suggestion_confidence_threshold: f64,
    pub suggestion_lookback_days: i64,

    // NLP
    pub nlp_confidence_threshold: f64,

    // Anomaly thresholds
    pub anomaly_extended_day_hours: f64,
    pub anomaly_consecutive_long_days: u32,
    pub anomaly_weekend_hours: f64,
    pub anomaly_long_day_hours: f64,

    // Cache TTLs
    pub cache_ttl_suggestions: Duration,
    pub cache_ttl_anomalies: Duration,
    pub cache_ttl_user_context: Duration,
    pub cache_ttl_forecasts: Duration,

    // Rate limits
    pub requests_per_minute: i64,
    pub requests_per_hour: i64,

    // Statistical anomaly detector gating
    pub min_samples_for_ml_anomaly: usize,
    pub baseline_days: i64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AiConfig {
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = std::env::var("TEMPO_AI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".tempo-ai"));

        Self {
            db_path: data_dir.join("tempo-ai.db"),
            socket_path: data_dir.join("tempo-ai.sock"),
            data_dir,

            master_encryption_key: std::env::var("TEMPO_AI_MASTER_KEY").unwrap_or_default(),

            gemini_model: std::env::var("TEMPO_AI_GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            openai_model: std::env::var("TEMPO_AI_OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            gemini_temperature: env_or("TEMPO_AI_GEMINI_TEMPERATURE", 0.7),
            gemini_max_tokens: env_or("TEMPO_AI_GEMINI_MAX_TOKENS", 1000),
            openai_timeout_secs: env_or("TEMPO_AI_OPENAI_TIMEOUT", 30),

            suggestion_confidence_threshold: env_or("TEMPO_AI_SUGGESTION_THRESHOLD", 0.3),
            suggestion_lookback_days: env_or("TEMPO_AI_SUGGESTION_LOOKBACK_DAYS", 30),

            nlp_confidence_threshold: env_or("TEMPO_AI_NLP_THRESHOLD", 0.7),

            anomaly_extended_day_hours: env_or("TEMPO_AI_ANOMALY_EXTENDED_DAY_HOURS", 12.0),
            anomaly_consecutive_long_days: env_or("TEMPO_AI_ANOMALY_CONSECUTIVE_LONG_DAYS", 5),
            anomaly_weekend_hours: env_or("TEMPO_AI_ANOMALY_WEEKEND_HOURS", 4.0),
            anomaly_long_day_hours: env_or("TEMPO_AI_ANOMALY_LONG_DAY_HOURS", 10.0),

            cache_ttl_suggestions: Duration::from_secs(env_or("TEMPO_AI_CACHE_TTL_SUGGESTIONS", 300)),
            cache_ttl_anomalies: Duration::from_secs(env_or("TEMPO_AI_CACHE_TTL_ANOMALIES", 3600)),
            cache_ttl_user_context: Duration::from_secs(env_or("TEMPO_AI_CACHE_TTL_USER_CONTEXT", 900)),
            cache_ttl_forecasts: Duration::from_secs(env_or("TEMPO_AI_CACHE_TTL_FORECASTS", 3600)),

            requests_per_minute: env_or("TEMPO_AI_REQUESTS_PER_MINUTE", 60),
            requests_per_hour: env_or("TEMPO_AI_REQUESTS_PER_HOUR", 1000),

            min_samples_for_ml_anomaly: env_or("TEMPO_AI_MIN_ML_SAMPLES", 30),
            baseline_days: env_or("TEMPO_AI_BASELINE_DAYS", 30),
        }
    }

    /// Defaults with an in-memory-friendly data dir, for tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut cfg = Self::from_env();
        cfg.master_encryption_key = "test-master-key-0123456789abcdef".to_string();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AiConfig::for_tests();
        assert!(cfg.master_encryption_key.len() >= 32);
        assert_eq!(cfg.anomaly_extended_day_hours, 12.0);
        assert_eq!(cfg.anomaly_consecutive_long_days, 5);
        assert_eq!(cfg.cache_ttl_suggestions, Duration::from_secs(300));
        assert_eq!(cfg.requests_per_minute, 60);
        assert_eq!(cfg.min_samples_for_ml_anomaly, 30);
    }
}
