//! Error kinds for the orchestration subsystem.
//!
//! One flat enum; handlers translate kinds to status codes at the edge.
//! Cache and rate-limiter faults never reach this type — the cache fails
//! miss and the limiter fails open.

use thiserror::Error;

pub type AiResult<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("feature '{0}' is disabled")]
    FeatureDisabled(String),

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("provider '{provider}' timed out")]
    Timeout { provider: String },

    #[error("all AI providers failed: {errors}")]
    AllProvidersFailed { errors: String },

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("invalid response from '{provider}': {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("cache store unavailable")]
    CacheUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AiError {
    /// JSON-RPC error code for this kind. The daemon's dispatch layer maps
    /// these one-to-one; an HTTP edge would map them to 400/403/404/429/503.
    pub fn rpc_code(&self) -> i32 {
        match self {
            AiError::BadInput(_) => -32602,
            AiError::NotFound(_) => -32004,
            AiError::Forbidden(_) => -32003,
            AiError::FeatureDisabled(_) => -32010,
            AiError::RateLimited { .. } => -32002,
            AiError::ProviderUnavailable { .. } => -32011,
            AiError::Timeout { .. } => -32012,
            AiError::AllProvidersFailed { .. } => -32013,
            AiError::CryptoFailure(_) => -32014,
            AiError::InvalidResponse { .. } => -32015,
            AiError::CacheUnavailable => -32016,
            AiError::Internal(_) => -32603,
        }
    }

    /// Provider-scoped errors participate in primary/fallback cycling;
    /// anything else aborts the attempt chain immediately.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            AiError::RateLimited { .. }
                | AiError::ProviderUnavailable { .. }
                | AiError::Timeout { .. }
                | AiError::InvalidResponse { .. }
        )
    }
}

impl From<rusqlite::Error> for AiError {
    fn from(e: rusqlite::Error) -> Self {
        AiError::Internal(format!("storage: {e}"))
    }
}
