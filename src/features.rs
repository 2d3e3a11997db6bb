//! Feature gate — decides whether an AI feature is active for a user.
//!
//! Two-level policy: global admin toggle × per-user preference, with admin
//! override and credential availability in between. The resolution is a
//! pure function over the three inputs so the whole decision table can be
//! tested exhaustively. Priority: global OFF > missing credential > admin
//! override > user preference > default ON.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{AiError, AiResult};
use crate::store::features::{FeatureSetting, UserPreference};
use crate::store::usage::UsageRecord;
use crate::store::Store;

/// Why a feature resolved the way it did. The strings are part of the API
/// surface; handlers show them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStatus {
    pub is_enabled: bool,
    pub global_enabled: bool,
    pub user_enabled: Option<bool>,
    pub admin_override: bool,
    pub reason: String,
}

/// Pure resolution over `(global setting, credential present, user pref)`.
fn resolve(
    setting: Option<&FeatureSetting>,
    credential_present: bool,
    pref: Option<&UserPreference>,
) -> FeatureStatus {
    let setting = match setting {
        Some(s) => s,
        None => {
            return FeatureStatus {
                is_enabled: false,
                global_enabled: false,
                user_enabled: None,
                admin_override: false,
                reason: "not found".into(),
            }
        }
    };

    if !setting.is_enabled {
        return FeatureStatus {
            is_enabled: false,
            global_enabled: false,
            user_enabled: None,
            admin_override: false,
            reason: "disabled by administrator".into(),
        };
    }

    if setting.requires_api_key && setting.api_provider.is_some() && !credential_present {
        let provider = setting.api_provider.as_deref().unwrap_or("provider");
        return FeatureStatus {
            is_enabled: false,
            global_enabled: true,
            user_enabled: None,
            admin_override: false,
            reason: format!("requires {provider} key"),
        };
    }

    match pref {
        Some(p) if p.admin_override => FeatureStatus {
            is_enabled: p.effective_enabled(),
            global_enabled: true,
            user_enabled: Some(p.is_enabled),
            admin_override: true,
            reason: "admin override".into(),
        },
        Some(p) => FeatureStatus {
            is_enabled: p.is_enabled,
            global_enabled: true,
            user_enabled: Some(p.is_enabled),
            admin_override: false,
            reason: "user preference".into(),
        },
        None => FeatureStatus {
            is_enabled: true,
            global_enabled: true,
            user_enabled: None,
            admin_override: false,
            reason: "enabled (default)".into(),
        },
    }
}

pub struct FeatureGate {
    store: Arc<Store>,
}

impl FeatureGate {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn is_enabled(&self, feature_id: &str, user_id: i64) -> AiResult<bool> {
        Ok(self.status(feature_id, user_id)?.is_enabled)
    }

    pub fn status(&self, feature_id: &str, user_id: i64) -> AiResult<FeatureStatus> {
        let setting = self.store.feature_setting(feature_id)?;
        let credential_present = match setting
            .as_ref()
            .filter(|s| s.requires_api_key)
            .and_then(|s| s.api_provider.as_deref())
        {
            Some(provider) => self.store.has_active_credential(provider)?,
            None => true,
        };
        let pref = self.store.user_preference(user_id, feature_id)?;
        Ok(resolve(setting.as_ref(), credential_present, pref.as_ref()))
    }

    // ── Mutators ────────────────────────────────────────────────────

    pub fn set_global(&self, feature_id: &str, enabled: bool, by: i64) -> AiResult<FeatureSetting> {
        self.store
            .update_feature_setting(feature_id, enabled, by)?
            .ok_or_else(|| AiError::NotFound(format!("feature '{feature_id}'")))
    }

    /// A user changing their own toggle. Refused while an admin override
    /// is in place.
    pub fn set_user_preference(
        &self,
        user_id: i64,
        feature_id: &str,
        enabled: bool,
    ) -> AiResult<UserPreference> {
        if let Some(existing) = self.store.user_preference(user_id, feature_id)? {
            if existing.admin_override {
                return Err(AiError::Forbidden(
                    "preference is locked by an admin override".into(),
                ));
            }
        }
        self.store.set_preference_value(user_id, feature_id, enabled)?;
        self.store
            .user_preference(user_id, feature_id)?
            .ok_or_else(|| AiError::Internal("preference vanished after upsert".into()))
    }

    pub fn set_admin_override(
        &self,
        user_id: i64,
        feature_id: &str,
        enabled: bool,
        admin_id: i64,
    ) -> AiResult<UserPreference> {
        self.store.set_override(user_id, feature_id, enabled, admin_id)?;
        self.store
            .user_preference(user_id, feature_id)?
            .ok_or_else(|| AiError::Internal("preference vanished after upsert".into()))
    }

    /// Lift an override, restoring self-service; resolution falls back to
    /// the user's own stored preference.
    pub fn remove_admin_override(
        &self,
        user_id: i64,
        feature_id: &str,
    ) -> AiResult<Option<UserPreference>> {
        match self.store.user_preference(user_id, feature_id)? {
            Some(pref) if pref.admin_override => {
                self.store.clear_override(user_id, feature_id)?;
                self.store.user_preference(user_id, feature_id)
            }
            other => Ok(other),
        }
    }

    // ── Summaries ───────────────────────────────────────────────────

    /// Every feature with its resolved status for one user.
    pub fn user_features_summary(&self, user_id: i64) -> AiResult<Vec<Value>> {
        let mut out = Vec::new();
        for setting in self.store.all_feature_settings()? {
            let status = self.status(&setting.feature_id, user_id)?;
            out.push(json!({
                "feature_id": setting.feature_id,
                "feature_name": setting.feature_name,
                "description": setting.description,
                "api_provider": setting.api_provider,
                "is_enabled": status.is_enabled,
                "global_enabled": status.global_enabled,
                "user_enabled": status.user_enabled,
                "admin_override": status.admin_override,
                "reason": status.reason,
            }));
        }
        Ok(out)
    }

    /// Admin view: global toggles plus adoption and 30-day usage.
    pub fn admin_features_summary(&self) -> AiResult<Vec<Value>> {
        let mut out = Vec::new();
        for setting in self.store.all_feature_settings()? {
            let (enabled_users, total_users) =
                self.store.count_users_with_feature_enabled(&setting.feature_id)?;
            let usage = self.store.feature_usage_stats(&setting.feature_id, 30)?;
            out.push(json!({
                "feature_id": setting.feature_id,
                "feature_name": setting.feature_name,
                "description": setting.description,
                "is_enabled": setting.is_enabled,
                "requires_api_key": setting.requires_api_key,
                "api_provider": setting.api_provider,
                "enabled_user_count": enabled_users,
                "total_user_count": total_users,
                "usage_this_month": usage,
            }));
        }
        Ok(out)
    }

    /// Append one ledger record for a served request.
    pub fn log_usage(&self, record: &UsageRecord<'_>) {
        if let Err(e) = self.store.append_usage(record) {
            tracing::error!(feature = record.feature_id, "Failed to append usage record: {e}");
        }
    }
}
