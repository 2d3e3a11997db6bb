//! Unix socket JSON-RPC server — the handler surface of the subsystem.
//!
//! One JSON-RPC 2.0 request per line; every method maps to one
//! orchestrator operation. Authentication, sessions and HTTP routing
//! belong to the main application; this daemon is local-only.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::error::{AiError, AiResult};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

pub struct Server {
    socket_path: PathBuf,
    orchestrator: Arc<Orchestrator>,
}

impl Server {
    pub fn new(socket_path: PathBuf, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            socket_path,
            orchestrator,
        }
    }

    pub async fn run(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "JSON-RPC server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, orchestrator).await {
                    warn!("Connection error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    orchestrator: Arc<Orchestrator>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => {
                let request_id = uuid::Uuid::new_v4();
                let id = request.id.clone();
                let params = request.params.unwrap_or(Value::Null);
                match dispatch(&orchestrator, &request.method, &params).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => {
                        warn!(request_id = %request_id, method = %request.method, error = %e, "Request failed");
                        JsonRpcResponse::failure(id, e.rpc_code(), e.to_string())
                    }
                }
            }
            Err(e) => JsonRpcResponse::failure(None, -32700, format!("Parse error: {e}")),
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}

fn required_i64(params: &Value, field: &str) -> AiResult<i64> {
    params[field]
        .as_i64()
        .ok_or_else(|| AiError::BadInput(format!("missing '{field}'")))
}

fn required_str<'a>(params: &'a Value, field: &str) -> AiResult<&'a str> {
    params[field]
        .as_str()
        .ok_or_else(|| AiError::BadInput(format!("missing '{field}'")))
}

/// Route one method to the orchestrator. Kept free of transport concerns
/// so the full surface is testable without a socket.
pub async fn dispatch(orch: &Orchestrator, method: &str, params: &Value) -> AiResult<Value> {
    match method {
        "ai.status" => orch.status(),

        // ── Engines ──
        "ai.suggest" => {
            let user_id = required_i64(params, "user_id")?;
            let limit = params["limit"].as_u64().unwrap_or(5) as usize;
            let use_ai = params["use_ai"].as_bool().unwrap_or(true);
            orch.suggestions
                .suggest(user_id, params["partial_description"].as_str(), limit, use_ai)
                .await
        }
        "ai.suggest.feedback" => {
            let user_id = required_i64(params, "user_id")?;
            let suggestion = required_i64(params, "suggestion_project_id")?;
            let accepted = params["accepted"].as_bool().unwrap_or(false);
            orch.suggestions.record_feedback(
                user_id,
                suggestion,
                accepted,
                params["actual_project_id"].as_i64(),
            )?;
            Ok(json!({ "recorded": true }))
        }
        "ai.anomalies.scanUser" => {
            let user_id = required_i64(params, "user_id")?;
            let period_days = params["period_days"].as_i64().unwrap_or(7);
            orch.anomalies.scan_user(user_id, period_days)
        }
        "ai.anomalies.scanAll" => {
            let period_days = params["period_days"].as_i64().unwrap_or(7);
            orch.anomalies.scan_all(params["team_id"].as_i64(), period_days)
        }
        "ai.forecast.payroll" => {
            let user_id = required_i64(params, "user_id")?;
            let period_type = params["period_type"].as_str().unwrap_or("bi_weekly");
            let periods_ahead = params["periods_ahead"].as_u64().unwrap_or(1) as usize;
            let include_overtime = params["include_overtime"].as_bool().unwrap_or(true);
            orch.forecaster
                .forecast_payroll(user_id, period_type, periods_ahead, include_overtime)
        }
        "ai.forecast.overtime" => {
            let user_id = required_i64(params, "user_id")?;
            let days_ahead = params["days_ahead"].as_i64().unwrap_or(7);
            orch.forecaster
                .assess_overtime_risk(user_id, days_ahead, params["team_id"].as_i64())
        }
        "ai.forecast.projectBudget" => {
            let user_id = required_i64(params, "user_id")?;
            orch.forecaster.forecast_project_budget(
                user_id,
                params["project_id"].as_i64(),
                params["team_id"].as_i64(),
            )
        }
        "ai.forecast.cashFlow" => {
            let user_id = required_i64(params, "user_id")?;
            let weeks_ahead = params["weeks_ahead"].as_u64().unwrap_or(4) as usize;
            orch.forecaster.forecast_cash_flow(user_id, weeks_ahead)
        }
        "ai.nlp.parse" => {
            let user_id = required_i64(params, "user_id")?;
            let text = required_str(params, "text")?;
            let timezone = params["timezone"].as_str().unwrap_or("UTC");
            let use_ai = params["use_ai"].as_bool().unwrap_or(true);
            orch.nlp.parse_entry(user_id, text, timezone, use_ai).await
        }
        "ai.nlp.confirm" => {
            let user_id = required_i64(params, "user_id")?;
            let parsed = params
                .get("parsed")
                .filter(|p| p.is_object())
                .ok_or_else(|| AiError::BadInput("missing 'parsed'".into()))?;
            orch.nlp.confirm_entry(user_id, parsed, params.get("overrides"))
        }
        "ai.report.weekly" => {
            let user_id = required_i64(params, "user_id")?;
            let use_ai = params["use_ai"].as_bool().unwrap_or(true);
            orch.reports
                .weekly_report(user_id, params["team_id"].as_i64(), use_ai)
                .await
        }
        "ai.report.projectHealth" => {
            let user_id = required_i64(params, "user_id")?;
            let project_id = required_i64(params, "project_id")?;
            orch.reports.project_health(user_id, project_id)
        }
        "ai.report.userInsights" => {
            let user_id = required_i64(params, "user_id")?;
            orch.reports
                .user_insights(user_id, params["target_user_id"].as_i64())
        }

        // ── Feature administration ──
        "ai.features.summary" => {
            let user_id = required_i64(params, "user_id")?;
            Ok(Value::Array(orch.gate.user_features_summary(user_id)?))
        }
        "ai.admin.features.list" => Ok(Value::Array(orch.gate.admin_features_summary()?)),
        "ai.admin.features.update" => {
            let feature_id = required_str(params, "feature_id")?;
            let enabled = params["enabled"]
                .as_bool()
                .ok_or_else(|| AiError::BadInput("missing 'enabled'".into()))?;
            let updated_by = required_i64(params, "updated_by")?;
            let setting = orch.gate.set_global(feature_id, enabled, updated_by)?;
            Ok(serde_json::to_value(setting).unwrap_or_default())
        }
        "ai.admin.prefs.list" => {
            let user_id = required_i64(params, "user_id")?;
            Ok(serde_json::to_value(orch.store.user_preferences(user_id)?).unwrap_or_default())
        }
        "ai.admin.prefs.set" => {
            let user_id = required_i64(params, "user_id")?;
            let feature_id = required_str(params, "feature_id")?;
            let enabled = params["enabled"]
                .as_bool()
                .ok_or_else(|| AiError::BadInput("missing 'enabled'".into()))?;
            let pref = orch.gate.set_user_preference(user_id, feature_id, enabled)?;
            orch.cache.invalidate_user(user_id);
            Ok(serde_json::to_value(pref).unwrap_or_default())
        }
        "ai.admin.prefs.override" => {
            let user_id = required_i64(params, "user_id")?;
            let feature_id = required_str(params, "feature_id")?;
            let enabled = params["enabled"]
                .as_bool()
                .ok_or_else(|| AiError::BadInput("missing 'enabled'".into()))?;
            let admin_id = required_i64(params, "admin_id")?;
            let pref = orch
                .gate
                .set_admin_override(user_id, feature_id, enabled, admin_id)?;
            orch.cache.invalidate_user(user_id);
            Ok(serde_json::to_value(pref).unwrap_or_default())
        }
        "ai.admin.prefs.removeOverride" => {
            let user_id = required_i64(params, "user_id")?;
            let feature_id = required_str(params, "feature_id")?;
            let pref = orch.gate.remove_admin_override(user_id, feature_id)?;
            Ok(serde_json::to_value(pref).unwrap_or_default())
        }

        // ── Credential administration ──
        "ai.admin.keys.list" => orch.credentials_list(
            params["provider"].as_str(),
            params["active_only"].as_bool().unwrap_or(false),
        ),
        "ai.admin.keys.create" => {
            let provider = required_str(params, "provider")?;
            let api_key = required_str(params, "api_key")?.to_string();
            orch.credentials_create(
                provider,
                api_key,
                params["label"].as_str(),
                params["notes"].as_str(),
                params["created_by"].as_i64(),
            )
        }
        "ai.admin.keys.get" => orch.credentials_get(required_i64(params, "id")?),
        "ai.admin.keys.update" => orch.credentials_update(
            required_i64(params, "id")?,
            params["label"].as_str(),
            params["notes"].as_str(),
            params["is_active"].as_bool(),
        ),
        "ai.admin.keys.delete" => orch.credentials_delete(required_i64(params, "id")?),
        "ai.admin.keys.test" => {
            let outcome = orch.credentials_test(required_i64(params, "id")?).await?;
            Ok(serde_json::to_value(outcome).unwrap_or_default())
        }

        // ── Usage ──
        "ai.usage.summary" => {
            let days = params["days"].as_i64().unwrap_or(30);
            orch.store.usage_summary(days)
        }
        "ai.usage.user" => {
            let user_id = required_i64(params, "user_id")?;
            let days = params["days"].as_i64().unwrap_or(30);
            orch.store.user_usage_stats(user_id, days)
        }

        other => Err(AiError::NotFound(format!("unknown method '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiConfig;
    use crate::providers::client::mock::{MockAdapter, Script};
    use crate::providers::ProviderAdapter;
    use crate::store::Store;
    use std::collections::HashMap;

    fn orchestrator() -> Arc<Orchestrator> {
        let cfg = Arc::new(AiConfig::for_tests());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            "gemini",
            Box::new(MockAdapter::new("gemini", Script::Succeed("ok".into()))),
        );
        Arc::new(Orchestrator::with_parts(cfg, store, adapters).unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let orch = orchestrator();
        let err = dispatch(&orch, "ai.nonsense", &json!({})).await.unwrap_err();
        assert!(matches!(err, AiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dispatch_missing_params() {
        let orch = orchestrator();
        let err = dispatch(&orch, "ai.suggest", &json!({})).await.unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));
        let err = dispatch(&orch, "ai.nlp.parse", &json!({"user_id": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::BadInput(_)));
    }

    #[tokio::test]
    async fn test_dispatch_feature_admin_flow() {
        let orch = orchestrator();
        let listed = dispatch(&orch, "ai.admin.features.list", &json!({})).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 6);

        let updated = dispatch(
            &orch,
            "ai.admin.features.update",
            &json!({"feature_id": "ai_suggestions", "enabled": false, "updated_by": 1}),
        )
        .await
        .unwrap();
        assert_eq!(updated["is_enabled"], false);

        let prefs = dispatch(
            &orch,
            "ai.admin.prefs.override",
            &json!({"user_id": 7, "feature_id": "ai_nlp_entry", "enabled": false, "admin_id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(prefs["admin_override"], true);

        // Self-service is refused while the override stands
        let err = dispatch(
            &orch,
            "ai.admin.prefs.set",
            &json!({"user_id": 7, "feature_id": "ai_nlp_entry", "enabled": true}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AiError::Forbidden(_)));

        dispatch(
            &orch,
            "ai.admin.prefs.removeOverride",
            &json!({"user_id": 7, "feature_id": "ai_nlp_entry"}),
        )
        .await
        .unwrap();
        let set = dispatch(
            &orch,
            "ai.admin.prefs.set",
            &json!({"user_id": 7, "feature_id": "ai_nlp_entry", "enabled": true}),
        )
        .await
        .unwrap();
        assert_eq!(set["is_enabled"], true);
    }

    #[tokio::test]
    async fn test_dispatch_keys_and_usage() {
        let orch = orchestrator();
        let created = dispatch(
            &orch,
            "ai.admin.keys.create",
            &json!({"provider": "gemini", "api_key": "AIzaSyTest0123456789xyz", "label": "prod"}),
        )
        .await
        .unwrap();
        let id = created["id"].as_i64().unwrap();

        let listed = dispatch(&orch, "ai.admin.keys.list", &json!({"provider": "gemini"}))
            .await
            .unwrap();
        assert_eq!(listed["total"], 1);

        let status = dispatch(&orch, "ai.status", &json!({})).await.unwrap();
        assert_eq!(status["any_provider_available"], true);

        dispatch(&orch, "ai.admin.keys.delete", &json!({"id": id}))
            .await
            .unwrap();

        let summary = dispatch(&orch, "ai.usage.summary", &json!({})).await.unwrap();
        assert_eq!(summary["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_dispatch_end_to_end_suggestion() {
        let orch = orchestrator();
        orch.credentials_create("gemini", "AIzaSyTest0123456789xyz".into(), None, None, None)
            .unwrap();
        let user_id = orch.store.insert_user("Dana", 40.0).unwrap();
        orch.store.insert_project("Apollo", None, None).unwrap();

        let result = dispatch(
            &orch,
            "ai.suggest",
            &json!({"user_id": user_id, "limit": 3, "use_ai": false}),
        )
        .await
        .unwrap();
        assert_eq!(result["enabled"], true);
    }

    #[test]
    fn test_rpc_response_shapes() {
        let ok = JsonRpcResponse::success(Some(json!(1)), json!({"a": 1}));
        let raw = serde_json::to_value(&ok).unwrap();
        assert_eq!(raw["jsonrpc"], "2.0");
        assert_eq!(raw["result"]["a"], 1);
        assert!(raw.get("error").is_none());

        let failed = JsonRpcResponse::failure(None, -32602, "missing 'user_id'".into());
        let raw = serde_json::to_value(&failed).unwrap();
        assert_eq!(raw["error"]["code"], -32602);
        assert!(raw.get("result").is_none());
    }
}
