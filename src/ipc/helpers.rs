use rusqlite::Connection;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::error::{engine_err, err, ok};
use super::types::{AppState, Request};
use crate::error::EngineError;

/// Runs `f` against the selected workspace and wraps the outcome in the
/// response envelope.
pub fn with_conn<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, EngineError>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            tracing::debug!(method = %req.method, code = e.code(), "request failed: {}", e);
            engine_err(&req.id, &e)
        }
    }
}

pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(params.clone()).map_err(|e| EngineError::bad_params(e.to_string()))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, EngineError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()).filter(|s| !s.is_empty()))
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a string", key))),
    }
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::bad_params(format!("missing integer {}", key)))
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Result<bool, EngineError> {
    match params.get(key) {
        None => Ok(false),
        Some(v) if v.is_null() => Ok(false),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a boolean", key))),
    }
}

/// Score values: absent or null mean "no score", anything else must be a number.
pub fn optional_score(params: &serde_json::Value, key: &str) -> Result<Option<f64>, EngineError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| EngineError::bad_params(format!("{} must be a number or null", key))),
    }
}

pub fn id_or_new(explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| Uuid::new_v4().to_string())
}
