use crate::config::{self, EngineSettings};
use crate::db;
use crate::error::EngineError;
use crate::ipc::helpers::{required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn settings_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let key = required_str(params, "key")?;
    let value = db::settings_get_json(conn, &key)?;
    let effective = EngineSettings::load(conn)?;
    Ok(json!({
        "key": key,
        "value": value,
        "effective": {
            "defaultPassingThreshold": effective.default_passing_threshold,
            "scoreRange": effective.score_range,
        }
    }))
}

fn settings_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let key = required_str(params, "key")?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| EngineError::bad_params("missing value"))?;
    config::validate_setting(&key, &value)?;
    db::settings_set_json(conn, &key, &value)?;
    tracing::info!(key = %key, "setting updated");
    Ok(json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(with_conn(state, req, settings_get)),
        "settings.set" => Some(with_conn(state, req, settings_set)),
        _ => None,
    }
}
