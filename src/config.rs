use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::db;
use crate::error::EngineError;

pub const DEFAULT_PASSING_THRESHOLD: f64 = 10.0;

pub const SETTING_DEFAULT_PASSING_THRESHOLD: &str = "evaluation.defaultPassingThreshold";
pub const SETTING_SCORE_RANGE: &str = "scores.range";

pub const ENV_LOG: &str = "PAUTAD_LOG";
pub const ENV_LOG_FORMAT: &str = "PAUTAD_LOG_FORMAT";
pub const ENV_WORKSPACE: &str = "PAUTAD_WORKSPACE";

/// Process-level configuration, read once from the environment at start.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub log_json: bool,
    pub workspace: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup(ENV_LOG)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let log_json = lookup(ENV_LOG_FORMAT)
            .map(|s| s.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let workspace = lookup(ENV_WORKSPACE)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Self {
            log_filter,
            log_json,
            workspace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl ScoreRange {
    pub fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }
}

/// Workspace-level knobs stored in the `settings` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub default_passing_threshold: f64,
    pub score_range: Option<ScoreRange>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_passing_threshold: DEFAULT_PASSING_THRESHOLD,
            score_range: None,
        }
    }
}

impl EngineSettings {
    pub fn load(conn: &Connection) -> Result<Self, EngineError> {
        let mut settings = EngineSettings::default();
        if let Some(v) = db::settings_get_json(conn, SETTING_DEFAULT_PASSING_THRESHOLD)? {
            if let Some(t) = v.as_f64().filter(|t| t.is_finite()) {
                settings.default_passing_threshold = t;
            }
        }
        if let Some(v) = db::settings_get_json(conn, SETTING_SCORE_RANGE)? {
            settings.score_range = serde_json::from_value(v).ok();
        }
        Ok(settings)
    }

    /// Enforced on score entry only; aggregation itself is scale-agnostic.
    pub fn check_score(&self, score: Option<f64>) -> Result<(), EngineError> {
        let Some(score) = score else {
            return Ok(());
        };
        if !score.is_finite() {
            return Err(EngineError::bad_params("score must be a finite number"));
        }
        if let Some(range) = self.score_range {
            if !range.contains(score) {
                return Err(EngineError::bad_params(format!(
                    "score {} is outside the configured range {}..{}",
                    score, range.min, range.max
                )));
            }
        }
        Ok(())
    }
}

/// Validates a value before it is written under one of the known keys.
/// Unknown keys are stored as given.
pub fn validate_setting(key: &str, value: &serde_json::Value) -> Result<(), EngineError> {
    match key {
        SETTING_DEFAULT_PASSING_THRESHOLD => {
            if value.as_f64().map(|v| v.is_finite()).unwrap_or(false) {
                Ok(())
            } else {
                Err(EngineError::bad_params(format!("{} must be a number", key)))
            }
        }
        SETTING_SCORE_RANGE => {
            let range: ScoreRange = serde_json::from_value(value.clone()).map_err(|_| {
                EngineError::bad_params(format!("{} must be {{ min, max }}", key))
            })?;
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(EngineError::bad_params(format!(
                    "{} must satisfy min <= max",
                    key
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn daemon_config_defaults_and_overrides() {
        let empty = DaemonConfig::from_lookup(|_| None);
        assert_eq!(empty.log_filter, "info");
        assert!(!empty.log_json);
        assert!(empty.workspace.is_none());

        let env: HashMap<&str, &str> = [
            (ENV_LOG, "pautad=debug"),
            (ENV_LOG_FORMAT, "JSON"),
            (ENV_WORKSPACE, "/tmp/ws"),
        ]
        .into_iter()
        .collect();
        let cfg = DaemonConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.log_filter, "pautad=debug");
        assert!(cfg.log_json);
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn score_range_is_checked_on_entry() {
        let settings = EngineSettings {
            score_range: Some(ScoreRange { min: 0.0, max: 20.0 }),
            ..EngineSettings::default()
        };
        assert!(settings.check_score(None).is_ok());
        assert!(settings.check_score(Some(20.0)).is_ok());
        assert!(settings.check_score(Some(20.5)).is_err());
        assert!(EngineSettings::default().check_score(Some(95.0)).is_ok());
    }

    #[test]
    fn known_settings_are_validated() {
        assert!(validate_setting(SETTING_DEFAULT_PASSING_THRESHOLD, &json!(9.5)).is_ok());
        assert!(validate_setting(SETTING_DEFAULT_PASSING_THRESHOLD, &json!("ten")).is_err());
        assert!(validate_setting(SETTING_SCORE_RANGE, &json!({ "min": 0, "max": 20 })).is_ok());
        assert!(validate_setting(SETTING_SCORE_RANGE, &json!({ "min": 5, "max": 1 })).is_err());
        assert!(validate_setting("ui.theme", &json!("dark")).is_ok());
    }
}
