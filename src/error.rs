use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the evaluation engine and the workspace around it.
///
/// Missing scores are not errors: they travel as `None` values through the
/// period, annual and promotion results.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no evaluation model configured for discipline {discipline_id}")]
    ConfigurationMissing {
        school_id: String,
        course_id: String,
        grade_id: String,
        discipline_id: String,
    },

    #[error("invalid evaluation configuration: {0}")]
    InvalidConfiguration(String),

    #[error("period {period} of class {class_id} is closed")]
    PeriodLocked { class_id: String, period: i64 },

    #[error("period {period} of class {class_id} was already closed at {closed_at}")]
    AlreadyClosed {
        class_id: String,
        period: i64,
        closed_at: String,
    },

    #[error("period {period} of class {class_id} cannot be closed yet")]
    Blocking {
        class_id: String,
        period: i64,
        pending_attendance: i64,
        foreign_attendance: i64,
        open_earlier_periods: Vec<i64>,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadParams(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        EngineError::BadParams(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ConfigurationMissing { .. } => "configuration_missing",
            EngineError::InvalidConfiguration(_) => "invalid_configuration",
            EngineError::PeriodLocked { .. } => "period_locked",
            EngineError::AlreadyClosed { .. } => "already_closed",
            EngineError::Blocking { .. } => "close_blocked",
            EngineError::NotFound(_) => "not_found",
            EngineError::BadParams(_) => "bad_params",
            EngineError::Db(_) => "db_query_failed",
            EngineError::Json(_) => "bad_json",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::ConfigurationMissing {
                school_id,
                course_id,
                grade_id,
                discipline_id,
            } => Some(json!({
                "schoolId": school_id,
                "courseId": course_id,
                "gradeId": grade_id,
                "disciplineId": discipline_id,
            })),
            EngineError::PeriodLocked { class_id, period } => Some(json!({
                "classId": class_id,
                "period": period,
            })),
            EngineError::AlreadyClosed {
                class_id,
                period,
                closed_at,
            } => Some(json!({
                "classId": class_id,
                "period": period,
                "closedAt": closed_at,
            })),
            EngineError::Blocking {
                class_id,
                period,
                pending_attendance,
                foreign_attendance,
                open_earlier_periods,
            } => Some(json!({
                "classId": class_id,
                "period": period,
                "pendingAttendance": pending_attendance,
                "foreignAttendance": foreign_attendance,
                "openEarlierPeriods": open_earlier_periods,
            })),
            EngineError::NotFound(what) => Some(json!({ "entity": what })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_wire_names() {
        let locked = EngineError::PeriodLocked {
            class_id: "c1".to_string(),
            period: 2,
        };
        assert_eq!(locked.code(), "period_locked");
        assert_eq!(locked.details().expect("details")["period"], 2);

        let missing = EngineError::ConfigurationMissing {
            school_id: "s".to_string(),
            course_id: "c".to_string(),
            grade_id: "g".to_string(),
            discipline_id: "d".to_string(),
        };
        assert_eq!(missing.code(), "configuration_missing");
        assert!(missing.to_string().contains("discipline d"));
    }
}
