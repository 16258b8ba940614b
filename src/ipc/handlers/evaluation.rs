use crate::calc::{validate_components, Component, EvaluationMode, ModelSource};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ipc::helpers::{id_or_new, optional_str, parse_params, required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::store;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelSetParams {
    scope: String,
    scope_ref: String,
    mode: String,
    passing_threshold: Option<f64>,
    components: Vec<Component>,
}

fn parse_scope(raw: &str) -> Result<ModelSource, EngineError> {
    ModelSource::parse(raw).ok_or_else(|| {
        EngineError::bad_params("scope must be one of: school, curriculum, class_discipline")
    })
}

fn scope_exists(conn: &Connection, scope: ModelSource, scope_ref: &str) -> Result<(), EngineError> {
    let (sql, entity) = match scope {
        ModelSource::School => ("SELECT 1 FROM schools WHERE id = ?", "school"),
        ModelSource::Curriculum => ("SELECT 1 FROM curriculum WHERE id = ?", "curriculum entry"),
        ModelSource::ClassDiscipline => (
            "SELECT 1 FROM class_disciplines WHERE id = ?",
            "class discipline",
        ),
    };
    conn.query_row(sql, [scope_ref], |r| r.get::<_, i64>(0))
        .optional()?
        .map(|_| ())
        .ok_or(EngineError::NotFound(entity))
}

/// Stores one level of the hierarchy, replacing its component list.
fn model_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: ModelSetParams = parse_params(params)?;
    let scope = parse_scope(&p.scope)?;
    let mode = EvaluationMode::parse(&p.mode).ok_or_else(|| {
        EngineError::InvalidConfiguration(format!("unknown evaluation mode {}", p.mode))
    })?;
    if let Some(t) = p.passing_threshold {
        if !t.is_finite() {
            return Err(EngineError::InvalidConfiguration(
                "passing threshold must be a finite number".to_string(),
            ));
        }
    }
    let components = validate_components(&p.components)?;
    scope_exists(conn, scope, &p.scope_ref)?;

    let tx = conn.unchecked_transaction()?;
    let existing_id: Option<String> = tx
        .query_row(
            "SELECT id FROM evaluation_models WHERE scope = ? AND scope_ref = ?",
            (scope.as_str(), &p.scope_ref),
            |r| r.get(0),
        )
        .optional()?;
    let model_id = id_or_new(existing_id);
    tx.execute(
        "INSERT INTO evaluation_models(id, scope, scope_ref, mode, passing_threshold, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(scope, scope_ref) DO UPDATE SET
           mode = excluded.mode,
           passing_threshold = excluded.passing_threshold,
           updated_at = excluded.updated_at",
        (
            &model_id,
            scope.as_str(),
            &p.scope_ref,
            mode.as_str(),
            p.passing_threshold,
            Utc::now().to_rfc3339(),
        ),
    )?;
    tx.execute(
        "DELETE FROM evaluation_components WHERE model_id = ?",
        [&model_id],
    )?;
    for (i, c) in components.iter().enumerate() {
        tx.execute(
            "INSERT INTO evaluation_components(id, model_id, code, weight, active, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                id_or_new(None),
                &model_id,
                &c.code,
                c.weight,
                if c.active { 1 } else { 0 },
                i as i64,
            ),
        )?;
    }
    tx.commit()?;

    tracing::info!(
        scope = scope.as_str(),
        scope_ref = %p.scope_ref,
        mode = mode.as_str(),
        components = components.len(),
        "evaluation model stored"
    );

    Ok(json!({
        "modelId": model_id,
        "scope": scope.as_str(),
        "scopeRef": p.scope_ref,
        "mode": mode.as_str(),
        "passingThreshold": p.passing_threshold,
        "components": components,
    }))
}

fn model_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let scope = parse_scope(&required_str(params, "scope")?)?;
    let scope_ref = required_str(params, "scopeRef")?;
    let model = store::load_model_record(conn, scope, &scope_ref)?.map(|m| {
        json!({
            "mode": m.mode.as_str(),
            "passingThreshold": m.passing_threshold,
            "components": m.components,
        })
    });
    Ok(json!({
        "scope": scope.as_str(),
        "scopeRef": scope_ref,
        "model": model,
    }))
}

/// Effective model for a discipline. Accepts either a class id, from which
/// school, course, grade and class-section link are derived, or the explicit
/// (school, course, grade) triple.
fn model_resolve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let settings = EngineSettings::load(conn)?;
    let discipline_id = required_str(params, "disciplineId")?;

    let model = match optional_str(params, "classId")? {
        Some(class_id) => {
            let class = store::load_class(conn, &class_id)?;
            let link = store::load_class_disciplines(conn, &class)?
                .into_iter()
                .find(|d| d.discipline_id == discipline_id)
                .and_then(|d| d.class_discipline_id);
            store::resolve_model(
                conn,
                &settings,
                &class.school_id,
                &class.course_id,
                &class.grade_id,
                &discipline_id,
                link.as_deref(),
            )?
        }
        None => {
            let school_id = required_str(params, "schoolId")?;
            let course_id = required_str(params, "courseId")?;
            let grade_id = required_str(params, "gradeId")?;
            let class_discipline_id = optional_str(params, "classDisciplineId")?;
            store::resolve_model(
                conn,
                &settings,
                &school_id,
                &course_id,
                &grade_id,
                &discipline_id,
                class_discipline_id.as_deref(),
            )?
        }
    };

    Ok(json!({
        "disciplineId": discipline_id,
        "periodCount": model.period_count(),
        "model": model,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluation.modelSet" => Some(with_conn(state, req, model_set)),
        "evaluation.modelGet" => Some(with_conn(state, req, model_get)),
        "evaluation.resolve" => Some(with_conn(state, req, model_resolve)),
        _ => None,
    }
}
