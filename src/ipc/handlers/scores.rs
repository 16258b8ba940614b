use crate::calc::canonical_component_code;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ipc::helpers::{
    id_or_new, optional_score, optional_str, required_i64, required_str, with_conn,
};
use crate::ipc::types::{AppState, Request};
use crate::store;
use chrono::Utc;
use rusqlite::{
    params_from_iter, types::Value, Connection, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde_json::json;

/// Records one score. The lock check and the insert share an immediate
/// transaction, so a concurrent close either lands first (and this write is
/// refused) or waits until the score is stored.
fn scores_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    let discipline_id = required_str(params, "disciplineId")?;
    let period = required_i64(params, "period")?;
    let component_code = canonical_component_code(&required_str(params, "componentCode")?);
    let score = optional_score(params, "score")?;
    let label = optional_str(params, "label")?;

    let settings = EngineSettings::load(conn)?;
    settings.check_score(score)?;

    let class = store::load_class(conn, &class_id)?;
    if !store::student_in_class(conn, &class_id, &student_id)? {
        return Err(EngineError::NotFound("student"));
    }
    let discipline = store::load_class_disciplines(conn, &class)?
        .into_iter()
        .find(|d| d.discipline_id == discipline_id)
        .ok_or(EngineError::NotFound("discipline"))?;
    let model = store::resolve_model(
        conn,
        &settings,
        &class.school_id,
        &class.course_id,
        &class.grade_id,
        &discipline.discipline_id,
        discipline.class_discipline_id.as_deref(),
    )?;
    if period < 1 || period > model.period_count() {
        return Err(EngineError::bad_params(format!(
            "period must be between 1 and {} for {}",
            model.period_count(),
            discipline.code
        )));
    }
    if !model.has_component(&component_code) {
        return Err(EngineError::bad_params(format!(
            "component {} is not active for {}",
            component_code, discipline.code
        )));
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    store::ensure_period_open(&tx, &class_id, period)?;
    let id = id_or_new(None);
    tx.execute(
        "INSERT INTO assessments(
           id, class_id, student_id, discipline_id, period, component_code, score, label,
           entered_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            &student_id,
            &discipline_id,
            period,
            &component_code,
            score,
            &label,
            Utc::now().to_rfc3339(),
        ),
    )?;
    tx.commit()?;

    Ok(json!({
        "assessmentId": id,
        "componentCode": component_code,
        "score": score,
    }))
}

/// Corrects the value of an existing score. Rows are never deleted; a
/// withdrawn score is corrected to null.
fn scores_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let assessment_id = required_str(params, "assessmentId")?;
    let score = optional_score(params, "score")?;
    let label = optional_str(params, "label")?;

    let settings = EngineSettings::load(conn)?;
    settings.check_score(score)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let (class_id, period): (String, i64) = tx
        .query_row(
            "SELECT class_id, period FROM assessments WHERE id = ?",
            [&assessment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or(EngineError::NotFound("assessment"))?;
    store::ensure_period_open(&tx, &class_id, period)?;
    tx.execute(
        "UPDATE assessments
         SET score = ?, label = COALESCE(?, label), updated_at = ?
         WHERE id = ?",
        (score, &label, Utc::now().to_rfc3339(), &assessment_id),
    )?;
    tx.commit()?;

    Ok(json!({ "assessmentId": assessment_id, "score": score }))
}

fn scores_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    store::load_class(conn, &class_id)?;

    let mut sql = String::from(
        "SELECT id, student_id, discipline_id, period, component_code, score, label,
                entered_at, updated_at
         FROM assessments
         WHERE class_id = ?",
    );
    let mut bind: Vec<Value> = vec![Value::Text(class_id.clone())];
    if let Some(d) = optional_str(params, "disciplineId")? {
        sql.push_str(" AND discipline_id = ?");
        bind.push(Value::Text(d));
    }
    if let Some(s) = optional_str(params, "studentId")? {
        sql.push_str(" AND student_id = ?");
        bind.push(Value::Text(s));
    }
    if let Some(p) = params.get("period").and_then(|v| v.as_i64()) {
        sql.push_str(" AND period = ?");
        bind.push(Value::Integer(p));
    }
    sql.push_str(" ORDER BY period, discipline_id, student_id, entered_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok(json!({
                "assessmentId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "disciplineId": r.get::<_, String>(2)?,
                "period": r.get::<_, i64>(3)?,
                "componentCode": r.get::<_, String>(4)?,
                "score": r.get::<_, Option<f64>>(5)?,
                "label": r.get::<_, Option<String>>(6)?,
                "enteredAt": r.get::<_, String>(7)?,
                "updatedAt": r.get::<_, Option<String>>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "classId": class_id, "scores": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.add" => Some(with_conn(state, req, scores_add)),
        "scores.update" => Some(with_conn(state, req, scores_update)),
        "scores.list" => Some(with_conn(state, req, scores_list)),
        _ => None,
    }
}
