use crate::class_run::ClassRun;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ipc::helpers::{optional_bool, optional_str, required_i64, required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::Connection;
use serde_json::json;

fn load_run(conn: &Connection, params: &serde_json::Value) -> Result<ClassRun, EngineError> {
    let class_id = required_str(params, "classId")?;
    let settings = EngineSettings::load(conn)?;
    ClassRun::load(conn, &settings, &class_id)
}

fn period_averages(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let run = load_run(conn, params)?;
    let period = required_i64(params, "period")?;
    let require_open = optional_bool(params, "requireOpen")?;
    let discipline_id = optional_str(params, "disciplineId")?;

    let mut view = run.period_averages(conn, period, require_open)?;
    if let Some(d) = discipline_id.as_deref() {
        if run.discipline(d).is_none() {
            return Err(EngineError::NotFound("discipline"));
        }
        view.averages.retain(|a| a.discipline_id == d);
    }

    Ok(json!({
        "classId": run.class.id,
        "period": view.period,
        "frozen": view.frozen,
        "averages": view.averages,
    }))
}

fn annual(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let run = load_run(conn, params)?;
    let discipline_id = optional_str(params, "disciplineId")?;
    let student_id = optional_str(params, "studentId")?;

    let mut records = run.annual_records(conn)?;
    if let Some(d) = discipline_id.as_deref() {
        records.retain(|r| r.discipline_id == d);
    }
    if let Some(s) = student_id.as_deref() {
        records.retain(|r| r.student_id == s);
    }

    Ok(json!({ "classId": run.class.id, "records": records }))
}

fn pauta(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let run = load_run(conn, params)?;
    let include_inactive = optional_bool(params, "includeInactive")?;

    let records = run.annual_records(conn)?;
    let matrix = run.pauta(&records, include_inactive);
    let closed: Vec<i64> = store::list_period_locks(conn, &run.class.id)?
        .into_iter()
        .map(|l| l.period)
        .collect();

    tracing::debug!(
        class_id = %run.class.id,
        rows = matrix.rows.len(),
        disciplines = matrix.disciplines.len(),
        "pauta built"
    );

    Ok(json!({
        "classId": run.class.id,
        "className": run.class.name,
        "academicYear": run.class.academic_year,
        "closedPeriods": closed,
        "pauta": matrix,
    }))
}

/// Frozen outcomes once the final period is closed, a live decision before.
fn promotion(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let run = load_run(conn, params)?;

    let (frozen_at, outcomes) = match store::load_promotion_snapshot(conn, &run.class.id)? {
        Some(stored) => (Some(stored.frozen_at), run.order_outcomes(stored.outcomes)),
        None => {
            let records = run.annual_records(conn)?;
            (None, run.promotion(&records))
        }
    };
    let promoted = outcomes.iter().filter(|o| o.overall_promoted).count();

    Ok(json!({
        "classId": run.class.id,
        "frozen": frozen_at.is_some(),
        "frozenAt": frozen_at,
        "promoted": promoted,
        "retained": outcomes.len() - promoted,
        "outcomes": outcomes,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.periodAverages" => Some(with_conn(state, req, period_averages)),
        "grades.annual" => Some(with_conn(state, req, annual)),
        "grades.pauta" => Some(with_conn(state, req, pauta)),
        "grades.promotion" => Some(with_conn(state, req, promotion)),
        _ => None,
    }
}
