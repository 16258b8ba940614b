use crate::class_run::ClassRun;
use crate::close;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{optional_str, required_i64, required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::Connection;
use serde_json::json;

/// Closing an already closed period is not a failure for the caller: the
/// response carries `outcome: "alreadyClosed"` and the existing lock.
fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (class_id, period, closed_by) = match (
        required_str(&req.params, "classId"),
        required_i64(&req.params, "period"),
        optional_str(&req.params, "closedBy"),
    ) {
        (Ok(c), Ok(p), Ok(b)) => (c, p, b),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return engine_err(&req.id, &e),
    };
    let settings = match EngineSettings::load(conn) {
        Ok(s) => s,
        Err(e) => return engine_err(&req.id, &e),
    };

    match close::close_period(conn, &settings, &class_id, period, closed_by.as_deref()) {
        Ok(closed) => {
            let mut result = serde_json::to_value(&closed).unwrap_or_else(|_| json!({}));
            result["outcome"] = json!("closed");
            ok(&req.id, result)
        }
        Err(EngineError::AlreadyClosed {
            class_id,
            period,
            closed_at,
        }) => {
            tracing::warn!(class_id = %class_id, period, "period was already closed");
            ok(
                &req.id,
                json!({
                    "outcome": "alreadyClosed",
                    "classId": class_id,
                    "period": period,
                    "closedAt": closed_at,
                }),
            )
        }
        Err(e @ EngineError::Blocking { .. }) => {
            tracing::warn!(class_id = %class_id, period, "period close blocked: {}", e);
            engine_err(&req.id, &e)
        }
        Err(e) => engine_err(&req.id, &e),
    }
}

fn status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    let settings = EngineSettings::load(conn)?;
    let run = ClassRun::load(conn, &settings, &class_id)?;
    let locks = store::list_period_locks(conn, &class_id)?;

    let periods: Vec<serde_json::Value> = (1..=run.final_period())
        .map(|p| match locks.iter().find(|l| l.period == p) {
            Some(lock) => json!({
                "period": p,
                "state": "closed",
                "closedAt": lock.closed_at,
                "closedBy": lock.closed_by,
                "snapshotSha256": lock.snapshot_sha256,
            }),
            None => json!({ "period": p, "state": "open" }),
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "finalPeriod": run.final_period(),
        "periods": periods,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "periods.close" => Some(handle_close(state, req)),
        "periods.status" => Some(with_conn(state, req, status)),
        _ => None,
    }
}
