use crate::error::EngineError;
use crate::ipc::helpers::{id_or_new, optional_bool, parse_params, required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::store;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Deserialize;
use serde_json::json;

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentUpsert {
    id: Option<String>,
    class_id: String,
    roll_number: Option<i64>,
    name: String,
    gender: Option<String>,
    birth_date: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

/// Creates or updates a student. Moving a student to another class is an
/// update of `classId`; their assessment rows stay with the old class and
/// their attendance in the old class's open periods is marked `transferred`.
fn students_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: StudentUpsert = parse_params(params)?;
    store::load_class(conn, &p.class_id)?;
    let name = p.name.trim().to_string();
    if name.is_empty() {
        return Err(EngineError::bad_params("name must not be blank"));
    }
    if let Some(roll) = p.roll_number {
        if roll < 1 {
            return Err(EngineError::bad_params("rollNumber must be positive"));
        }
    }
    if let Some(birth) = p.birth_date.as_deref() {
        chrono::NaiveDate::parse_from_str(birth, "%Y-%m-%d")
            .map_err(|_| EngineError::bad_params("birthDate must be YYYY-MM-DD"))?;
    }

    let id = id_or_new(p.id);
    let now = Utc::now().to_rfc3339();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let previous_class: Option<String> = tx
        .query_row("SELECT class_id FROM students WHERE id = ?", [&id], |r| r.get(0))
        .optional()?;

    tx.execute(
        "INSERT INTO students(
           id, class_id, roll_number, name, gender, birth_date, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           class_id = excluded.class_id,
           roll_number = excluded.roll_number,
           name = excluded.name,
           gender = excluded.gender,
           birth_date = excluded.birth_date,
           active = excluded.active,
           updated_at = excluded.updated_at",
        (
            &id,
            &p.class_id,
            p.roll_number,
            &name,
            &p.gender,
            &p.birth_date,
            if p.active { 1 } else { 0 },
            &now,
        ),
    )?;

    let transfer = previous_class.filter(|c| c != &p.class_id);
    let transferred_rows = match transfer.as_deref() {
        // Locked periods keep their history untouched.
        Some(prev) => tx.execute(
            "UPDATE attendance SET status = 'transferred', updated_at = ?
             WHERE class_id = ? AND student_id = ?
               AND period NOT IN (SELECT period FROM attendance_locks WHERE class_id = ?)",
            (&now, prev, &id, prev),
        )?,
        None => 0,
    };
    tx.commit()?;

    if let Some(prev) = transfer {
        tracing::info!(
            student_id = %id,
            from = %prev,
            to = %p.class_id,
            attendance_rows = transferred_rows,
            "student transferred"
        );
    }

    Ok(json!({ "studentId": id, "transferredAttendance": transferred_rows }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    let include_inactive = optional_bool(params, "includeInactive")?;
    store::load_class(conn, &class_id)?;
    let roster = store::load_roster(conn, &class_id, include_inactive)?;
    Ok(json!({ "classId": class_id, "students": roster }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(with_conn(state, req, students_upsert)),
        "students.list" => Some(with_conn(state, req, students_list)),
        _ => None,
    }
}
