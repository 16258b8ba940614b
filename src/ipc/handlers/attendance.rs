use crate::close::check_attendance;
use crate::error::EngineError;
use crate::ipc::helpers::{id_or_new, required_i64, required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::store;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::json;
use std::collections::BTreeMap;

const STATUSES: [&str; 5] = ["present", "absent", "late", "excused", "pending"];

fn parse_status(raw: &str) -> Result<&'static str, EngineError> {
    let s = raw.trim().to_ascii_lowercase();
    STATUSES
        .iter()
        .copied()
        .find(|k| *k == s)
        .ok_or_else(|| {
            EngineError::bad_params(format!("status must be one of: {}", STATUSES.join(", ")))
        })
}

/// One mark per (student, period, date); recording again overwrites it.
fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    let period = required_i64(params, "period")?;
    let date = required_str(params, "date")?;
    let status = parse_status(&required_str(params, "status")?)?;

    NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| EngineError::bad_params("date must be YYYY-MM-DD"))?;
    if period < 1 {
        return Err(EngineError::bad_params("period must be positive"));
    }
    store::load_class(conn, &class_id)?;
    if !store::student_in_class(conn, &class_id, &student_id)? {
        return Err(EngineError::NotFound("student"));
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    store::ensure_attendance_open(&tx, &class_id, period)?;
    tx.execute(
        "INSERT INTO attendance(id, class_id, student_id, period, date, status, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, period, date) DO UPDATE SET
           status = excluded.status,
           updated_at = excluded.updated_at",
        (
            id_or_new(None),
            &class_id,
            &student_id,
            period,
            &date,
            status,
            Utc::now().to_rfc3339(),
        ),
    )?;
    tx.commit()?;

    Ok(json!({
        "classId": class_id,
        "studentId": student_id,
        "period": period,
        "date": date,
        "status": status,
    }))
}

/// Per-student status counts for a period, plus whether the period could be
/// closed as far as attendance is concerned.
fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let class_id = required_str(params, "classId")?;
    let period = required_i64(params, "period")?;
    store::load_class(conn, &class_id)?;

    let mut stmt = conn.prepare(
        "SELECT student_id, status, COUNT(*)
         FROM attendance
         WHERE class_id = ? AND period = ?
         GROUP BY student_id, status",
    )?;
    let rows = stmt
        .query_map((&class_id, period), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_student: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for (student_id, status, n) in rows {
        by_student.entry(student_id).or_default().insert(status, n);
    }

    let roster = store::load_roster(conn, &class_id, true)?;
    let students: Vec<serde_json::Value> = roster
        .iter()
        .map(|s| {
            let counts = by_student.remove(&s.student_id).unwrap_or_default();
            json!({
                "studentId": s.student_id,
                "name": s.name,
                "counts": counts,
            })
        })
        .collect();

    let check = check_attendance(conn, &class_id, period)?;
    let locked = match store::ensure_attendance_open(conn, &class_id, period) {
        Ok(()) => false,
        Err(EngineError::PeriodLocked { .. }) => true,
        Err(e) => return Err(e),
    };

    Ok(json!({
        "classId": class_id,
        "period": period,
        "locked": locked,
        "students": students,
        "pending": check.pending,
        "foreign": check.foreign,
        "consistent": check.is_consistent(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_normalised() {
        assert_eq!(parse_status(" Present ").expect("present"), "present");
        assert_eq!(parse_status("PENDING").expect("pending"), "pending");
        assert_eq!(
            parse_status("sick").expect_err("unknown").code(),
            "bad_params"
        );
    }
}
