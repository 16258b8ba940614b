use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::calc::PeriodAverage;
use crate::class_run::ClassRun;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPeriod {
    pub class_id: String,
    pub period: i64,
    pub closed_at: String,
    pub closed_by: Option<String>,
    pub snapshot_sha256: String,
    pub frozen_averages: usize,
    pub promotion_frozen: bool,
}

/// Attendance problems that keep a period from closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttendanceCheck {
    pub pending: i64,
    pub foreign: i64,
}

impl AttendanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.pending == 0 && self.foreign == 0
    }
}

pub fn check_attendance(
    conn: &Connection,
    class_id: &str,
    period: i64,
) -> Result<AttendanceCheck, EngineError> {
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attendance
         WHERE class_id = ? AND period = ? AND status = 'pending'",
        (class_id, period),
        |r| r.get(0),
    )?;
    // Rows of students no longer in the class. A transfer marks the rows it
    // leaves behind as `transferred`, which settles them.
    let foreign: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM attendance a
         LEFT JOIN students s ON s.id = a.student_id AND s.class_id = a.class_id
         WHERE a.class_id = ? AND a.period = ? AND s.id IS NULL
           AND a.status <> 'transferred'",
        (class_id, period),
        |r| r.get(0),
    )?;
    Ok(AttendanceCheck { pending, foreign })
}

/// SHA-256 over the canonical JSON of the frozen rows.
pub fn snapshot_digest(averages: &[PeriodAverage]) -> Result<String, EngineError> {
    let bytes = serde_json::to_vec(averages)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// OPEN → CLOSED for one class period, grades and attendance together.
///
/// Runs in a single immediate transaction so a concurrent closer blocks on
/// the write lock and then observes `AlreadyClosed`. Closing the last period
/// of the year also freezes the promotion outcomes.
pub fn close_period(
    conn: &Connection,
    settings: &EngineSettings,
    class_id: &str,
    period: i64,
    closed_by: Option<&str>,
) -> Result<ClosedPeriod, EngineError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    if let Some(lock) = store::period_lock(&tx, class_id, period)? {
        return Err(EngineError::AlreadyClosed {
            class_id: lock.class_id,
            period: lock.period,
            closed_at: lock.closed_at,
        });
    }

    let run = ClassRun::load(&tx, settings, class_id)?;
    run.check_period(period)?;

    let attendance = check_attendance(&tx, class_id, period)?;
    let open_earlier_periods: Vec<i64> = {
        let closed: Vec<i64> = store::list_period_locks(&tx, class_id)?
            .into_iter()
            .map(|l| l.period)
            .collect();
        (1..period).filter(|p| !closed.contains(p)).collect()
    };
    if !attendance.is_consistent() || !open_earlier_periods.is_empty() {
        return Err(EngineError::Blocking {
            class_id: class_id.to_string(),
            period,
            pending_attendance: attendance.pending,
            foreign_attendance: attendance.foreign,
            open_earlier_periods,
        });
    }

    let averages = run.compute_period(&tx, period)?;
    let snapshot_sha256 = snapshot_digest(&averages)?;
    let closed_at = Utc::now().to_rfc3339();

    let inserted = tx.execute(
        "INSERT INTO period_locks(class_id, period, closed_at, closed_by, snapshot_sha256)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(class_id, period) DO NOTHING",
        (class_id, period, &closed_at, closed_by, &snapshot_sha256),
    )?;
    if inserted == 0 {
        let existing = store::period_lock(&tx, class_id, period)?;
        return Err(EngineError::AlreadyClosed {
            class_id: class_id.to_string(),
            period,
            closed_at: existing.map(|l| l.closed_at).unwrap_or_default(),
        });
    }
    tx.execute(
        "INSERT INTO attendance_locks(class_id, period, locked_at) VALUES(?, ?, ?)",
        (class_id, period, &closed_at),
    )?;
    store::save_period_snapshot(&tx, class_id, &averages)?;

    let promotion_frozen = period == run.final_period();
    if promotion_frozen {
        // The snapshot written above is visible inside this transaction, so
        // the annual records see every period frozen.
        let records = run.annual_records(&tx)?;
        let outcomes = run.promotion(&records);
        store::save_promotion_snapshot(&tx, class_id, period, &outcomes, &closed_at)?;
    }

    tx.commit()?;

    tracing::info!(
        class_id,
        period,
        frozen = averages.len(),
        promotion_frozen,
        "period closed"
    );

    Ok(ClosedPeriod {
        class_id: class_id.to_string(),
        period,
        closed_at,
        closed_by: closed_by.map(|s| s.to_string()),
        snapshot_sha256,
        frozen_averages: averages.len(),
        promotion_frozen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO schools(id, name) VALUES('sch', 'Escola');
             INSERT INTO courses(id, school_id, name) VALUES('crs', 'sch', 'Geral');
             INSERT INTO grades(id, school_id, name, level) VALUES('g7', 'sch', '7a', 7);
             INSERT INTO disciplines(id, school_id, code, name)
               VALUES('mat', 'sch', 'MAT', 'Matematica');
             INSERT INTO curriculum(id, course_id, grade_id, discipline_id, sort_order)
               VALUES('cu-mat', 'crs', 'g7', 'mat', 0);
             INSERT INTO classes(id, school_id, course_id, grade_id, name)
               VALUES('c1', 'sch', 'crs', 'g7', '7A');
             INSERT INTO students(id, class_id, roll_number, name, active)
               VALUES('s1', 'c1', 1, 'Ana', 1);
             INSERT INTO evaluation_models(id, scope, scope_ref, mode)
               VALUES('m1', 'school', 'sch', 'SEMESTRAL');
             INSERT INTO evaluation_components(id, model_id, code, weight, active, sort_order)
               VALUES('mc1', 'm1', 'MAC', 1, 1, 0);
             INSERT INTO assessments(
               id, class_id, student_id, discipline_id, period, component_code, score, entered_at)
               VALUES('a1', 'c1', 's1', 'mat', 1, 'MAC', 12, '2026-01-01');
             INSERT INTO assessments(
               id, class_id, student_id, discipline_id, period, component_code, score, entered_at)
               VALUES('a2', 'c1', 's1', 'mat', 2, 'MAC', 8, '2026-05-01');",
        )
        .expect("seed");
    }

    #[test]
    fn close_freezes_and_second_close_is_already_closed() {
        let ws = temp_dir("pautad-close-unit");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        let settings = EngineSettings::default();

        let closed = close_period(&conn, &settings, "c1", 1, Some("secretaria")).expect("close");
        assert_eq!(closed.frozen_averages, 1);
        assert!(!closed.promotion_frozen);
        assert_eq!(closed.snapshot_sha256.len(), 64);

        let again = close_period(&conn, &settings, "c1", 1, None).expect_err("second close");
        assert_eq!(again.code(), "already_closed");

        let err = store::ensure_period_open(&conn, "c1", 1).expect_err("locked");
        assert_eq!(err.code(), "period_locked");
        assert!(store::ensure_attendance_open(&conn, "c1", 1).is_err());
    }

    #[test]
    fn later_period_needs_earlier_ones_closed() {
        let ws = temp_dir("pautad-close-order");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        let settings = EngineSettings::default();

        let err = close_period(&conn, &settings, "c1", 2, None).expect_err("blocked");
        assert_eq!(err.code(), "close_blocked");
        assert_eq!(
            err.details().expect("details")["openEarlierPeriods"],
            serde_json::json!([1])
        );
        // Nothing half-written.
        assert!(store::period_lock(&conn, "c1", 2).expect("lock").is_none());
        assert!(store::ensure_attendance_open(&conn, "c1", 2).is_ok());

        close_period(&conn, &settings, "c1", 1, None).expect("close 1");
        let last = close_period(&conn, &settings, "c1", 2, None).expect("close 2");
        assert!(last.promotion_frozen);

        let frozen = store::load_promotion_snapshot(&conn, "c1")
            .expect("load")
            .expect("frozen");
        assert_eq!(frozen.period, 2);
        let outcomes = frozen.outcomes;
        assert_eq!(outcomes.len(), 1);
        // (12 + 8) / 2 = 10 meets the default threshold.
        assert_eq!(outcomes[0].per_discipline_result[0].annual_final, Some(10.0));
        assert!(outcomes[0].overall_promoted);
    }

    #[test]
    fn pending_attendance_blocks_both_locks() {
        let ws = temp_dir("pautad-close-attendance");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        conn.execute(
            "INSERT INTO attendance(id, class_id, student_id, period, date, status)
             VALUES('at1', 'c1', 's1', 1, '2026-02-02', 'pending')",
            [],
        )
        .expect("attendance");

        let err = close_period(&conn, &EngineSettings::default(), "c1", 1, None)
            .expect_err("blocked");
        assert_eq!(err.code(), "close_blocked");
        assert!(store::ensure_period_open(&conn, "c1", 1).is_ok());
        assert!(store::ensure_attendance_open(&conn, "c1", 1).is_ok());
    }

    #[test]
    fn attendance_of_a_moved_student_blocks_until_settled() {
        let ws = temp_dir("pautad-close-foreign");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO classes(id, school_id, course_id, grade_id, name)
               VALUES('c2', 'sch', 'crs', 'g7', '7B');
             INSERT INTO attendance(id, class_id, student_id, period, date, status)
               VALUES('at1', 'c1', 's1', 1, '2026-02-02', 'present');
             UPDATE students SET class_id = 'c2' WHERE id = 's1';",
        )
        .expect("move student");

        let settings = EngineSettings::default();
        let err = close_period(&conn, &settings, "c1", 1, None).expect_err("blocked");
        assert_eq!(err.code(), "close_blocked");
        let details = err.details().expect("details");
        assert_eq!(details["foreignAttendance"], 1);
        assert_eq!(details["pendingAttendance"], 0);

        conn.execute("UPDATE attendance SET status = 'transferred' WHERE id = 'at1'", [])
            .expect("settle");
        let check = check_attendance(&conn, "c1", 1).expect("check");
        assert!(check.is_consistent());
        close_period(&conn, &settings, "c1", 1, None).expect("close");
    }

    #[test]
    fn promotion_freezes_with_an_empty_roster() {
        let ws = temp_dir("pautad-close-empty-roster");
        let conn = db::open_db(&ws).expect("open");
        seed(&conn);
        conn.execute("UPDATE students SET active = 0", []).expect("deactivate");
        let settings = EngineSettings::default();

        assert!(store::load_promotion_snapshot(&conn, "c1").expect("load").is_none());
        close_period(&conn, &settings, "c1", 1, None).expect("close 1");
        let last = close_period(&conn, &settings, "c1", 2, None).expect("close 2");
        assert!(last.promotion_frozen);

        let frozen = store::load_promotion_snapshot(&conn, "c1")
            .expect("load")
            .expect("frozen marker");
        assert_eq!(frozen.period, 2);
        assert_eq!(frozen.frozen_at, last.closed_at);
        assert!(frozen.outcomes.is_empty());
    }
}
