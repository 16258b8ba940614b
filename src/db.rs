use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "pautad.sqlite3";

/// Concurrent closers wait this long for the write lock instead of failing
/// with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS disciplines(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, code)
        )",
        [],
    )?;

    // Course × grade × discipline: the curriculum link that can carry its own
    // evaluation model.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS curriculum(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            discipline_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(discipline_id) REFERENCES disciplines(id),
            UNIQUE(course_id, grade_id, discipline_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_curriculum_course_grade ON curriculum(course_id, grade_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            name TEXT NOT NULL,
            academic_year TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_disciplines(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            discipline_id TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(discipline_id) REFERENCES disciplines(id),
            UNIQUE(class_id, discipline_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            roll_number INTEGER,
            name TEXT NOT NULL,
            gender TEXT,
            birth_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_models(
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            scope_ref TEXT NOT NULL,
            mode TEXT NOT NULL,
            passing_threshold REAL,
            updated_at TEXT,
            UNIQUE(scope, scope_ref)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_components(
            id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            code TEXT NOT NULL,
            weight REAL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(model_id) REFERENCES evaluation_models(id),
            UNIQUE(model_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluation_components_model
         ON evaluation_components(model_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            discipline_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            component_code TEXT NOT NULL,
            score REAL,
            label TEXT,
            entered_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(discipline_id) REFERENCES disciplines(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_class_period ON assessments(class_id, period)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_student ON assessments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id, period, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_period ON attendance(class_id, period)",
        [],
    )?;

    // Grade and attendance locks are written in the same transaction by
    // close::close_period; the primary keys make the second closer lose.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_locks(
            class_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            closed_at TEXT NOT NULL,
            closed_by TEXT,
            snapshot_sha256 TEXT NOT NULL,
            PRIMARY KEY(class_id, period),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_locks(
            class_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            locked_at TEXT NOT NULL,
            PRIMARY KEY(class_id, period),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_snapshots(
            class_id TEXT NOT NULL,
            period INTEGER NOT NULL,
            student_id TEXT NOT NULL,
            discipline_id TEXT NOT NULL,
            value REAL,
            components_json TEXT NOT NULL,
            PRIMARY KEY(class_id, period, student_id, discipline_id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_snapshots(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            outcome_json TEXT NOT NULL,
            frozen_at TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    // One row per class once promotion is frozen, even when the roster had
    // no active students and promotion_snapshots stayed empty.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_locks(
            class_id TEXT PRIMARY KEY,
            period INTEGER NOT NULL,
            frozen_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    ensure_assessments_label(&conn)?;

    Ok(conn)
}

fn ensure_assessments_label(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "label")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN label TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // Unparseable values read as absent so a bad write cannot brick a workspace.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}
