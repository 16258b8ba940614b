use crate::error::EngineError;
use crate::ipc::helpers::{id_or_new, parse_params, with_conn};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchoolParams {
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseParams {
    id: Option<String>,
    school_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GradeParams {
    id: Option<String>,
    school_id: String,
    name: String,
    #[serde(default)]
    level: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisciplineParams {
    id: Option<String>,
    school_id: String,
    code: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurriculumParams {
    course_id: String,
    grade_id: String,
    discipline_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassParams {
    id: Option<String>,
    school_id: String,
    course_id: String,
    grade_id: String,
    name: String,
    academic_year: Option<String>,
}

fn require_row(
    conn: &Connection,
    table: &'static str,
    entity: &'static str,
    id: &str,
) -> Result<(), EngineError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found = conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    if found {
        Ok(())
    } else {
        Err(EngineError::NotFound(entity))
    }
}

fn require_name(name: &str) -> Result<String, EngineError> {
    let t = name.trim();
    if t.is_empty() {
        return Err(EngineError::bad_params("name must not be blank"));
    }
    Ok(t.to_string())
}

fn school_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: SchoolParams = parse_params(params)?;
    let id = id_or_new(p.id);
    let name = require_name(&p.name)?;
    conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (&id, &name),
    )?;
    Ok(json!({ "schoolId": id }))
}

fn course_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: CourseParams = parse_params(params)?;
    require_row(conn, "schools", "school", &p.school_id)?;
    let id = id_or_new(p.id);
    let name = require_name(&p.name)?;
    conn.execute(
        "INSERT INTO courses(id, school_id, name) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           school_id = excluded.school_id,
           name = excluded.name",
        (&id, &p.school_id, &name),
    )?;
    Ok(json!({ "courseId": id }))
}

fn grade_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: GradeParams = parse_params(params)?;
    require_row(conn, "schools", "school", &p.school_id)?;
    let id = id_or_new(p.id);
    let name = require_name(&p.name)?;
    conn.execute(
        "INSERT INTO grades(id, school_id, name, level) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           school_id = excluded.school_id,
           name = excluded.name,
           level = excluded.level",
        (&id, &p.school_id, &name, p.level),
    )?;
    Ok(json!({ "gradeId": id }))
}

fn discipline_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: DisciplineParams = parse_params(params)?;
    require_row(conn, "schools", "school", &p.school_id)?;
    let id = id_or_new(p.id);
    let code = p.code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(EngineError::bad_params("code must not be blank"));
    }
    let name = require_name(&p.name)?;
    conn.execute(
        "INSERT INTO disciplines(id, school_id, code, name) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           school_id = excluded.school_id,
           code = excluded.code,
           name = excluded.name",
        (&id, &p.school_id, &code, &name),
    )?;
    Ok(json!({ "disciplineId": id, "code": code }))
}

/// Brings a class's section links in line with its course/grade curriculum.
/// Links for disciplines that left the curriculum are dropped together with
/// their class-level evaluation overrides; missing links are created.
fn sync_class_links(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<serde_json::Value>, EngineError> {
    let stale: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT cd.id
             FROM class_disciplines cd
             JOIN classes c ON c.id = cd.class_id
             LEFT JOIN curriculum cu
               ON cu.course_id = c.course_id
              AND cu.grade_id = c.grade_id
              AND cu.discipline_id = cd.discipline_id
             WHERE cd.class_id = ? AND cu.id IS NULL",
        )?;
        let rows = stmt
            .query_map([class_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for link_id in &stale {
        delete_models(conn, "class_discipline", link_id)?;
        conn.execute("DELETE FROM class_disciplines WHERE id = ?", [link_id])?;
    }

    let discipline_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT cu.discipline_id
             FROM curriculum cu
             JOIN classes c ON c.course_id = cu.course_id AND c.grade_id = cu.grade_id
             WHERE c.id = ?
             ORDER BY cu.sort_order",
        )?;
        let rows = stmt
            .query_map([class_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut links = Vec::with_capacity(discipline_ids.len());
    for discipline_id in discipline_ids {
        conn.execute(
            "INSERT INTO class_disciplines(id, class_id, discipline_id) VALUES(?, ?, ?)
             ON CONFLICT(class_id, discipline_id) DO NOTHING",
            (id_or_new(None), class_id, &discipline_id),
        )?;
        let link_id: String = conn.query_row(
            "SELECT id FROM class_disciplines WHERE class_id = ? AND discipline_id = ?",
            (class_id, &discipline_id),
            |r| r.get(0),
        )?;
        links.push(json!({ "disciplineId": discipline_id, "classDisciplineId": link_id }));
    }

    if !stale.is_empty() {
        tracing::info!(class_id, dropped = stale.len(), "stale class links removed");
    }
    Ok(links)
}

fn delete_models(conn: &Connection, scope: &str, scope_ref: &str) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM evaluation_components WHERE model_id IN (
           SELECT id FROM evaluation_models WHERE scope = ? AND scope_ref = ?
         )",
        (scope, scope_ref),
    )?;
    conn.execute(
        "DELETE FROM evaluation_models WHERE scope = ? AND scope_ref = ?",
        (scope, scope_ref),
    )?;
    Ok(())
}

/// Replaces the discipline list of a course/grade. Links that survive keep
/// their id, so curriculum-level evaluation overrides stay attached. Every
/// class of the course/grade gets its section links synced in the same
/// transaction.
fn curriculum_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: CurriculumParams = parse_params(params)?;
    require_row(conn, "courses", "course", &p.course_id)?;
    require_row(conn, "grades", "grade", &p.grade_id)?;
    for d in &p.discipline_ids {
        require_row(conn, "disciplines", "discipline", d)?;
    }

    let tx = conn.unchecked_transaction()?;
    let existing: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT id, discipline_id FROM curriculum WHERE course_id = ? AND grade_id = ?",
        )?;
        let rows = stmt
            .query_map((&p.course_id, &p.grade_id), |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (curriculum_id, discipline_id) in &existing {
        if p.discipline_ids.contains(discipline_id) {
            continue;
        }
        delete_models(&tx, "curriculum", curriculum_id)?;
        tx.execute("DELETE FROM curriculum WHERE id = ?", [curriculum_id])?;
    }

    let mut links = Vec::with_capacity(p.discipline_ids.len());
    for (i, discipline_id) in p.discipline_ids.iter().enumerate() {
        let curriculum_id = existing
            .iter()
            .find(|(_, d)| d == discipline_id)
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| id_or_new(None));
        tx.execute(
            "INSERT INTO curriculum(id, course_id, grade_id, discipline_id, sort_order)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(course_id, grade_id, discipline_id) DO UPDATE SET
               sort_order = excluded.sort_order",
            (&curriculum_id, &p.course_id, &p.grade_id, discipline_id, i as i64),
        )?;
        links.push(json!({ "disciplineId": discipline_id, "curriculumId": curriculum_id }));
    }

    let class_ids: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT id FROM classes WHERE course_id = ? AND grade_id = ? ORDER BY id")?;
        let rows = stmt
            .query_map((&p.course_id, &p.grade_id), |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for class_id in &class_ids {
        sync_class_links(&tx, class_id)?;
    }
    tx.commit()?;

    Ok(json!({ "curriculum": links, "classesSynced": class_ids.len() }))
}

/// Upserts the class and syncs its class-section links, which overrides
/// attach to, with the curriculum of its course/grade.
fn class_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let p: ClassParams = parse_params(params)?;
    require_row(conn, "schools", "school", &p.school_id)?;
    require_row(conn, "courses", "course", &p.course_id)?;
    require_row(conn, "grades", "grade", &p.grade_id)?;
    let id = id_or_new(p.id);
    let name = require_name(&p.name)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO classes(id, school_id, course_id, grade_id, name, academic_year)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           school_id = excluded.school_id,
           course_id = excluded.course_id,
           grade_id = excluded.grade_id,
           name = excluded.name,
           academic_year = excluded.academic_year",
        (&id, &p.school_id, &p.course_id, &p.grade_id, &name, &p.academic_year),
    )?;

    let links = sync_class_links(&tx, &id)?;
    tx.commit()?;

    Ok(json!({ "classId": id, "disciplines": links }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.schoolUpsert" => Some(with_conn(state, req, school_upsert)),
        "setup.courseUpsert" => Some(with_conn(state, req, course_upsert)),
        "setup.gradeUpsert" => Some(with_conn(state, req, grade_upsert)),
        "setup.disciplineUpsert" => Some(with_conn(state, req, discipline_upsert)),
        "setup.curriculumSet" => Some(with_conn(state, req, curriculum_set)),
        "setup.classUpsert" => Some(with_conn(state, req, class_upsert)),
        _ => None,
    }
}
