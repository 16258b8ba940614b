use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::HashMap;

use crate::calc::{
    self, AssessmentRecord, Component, ComponentMean, EvaluationMode, EvaluationModel,
    ModelLevels, ModelRecord, ModelSource, PeriodAverage, PromotionOutcome, RosterEntry,
};
use crate::config::EngineSettings;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: String,
    pub school_id: String,
    pub course_id: String,
    pub grade_id: String,
    pub name: String,
    pub academic_year: Option<String>,
}

/// A discipline of the class's curriculum, with the class-section link when
/// one exists.
#[derive(Debug, Clone)]
pub struct ClassDiscipline {
    pub discipline_id: String,
    pub code: String,
    pub name: String,
    pub sort_order: i64,
    pub curriculum_id: String,
    pub class_discipline_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeriodLock {
    pub class_id: String,
    pub period: i64,
    pub closed_at: String,
    pub closed_by: Option<String>,
    pub snapshot_sha256: String,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassInfo, EngineError> {
    conn.query_row(
        "SELECT id, school_id, course_id, grade_id, name, academic_year
         FROM classes
         WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassInfo {
                id: r.get(0)?,
                school_id: r.get(1)?,
                course_id: r.get(2)?,
                grade_id: r.get(3)?,
                name: r.get(4)?,
                academic_year: r.get(5)?,
            })
        },
    )
    .optional()?
    .ok_or(EngineError::NotFound("class"))
}

/// The curriculum for the class's course and grade, in curriculum order.
pub fn load_class_disciplines(
    conn: &Connection,
    class: &ClassInfo,
) -> Result<Vec<ClassDiscipline>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.code, d.name, cu.sort_order, cu.id, cd.id
         FROM curriculum cu
         JOIN disciplines d ON d.id = cu.discipline_id
         LEFT JOIN class_disciplines cd
           ON cd.discipline_id = cu.discipline_id AND cd.class_id = ?
         WHERE cu.course_id = ? AND cu.grade_id = ?
         ORDER BY cu.sort_order, d.code",
    )?;
    let rows = stmt
        .query_map((&class.id, &class.course_id, &class.grade_id), |r| {
            Ok(ClassDiscipline {
                discipline_id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                sort_order: r.get(3)?,
                curriculum_id: r.get(4)?,
                class_discipline_id: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_model_record(
    conn: &Connection,
    scope: ModelSource,
    scope_ref: &str,
) -> Result<Option<ModelRecord>, EngineError> {
    let row: Option<(String, String, Option<f64>)> = conn
        .query_row(
            "SELECT id, mode, passing_threshold
             FROM evaluation_models
             WHERE scope = ? AND scope_ref = ?",
            (scope.as_str(), scope_ref),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((model_id, mode_raw, passing_threshold)) = row else {
        return Ok(None);
    };
    let mode = EvaluationMode::parse(&mode_raw).ok_or_else(|| {
        EngineError::InvalidConfiguration(format!("unknown evaluation mode {}", mode_raw))
    })?;

    let mut stmt = conn.prepare(
        "SELECT code, weight, active
         FROM evaluation_components
         WHERE model_id = ?
         ORDER BY sort_order, code",
    )?;
    let components = stmt
        .query_map([&model_id], |r| {
            Ok(Component {
                code: r.get(0)?,
                weight: r.get(1)?,
                active: r.get::<_, i64>(2)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(ModelRecord {
        mode,
        components,
        passing_threshold,
    }))
}

/// Resolves the effective model for one discipline taught under
/// (school, course, grade), optionally through a class-section link.
pub fn resolve_model(
    conn: &Connection,
    settings: &EngineSettings,
    school_id: &str,
    course_id: &str,
    grade_id: &str,
    discipline_id: &str,
    class_discipline_id: Option<&str>,
) -> Result<EvaluationModel, EngineError> {
    let curriculum_id: Option<String> = conn
        .query_row(
            "SELECT id FROM curriculum WHERE course_id = ? AND grade_id = ? AND discipline_id = ?",
            (course_id, grade_id, discipline_id),
            |r| r.get(0),
        )
        .optional()?;

    let levels = ModelLevels {
        class_discipline: match class_discipline_id {
            Some(id) => load_model_record(conn, ModelSource::ClassDiscipline, id)?,
            None => None,
        },
        curriculum: match curriculum_id.as_deref() {
            Some(id) => load_model_record(conn, ModelSource::Curriculum, id)?,
            None => None,
        },
        school: load_model_record(conn, ModelSource::School, school_id)?,
    };

    calc::resolve_levels(&levels, settings.default_passing_threshold)?.ok_or_else(|| {
        EngineError::ConfigurationMissing {
            school_id: school_id.to_string(),
            course_id: course_id.to_string(),
            grade_id: grade_id.to_string(),
            discipline_id: discipline_id.to_string(),
        }
    })
}

/// Per-run memo of resolved models, keyed by discipline.
#[derive(Debug, Default)]
pub struct ModelCache {
    by_discipline: HashMap<String, EvaluationModel>,
}

impl ModelCache {
    pub fn get_or_resolve(
        &mut self,
        conn: &Connection,
        settings: &EngineSettings,
        class: &ClassInfo,
        discipline: &ClassDiscipline,
    ) -> Result<&EvaluationModel, EngineError> {
        if !self.by_discipline.contains_key(&discipline.discipline_id) {
            let model = resolve_model(
                conn,
                settings,
                &class.school_id,
                &class.course_id,
                &class.grade_id,
                &discipline.discipline_id,
                discipline.class_discipline_id.as_deref(),
            )?;
            tracing::debug!(
                class_id = %class.id,
                discipline_id = %discipline.discipline_id,
                source = model.source.as_str(),
                mode = model.mode.as_str(),
                "resolved evaluation model"
            );
            self.by_discipline
                .insert(discipline.discipline_id.clone(), model);
        }
        self.by_discipline
            .get(&discipline.discipline_id)
            .ok_or(EngineError::NotFound("evaluation model"))
    }
}

pub fn load_roster(
    conn: &Connection,
    class_id: &str,
    include_inactive: bool,
) -> Result<Vec<RosterEntry>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, roll_number, name, gender, birth_date, active
         FROM students
         WHERE class_id = ?",
    )?;
    let mut roster = stmt
        .query_map([class_id], |r| {
            Ok(RosterEntry {
                student_id: r.get(0)?,
                roll_number: r.get(1)?,
                name: r.get(2)?,
                gender: r.get(3)?,
                birth_date: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if !include_inactive {
        roster.retain(|s| s.active);
    }
    calc::sort_roster(&mut roster);
    Ok(roster)
}

pub fn student_in_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<bool, EngineError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (class_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn load_assessments(
    conn: &Connection,
    class_id: &str,
    discipline_id: Option<&str>,
    period: Option<i64>,
) -> Result<Vec<AssessmentRecord>, EngineError> {
    let mut sql = String::from(
        "SELECT student_id, discipline_id, period, component_code, score
         FROM assessments
         WHERE class_id = ?",
    );
    let mut bind: Vec<Value> = vec![Value::Text(class_id.to_string())];
    if let Some(d) = discipline_id {
        sql.push_str(" AND discipline_id = ?");
        bind.push(Value::Text(d.to_string()));
    }
    if let Some(p) = period {
        sql.push_str(" AND period = ?");
        bind.push(Value::Integer(p));
    }
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok(AssessmentRecord {
                student_id: r.get(0)?,
                discipline_id: r.get(1)?,
                period: r.get(2)?,
                component_code: r.get(3)?,
                score: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn period_lock(
    conn: &Connection,
    class_id: &str,
    period: i64,
) -> Result<Option<PeriodLock>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT class_id, period, closed_at, closed_by, snapshot_sha256
             FROM period_locks
             WHERE class_id = ? AND period = ?",
            (class_id, period),
            |r| {
                Ok(PeriodLock {
                    class_id: r.get(0)?,
                    period: r.get(1)?,
                    closed_at: r.get(2)?,
                    closed_by: r.get(3)?,
                    snapshot_sha256: r.get(4)?,
                })
            },
        )
        .optional()?)
}

pub fn list_period_locks(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<PeriodLock>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT class_id, period, closed_at, closed_by, snapshot_sha256
         FROM period_locks
         WHERE class_id = ?
         ORDER BY period",
    )?;
    let locks = stmt
        .query_map([class_id], |r| {
            Ok(PeriodLock {
                class_id: r.get(0)?,
                period: r.get(1)?,
                closed_at: r.get(2)?,
                closed_by: r.get(3)?,
                snapshot_sha256: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(locks)
}

/// Score writes go through here: a closed period refuses them.
pub fn ensure_period_open(
    conn: &Connection,
    class_id: &str,
    period: i64,
) -> Result<(), EngineError> {
    if period_lock(conn, class_id, period)?.is_some() {
        return Err(EngineError::PeriodLocked {
            class_id: class_id.to_string(),
            period,
        });
    }
    Ok(())
}

pub fn ensure_attendance_open(
    conn: &Connection,
    class_id: &str,
    period: i64,
) -> Result<(), EngineError> {
    let locked = conn
        .query_row(
            "SELECT 1 FROM attendance_locks WHERE class_id = ? AND period = ?",
            (class_id, period),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if locked {
        return Err(EngineError::PeriodLocked {
            class_id: class_id.to_string(),
            period,
        });
    }
    Ok(())
}

pub fn load_period_snapshot(
    conn: &Connection,
    class_id: &str,
    period: i64,
) -> Result<Vec<PeriodAverage>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, discipline_id, value, components_json
         FROM period_snapshots
         WHERE class_id = ? AND period = ?
         ORDER BY student_id, discipline_id",
    )?;
    let rows = stmt
        .query_map((class_id, period), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (student_id, discipline_id, value, components_json) in rows {
        let components: Vec<ComponentMean> = serde_json::from_str(&components_json)?;
        out.push(PeriodAverage {
            student_id,
            discipline_id,
            period,
            value,
            components,
        });
    }
    Ok(out)
}

pub fn save_period_snapshot(
    conn: &Connection,
    class_id: &str,
    averages: &[PeriodAverage],
) -> Result<(), EngineError> {
    for a in averages {
        conn.execute(
            "INSERT INTO period_snapshots(
               class_id, period, student_id, discipline_id, value, components_json)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                class_id,
                a.period,
                &a.student_id,
                &a.discipline_id,
                a.value,
                serde_json::to_string(&a.components)?,
            ),
        )?;
    }
    Ok(())
}

/// Promotion outcomes frozen by the close of the final period.
#[derive(Debug, Clone)]
pub struct FrozenPromotion {
    pub period: i64,
    pub frozen_at: String,
    pub outcomes: Vec<PromotionOutcome>,
}

/// `None` until the final period is closed. The marker row decides, so a
/// class frozen with no active students still reads as frozen.
pub fn load_promotion_snapshot(
    conn: &Connection,
    class_id: &str,
) -> Result<Option<FrozenPromotion>, EngineError> {
    let marker: Option<(i64, String)> = conn
        .query_row(
            "SELECT period, frozen_at FROM promotion_locks WHERE class_id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((period, frozen_at)) = marker else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT outcome_json FROM promotion_snapshots WHERE class_id = ?")?;
    let raw = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut outcomes = Vec::with_capacity(raw.len());
    for s in raw {
        outcomes.push(serde_json::from_str::<PromotionOutcome>(&s)?);
    }
    Ok(Some(FrozenPromotion {
        period,
        frozen_at,
        outcomes,
    }))
}

pub fn save_promotion_snapshot(
    conn: &Connection,
    class_id: &str,
    period: i64,
    outcomes: &[PromotionOutcome],
    frozen_at: &str,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO promotion_locks(class_id, period, frozen_at) VALUES(?, ?, ?)",
        (class_id, period, frozen_at),
    )?;
    for o in outcomes {
        conn.execute(
            "INSERT INTO promotion_snapshots(class_id, student_id, outcome_json, frozen_at)
             VALUES(?, ?, ?, ?)",
            (class_id, &o.student_id, serde_json::to_string(o)?, frozen_at),
        )?;
    }
    Ok(())
}
