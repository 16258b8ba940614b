use rusqlite::Connection;
use std::collections::HashMap;

use crate::calc::{
    self, AnnualRecord, DisciplineRule, EvaluationModel, PautaDiscipline, PautaMatrix,
    PeriodAverage, PromotionOutcome, RosterEntry,
};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::store::{self, ClassDiscipline, ClassInfo, ModelCache};

/// Everything one computation over a class needs, loaded up front: the class,
/// its curriculum with resolved models, and the roster in grade-sheet order.
#[derive(Debug)]
pub struct ClassRun {
    pub class: ClassInfo,
    pub disciplines: Vec<(ClassDiscipline, EvaluationModel)>,
    pub roster: Vec<RosterEntry>,
}

#[derive(Debug, Clone)]
pub struct PeriodAveragesView {
    pub period: i64,
    pub frozen: bool,
    pub averages: Vec<PeriodAverage>,
}

impl ClassRun {
    pub fn load(
        conn: &Connection,
        settings: &EngineSettings,
        class_id: &str,
    ) -> Result<Self, EngineError> {
        let class = store::load_class(conn, class_id)?;
        let curriculum = store::load_class_disciplines(conn, &class)?;
        let mut cache = ModelCache::default();
        let mut disciplines = Vec::with_capacity(curriculum.len());
        for d in curriculum {
            let model = cache.get_or_resolve(conn, settings, &class, &d)?.clone();
            disciplines.push((d, model));
        }
        let roster = store::load_roster(conn, class_id, true)?;
        Ok(Self {
            class,
            disciplines,
            roster,
        })
    }

    /// The last period of the class's year: the longest scheme among its
    /// disciplines.
    pub fn final_period(&self) -> i64 {
        self.disciplines
            .iter()
            .map(|(_, m)| m.period_count())
            .max()
            .unwrap_or(0)
    }

    pub fn check_period(&self, period: i64) -> Result<(), EngineError> {
        let last = self.final_period();
        if period < 1 || period > last {
            return Err(EngineError::bad_params(format!(
                "period must be between 1 and {} for this class",
                last
            )));
        }
        Ok(())
    }

    pub fn discipline(&self, discipline_id: &str) -> Option<&(ClassDiscipline, EvaluationModel)> {
        self.disciplines
            .iter()
            .find(|(d, _)| d.discipline_id == discipline_id)
    }

    /// Fresh aggregation from the assessment store, ignoring any snapshot.
    pub fn compute_period(
        &self,
        conn: &Connection,
        period: i64,
    ) -> Result<Vec<PeriodAverage>, EngineError> {
        let records = store::load_assessments(conn, &self.class.id, None, Some(period))?;
        let mut out = Vec::new();
        for (d, model) in &self.disciplines {
            if period > model.period_count() {
                continue;
            }
            let mine: Vec<_> = records
                .iter()
                .filter(|r| r.discipline_id == d.discipline_id)
                .cloned()
                .collect();
            out.extend(calc::aggregate_period(model, &mine, period));
        }
        out.sort_by(|a, b| {
            a.student_id
                .cmp(&b.student_id)
                .then_with(|| a.discipline_id.cmp(&b.discipline_id))
        });
        Ok(out)
    }

    /// Period averages as callers should see them: the frozen snapshot once
    /// the period is closed, a fresh computation otherwise.
    pub fn period_averages(
        &self,
        conn: &Connection,
        period: i64,
        require_open: bool,
    ) -> Result<PeriodAveragesView, EngineError> {
        self.check_period(period)?;
        if store::period_lock(conn, &self.class.id, period)?.is_some() {
            if require_open {
                return Err(EngineError::PeriodLocked {
                    class_id: self.class.id.clone(),
                    period,
                });
            }
            return Ok(PeriodAveragesView {
                period,
                frozen: true,
                averages: store::load_period_snapshot(conn, &self.class.id, period)?,
            });
        }
        Ok(PeriodAveragesView {
            period,
            frozen: false,
            averages: self.compute_period(conn, period)?,
        })
    }

    pub fn annual_records(&self, conn: &Connection) -> Result<Vec<AnnualRecord>, EngineError> {
        let mut averages: Vec<PeriodAverage> = Vec::new();
        for period in 1..=self.final_period() {
            averages.extend(self.period_averages(conn, period, false)?.averages);
        }

        let mut by_pair: HashMap<(&str, &str), Vec<PeriodAverage>> = HashMap::new();
        for a in &averages {
            by_pair
                .entry((a.student_id.as_str(), a.discipline_id.as_str()))
                .or_default()
                .push(a.clone());
        }

        let mut records = Vec::with_capacity(self.roster.len() * self.disciplines.len());
        for student in &self.roster {
            for (d, model) in &self.disciplines {
                let pair = by_pair
                    .get(&(student.student_id.as_str(), d.discipline_id.as_str()))
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);
                records.push(calc::compose_annual(
                    model.mode,
                    &student.student_id,
                    &d.discipline_id,
                    pair,
                ));
            }
        }
        Ok(records)
    }

    pub fn pauta_disciplines(&self) -> Vec<PautaDiscipline> {
        self.disciplines
            .iter()
            .map(|(d, m)| PautaDiscipline {
                discipline_id: d.discipline_id.clone(),
                code: d.code.clone(),
                name: d.name.clone(),
                mode: m.mode,
                period_count: m.period_count(),
                passing_threshold: m.passing_threshold,
            })
            .collect()
    }

    pub fn pauta(&self, records: &[AnnualRecord], include_inactive: bool) -> PautaMatrix {
        let roster: Vec<RosterEntry> = self
            .roster
            .iter()
            .filter(|s| include_inactive || s.active)
            .cloned()
            .collect();
        calc::build_pauta(&roster, &self.pauta_disciplines(), records)
    }

    pub fn curriculum_rules(&self) -> Vec<DisciplineRule> {
        self.disciplines
            .iter()
            .map(|(d, m)| DisciplineRule {
                discipline_id: d.discipline_id.clone(),
                passing_threshold: m.passing_threshold,
            })
            .collect()
    }

    /// Promotion runs over active students only.
    pub fn promotion(&self, records: &[AnnualRecord]) -> Vec<PromotionOutcome> {
        let student_ids: Vec<String> = self
            .roster
            .iter()
            .filter(|s| s.active)
            .map(|s| s.student_id.clone())
            .collect();
        calc::decide_promotion(&student_ids, &self.curriculum_rules(), records)
    }

    /// Puts stored outcomes back into roster order.
    pub fn order_outcomes(&self, mut outcomes: Vec<PromotionOutcome>) -> Vec<PromotionOutcome> {
        let position: HashMap<&str, usize> = self
            .roster
            .iter()
            .enumerate()
            .map(|(i, s)| (s.student_id.as_str(), i))
            .collect();
        outcomes.sort_by_key(|o| {
            position
                .get(o.student_id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
        outcomes
    }
}
