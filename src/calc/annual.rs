use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::aggregate::PeriodAverage;
use super::model::EvaluationMode;
use super::promotion::discipline_passed;
use super::round_half_up_2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualRecord {
    pub student_id: String,
    pub discipline_id: String,
    /// One slot per period of the year, period 1 first.
    pub period_averages: Vec<Option<f64>>,
    pub annual_final: Option<f64>,
}

/// Mean of the graded periods. Ungraded periods leave both the sum and the
/// divisor untouched.
pub fn annual_final(values: &[Option<f64>]) -> Option<f64> {
    let graded: Vec<f64> = values.iter().flatten().copied().collect();
    if graded.is_empty() {
        return None;
    }
    let sum: f64 = graded.iter().sum();
    Some(round_half_up_2(sum / graded.len() as f64))
}

pub fn compose_annual(
    mode: EvaluationMode,
    student_id: &str,
    discipline_id: &str,
    averages: &[PeriodAverage],
) -> AnnualRecord {
    let period_averages: Vec<Option<f64>> = (1..=mode.period_count())
        .map(|p| {
            averages
                .iter()
                .find(|a| {
                    a.period == p && a.student_id == student_id && a.discipline_id == discipline_id
                })
                .and_then(|a| a.value)
        })
        .collect();

    let annual_final = if mode.composes_annual() {
        annual_final(&period_averages)
    } else {
        period_averages.first().copied().flatten()
    };

    AnnualRecord {
        student_id: student_id.to_string(),
        discipline_id: discipline_id.to_string(),
        period_averages,
        annual_final,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub roll_number: Option<i64>,
    pub name: String,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub active: bool,
}

fn roster_order(a: &RosterEntry, b: &RosterEntry) -> Ordering {
    let by_roll = match (a.roll_number, b.roll_number) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_roll
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.student_id.cmp(&b.student_id))
}

/// Grade-sheet order: roll number ascending, then name. Students without a
/// roll number follow the numbered ones.
pub fn sort_roster(entries: &mut [RosterEntry]) {
    entries.sort_by(roster_order);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaDiscipline {
    pub discipline_id: String,
    pub code: String,
    pub name: String,
    pub mode: EvaluationMode,
    pub period_count: i64,
    pub passing_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaCell {
    pub discipline_id: String,
    pub periods: Vec<Option<f64>>,
    pub annual_final: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaRow {
    pub student: RosterEntry,
    pub cells: Vec<PautaCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaColumnStats {
    pub discipline_id: String,
    pub evaluated: usize,
    pub passed: usize,
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PautaMatrix {
    pub disciplines: Vec<PautaDiscipline>,
    pub rows: Vec<PautaRow>,
    pub stats: Vec<PautaColumnStats>,
}

/// Students × disciplines grade sheet. Every roster student gets a cell for
/// every discipline; cells without a record show empty periods.
pub fn build_pauta(
    roster: &[RosterEntry],
    disciplines: &[PautaDiscipline],
    records: &[AnnualRecord],
) -> PautaMatrix {
    let by_pair: HashMap<(&str, &str), &AnnualRecord> = records
        .iter()
        .map(|r| ((r.student_id.as_str(), r.discipline_id.as_str()), r))
        .collect();

    let mut ordered = roster.to_vec();
    sort_roster(&mut ordered);

    let rows: Vec<PautaRow> = ordered
        .into_iter()
        .map(|student| {
            let cells = disciplines
                .iter()
                .map(|d| {
                    let record =
                        by_pair.get(&(student.student_id.as_str(), d.discipline_id.as_str()));
                    let mut periods = record
                        .map(|r| r.period_averages.clone())
                        .unwrap_or_default();
                    periods.resize(d.period_count.max(0) as usize, None);
                    PautaCell {
                        discipline_id: d.discipline_id.clone(),
                        periods,
                        annual_final: record.and_then(|r| r.annual_final),
                    }
                })
                .collect();
            PautaRow { student, cells }
        })
        .collect();

    let stats = disciplines
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let finals: Vec<f64> = rows
                .iter()
                .filter(|r| r.student.active)
                .filter_map(|r| r.cells[i].annual_final)
                .collect();
            let passed = finals
                .iter()
                .filter(|v| discipline_passed(Some(**v), d.passing_threshold))
                .count();
            let class_average = if finals.is_empty() {
                None
            } else {
                Some(round_half_up_2(
                    finals.iter().sum::<f64>() / finals.len() as f64,
                ))
            };
            PautaColumnStats {
                discipline_id: d.discipline_id.clone(),
                evaluated: finals.len(),
                passed,
                class_average,
            }
        })
        .collect();

    PautaMatrix {
        disciplines: disciplines.to_vec(),
        rows,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avg(student: &str, period: i64, value: Option<f64>) -> PeriodAverage {
        PeriodAverage {
            student_id: student.to_string(),
            discipline_id: "MAT".to_string(),
            period,
            value,
            components: Vec::new(),
        }
    }

    fn entry(id: &str, roll: Option<i64>, name: &str) -> RosterEntry {
        RosterEntry {
            student_id: id.to_string(),
            roll_number: roll,
            name: name.to_string(),
            gender: None,
            birth_date: None,
            active: true,
        }
    }

    fn discipline(id: &str, mode: EvaluationMode) -> PautaDiscipline {
        PautaDiscipline {
            discipline_id: id.to_string(),
            code: id.to_string(),
            name: id.to_string(),
            mode,
            period_count: mode.period_count(),
            passing_threshold: 10.0,
        }
    }

    #[test]
    fn null_periods_leave_the_divisor_alone() {
        assert_eq!(annual_final(&[Some(12.0), None, Some(16.0)]), Some(14.0));
        assert_eq!(annual_final(&[Some(10.0), None, Some(12.0)]), Some(11.0));
        assert_eq!(annual_final(&[None, None, None]), None);
        assert_eq!(annual_final(&[Some(10.0), Some(10.0), Some(11.0)]), Some(10.33));
    }

    #[test]
    fn compose_fills_one_slot_per_period() {
        let averages = vec![
            avg("s1", 1, Some(10.0)),
            avg("s1", 3, Some(12.0)),
            avg("s2", 2, Some(20.0)),
        ];
        let r = compose_annual(EvaluationMode::Trimestral, "s1", "MAT", &averages);
        assert_eq!(r.period_averages, vec![Some(10.0), None, Some(12.0)]);
        assert_eq!(r.annual_final, Some(11.0));

        let empty = compose_annual(EvaluationMode::Trimestral, "s3", "MAT", &averages);
        assert_eq!(empty.period_averages, vec![None, None, None]);
        assert_eq!(empty.annual_final, None);
    }

    #[test]
    fn simplified_mode_passes_the_single_period_through() {
        let averages = vec![avg("s1", 1, Some(13.37))];
        let r = compose_annual(EvaluationMode::Simplified, "s1", "MAT", &averages);
        assert_eq!(r.period_averages, vec![Some(13.37)]);
        assert_eq!(r.annual_final, Some(13.37));
    }

    #[test]
    fn roster_orders_by_roll_then_name() {
        let mut roster = vec![
            entry("a", None, "Zita"),
            entry("b", Some(2), "Bruno"),
            entry("c", Some(1), "Carla"),
            entry("d", Some(2), "ana"),
            entry("e", None, "Abel"),
        ];
        sort_roster(&mut roster);
        let ids: Vec<&str> = roster.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "e", "a"]);
    }

    #[test]
    fn pauta_keeps_gaps_and_roster_order() {
        let roster = vec![entry("s2", Some(2), "Beatriz"), entry("s1", Some(1), "Artur")];
        let disciplines = vec![
            discipline("MAT", EvaluationMode::Trimestral),
            discipline("EF", EvaluationMode::Simplified),
        ];
        let records = vec![AnnualRecord {
            student_id: "s1".to_string(),
            discipline_id: "MAT".to_string(),
            period_averages: vec![Some(12.0), None, Some(16.0)],
            annual_final: Some(14.0),
        }];
        let pauta = build_pauta(&roster, &disciplines, &records);

        assert_eq!(pauta.rows[0].student.student_id, "s1");
        assert_eq!(pauta.rows[0].cells[0].annual_final, Some(14.0));
        assert_eq!(pauta.rows[0].cells[1].periods, vec![None]);
        assert_eq!(pauta.rows[1].cells[0].periods, vec![None, None, None]);
        assert_eq!(pauta.rows[1].cells[0].annual_final, None);

        assert_eq!(pauta.stats[0].evaluated, 1);
        assert_eq!(pauta.stats[0].passed, 1);
        assert_eq!(pauta.stats[0].class_average, Some(14.0));
        assert_eq!(pauta.stats[1].class_average, None);
    }
}
