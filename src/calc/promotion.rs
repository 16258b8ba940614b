use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::annual::AnnualRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplineRule {
    pub discipline_id: String,
    pub passing_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplineResult {
    pub discipline_id: String,
    pub annual_final: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    pub student_id: String,
    pub per_discipline_result: Vec<DisciplineResult>,
    pub overall_promoted: bool,
    pub failed_count: usize,
}

/// An ungraded discipline is never a pass, whatever the threshold.
pub fn discipline_passed(annual_final: Option<f64>, passing_threshold: f64) -> bool {
    annual_final.is_some_and(|v| v >= passing_threshold)
}

/// One outcome per student, in the order given. A student is promoted only
/// when every curriculum discipline is passed; disciplines without an annual
/// record count as failed.
pub fn decide_promotion(
    student_ids: &[String],
    curriculum: &[DisciplineRule],
    records: &[AnnualRecord],
) -> Vec<PromotionOutcome> {
    let finals: HashMap<(&str, &str), Option<f64>> = records
        .iter()
        .map(|r| {
            (
                (r.student_id.as_str(), r.discipline_id.as_str()),
                r.annual_final,
            )
        })
        .collect();

    student_ids
        .iter()
        .map(|student_id| {
            let per_discipline_result: Vec<DisciplineResult> = curriculum
                .iter()
                .map(|rule| {
                    let annual_final = finals
                        .get(&(student_id.as_str(), rule.discipline_id.as_str()))
                        .copied()
                        .flatten();
                    DisciplineResult {
                        discipline_id: rule.discipline_id.clone(),
                        annual_final,
                        passed: discipline_passed(annual_final, rule.passing_threshold),
                    }
                })
                .collect();
            let failed_count = per_discipline_result.iter().filter(|r| !r.passed).count();
            PromotionOutcome {
                student_id: student_id.clone(),
                per_discipline_result,
                overall_promoted: failed_count == 0,
                failed_count,
            }
        })
        .collect()
}
