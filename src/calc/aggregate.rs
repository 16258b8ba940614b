use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::model::EvaluationModel;
use super::round_half_up_2;

/// Single place where component aliases are folded together. `PT` is the
/// older name of the final test component `NPT`.
pub fn canonical_component_code(raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();
    match code.as_str() {
        "PT" => "NPT".to_string(),
        _ => code,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRecord {
    pub student_id: String,
    pub discipline_id: String,
    pub period: i64,
    pub component_code: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMean {
    pub code: String,
    pub weight: f64,
    pub mean: Option<f64>,
    pub score_count: usize,
}

/// A student's MT for one discipline and period. `value` is `None` when no
/// active component has a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodAverage {
    pub student_id: String,
    pub discipline_id: String,
    pub period: i64,
    pub value: Option<f64>,
    pub components: Vec<ComponentMean>,
}

fn mean_of(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    // Sorted summation keeps the mean bit-identical for any input order.
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let sum: f64 = sorted.iter().sum();
    Some(sum / sorted.len() as f64)
}

fn weighted_period_value(
    model: &EvaluationModel,
    by_component: &HashMap<String, Vec<f64>>,
) -> (Option<f64>, Vec<ComponentMean>) {
    let mut weighted_sum = 0.0_f64;
    let mut weighted_denom = 0.0_f64;
    let mut equal_sum = 0.0_f64;
    let mut equal_denom = 0_usize;
    let mut components = Vec::with_capacity(model.components.len());

    for c in &model.components {
        let scores = by_component.get(&c.code).map(|v| v.as_slice()).unwrap_or(&[]);
        let weight = c.effective_weight();
        let mean = mean_of(scores);
        if let Some(m) = mean {
            if weight > 0.0 {
                weighted_sum += m * weight;
                weighted_denom += weight;
            }
            equal_sum += m;
            equal_denom += 1;
        }
        components.push(ComponentMean {
            code: c.code.clone(),
            weight,
            mean: mean.map(round_half_up_2),
            score_count: scores.len(),
        });
    }

    let value = if weighted_denom > 0.0 {
        Some(weighted_sum / weighted_denom)
    } else if equal_denom > 0 {
        Some(equal_sum / equal_denom as f64)
    } else {
        None
    };

    (value.map(round_half_up_2), components)
}

/// Period averages for every (student, discipline) pair that has at least one
/// record in `period`, ordered by student id then discipline id.
pub fn aggregate_period(
    model: &EvaluationModel,
    records: &[AssessmentRecord],
    period: i64,
) -> Vec<PeriodAverage> {
    let mut grouped: BTreeMap<(&str, &str), HashMap<String, Vec<f64>>> = BTreeMap::new();
    for r in records.iter().filter(|r| r.period == period) {
        let by_component = grouped
            .entry((r.student_id.as_str(), r.discipline_id.as_str()))
            .or_default();
        let scores = by_component
            .entry(canonical_component_code(&r.component_code))
            .or_default();
        if let Some(score) = r.score.filter(|s| s.is_finite()) {
            scores.push(score);
        }
    }

    grouped
        .into_iter()
        .map(|((student_id, discipline_id), by_component)| {
            let (value, components) = weighted_period_value(model, &by_component);
            PeriodAverage {
                student_id: student_id.to_string(),
                discipline_id: discipline_id.to_string(),
                period,
                value,
                components,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{Component, EvaluationMode, ModelSource};
    use proptest::prelude::*;

    fn model(components: &[(&str, Option<f64>)]) -> EvaluationModel {
        EvaluationModel {
            mode: EvaluationMode::Trimestral,
            components: components
                .iter()
                .map(|(code, weight)| Component {
                    code: code.to_string(),
                    weight: *weight,
                    active: true,
                })
                .collect(),
            retired_components: Vec::new(),
            passing_threshold: 10.0,
            source: ModelSource::School,
        }
    }

    fn rec(student: &str, period: i64, code: &str, score: Option<f64>) -> AssessmentRecord {
        AssessmentRecord {
            student_id: student.to_string(),
            discipline_id: "MAT".to_string(),
            period,
            component_code: code.to_string(),
            score,
        }
    }

    fn standard_model() -> EvaluationModel {
        model(&[("MAC", Some(1.0)), ("NPP", Some(1.0)), ("NPT", Some(2.0))])
    }

    #[test]
    fn weighted_average_of_component_means() {
        let records = vec![
            rec("s1", 1, "MAC", Some(14.0)),
            rec("s1", 1, "MAC", Some(16.0)),
            rec("s1", 1, "NPP", Some(12.0)),
            rec("s1", 1, "NPT", Some(10.0)),
        ];
        let out = aggregate_period(&standard_model(), &records, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Some(11.75));
        assert_eq!(out[0].components[0].mean, Some(15.0));
        assert_eq!(out[0].components[0].score_count, 2);
    }

    #[test]
    fn missing_components_are_not_zeroes() {
        let records = vec![rec("s1", 1, "NPP", Some(14.0))];
        let out = aggregate_period(&standard_model(), &records, 1);
        assert_eq!(out[0].value, Some(14.0));
        assert_eq!(out[0].components[0].mean, None);
        assert_eq!(out[0].components[0].score_count, 0);
    }

    #[test]
    fn pt_and_npt_pool_together() {
        let records = vec![
            rec("s1", 1, "NPT", Some(10.0)),
            rec("s1", 1, "pt", Some(14.0)),
        ];
        let out = aggregate_period(&standard_model(), &records, 1);
        let npt = &out[0].components[2];
        assert_eq!(npt.code, "NPT");
        assert_eq!(npt.score_count, 2);
        assert_eq!(npt.mean, Some(12.0));
        assert_eq!(out[0].value, Some(12.0));
    }

    #[test]
    fn null_scores_and_other_periods_are_ignored() {
        let records = vec![
            rec("s1", 1, "MAC", None),
            rec("s1", 2, "MAC", Some(18.0)),
            rec("s2", 1, "NPP", Some(9.0)),
        ];
        let out = aggregate_period(&standard_model(), &records, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].student_id, "s1");
        assert_eq!(out[0].value, None);
        assert_eq!(out[1].value, Some(9.0));
    }

    #[test]
    fn inactive_component_codes_do_not_contribute() {
        let records = vec![
            rec("s1", 1, "EXTRA", Some(20.0)),
            rec("s1", 1, "MAC", Some(8.0)),
        ];
        let out = aggregate_period(&standard_model(), &records, 1);
        assert_eq!(out[0].value, Some(8.0));

        let only_unknown = vec![rec("s1", 1, "EXTRA", Some(20.0))];
        let out = aggregate_period(&standard_model(), &only_unknown, 1);
        assert_eq!(out[0].value, None);
    }

    #[test]
    fn unweighted_fallback_when_no_weights_are_configured() {
        let m = model(&[("MAC", None), ("NPP", Some(0.0)), ("NPT", None)]);
        let records = vec![
            rec("s1", 1, "MAC", Some(10.0)),
            rec("s1", 1, "NPP", Some(11.0)),
            rec("s1", 1, "NPT", Some(15.0)),
        ];
        let out = aggregate_period(&m, &records, 1);
        assert_eq!(out[0].value, Some(12.0));
    }

    #[test]
    fn no_records_means_no_row() {
        let out = aggregate_period(&standard_model(), &[], 1);
        assert!(out.is_empty());
    }

    fn arb_records() -> impl Strategy<Value = Vec<AssessmentRecord>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["s1", "s2", "s3"]),
                prop::sample::select(vec!["MAC", "NPP", "NPT", "PT"]),
                prop::option::weighted(0.9, 0.0_f64..20.0),
            ),
            0..40,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(student, code, score)| rec(student, 1, code, score))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn aggregation_ignores_record_order(records in arb_records(), seed in any::<u64>()) {
            let m = standard_model();
            let forward = aggregate_period(&m, &records, 1);

            let mut shuffled = records.clone();
            shuffled.reverse();
            let len = shuffled.len();
            if len > 1 {
                shuffled.rotate_left((seed as usize) % len);
            }
            let reordered = aggregate_period(&m, &shuffled, 1);
            prop_assert_eq!(forward, reordered);
        }

        #[test]
        fn zero_weights_equal_unweighted_mean(records in arb_records()) {
            let zero = model(&[("MAC", Some(0.0)), ("NPP", None), ("NPT", Some(0.0))]);
            let equal = model(&[("MAC", Some(1.0)), ("NPP", Some(1.0)), ("NPT", Some(1.0))]);
            let a: Vec<Option<f64>> = aggregate_period(&zero, &records, 1)
                .into_iter()
                .map(|p| p.value)
                .collect();
            let b: Vec<Option<f64>> = aggregate_period(&equal, &records, 1)
                .into_iter()
                .map(|p| p.value)
                .collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn students_without_scores_get_none(records in arb_records()) {
            let out = aggregate_period(&standard_model(), &records, 1);
            for avg in out {
                let has_score = records
                    .iter()
                    .any(|r| r.student_id == avg.student_id && r.score.is_some());
                prop_assert_eq!(avg.value.is_some(), has_score);
            }
        }
    }
}
