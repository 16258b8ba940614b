//! Pure evaluation math: model resolution, period aggregation, annual
//! composition and promotion. Nothing in here touches the workspace; the
//! loaders in `store` feed these functions plain data.

mod aggregate;
mod annual;
mod model;
mod promotion;

pub use aggregate::{
    aggregate_period, canonical_component_code, AssessmentRecord, ComponentMean, PeriodAverage,
};
pub use annual::{
    annual_final, build_pauta, compose_annual, sort_roster, AnnualRecord, PautaCell,
    PautaColumnStats, PautaDiscipline, PautaMatrix, PautaRow, RosterEntry,
};
pub use model::{
    resolve_levels, validate_components, Component, EvaluationMode, EvaluationModel,
    ModelLevels, ModelRecord, ModelSource,
};
pub use promotion::{
    decide_promotion, discipline_passed, DisciplineResult, DisciplineRule, PromotionOutcome,
};

/// Two-decimal half-up rounding, the canonical precision of every grade the
/// engine emits.
///
/// The scaled value is first snapped to 1e-6 so that decimal inputs such as
/// `11.745` (stored as `11.74499…`) round up as written.
pub fn round_half_up_2(x: f64) -> f64 {
    let scaled = (x * 100.0 * 1e6).round() / 1e6;
    (scaled + 0.5).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_half_up_matches_written_decimals() {
        assert_eq!(round_half_up_2(0.0), 0.0);
        assert_eq!(round_half_up_2(11.75), 11.75);
        assert_eq!(round_half_up_2(11.745), 11.75);
        assert_eq!(round_half_up_2(2.675), 2.68);
        assert_eq!(round_half_up_2(1.005), 1.01);
        assert_eq!(round_half_up_2(28.0 / 3.0), 9.33);
        assert_eq!(round_half_up_2(29.0 / 3.0), 9.67);
        assert_eq!(round_half_up_2(14.0), 14.0);
    }
}
