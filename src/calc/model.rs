use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::aggregate::canonical_component_code;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationMode {
    Trimestral,
    Semestral,
    Simplified,
}

impl EvaluationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TRIMESTRAL" => Some(EvaluationMode::Trimestral),
            "SEMESTRAL" => Some(EvaluationMode::Semestral),
            "SIMPLIFIED" | "SIMPLIFICADO" => Some(EvaluationMode::Simplified),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationMode::Trimestral => "TRIMESTRAL",
            EvaluationMode::Semestral => "SEMESTRAL",
            EvaluationMode::Simplified => "SIMPLIFIED",
        }
    }

    /// Number of grading periods in one academic year.
    pub fn period_count(self) -> i64 {
        match self {
            EvaluationMode::Trimestral => 3,
            EvaluationMode::Semestral => 2,
            EvaluationMode::Simplified => 1,
        }
    }

    /// Simplified schemes report a single period value and skip the annual mean.
    pub fn composes_annual(self) -> bool {
        !matches!(self, EvaluationMode::Simplified)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub code: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Component {
    /// Absent and non-positive weights both count as "no weight".
    pub fn effective_weight(&self) -> f64 {
        self.weight.filter(|w| *w > 0.0).unwrap_or(0.0)
    }
}

/// One stored level of the configuration hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub mode: EvaluationMode,
    pub components: Vec<Component>,
    pub passing_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    ClassDiscipline,
    Curriculum,
    School,
}

impl ModelSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSource::ClassDiscipline => "class_discipline",
            ModelSource::Curriculum => "curriculum",
            ModelSource::School => "school",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "class_discipline" | "classdiscipline" => Some(ModelSource::ClassDiscipline),
            "curriculum" => Some(ModelSource::Curriculum),
            "school" => Some(ModelSource::School),
            _ => None,
        }
    }
}

/// The three override levels, most specific first.
#[derive(Debug, Clone, Default)]
pub struct ModelLevels {
    pub class_discipline: Option<ModelRecord>,
    pub curriculum: Option<ModelRecord>,
    pub school: Option<ModelRecord>,
}

impl ModelLevels {
    fn chain(&self) -> [(ModelSource, Option<&ModelRecord>); 3] {
        [
            (ModelSource::ClassDiscipline, self.class_discipline.as_ref()),
            (ModelSource::Curriculum, self.curriculum.as_ref()),
            (ModelSource::School, self.school.as_ref()),
        ]
    }

    pub fn effective(&self) -> Option<(ModelSource, &ModelRecord)> {
        self.chain()
            .into_iter()
            .find_map(|(source, record)| record.map(|r| (source, r)))
    }

    fn passing_threshold(&self) -> Option<f64> {
        self.chain()
            .into_iter()
            .find_map(|(_, record)| record.and_then(|r| r.passing_threshold))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationModel {
    pub mode: EvaluationMode,
    pub components: Vec<Component>,
    pub retired_components: Vec<Component>,
    pub passing_threshold: f64,
    pub source: ModelSource,
}

impl EvaluationModel {
    pub fn period_count(&self) -> i64 {
        self.mode.period_count()
    }

    pub fn has_component(&self, code: &str) -> bool {
        let code = canonical_component_code(code);
        self.components.iter().any(|c| c.code == code)
    }
}

/// Canonicalises component codes and rejects configurations the aggregator
/// cannot honour (blank or duplicate codes, negative or non-finite weights).
pub fn validate_components(components: &[Component]) -> Result<Vec<Component>, EngineError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(components.len());
    for c in components {
        let code = canonical_component_code(&c.code);
        if code.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "component code must not be blank".to_string(),
            ));
        }
        if let Some(w) = c.weight {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "component {} has invalid weight {}",
                    code, w
                )));
            }
        }
        if !seen.insert(code.clone()) {
            return Err(EngineError::InvalidConfiguration(format!(
                "component {} is defined more than once",
                code
            )));
        }
        out.push(Component {
            code,
            weight: c.weight,
            active: c.active,
        });
    }
    Ok(out)
}

/// First configured level wins. `Ok(None)` means nothing is configured at any
/// level; callers turn that into `ConfigurationMissing` with their own ids.
pub fn resolve_levels(
    levels: &ModelLevels,
    default_threshold: f64,
) -> Result<Option<EvaluationModel>, EngineError> {
    let Some((source, record)) = levels.effective() else {
        return Ok(None);
    };

    let components = validate_components(&record.components)?;
    let (active, retired): (Vec<Component>, Vec<Component>) =
        components.into_iter().partition(|c| c.active);

    let passing_threshold = levels.passing_threshold().unwrap_or(default_threshold);
    if !passing_threshold.is_finite() {
        return Err(EngineError::InvalidConfiguration(
            "passing threshold must be a finite number".to_string(),
        ));
    }

    Ok(Some(EvaluationModel {
        mode: record.mode,
        components: active,
        retired_components: retired,
        passing_threshold,
        source,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(code: &str, weight: Option<f64>, active: bool) -> Component {
        Component {
            code: code.to_string(),
            weight,
            active,
        }
    }

    fn record(mode: EvaluationMode, codes: &[&str]) -> ModelRecord {
        ModelRecord {
            mode,
            components: codes
                .iter()
                .map(|c| component(c, Some(1.0), true))
                .collect(),
            passing_threshold: None,
        }
    }

    #[test]
    fn most_specific_level_wins() {
        let levels = ModelLevels {
            class_discipline: Some(record(EvaluationMode::Simplified, &["MAC"])),
            curriculum: Some(record(EvaluationMode::Semestral, &["NPP"])),
            school: Some(record(EvaluationMode::Trimestral, &["MAC", "NPP", "NPT"])),
        };
        let model = resolve_levels(&levels, 10.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.source, ModelSource::ClassDiscipline);
        assert_eq!(model.mode, EvaluationMode::Simplified);
        assert_eq!(model.components.len(), 1);

        let levels = ModelLevels {
            class_discipline: None,
            ..levels
        };
        let model = resolve_levels(&levels, 10.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.source, ModelSource::Curriculum);
        assert_eq!(model.period_count(), 2);
    }

    #[test]
    fn falls_back_to_school_default() {
        let levels = ModelLevels {
            school: Some(record(EvaluationMode::Trimestral, &["MAC"])),
            ..ModelLevels::default()
        };
        let model = resolve_levels(&levels, 10.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.source, ModelSource::School);
        assert_eq!(model.period_count(), 3);
    }

    #[test]
    fn nothing_configured_resolves_to_none() {
        let resolved = resolve_levels(&ModelLevels::default(), 10.0).expect("resolve");
        assert!(resolved.is_none());
    }

    #[test]
    fn inactive_components_are_retired_not_dropped() {
        let levels = ModelLevels {
            school: Some(ModelRecord {
                mode: EvaluationMode::Trimestral,
                components: vec![
                    component("mac", Some(1.0), true),
                    component("NPP", Some(1.0), false),
                ],
                passing_threshold: None,
            }),
            ..ModelLevels::default()
        };
        let model = resolve_levels(&levels, 10.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.components, vec![component("MAC", Some(1.0), true)]);
        assert_eq!(
            model.retired_components,
            vec![component("NPP", Some(1.0), false)]
        );
        assert!(model.has_component("mac"));
        assert!(!model.has_component("NPP"));
    }

    #[test]
    fn alias_codes_collide() {
        let err = validate_components(&[
            component("NPT", Some(2.0), true),
            component("pt", Some(1.0), true),
        ])
        .expect_err("duplicate alias");
        assert_eq!(err.code(), "invalid_configuration");
    }

    #[test]
    fn negative_weights_are_rejected() {
        let err = validate_components(&[component("MAC", Some(-1.0), true)])
            .expect_err("negative weight");
        assert_eq!(err.code(), "invalid_configuration");
    }

    #[test]
    fn threshold_follows_the_chain_then_default() {
        let mut school = record(EvaluationMode::Trimestral, &["MAC"]);
        school.passing_threshold = Some(9.5);
        let levels = ModelLevels {
            curriculum: Some(record(EvaluationMode::Trimestral, &["NPP"])),
            school: Some(school),
            ..ModelLevels::default()
        };
        let model = resolve_levels(&levels, 10.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.source, ModelSource::Curriculum);
        assert_eq!(model.passing_threshold, 9.5);

        let levels = ModelLevels {
            school: Some(record(EvaluationMode::Trimestral, &["MAC"])),
            ..ModelLevels::default()
        };
        let model = resolve_levels(&levels, 12.0)
            .expect("resolve")
            .expect("model");
        assert_eq!(model.passing_threshold, 12.0);
    }

    #[test]
    fn mode_parsing_accepts_local_spelling() {
        assert_eq!(
            EvaluationMode::parse(" simplificado "),
            Some(EvaluationMode::Simplified)
        );
        assert_eq!(
            EvaluationMode::parse("TRIMESTRAL"),
            Some(EvaluationMode::Trimestral)
        );
        assert_eq!(EvaluationMode::parse("quarterly"), None);
        assert!(!EvaluationMode::Simplified.composes_annual());
    }
}
