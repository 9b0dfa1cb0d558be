//! Experiment configuration: the wire format and its validated, ready-to-evaluate form.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    allocator::{Allocation, VariantWire},
    error::ConfigError,
    sharder::BUCKET_SPACE,
    targeting::{TargetingRule, TargetingRuleWire},
    Error, Result,
};

/// Version reported for experiments that are not present in the registry. Real versions start at 1.
pub const UNKNOWN_CONFIG_VERSION: u64 = 0;

/// Experiment configuration as it appears in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfigWire {
    pub id: String,
    /// Must increase whenever any other field changes.
    pub version: u64,
    /// Mixed into hashing. Change it only to reshuffle every unit.
    pub salt: String,
    #[serde(default)]
    pub status: ExperimentStatus,
    pub variants: Vec<VariantWire>,
    #[serde(default)]
    pub targeting_rules: Vec<TargetingRuleWire>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    #[default]
    Running,
    Paused,
    Draft,
}

/// Parse a configuration document: either a bare array of experiments, or an object with an
/// `experiments` array.
pub fn parse_config_document(json: &[u8]) -> Result<Vec<ExperimentConfigWire>> {
    let document: serde_json::Value = serde_json::from_slice(json)?;
    let experiments = match document {
        array @ serde_json::Value::Array(_) => array,
        serde_json::Value::Object(mut object) => object
            .remove("experiments")
            .ok_or_else(|| Error::ConfigParse("missing \"experiments\" field".to_owned()))?,
        _ => {
            return Err(Error::ConfigParse(
                "expected an array of experiments or an object".to_owned(),
            ))
        }
    };
    Ok(serde_json::from_value(experiments)?)
}

/// A validated experiment configuration. Immutable once built.
#[derive(Debug)]
pub struct ExperimentConfig {
    wire: ExperimentConfigWire,
    allocation: Allocation,
    targeting_rules: Box<[TargetingRule]>,
}

impl ExperimentConfig {
    /// Validate `wire` and prepare it for evaluation.
    pub fn compile(wire: ExperimentConfigWire) -> std::result::Result<Self, ConfigError> {
        if wire.id.is_empty() {
            return Err(ConfigError::EmptyExperimentId);
        }
        let experiment = || wire.id.clone();

        if wire.salt.is_empty() {
            return Err(ConfigError::EmptySalt {
                experiment: experiment(),
            });
        }
        if wire.version == UNKNOWN_CONFIG_VERSION {
            return Err(ConfigError::ReservedVersion {
                experiment: experiment(),
            });
        }
        if wire.variants.is_empty() {
            return Err(ConfigError::NoVariants {
                experiment: experiment(),
            });
        }

        let mut names = HashSet::new();
        for variant in &wire.variants {
            if variant.name.is_empty() {
                return Err(ConfigError::EmptyVariantName {
                    experiment: experiment(),
                });
            }
            if !names.insert(variant.name.as_str()) {
                return Err(ConfigError::DuplicateVariant {
                    experiment: experiment(),
                    variant: variant.name.clone(),
                });
            }
        }

        let allocation = Allocation::layout(&wire.variants).map_err(|total| {
            ConfigError::TrafficExceedsBucketSpace {
                experiment: experiment(),
                total,
                bucket_space: BUCKET_SPACE,
            }
        })?;

        // Rules are combined with AND, so two rules of the same kind on one attribute are either
        // redundant or contradictory.
        let mut seen = HashSet::new();
        for rule in &wire.targeting_rules {
            if !seen.insert((rule.attribute.as_str(), rule.predicate.kind())) {
                return Err(ConfigError::OverlappingRules {
                    experiment: experiment(),
                    attribute: rule.attribute.clone(),
                    kind: rule.predicate.kind(),
                });
            }
        }

        let targeting_rules = wire
            .targeting_rules
            .iter()
            .map(|rule| {
                TargetingRule::compile(rule).map_err(|message| ConfigError::InvalidRule {
                    experiment: experiment(),
                    attribute: rule.attribute.clone(),
                    message,
                })
            })
            .collect::<std::result::Result<_, _>>()?;

        Ok(ExperimentConfig {
            wire,
            allocation,
            targeting_rules,
        })
    }

    pub fn id(&self) -> &str {
        &self.wire.id
    }

    pub fn version(&self) -> u64 {
        self.wire.version
    }

    pub fn salt(&self) -> &str {
        &self.wire.salt
    }

    pub fn status(&self) -> ExperimentStatus {
        self.wire.status
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn targeting_rules(&self) -> &[TargetingRule] {
        &self.targeting_rules
    }

    /// The configuration this experiment was compiled from.
    pub fn wire(&self) -> &ExperimentConfigWire {
        &self.wire
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        allocator::VariantWire,
        error::ConfigError,
        targeting::{PredicateWire, TargetingRuleWire},
        Error,
    };

    use super::{parse_config_document, ExperimentConfig, ExperimentConfigWire, ExperimentStatus};

    fn wire() -> ExperimentConfigWire {
        ExperimentConfigWire {
            id: "exp".into(),
            version: 1,
            salt: "salt".into(),
            status: ExperimentStatus::Running,
            variants: vec![
                VariantWire {
                    name: "control".into(),
                    traffic_allocation_basis_points: 5000,
                },
                VariantWire {
                    name: "treatment".into(),
                    traffic_allocation_basis_points: 5000,
                },
            ],
            targeting_rules: vec![],
        }
    }

    fn country_rule() -> TargetingRuleWire {
        TargetingRuleWire {
            attribute: "country".into(),
            predicate: PredicateWire::OneOf {
                values: vec!["US".into()],
            },
            optional: false,
        }
    }

    #[test]
    fn parse_experiments_fixture() {
        let json = fs::read("tests/data/experiments.json")
            .expect("Failed to open tests/data/experiments.json");
        let experiments = parse_config_document(&json).unwrap();
        assert_eq!(experiments.len(), 3);
        for experiment in experiments {
            ExperimentConfig::compile(experiment).unwrap();
        }
    }

    #[test]
    fn parse_both_document_shapes() {
        let array = parse_config_document(
            br#"[{"id": "a", "version": 1, "salt": "s", "variants": []}]"#,
        )
        .unwrap();
        let object = parse_config_document(
            br#"{"experiments": [{"id": "a", "version": 1, "salt": "s", "variants": []}]}"#,
        )
        .unwrap();
        assert_eq!(array, object);
        assert_eq!(array[0].status, ExperimentStatus::Running);
        assert!(array[0].targeting_rules.is_empty());
    }

    #[test]
    fn reject_unparseable_documents() {
        assert!(matches!(
            parse_config_document(b"not json"),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            parse_config_document(br#"{"flags": []}"#),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            parse_config_document(br#"[{"id": "a"}]"#),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn compiles_valid_config() {
        let config = ExperimentConfig::compile(wire()).unwrap();
        assert_eq!(config.id(), "exp");
        assert_eq!(config.version(), 1);
        assert_eq!(config.allocation().allocated(), 10_000);
    }

    #[test]
    fn rejects_traffic_over_bucket_space() {
        let mut w = wire();
        w.variants[0].traffic_allocation_basis_points = 7000;
        w.variants[1].traffic_allocation_basis_points = 5000;
        assert_eq!(
            ExperimentConfig::compile(w).unwrap_err(),
            ConfigError::TrafficExceedsBucketSpace {
                experiment: "exp".into(),
                total: 12_000,
                bucket_space: 10_000,
            }
        );
    }

    #[test]
    fn rejects_structural_problems() {
        let mut w = wire();
        w.id = "".into();
        assert_eq!(
            ExperimentConfig::compile(w).unwrap_err(),
            ConfigError::EmptyExperimentId
        );

        let mut w = wire();
        w.salt = "".into();
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::EmptySalt { .. })
        ));

        let mut w = wire();
        w.version = 0;
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::ReservedVersion { .. })
        ));

        let mut w = wire();
        w.variants.clear();
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::NoVariants { .. })
        ));

        let mut w = wire();
        w.variants[1].name = "control".into();
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::DuplicateVariant { .. })
        ));

        let mut w = wire();
        w.variants[1].name = "".into();
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::EmptyVariantName { .. })
        ));
    }

    #[test]
    fn rejects_overlapping_rules() {
        let mut w = wire();
        w.targeting_rules = vec![country_rule(), country_rule()];
        assert_eq!(
            ExperimentConfig::compile(w).unwrap_err(),
            ConfigError::OverlappingRules {
                experiment: "exp".into(),
                attribute: "country".into(),
                kind: "one_of",
            }
        );
    }

    #[test]
    fn allows_different_rule_kinds_on_one_attribute() {
        let mut w = wire();
        w.targeting_rules = vec![
            country_rule(),
            TargetingRuleWire {
                attribute: "country".into(),
                predicate: PredicateWire::Matches {
                    pattern: "^[A-Z]{2}$".into(),
                },
                optional: false,
            },
        ];
        assert_eq!(ExperimentConfig::compile(w).unwrap().targeting_rules().len(), 2);
    }

    #[test]
    fn rejects_invalid_rule() {
        let mut w = wire();
        w.targeting_rules = vec![TargetingRuleWire {
            attribute: "app_ver".into(),
            predicate: PredicateWire::VersionRange {
                min: Some("banana".into()),
                max: None,
            },
            optional: false,
        }];
        assert!(matches!(
            ExperimentConfig::compile(w),
            Err(ConfigError::InvalidRule { attribute, .. }) if attribute == "app_ver"
        ));
    }
}
