//! Targeting rules: context-attribute constraints that gate eligibility before bucketing.
use std::collections::{HashMap, HashSet};

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Request context: attribute name to string value (e.g., `country`, `app_ver`).
pub type Context = HashMap<String, String>;

/// Targeting rule as it appears in the configuration document.
///
/// ```json
/// {"attribute": "country", "kind": "one_of", "values": ["US", "CA"]}
/// {"attribute": "app_ver", "kind": "version_range", "min": "4.2", "optional": true}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRuleWire {
    pub attribute: String,
    #[serde(flatten)]
    pub predicate: PredicateWire,
    /// When `true`, a context without the attribute passes the rule instead of failing it.
    #[serde(default)]
    pub optional: bool,
}

/// Closed set of predicate kinds.
///
/// Ranges are half-open: `min` is inclusive and `max` is exclusive. Either bound may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateWire {
    OneOf {
        values: Vec<String>,
    },
    NotOneOf {
        values: Vec<String>,
    },
    NumberRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    VersionRange {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    Matches {
        pattern: String,
    },
}

impl PredicateWire {
    /// Name of the predicate kind, as used in the configuration document.
    pub fn kind(&self) -> &'static str {
        match self {
            PredicateWire::OneOf { .. } => "one_of",
            PredicateWire::NotOneOf { .. } => "not_one_of",
            PredicateWire::NumberRange { .. } => "number_range",
            PredicateWire::VersionRange { .. } => "version_range",
            PredicateWire::Matches { .. } => "matches",
        }
    }
}

/// A validated targeting rule, ready for evaluation.
#[derive(Debug, Clone)]
pub struct TargetingRule {
    attribute: String,
    predicate: Predicate,
    optional: bool,
}

#[derive(Debug, Clone)]
enum Predicate {
    OneOf(HashSet<String>),
    NotOneOf(HashSet<String>),
    NumberRange {
        min: Option<f64>,
        max: Option<f64>,
    },
    VersionRange {
        min: Option<Version>,
        max: Option<Version>,
    },
    Matches(Regex),
}

impl TargetingRule {
    /// Validate a wire rule. Returns a human-readable message on failure.
    pub(crate) fn compile(wire: &TargetingRuleWire) -> Result<TargetingRule, String> {
        if wire.attribute.is_empty() {
            return Err("attribute name must not be empty".to_owned());
        }

        let predicate = match &wire.predicate {
            PredicateWire::OneOf { values } => Predicate::OneOf(values.iter().cloned().collect()),
            PredicateWire::NotOneOf { values } => {
                Predicate::NotOneOf(values.iter().cloned().collect())
            }
            PredicateWire::NumberRange { min, max } => {
                if min.is_some_and(f64::is_nan) || max.is_some_and(f64::is_nan) {
                    return Err("range bound must be a number".to_owned());
                }
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(format!("min {min} is greater than max {max}"));
                    }
                }
                Predicate::NumberRange {
                    min: *min,
                    max: *max,
                }
            }
            PredicateWire::VersionRange { min, max } => {
                let parse_bound = |bound: &Option<String>| -> Result<Option<Version>, String> {
                    bound
                        .as_deref()
                        .map(|s| parse_version(s).ok_or_else(|| format!("invalid version {s:?}")))
                        .transpose()
                };
                let min = parse_bound(min)?;
                let max = parse_bound(max)?;
                if let (Some(min), Some(max)) = (&min, &max) {
                    if min > max {
                        return Err(format!("min {min} is greater than max {max}"));
                    }
                }
                Predicate::VersionRange { min, max }
            }
            PredicateWire::Matches { pattern } => {
                Predicate::Matches(Regex::new(pattern).map_err(|err| err.to_string())?)
            }
        };

        Ok(TargetingRule {
            attribute: wire.attribute.clone(),
            predicate,
            optional: wire.optional,
        })
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Evaluate the rule against `context`.
    ///
    /// A missing attribute fails the rule unless it is optional. An attribute that cannot be
    /// interpreted by the predicate (e.g., unparseable number) fails the rule.
    pub fn eval(&self, context: &Context) -> bool {
        match context.get(&self.attribute) {
            Some(value) => self.predicate.eval(value),
            None => self.optional,
        }
    }
}

impl Predicate {
    fn eval(&self, value: &str) -> bool {
        self.try_eval(value).unwrap_or(false)
    }

    /// Try applying the predicate, returning `None` if the value cannot be interpreted.
    fn try_eval(&self, value: &str) -> Option<bool> {
        match self {
            Predicate::OneOf(values) => Some(values.contains(value)),
            Predicate::NotOneOf(values) => Some(!values.contains(value)),
            Predicate::NumberRange { min, max } => {
                let n: f64 = value.trim().parse().ok()?;
                if n.is_nan() {
                    return None;
                }
                Some(in_range(&n, min.as_ref(), max.as_ref()))
            }
            Predicate::VersionRange { min, max } => {
                let v = parse_version(value)?;
                Some(in_range(&v, min.as_ref(), max.as_ref()))
            }
            Predicate::Matches(regex) => Some(regex.is_match(value)),
        }
    }
}

fn in_range<T: PartialOrd>(value: &T, min: Option<&T>, max: Option<&T>) -> bool {
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value < max)
}

/// Parse a version string. Accepts full semver (`1.2.3`, `1.2.3-beta.1`), an optional leading `v`,
/// and shortened forms (`42` as `42.0.0`, `1.2` as `1.2.0`) that app builds commonly report.
fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }

    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
    let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}

/// Evaluate all `rules` against `context`. All rules must pass; an empty rule set always passes.
///
/// Evaluation stops at the first failing rule. Rules have no side effects, so the outcome does not
/// depend on their order.
pub fn evaluate(rules: &[TargetingRule], context: &Context) -> bool {
    rules.iter().all(|rule| {
        let passed = rule.eval(context);
        if !passed {
            log::trace!(target: "assignd", attribute = rule.attribute(); "targeting rule failed");
        }
        passed
    })
}
