use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    allocator::Variant,
    events::{EventLogger, ExposureEvent, GoalEvent, NoopEventLogger},
    experiment::{ExperimentConfig, ExperimentStatus, UNKNOWN_CONFIG_VERSION},
    registry::Registry,
    sharder::{self, Md5Sharder, Sharder},
    targeting::{self, Context},
    unit::UnitIdentity,
    Error, Result,
};

/// A request to assign a unit to an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    pub experiment_id: String,
    #[serde(default)]
    pub unit: UnitIdentity,
    #[serde(default)]
    pub context: Context,
}

impl AssignmentRequest {
    pub fn new(experiment_id: impl Into<String>, unit: UnitIdentity) -> AssignmentRequest {
        AssignmentRequest {
            experiment_id: experiment_id.into(),
            unit,
            context: Context::new(),
        }
    }

    /// Add a context attribute.
    ///
    /// ```
    /// # use assignd::{AssignmentRequest, UnitIdentity};
    /// let request = AssignmentRequest::new("checkout_redesign", UnitIdentity::user("42"))
    ///     .with_context("country", "US");
    /// ```
    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }
}

/// A request to record that a unit reached a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalRequest {
    pub experiment_id: String,
    /// Treatment the unit was assigned, as returned by [`AssignmentEngine::assign`].
    pub treatment: String,
    pub goal: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: UnitIdentity,
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Included,
    Excluded,
}

/// Why a unit was excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    /// The experiment id is not in the served configuration.
    UnknownExperiment,
    /// The experiment is paused or still a draft.
    NotRunning,
    /// The context did not pass the experiment's targeting rules.
    Targeting,
    /// The unit's bucket falls outside every variant's traffic allocation.
    TrafficAllocation,
}

/// Outcome of an assignment.
///
/// Everything except `timestamp` is a pure function of the request and the experiment
/// configuration version used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResult {
    pub experiment: String,
    pub decision: Decision,
    /// Assigned variant name. `None` unless `decision` is [`Decision::Included`].
    pub treatment: Option<String>,
    /// Version of the experiment configuration used, or [`UNKNOWN_CONFIG_VERSION`] if the
    /// experiment is unknown.
    pub config_version: u64,
    pub reason: Option<ExclusionReason>,
    pub timestamp: DateTime<Utc>,
}

impl AssignmentResult {
    pub fn is_included(&self) -> bool {
        self.decision == Decision::Included
    }
}

/// Result of evaluating one experiment configuration for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation<'a> {
    Included(&'a Variant),
    Excluded(ExclusionReason),
}

impl ExperimentConfig {
    /// Evaluate the experiment for `unit_key` in `context`.
    ///
    /// Checks status, then targeting rules, then buckets the unit. Never fails: every input maps to
    /// an inclusion or an exclusion with a reason.
    pub fn eval(&self, unit_key: &str, context: &Context, sharder: &impl Sharder) -> Evaluation {
        if self.status() != ExperimentStatus::Running {
            return Evaluation::Excluded(ExclusionReason::NotRunning);
        }

        if !targeting::evaluate(self.targeting_rules(), context) {
            return Evaluation::Excluded(ExclusionReason::Targeting);
        }

        let bucket = sharder::bucket(sharder, self.salt(), unit_key);
        match self.allocation().allocate(bucket) {
            Some(variant) => Evaluation::Included(variant),
            None => Evaluation::Excluded(ExclusionReason::TrafficAllocation),
        }
    }
}

/// Assigns units to experiments using the configuration currently served by a [`Registry`].
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use assignd::{AssignmentEngine, AssignmentRequest, Registry, UnitIdentity};
/// let registry = Arc::new(Registry::new());
/// registry.publish_json(br#"[{
///     "id": "checkout_redesign", "version": 3, "salt": "cr-2024",
///     "variants": [
///         {"name": "control", "trafficAllocationBasisPoints": 5000},
///         {"name": "treatment", "trafficAllocationBasisPoints": 5000}
///     ]
/// }]"#).unwrap();
///
/// let engine = AssignmentEngine::new(registry);
/// let result = engine
///     .assign(&AssignmentRequest::new("checkout_redesign", UnitIdentity::user("42")))
///     .unwrap();
/// assert_eq!(result.treatment.as_deref(), Some("control"));
/// assert_eq!(result.config_version, 3);
/// ```
pub struct AssignmentEngine {
    registry: Arc<Registry>,
    sharder: Md5Sharder,
    event_logger: Box<dyn EventLogger + Send + Sync>,
}

impl AssignmentEngine {
    /// Create an engine reading from `registry` that does not log events.
    pub fn new(registry: Arc<Registry>) -> AssignmentEngine {
        AssignmentEngine {
            registry,
            sharder: Md5Sharder,
            event_logger: Box::new(NoopEventLogger),
        }
    }

    /// Set the logger that receives an [`ExposureEvent`] for every included unit and a
    /// [`GoalEvent`] for every recorded goal.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use assignd::{AssignmentEngine, ExposureEvent, Registry};
    /// let engine = AssignmentEngine::new(Arc::new(Registry::new()))
    ///     .with_event_logger(|event: ExposureEvent| println!("{:?}", event));
    /// ```
    pub fn with_event_logger(
        mut self,
        event_logger: impl EventLogger + Send + Sync + 'static,
    ) -> AssignmentEngine {
        self.event_logger = Box::new(event_logger);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Assign the requesting unit to the requested experiment.
    ///
    /// Unknown experiments, non-running experiments, failed targeting and unallocated buckets all
    /// produce an [`Decision::Excluded`] result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryUninitialized`] if no configuration has ever been published. This
    /// is kept distinct from an exclusion so that a broken daemon is not mistaken for an experiment
    /// that said no.
    pub fn assign(&self, request: &AssignmentRequest) -> Result<AssignmentResult> {
        let unit_key = request.unit.unit_key();
        let experiment_id = request.experiment_id.as_str();

        let Some(snapshot) = self.registry.snapshot() else {
            log::warn!(target: "assignd",
                       experiment_id,
                       unit_key;
                       "assignment requested before experiment configuration has been published");
            return Err(Error::RegistryUninitialized);
        };

        let (treatment, config_version, reason) = match snapshot.get(experiment_id) {
            None => (
                None,
                UNKNOWN_CONFIG_VERSION,
                Some(ExclusionReason::UnknownExperiment),
            ),
            Some(config) => match config.eval(&unit_key, &request.context, &self.sharder) {
                Evaluation::Included(variant) => {
                    (Some(variant.name.clone()), config.version(), None)
                }
                Evaluation::Excluded(reason) => (None, config.version(), Some(reason)),
            },
        };

        let result = AssignmentResult {
            experiment: request.experiment_id.clone(),
            decision: if treatment.is_some() {
                Decision::Included
            } else {
                Decision::Excluded
            },
            treatment,
            config_version,
            reason,
            timestamp: Utc::now(),
        };

        log::trace!(target: "assignd",
                    experiment_id,
                    unit_key,
                    result:serde = result;
                    "evaluated an experiment");

        if let Some(treatment) = &result.treatment {
            self.event_logger.log_exposure(ExposureEvent {
                experiment: result.experiment.clone(),
                treatment: treatment.clone(),
                config_version: result.config_version,
                unit: unit_key,
                context: request.context.clone(),
                timestamp: result.timestamp,
            });
        }

        Ok(result)
    }

    /// Record that the requesting unit reached a goal in the given treatment of an experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::RegistryUninitialized`] if no configuration has ever been published.
    /// - [`Error::InvalidGoal`] if the goal name is empty, the value is not finite, or the
    ///   experiment or treatment is not currently served.
    pub fn record_goal(&self, request: &GoalRequest) -> Result<GoalEvent> {
        if request.goal.is_empty() {
            return Err(Error::InvalidGoal("goal name must not be empty".to_owned()));
        }
        if request.value.is_some_and(|value| !value.is_finite()) {
            return Err(Error::InvalidGoal("goal value must be finite".to_owned()));
        }

        let snapshot = self
            .registry
            .snapshot()
            .ok_or(Error::RegistryUninitialized)?;
        let config = snapshot.get(&request.experiment_id).ok_or_else(|| {
            Error::InvalidGoal(format!("unknown experiment {:?}", request.experiment_id))
        })?;
        if !config
            .allocation()
            .variants()
            .iter()
            .any(|variant| variant.name == request.treatment)
        {
            return Err(Error::InvalidGoal(format!(
                "experiment {:?} has no treatment {:?}",
                request.experiment_id, request.treatment
            )));
        }

        let event = GoalEvent {
            experiment: request.experiment_id.clone(),
            treatment: request.treatment.clone(),
            goal: request.goal.clone(),
            value: request.value,
            unit: request.unit.unit_key(),
            context: request.context.clone(),
            timestamp: Utc::now(),
        };
        log::trace!(target: "assignd", goal:serde = event; "recorded a goal");
        self.event_logger.log_goal(event.clone());
        Ok(event)
    }
}
