use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::targeting::Context;

/// Records that a unit was included in an experiment and shown a treatment. Exposures need to be
/// saved to analytics storage so results can be attributed to the treatment each unit saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEvent {
    pub experiment: String,
    pub treatment: String,
    pub config_version: u64,
    /// Resolved unit key (e.g., `u:42`).
    pub unit: String,
    pub context: Context,
    pub timestamp: DateTime<Utc>,
}

/// Records that a unit in an experiment's treatment reached a goal (a conversion, a purchase...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    pub experiment: String,
    pub treatment: String,
    pub goal: String,
    /// Optional numeric value attached to the goal, such as an order total.
    pub value: Option<f64>,
    pub unit: String,
    pub context: Context,
    pub timestamp: DateTime<Utc>,
}

/// Any event written to an event log. Serialized with a `type` field telling the kinds apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoggedEvent {
    Exposure(ExposureEvent),
    Goal(GoalEvent),
}

/// Receives events produced by the [`AssignmentEngine`](crate::AssignmentEngine).
///
/// The engine calls the logger on the request path, so implementations must not block: hand the
/// event off and return. Failures should be reported through the `log` crate.
pub trait EventLogger {
    fn log_exposure(&self, event: ExposureEvent);

    /// Goals are dropped unless the logger records them.
    fn log_goal(&self, event: GoalEvent) {
        let _ = event;
    }
}

pub(crate) struct NoopEventLogger;
impl EventLogger for NoopEventLogger {
    fn log_exposure(&self, _event: ExposureEvent) {}
}

impl<T: Fn(ExposureEvent)> EventLogger for T {
    fn log_exposure(&self, event: ExposureEvent) {
        self(event);
    }
}
