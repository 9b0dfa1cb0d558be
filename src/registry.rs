//! A thread-safe in-memory registry of the currently served experiment configurations.
//!
//! [`Registry`] provides concurrent access for readers (assignment requests) and a writer (the
//! config reload path). Configurations are held in an immutable [`Snapshot`] that is replaced
//! completely on every successful publish. A reader that grabbed a snapshot keeps observing it,
//! unaffected by later publishes, so every request is answered from a single generation.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    experiment::{parse_config_document, ExperimentConfig, ExperimentConfigWire},
    Error, Result,
};

/// An immutable set of experiment configurations.
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    published_at: DateTime<Utc>,
    experiments: HashMap<String, Arc<ExperimentConfig>>,
}

impl Snapshot {
    /// Get the configuration of `experiment_id`, if present.
    pub fn get(&self, experiment_id: &str) -> Option<&Arc<ExperimentConfig>> {
        self.experiments.get(experiment_id)
    }

    /// Sequence number of this snapshot. The first published snapshot has generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn experiment_ids(&self) -> impl Iterator<Item = &str> {
        self.experiments.keys().map(String::as_str)
    }
}

/// `Registry` holds the currently served [`Snapshot`].
///
/// Publishing is serialized and copy-on-write: the new snapshot is fully validated and built before
/// the current one is swapped out, so readers never observe a partially applied configuration. A
/// rejected publish leaves the current snapshot in place.
#[derive(Default)]
pub struct Registry {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Held for the whole duration of a publish. Also remembers the last publish failure.
    publisher: Mutex<PublishState>,
}

#[derive(Default)]
struct PublishState {
    last_error: Option<String>,
}

impl Registry {
    /// Create a new empty registry. It reports [`ServingStatus::NotServing`] until the first
    /// successful publish.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Get the currently served snapshot. Returns `None` if nothing has been published yet.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        // A poisoned lock means a writer panicked while holding it. The slot only ever holds a
        // complete value, so it is still safe to read.
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get the currently served configuration of `experiment_id`.
    pub fn get(&self, experiment_id: &str) -> Option<Arc<ExperimentConfig>> {
        self.snapshot()?.get(experiment_id).cloned()
    }

    /// Validate `experiments` and install them as the new snapshot, replacing the current one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedConfig`] if any experiment is invalid, if an experiment id is
    /// repeated, or if an experiment's version goes backwards or is reused with different content.
    /// Nothing is changed in that case.
    pub fn publish(&self, experiments: Vec<ExperimentConfigWire>) -> Result<Arc<Snapshot>> {
        let mut state = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let result = self.build_snapshot(experiments).map(Arc::new);
        match &result {
            Ok(snapshot) => {
                *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(snapshot.clone());
                state.last_error = None;
                log::info!(target: "assignd",
                           generation = snapshot.generation(),
                           experiments = snapshot.len();
                           "published experiment configuration");
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
                log::warn!(target: "assignd", "rejected experiment configuration: {err}");
            }
        }
        result
    }

    /// Parse a JSON configuration document and [publish](Registry::publish) it.
    pub fn publish_json(&self, json: &[u8]) -> Result<Arc<Snapshot>> {
        match parse_config_document(json) {
            Ok(experiments) => self.publish(experiments),
            Err(err) => {
                log::warn!(target: "assignd", "failed to parse experiment configuration: {err}");
                self.publisher
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn build_snapshot(&self, experiments: Vec<ExperimentConfigWire>) -> Result<Snapshot> {
        let current = self.snapshot();

        let mut compiled = HashMap::with_capacity(experiments.len());
        for wire in experiments {
            if compiled.contains_key(&wire.id) {
                return Err(ConfigError::DuplicateExperiment(wire.id).into());
            }

            if let Some(served) = current.as_ref().and_then(|s| s.get(&wire.id)) {
                if wire.version < served.version() {
                    return Err(ConfigError::VersionRegression {
                        experiment: wire.id,
                        current: served.version(),
                        published: wire.version,
                    }
                    .into());
                }
                if wire.version == served.version() && &wire != served.wire() {
                    return Err(ConfigError::VersionReused {
                        experiment: wire.id,
                        version: wire.version,
                    }
                    .into());
                }
                if wire.version == served.version() {
                    // Unchanged. Keep sharing the already compiled value.
                    compiled.insert(wire.id, served.clone());
                    continue;
                }
            }

            let config = ExperimentConfig::compile(wire)?;
            compiled.insert(config.id().to_owned(), Arc::new(config));
        }

        Ok(Snapshot {
            generation: current.map_or(1, |s| s.generation + 1),
            published_at: Utc::now(),
            experiments: compiled,
        })
    }

    /// Report whether the registry can serve traffic.
    pub fn health(&self) -> HealthReport {
        let last_error = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone();

        match self.snapshot() {
            Some(snapshot) => HealthReport {
                status: ServingStatus::Serving,
                generation: Some(snapshot.generation()),
                published_at: Some(snapshot.published_at()),
                experiments: snapshot.len(),
                last_error,
            },
            None => HealthReport {
                status: ServingStatus::NotServing,
                generation: None,
                published_at: None,
                experiments: 0,
                last_error,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// At least one valid snapshot has been published.
    Serving,
    /// Nothing has been published yet, or every publish so far has failed.
    NotServing,
}

/// Registry status, as reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: ServingStatus,
    pub generation: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub experiments: usize,
    /// Error of the most recent publish, if it failed. A failed reload does not stop serving the
    /// previous snapshot.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        allocator::VariantWire,
        error::ConfigError,
        experiment::{ExperimentConfigWire, ExperimentStatus},
        Error,
    };

    use super::{Registry, ServingStatus};

    fn experiment(id: &str, version: u64, split: (u32, u32)) -> ExperimentConfigWire {
        ExperimentConfigWire {
            id: id.into(),
            version,
            salt: format!("{id}-salt"),
            status: ExperimentStatus::Running,
            variants: vec![
                VariantWire {
                    name: "control".into(),
                    traffic_allocation_basis_points: split.0,
                },
                VariantWire {
                    name: "treatment".into(),
                    traffic_allocation_basis_points: split.1,
                },
            ],
            targeting_rules: vec![],
        }
    }

    #[test]
    fn empty_registry_is_not_serving() {
        let registry = Registry::new();
        assert!(registry.snapshot().is_none());
        assert!(registry.get("anything").is_none());
        assert_eq!(registry.health().status, ServingStatus::NotServing);
    }

    #[test]
    fn publish_makes_experiments_visible() {
        let registry = Registry::new();
        let snapshot = registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("b", 2, (100, 100))])
            .unwrap();

        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.get("a").unwrap().version(), 1);
        assert_eq!(registry.get("b").unwrap().version(), 2);
        assert!(registry.get("c").is_none());

        let health = registry.health();
        assert_eq!(health.status, ServingStatus::Serving);
        assert_eq!(health.generation, Some(1));
        assert_eq!(health.experiments, 2);
        assert_eq!(health.last_error, None);
    }

    #[test]
    fn malformed_publish_keeps_previous_snapshot() {
        let registry = Registry::new();
        registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("b", 1, (5000, 5000))])
            .unwrap();

        let err = registry
            .publish(vec![experiment("a", 2, (5000, 5000)), experiment("b", 2, (6000, 6000))])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedConfig(ConfigError::TrafficExceedsBucketSpace { total: 12_000, .. })
        ));

        // Neither experiment moved to version 2, including the valid one.
        assert_eq!(registry.get("a").unwrap().version(), 1);
        assert_eq!(registry.get("b").unwrap().version(), 1);

        let health = registry.health();
        assert_eq!(health.status, ServingStatus::Serving);
        assert_eq!(health.generation, Some(1));
        assert!(health.last_error.unwrap().contains("12000"));
    }

    #[test]
    fn failed_initial_publish_stays_not_serving() {
        let registry = Registry::new();
        assert!(registry.publish_json(b"{ not json").is_err());

        let health = registry.health();
        assert_eq!(health.status, ServingStatus::NotServing);
        assert!(health.last_error.is_some());
    }

    #[test]
    fn successful_publish_clears_last_error() {
        let registry = Registry::new();
        assert!(registry.publish(vec![experiment("a", 1, (9000, 9000))]).is_err());
        registry.publish(vec![experiment("a", 1, (5000, 5000))]).unwrap();
        assert_eq!(registry.health().last_error, None);
    }

    #[test]
    fn rejects_duplicate_experiment_ids() {
        let registry = Registry::new();
        let err = registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("a", 2, (5000, 5000))])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedConfig(ConfigError::DuplicateExperiment(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_version_regression() {
        let registry = Registry::new();
        registry.publish(vec![experiment("a", 5, (5000, 5000))]).unwrap();
        let err = registry
            .publish(vec![experiment("a", 4, (5000, 5000))])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedConfig(ConfigError::VersionRegression {
                current: 5,
                published: 4,
                ..
            })
        ));
    }

    #[test]
    fn rejects_mutation_under_same_version() {
        let registry = Registry::new();
        registry.publish(vec![experiment("a", 1, (5000, 5000))]).unwrap();
        let err = registry
            .publish(vec![experiment("a", 1, (2000, 8000))])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedConfig(ConfigError::VersionReused { version: 1, .. })
        ));
    }

    #[test]
    fn identical_republish_shares_compiled_config() {
        let registry = Registry::new();
        registry.publish(vec![experiment("a", 1, (5000, 5000))]).unwrap();
        let before = registry.get("a").unwrap();

        let snapshot = registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("b", 1, (5000, 5000))])
            .unwrap();
        assert_eq!(snapshot.generation(), 2);
        assert!(Arc::ptr_eq(&before, &registry.get("a").unwrap()));
    }

    #[test]
    fn old_snapshot_is_unaffected_by_publish() {
        let registry = Registry::new();
        registry.publish(vec![experiment("a", 1, (5000, 5000))]).unwrap();
        let old = registry.snapshot().unwrap();

        registry.publish(vec![experiment("a", 2, (1000, 1000))]).unwrap();

        assert_eq!(old.get("a").unwrap().version(), 1);
        assert_eq!(registry.get("a").unwrap().version(), 2);
    }

    #[test]
    fn removed_experiments_disappear() {
        let registry = Registry::new();
        registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("b", 1, (5000, 5000))])
            .unwrap();
        registry.publish(vec![experiment("a", 1, (5000, 5000))]).unwrap();
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn can_publish_from_another_thread() {
        let registry = Arc::new(Registry::new());

        {
            let registry = registry.clone();
            let _ = std::thread::spawn(move || {
                registry
                    .publish(vec![experiment("a", 1, (5000, 5000))])
                    .unwrap();
            })
            .join();
        }

        assert!(registry.snapshot().is_some());
    }

    #[test]
    fn readers_never_observe_mixed_generations() {
        let registry = Arc::new(Registry::new());
        registry
            .publish(vec![experiment("a", 1, (5000, 5000)), experiment("b", 1, (5000, 5000))])
            .unwrap();

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for version in 2..200 {
                    registry
                        .publish(vec![
                            experiment("a", version, (5000, 5000)),
                            experiment("b", version, (5000, 5000)),
                        ])
                        .unwrap();
                }
            })
        };

        for _ in 0..10_000 {
            let snapshot = registry.snapshot().unwrap();
            assert_eq!(
                snapshot.get("a").unwrap().version(),
                snapshot.get("b").unwrap().version()
            );
        }

        writer.join().unwrap();
        assert_eq!(registry.get("a").unwrap().version(), 199);
    }
}
