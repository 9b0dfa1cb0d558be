//! A deterministic experiment-assignment daemon.
//!
//! # Overview
//!
//! The daemon revolves around an [`AssignmentEngine`] that decides, for an experiment and a unit
//! (a user, device or request), whether the unit is included in the experiment and which treatment
//! it receives. For fixed inputs and a fixed experiment configuration version the decision is
//! always the same: units are bucketed by hashing the experiment's salt with the unit key into a
//! space of [`BUCKET_SPACE`] buckets, and each variant owns a contiguous range of buckets.
//!
//! Experiment configuration lives in a [`Registry`] which serves immutable snapshots and swaps
//! them atomically on [`Registry::publish`]. A [`PollerThread`] keeps the registry up to date from
//! a [`ConfigSource`] (a local file or an HTTP endpoint).
//!
//! An [`EventLogger`] receives an [`ExposureEvent`] for every included unit and a [`GoalEvent`]
//! for every goal recorded through [`AssignmentEngine::record_goal`]. The [`WalEventLogger`]
//! queues them for a writer thread that appends to rotating newline-delimited JSON files.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Most negative outcomes (unknown experiment,
//! failed targeting, unallocated traffic) are not errors but `EXCLUDED` results carrying a reason.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with target `assignd`. The
//! `assignd` binary installs `env_logger`, configured through `RUST_LOG`.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod allocator;
mod config;
mod engine;
mod error;
mod events;
pub mod experiment;
pub mod http;
mod poller;
mod registry;
pub mod sharder;
pub mod source;
pub mod targeting;
mod unit;
mod wal;

pub use config::{ConfigSourceSpec, DaemonConfig};
pub use engine::{
    AssignmentEngine, AssignmentRequest, AssignmentResult, Decision, Evaluation, ExclusionReason,
    GoalRequest,
};
pub use error::{ConfigError, Error, Result};
pub use events::{EventLogger, ExposureEvent, GoalEvent, LoggedEvent};
pub use experiment::{
    ExperimentConfig, ExperimentConfigWire, ExperimentStatus, UNKNOWN_CONFIG_VERSION,
};
pub use poller::{PollerThread, PollerThreadConfig};
pub use registry::{HealthReport, Registry, ServingStatus, Snapshot};
pub use sharder::BUCKET_SPACE;
pub use source::{ConfigSource, FileSource, HttpSource};
pub use targeting::Context;
pub use unit::{UnitIdentity, ANONYMOUS_UNIT_KEY};
pub use wal::{WalConfig, WalEventLogger};
