use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the daemon.
///
/// Note that most "negative" assignment outcomes are not errors: an unknown experiment, a unit
/// without identifiers, or a context attribute that fails to parse all produce a normal
/// [`AssignmentResult`](crate::AssignmentResult) with an `EXCLUDED` decision. Only
/// [`Error::RegistryUninitialized`] is surfaced from [`AssignmentEngine::assign`](crate::AssignmentEngine::assign).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A published configuration violates an invariant and was rejected as a whole.
    #[error("malformed configuration: {0}")]
    MalformedConfig(#[from] ConfigError),

    /// Configuration document could not be decoded.
    #[error("error parsing configuration: {0}")]
    ConfigParse(String),

    /// A goal could not be recorded: empty name, non-finite value, or an experiment or treatment
    /// that is not currently served.
    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    /// No configuration snapshot has ever been published. The daemon cannot answer requests.
    #[error("experiment registry has not been initialized")]
    RegistryUninitialized,

    /// The remote configuration source refused our credentials.
    #[error("unauthorized, config source token is likely invalid")]
    Unauthorized,

    /// Invalid config source URL.
    #[error("invalid config source url")]
    InvalidUrl(#[source] url::ParseError),

    /// An I/O error.
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Network error while fetching remote configuration.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::ConfigParse(value.to_string())
    }
}

/// Reasons a configuration is rejected at publish time.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("experiment id must not be empty")]
    EmptyExperimentId,

    #[error("experiment {experiment:?}: salt must not be empty")]
    EmptySalt { experiment: String },

    #[error("experiment {experiment:?}: version 0 is reserved")]
    ReservedVersion { experiment: String },

    #[error("experiment {experiment:?}: at least one variant is required")]
    NoVariants { experiment: String },

    #[error("experiment {experiment:?}: variant name must not be empty")]
    EmptyVariantName { experiment: String },

    #[error("experiment {experiment:?}: duplicate variant {variant:?}")]
    DuplicateVariant { experiment: String, variant: String },

    #[error("experiment {experiment:?}: traffic allocations sum to {total} basis points, exceeding {bucket_space}")]
    TrafficExceedsBucketSpace {
        experiment: String,
        total: u64,
        bucket_space: u64,
    },

    #[error("experiment {experiment:?}: rule on {attribute:?}: {message}")]
    InvalidRule {
        experiment: String,
        attribute: String,
        message: String,
    },

    #[error("experiment {experiment:?}: more than one {kind} rule on attribute {attribute:?}")]
    OverlappingRules {
        experiment: String,
        attribute: String,
        kind: &'static str,
    },

    #[error("experiment {0:?} is declared more than once")]
    DuplicateExperiment(String),

    #[error("experiment {experiment:?}: version {published} is older than served version {current}")]
    VersionRegression {
        experiment: String,
        current: u64,
        published: u64,
    },

    #[error("experiment {experiment:?}: version {version} was republished with different content")]
    VersionReused { experiment: String, version: u64 },
}
