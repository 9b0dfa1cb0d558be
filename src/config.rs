use std::{
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_more::From;

use crate::{
    poller::PollerThreadConfig,
    source::{ConfigSource, FileSource, HttpSource},
    wal::{WalConfig, WalEventLogger},
    AssignmentEngine, Registry, Result,
};

/// Where experiment configuration is read from.
#[derive(Debug, Clone, PartialEq, Eq, From)]
pub enum ConfigSourceSpec {
    /// A local JSON file, re-read when it changes.
    File(PathBuf),
    /// An HTTP(S) endpoint serving the JSON document.
    Url(String),
}

impl FromStr for ConfigSourceSpec {
    type Err = Infallible;

    /// `http://` and `https://` values are URLs, anything else is a file path.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(if s.starts_with("http://") || s.starts_with("https://") {
            ConfigSourceSpec::Url(s.to_owned())
        } else {
            ConfigSourceSpec::File(s.into())
        })
    }
}

/// Configuration of the daemon.
///
/// ```
/// # use std::{path::PathBuf, time::Duration};
/// # use assignd::DaemonConfig;
/// let config = DaemonConfig::new(PathBuf::from("experiments.json"))
///     .with_poll_interval(Duration::from_secs(10));
/// assert_eq!(config.bind, DaemonConfig::DEFAULT_BIND);
/// ```
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the HTTP server listens on.
    ///
    /// Defaults to [`DaemonConfig::DEFAULT_BIND`].
    pub bind: SocketAddr,
    pub source: ConfigSourceSpec,
    /// Bearer token sent to [`ConfigSourceSpec::Url`] sources.
    pub source_token: Option<String>,
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub poll_jitter: Duration,
    /// Event write-ahead log. Events are discarded if unset.
    pub wal: Option<WalConfig>,
}

impl DaemonConfig {
    /// Default value for [`DaemonConfig::bind`].
    pub const DEFAULT_BIND: SocketAddr =
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));

    pub fn new(source: impl Into<ConfigSourceSpec>) -> DaemonConfig {
        DaemonConfig {
            bind: DaemonConfig::DEFAULT_BIND,
            source: source.into(),
            source_token: None,
            poll_interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            poll_jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
            wal: None,
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> DaemonConfig {
        self.bind = bind;
        self
    }

    pub fn with_source_token(mut self, token: impl Into<String>) -> DaemonConfig {
        self.source_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> DaemonConfig {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> DaemonConfig {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_wal(mut self, wal: WalConfig) -> DaemonConfig {
        self.wal = Some(wal);
        self
    }

    pub fn poller_config(&self) -> PollerThreadConfig {
        PollerThreadConfig::new()
            .with_interval(self.poll_interval)
            .with_jitter(self.poll_jitter)
    }

    /// Open the configured config source.
    ///
    /// Must not be called from within an async runtime.
    pub fn open_source(&self) -> Result<Box<dyn ConfigSource + Send>> {
        Ok(match &self.source {
            ConfigSourceSpec::File(path) => Box::new(FileSource::new(path)),
            ConfigSourceSpec::Url(url) => {
                Box::new(HttpSource::new(url, self.source_token.clone())?)
            }
        })
    }

    /// Create an engine reading from `registry`, logging events to the write-ahead log if one is
    /// configured.
    pub fn build_engine(&self, registry: Arc<Registry>) -> Result<AssignmentEngine> {
        let engine = AssignmentEngine::new(registry);
        Ok(match &self.wal {
            Some(wal) => engine.with_event_logger(WalEventLogger::open(wal.clone())?),
            None => engine,
        })
    }
}
