use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;

use assignd::{
    AssignmentEngine, ConfigSourceSpec, DaemonConfig, Error, PollerThread, PollerThreadConfig,
    Registry, WalConfig,
};

#[derive(Parser)]
#[command(name = "assignd", about = "Deterministic experiment-assignment daemon", version)]
struct Args {
    /// Experiment configuration: a JSON file path or an http(s) URL
    #[arg(long, env = "ASSIGND_CONFIG")]
    config: ConfigSourceSpec,

    /// Bearer token for URL configuration sources
    #[arg(long, env = "ASSIGND_CONFIG_TOKEN", hide_env_values = true)]
    config_token: Option<String>,

    /// Address to listen on
    #[arg(long, env = "ASSIGND_BIND", default_value_t = DaemonConfig::DEFAULT_BIND)]
    bind: SocketAddr,

    /// Seconds between configuration polls
    #[arg(long, env = "ASSIGND_POLL_INTERVAL_SECS",
          default_value_t = PollerThreadConfig::DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval_secs: u64,

    /// Maximum seconds subtracted at random from each poll interval
    #[arg(long, env = "ASSIGND_POLL_JITTER_SECS",
          default_value_t = PollerThreadConfig::DEFAULT_POLL_JITTER.as_secs())]
    poll_jitter_secs: u64,

    /// Directory for the event write-ahead log. Events are discarded if unset
    #[arg(long, env = "ASSIGND_WAL_DIR")]
    wal_dir: Option<PathBuf>,

    /// Size at which a new write-ahead log segment is started
    #[arg(long, env = "ASSIGND_WAL_MAX_SEGMENT_BYTES",
          default_value_t = WalConfig::DEFAULT_MAX_SEGMENT_BYTES)]
    wal_max_segment_bytes: u64,

    /// Sync every event to disk
    #[arg(long, env = "ASSIGND_WAL_FSYNC")]
    wal_fsync: bool,

    /// Events buffered for the write-ahead log writer before new ones are dropped
    #[arg(long, env = "ASSIGND_WAL_QUEUE_CAPACITY",
          default_value_t = WalConfig::DEFAULT_QUEUE_CAPACITY)]
    wal_queue_capacity: usize,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        let mut config = DaemonConfig::new(self.config)
            .with_bind(self.bind)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_poll_jitter(Duration::from_secs(self.poll_jitter_secs));
        if let Some(token) = self.config_token {
            config = config.with_source_token(token);
        }
        if let Some(dir) = self.wal_dir {
            config = config.with_wal(
                WalConfig::new(dir)
                    .with_max_segment_bytes(self.wal_max_segment_bytes)
                    .with_fsync(self.wal_fsync)
                    .with_queue_capacity(self.wal_queue_capacity),
            );
        }
        config
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("assignd=info")).init();

    match run(args.into_config()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!(target: "assignd", "{err}");
            ExitCode::FAILURE
        }
    }
}

/// Blocking sources must be created and polled outside the async runtime, so the poller is
/// started before the runtime is built.
fn run(config: DaemonConfig) -> assignd::Result<()> {
    let registry = Arc::new(Registry::new());
    let poller = PollerThread::start_with_config(
        config.open_source()?,
        registry.clone(),
        config.poller_config(),
    )?;

    match poller.wait_for_configuration() {
        Ok(()) => {}
        Err(err @ (Error::Unauthorized | Error::InvalidUrl(_) | Error::PollerThreadPanicked)) => {
            return Err(err);
        }
        Err(err) => {
            log::warn!(target: "assignd", "no experiment configuration loaded yet, reporting NOT_SERVING: {err}");
        }
    }

    let engine = Arc::new(config.build_engine(registry)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config.bind, engine.clone()))?;
    drop(runtime);

    // Last reference: dropping it drains the event log.
    drop(engine);
    poller.shutdown()
}

async fn serve(bind: SocketAddr, engine: Arc<AssignmentEngine>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    log::info!(target: "assignd", local_addr:display; "listening");
    axum::serve(listener, assignd::http::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!(target: "assignd", "failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    log::info!(target: "assignd", "shutting down");
}
