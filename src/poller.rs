//! A background poller thread that periodically reads configuration from a [`ConfigSource`] and
//! publishes it to a [`Registry`].
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{registry::Registry, source::ConfigSource, Error, Result};

/// How often a [`PollerThread`] reads its [`ConfigSource`].
///
/// A [`FileSource`](crate::FileSource) only stats the file on most polls, so short intervals are
/// cheap for local files. An [`HttpSource`](crate::HttpSource) sends a conditional request each
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerThreadConfig {
    /// Longest time between two polls, and so the longest a published document waits before it
    /// is served.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Up to this much is taken off every wait, picked at random per poll. Daemons started
    /// together by a deploy drift apart instead of hitting a shared config endpoint at once.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// A zero jitter polls at exactly `interval`, which tests rely on.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig::new()
    }
}

/// A configuration poller thread.
///
/// Polls a [`ConfigSource`] and publishes every changed document to a [`Registry`]. Rejected
/// documents leave the previously served snapshot in place.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first poll completes. Afterwards holds the outcome of the latest
    /// poll that changed anything: `Ok(())` once a configuration has been published, or the error
    /// that prevented it.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start<S>(source: S, registry: Arc<Registry>) -> std::io::Result<PollerThread>
    where
        S: ConfigSource + Send + 'static,
    {
        PollerThread::start_with_config(source, registry, PollerThreadConfig::default())
    }

    /// Starts the poller thread with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start_with_config<S>(
        mut source: S,
        registry: Arc<Registry>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread>
    where
        S: ConfigSource + Send + 'static,
    {
        // `sync_channel` makes `stop_sender` `Sync`. A buffer of 1 is enough: a second stop
        // command can be dropped as the thread is stopping anyway.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>, overwrite_error: bool| {
                let mut lock = result.0.lock().unwrap_or_else(PoisonError::into_inner);
                // After the first poll, errors only surface if nothing has been published yet.
                if overwrite_error || value.is_ok() || lock.is_none() {
                    *lock = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("assignd-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        log::debug!(target: "assignd", "polling config source");
                        match source.fetch() {
                            Ok(Some(document)) => {
                                update_result(registry.publish_json(&document).map(|_| ()), false)
                            }
                            Ok(None) => {
                                log::debug!(target: "assignd", "configuration unchanged");
                                if registry.snapshot().is_some() {
                                    update_result(Ok(()), false);
                                }
                            }
                            Err(err @ (Error::Unauthorized | Error::InvalidUrl(_))) => {
                                // Unrecoverable errors
                                log::warn!(target: "assignd", "stopping poller: {err}");
                                update_result(Err(err), true);
                                return;
                            }
                            Err(err) => {
                                log::warn!(target: "assignd", "failed to fetch configuration: {err}");
                                update_result(Err(err), false);
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) => {
                                log::debug!(target: "assignd", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "assignd", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    if outcome.is_err() {
                        update_result(Err(Error::PollerThreadPanicked), true);
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block until the first poll completes.
    ///
    /// Returns `Ok(())` if a configuration has been published, or the error that prevented the
    /// first publish. The poller keeps running after an error (unless it is unrecoverable), so the
    /// daemon recovers once the source is fixed.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidUrl`]
    /// - any fetch or publish error of the first poll
    ///
    /// # Example
    ///
    /// ```
    /// # fn test(poller_thread: assignd::PollerThread) {
    /// match poller_thread.wait_for_configuration() {
    ///     Ok(()) => println!("Configuration published."),
    ///     Err(err) => eprintln!("Cannot load configuration: {err}"),
    /// }
    /// # }
    /// ```
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Either the thread already exited or a stop command is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
