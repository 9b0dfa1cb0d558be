//! A durable event logger that appends newline-delimited JSON to size-rotated segment files.
//!
//! Segments are named `events-YYYYMMDD-HHMMSS-<seq>.wal` and live in a single directory. A new
//! segment is opened when appending the next event would exceed the configured segment size.
//!
//! Logging only enqueues. A dedicated writer thread owns the segment file, so a slow disk never
//! holds up an assignment. When the queue is full, new events are dropped and counted.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
};

use chrono::Utc;

use crate::{
    events::{EventLogger, ExposureEvent, GoalEvent, LoggedEvent},
    Result,
};

const SEGMENT_PREFIX: &str = "events-";
const SEGMENT_SUFFIX: &str = ".wal";

/// Configuration for [`WalEventLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// Directory segments are written to. Created if missing.
    pub dir: PathBuf,
    /// Size after which a new segment is started.
    ///
    /// Defaults to [`WalConfig::DEFAULT_MAX_SEGMENT_BYTES`].
    pub max_segment_bytes: u64,
    /// Sync every event to disk after writing it. Only slows down the writer thread.
    pub fsync: bool,
    /// Events waiting for the writer thread. Events logged while the queue is full are dropped.
    ///
    /// Defaults to [`WalConfig::DEFAULT_QUEUE_CAPACITY`].
    pub queue_capacity: usize,
}

impl WalConfig {
    /// Default value for [`WalConfig::max_segment_bytes`].
    pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 32 * 1024 * 1024;
    /// Default value for [`WalConfig::queue_capacity`].
    pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

    pub fn new(dir: impl Into<PathBuf>) -> WalConfig {
        WalConfig {
            dir: dir.into(),
            max_segment_bytes: WalConfig::DEFAULT_MAX_SEGMENT_BYTES,
            fsync: false,
            queue_capacity: WalConfig::DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_max_segment_bytes(mut self, max_segment_bytes: u64) -> WalConfig {
        self.max_segment_bytes = max_segment_bytes;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> WalConfig {
        self.fsync = fsync;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> WalConfig {
        self.queue_capacity = queue_capacity;
        self
    }
}

enum Command {
    Append(LoggedEvent),
    /// Sync the current segment, then acknowledge.
    Flush(SyncSender<()>),
}

/// Write-ahead log of exposure and goal events.
///
/// Dropping the logger drains the queue, syncs the current segment and joins the writer thread.
pub struct WalEventLogger {
    sender: Option<SyncSender<Command>>,
    writer: Option<JoinHandle<()>>,
    current_segment: Arc<Mutex<PathBuf>>,
    dropped: AtomicU64,
}

struct Segment {
    file: File,
    path: PathBuf,
    written: u64,
    seq: u64,
}

impl Segment {
    fn open(dir: &Path, seq: u64) -> io::Result<Segment> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{SEGMENT_PREFIX}{stamp}-{seq}{SEGMENT_SUFFIX}"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        log::info!(target: "assignd", segment:display = path.display(); "opened event log segment");
        Ok(Segment {
            file,
            path,
            written,
            seq,
        })
    }
}

struct Writer {
    config: WalConfig,
    segment: Segment,
    current_segment: Arc<Mutex<PathBuf>>,
}

impl Writer {
    fn run(mut self, receiver: Receiver<Command>) {
        // Ends once every sender is gone, after the queue has been drained.
        for command in receiver {
            match command {
                Command::Append(event) => {
                    if let Err(err) = self.append(&event) {
                        log::warn!(target: "assignd", "failed to write event: {err}");
                    }
                }
                Command::Flush(ack) => {
                    if let Err(err) = self.segment.file.sync_all() {
                        log::warn!(target: "assignd", "failed to sync event log: {err}");
                    }
                    let _ = ack.send(());
                }
            }
        }

        if let Err(err) = self.segment.file.sync_all() {
            log::warn!(target: "assignd", "failed to sync event log: {err}");
        }
        log::debug!(target: "assignd", "event log writer stopped");
    }

    fn append(&mut self, event: &LoggedEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if self.segment.written > 0
            && self.segment.written + line.len() as u64 > self.config.max_segment_bytes
        {
            self.segment.file.sync_all()?;
            self.segment = Segment::open(&self.config.dir, self.segment.seq + 1)?;
            *self
                .current_segment
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = self.segment.path.clone();
        }

        self.segment.file.write_all(&line)?;
        self.segment.written += line.len() as u64;
        if self.config.fsync {
            self.segment.file.sync_data()?;
        }
        Ok(())
    }
}

impl WalEventLogger {
    /// Create the log directory if needed, open the first segment and start the writer thread.
    pub fn open(config: WalConfig) -> Result<WalEventLogger> {
        fs::create_dir_all(&config.dir)?;
        let segment = Segment::open(&config.dir, 0)?;
        let current_segment = Arc::new(Mutex::new(segment.path.clone()));

        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let writer = Writer {
            config,
            segment,
            current_segment: Arc::clone(&current_segment),
        };
        let writer = std::thread::Builder::new()
            .name("assignd-wal".to_owned())
            .spawn(move || writer.run(receiver))?;

        Ok(WalEventLogger {
            sender: Some(sender),
            writer: Some(writer),
            current_segment,
            dropped: AtomicU64::new(0),
        })
    }

    /// Path of the segment currently being appended to.
    pub fn current_segment(&self) -> PathBuf {
        self.current_segment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block until every event logged so far is written and synced to disk.
    pub fn flush(&self) -> Result<()> {
        let stopped = || io::Error::new(io::ErrorKind::BrokenPipe, "event log writer has stopped");
        let sender = self.sender.as_ref().ok_or_else(stopped)?;
        let (ack, done) = mpsc::sync_channel(1);
        sender.send(Command::Flush(ack)).map_err(|_| stopped())?;
        done.recv().map_err(|_| stopped())?;
        Ok(())
    }

    fn enqueue(&self, event: LoggedEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(Command::Append(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // One warning per thousand drops.
                if dropped % 1000 == 1 {
                    log::warn!(target: "assignd", dropped; "event log queue is full, dropping events");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(target: "assignd", "event log writer has stopped, dropping event");
            }
        }
    }
}

impl EventLogger for WalEventLogger {
    fn log_exposure(&self, event: ExposureEvent) {
        self.enqueue(LoggedEvent::Exposure(event));
    }

    fn log_goal(&self, event: GoalEvent) {
        self.enqueue(LoggedEvent::Goal(event));
    }
}

impl Drop for WalEventLogger {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!(target: "assignd", "event log writer panicked");
            }
        }
    }
}
