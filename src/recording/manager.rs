//! Session Manager - Double Buffer, Flush Policy, Upload Pipeline
//!
//! One `SessionManager` per live `(team, session)` pair. Messages append
//! to the active on-disk buffer; when a flush triggers, the active buffer
//! is swapped for a fresh one and the sealed buffer is gzipped and
//! uploaded off the hot path, so appends never wait on the object store.
//!
//! ## Data flow
//!
//! ```text
//! dispatcher.add ──► active buffer (jsonl file) ──► [threshold] swap
//!                         │                              │
//!                         ▼ (mirror active)              ▼
//!                    realtime sink          gzip ──► multipart upload
//!                                                        │
//!                                          on_finish(offsets) ──► commit
//! ```
//!
//! ## Flush triggers
//!
//! - `buffer_size`: byte estimate over threshold, checked on every append
//! - `buffer_age`: source-log age over threshold, driven by the
//!   dispatcher's tick with its partition-wide reference time
//! - `buffer_age_realtime`: wall-clock age over threshold × multiplier;
//!   the source-time reason wins when both fire
//!
//! State lives behind a single mutex held only for synchronous sections;
//! the dispatcher guarantees serial entry per manager, the lock makes the
//! swap and counter updates safe against the pipeline task.

use crate::recording::blob_store::BlobStore;
use crate::recording::buffer::{BufferError, SessionBuffer};
use crate::recording::config::RecordingConfig;
use crate::recording::message::{serialize_line, RecordingMessage};
use crate::recording::realtime::RealtimeSink;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rand::Rng;
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a flush was triggered. The string form labels the
/// `recording_s3_files_written` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Byte estimate crossed the size threshold
    BufferSize,
    /// Source-log age crossed the base threshold
    BufferAge,
    /// Wall-clock age crossed the deferred in-memory threshold
    BufferAgeRealtime,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::BufferSize => "buffer_size",
            FlushReason::BufferAge => "buffer_age",
            FlushReason::BufferAgeRealtime => "buffer_age_realtime",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one managed session
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub team_id: u64,
    pub session_id: String,
    pub partition: i32,
    pub topic: String,
}

/// Callback into the dispatcher: one flush attempt is done, these are the
/// flushed buffer's `(lowest, highest)` source-log offsets. Invoked on
/// success and on terminal failure alike; the dispatcher uses it only as
/// "this attempt is done".
pub type OnFlushComplete = Box<dyn Fn(i64, i64) + Send + Sync>;

/// Error type for session manager operations
#[derive(Debug)]
pub enum ManagerError {
    /// Buffer creation or serialization failed
    Buffer(BufferError),
    /// Observed state that the data model rules out
    InvariantViolation(&'static str),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::Buffer(e) => write!(f, "Buffer error: {}", e),
            ManagerError::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<BufferError> for ManagerError {
    fn from(e: BufferError) -> Self {
        ManagerError::Buffer(e)
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(e: serde_json::Error) -> Self {
        ManagerError::Buffer(BufferError::Serialization(e))
    }
}

/// Snapshot of a manager's active buffer, for operational logging
#[derive(Debug, Clone)]
pub struct SessionManagerStats {
    pub buffer_id: String,
    pub count: u64,
    pub size_estimate: u64,
    pub oldest_source_ts: Option<i64>,
    pub flush_in_progress: bool,
}

/// Terminal outcome of one upload pipeline run
#[derive(Debug)]
enum FlushError {
    /// The sealed buffer had no messages
    EmptyBuffer,
    /// The sealed buffer never saw an event-payload timestamp
    MissingEventsRange,
    Io(std::io::Error),
    /// Upload cancelled through the manager's cancel handle
    Aborted,
    /// Hard flush deadline expired; the upload was abandoned, not cancelled
    HardTimeout,
    /// A pipeline task failed to run to completion
    TaskFailed(String),
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushError::EmptyBuffer => write!(f, "flushed buffer has no messages"),
            FlushError::MissingEventsRange => {
                write!(f, "flushed buffer has no event-payload timestamps")
            }
            FlushError::Io(e) => write!(f, "I/O error: {}", e),
            FlushError::Aborted => write!(f, "upload aborted"),
            FlushError::HardTimeout => write!(f, "flush deadline expired"),
            FlushError::TaskFailed(msg) => write!(f, "pipeline task failed: {}", msg),
        }
    }
}

struct FlushStats {
    key: String,
    lines: u64,
    size_kb: f64,
    age_seconds: f64,
}

struct SessionState {
    /// Buffer currently accepting appends. None only after destroy.
    active: Option<SessionBuffer>,
    /// Sealed buffer being uploaded; at most one flush runs at a time
    flushing: Option<SessionBuffer>,
    destroying: bool,
    /// Whether appends are mirrored to the realtime sink
    realtime_active: bool,
    /// Cancel handle for the in-progress upload
    upload_cancel: Option<oneshot::Sender<()>>,
    flush_task: Option<JoinHandle<()>>,
    subscription_task: Option<JoinHandle<()>>,
}

struct ManagerInner {
    key: SessionKey,
    config: RecordingConfig,
    blob_store: Arc<dyn BlobStore>,
    realtime: Arc<dyn RealtimeSink>,
    clock: Arc<dyn Clock>,
    /// Sampled once from [1 - J, 1]; spreads the first age flush of
    /// co-created managers across the base threshold
    jitter_multiplier: f64,
    on_finish: OnFlushComplete,
    state: Mutex<SessionState>,
}

/// Per-session buffering and flush state machine
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create the manager for a session's first message. Clears stale
    /// realtime state, opens the first buffer file and registers for
    /// realtime activation signals.
    pub async fn create(
        config: RecordingConfig,
        blob_store: Arc<dyn BlobStore>,
        realtime: Arc<dyn RealtimeSink>,
        key: SessionKey,
        clock: Arc<dyn Clock>,
        on_finish: OnFlushComplete,
    ) -> Result<Self, ManagerError> {
        if let Err(e) = realtime.clear_session(key.team_id, &key.session_id).await {
            warn!(
                team_id = key.team_id,
                session_id = %key.session_id,
                "failed to clear stale realtime state: {}",
                e
            );
        }

        let jitter = config.buffer_age_jitter;
        let jitter_multiplier = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);

        let active = SessionBuffer::open(
            &config.buffer_directory(),
            key.team_id,
            &key.session_id,
            clock.now_ms(),
        )?;

        let activation_rx = realtime.subscribe(key.team_id, &key.session_id);

        let inner = Arc::new(ManagerInner {
            key,
            config,
            blob_store,
            realtime,
            clock,
            jitter_multiplier,
            on_finish,
            state: Mutex::new(SessionState {
                active: Some(active),
                flushing: None,
                destroying: false,
                realtime_active: false,
                upload_cancel: None,
                flush_task: None,
                subscription_task: None,
            }),
        });

        let subscription_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            let mut activation_rx = activation_rx;
            async move {
                while activation_rx.recv().await.is_some() {
                    inner.start_realtime().await;
                }
            }
        });
        inner.state.lock().subscription_task = Some(subscription_task);

        debug!(
            team_id = inner.key.team_id,
            session_id = %inner.key.session_id,
            partition = inner.key.partition,
            jitter_multiplier = inner.jitter_multiplier,
            "session manager created"
        );

        Ok(SessionManager { inner })
    }

    /// Append one message to the active buffer. Mirrors the line to the
    /// realtime sink when active (fire-and-forget) and initiates a
    /// `buffer_size` flush when the byte estimate crosses the threshold.
    pub fn add(&self, message: &RecordingMessage) -> Result<(), ManagerError> {
        let line = serialize_line(message)?;

        let over_size_threshold = {
            let mut state = self.inner.state.lock();
            if state.destroying {
                warn!(
                    session_id = %self.inner.key.session_id,
                    "dropping message added during destroy"
                );
                return Ok(());
            }
            let Some(active) = state.active.as_mut() else {
                warn!(
                    session_id = %self.inner.key.session_id,
                    "dropping message added after destroy"
                );
                return Ok(());
            };

            active.append(message, &line);
            let over = active.size_estimate() >= self.inner.config.max_buffer_size_bytes();

            if state.realtime_active {
                // Never backpressure the append path on the realtime store
                let realtime = Arc::clone(&self.inner.realtime);
                let team_id = self.inner.key.team_id;
                let session_id = self.inner.key.session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = realtime.publish_message(team_id, &session_id, &line).await {
                        debug!(session_id = %session_id, "realtime publish failed: {}", e);
                    }
                });
            }

            over
        };

        if over_size_threshold {
            self.flush(FlushReason::BufferSize)?;
        }
        Ok(())
    }

    /// Age-based flush tick. `reference_now_ms` is source-log time
    /// supplied by the dispatcher, typically the newest timestamp it has
    /// observed across the partition. Returns the reason a flush was
    /// initiated for, if any.
    pub fn flush_if_session_buffer_is_old(
        &self,
        reference_now_ms: i64,
    ) -> Result<Option<FlushReason>, ManagerError> {
        let reason = {
            let state = self.inner.state.lock();
            if state.destroying || state.flushing.is_some() {
                return Ok(None);
            }
            let Some(active) = state.active.as_ref() else {
                return Ok(None);
            };
            if active.is_empty() {
                return Ok(None);
            }
            let Some(oldest) = active.oldest_source_ts() else {
                error!(
                    session_id = %self.inner.key.session_id,
                    count = active.count(),
                    "non-empty buffer without a source timestamp"
                );
                return Err(ManagerError::InvariantViolation(
                    "non-empty buffer without a source timestamp",
                ));
            };

            let base_threshold_ms =
                self.inner.config.max_buffer_age_ms() as f64 * self.inner.jitter_multiplier;
            let source_age_ms = reference_now_ms.saturating_sub(oldest);

            if source_age_ms as f64 >= base_threshold_ms {
                Some(FlushReason::BufferAge)
            } else {
                let wall_age_ms = self
                    .inner
                    .clock
                    .now_ms()
                    .saturating_sub(active.created_at_ms());
                let in_memory_threshold_ms =
                    base_threshold_ms * self.inner.config.buffer_age_in_memory_multiplier;
                if wall_age_ms as f64 > in_memory_threshold_ms {
                    Some(FlushReason::BufferAgeRealtime)
                } else {
                    None
                }
            }
        };

        match reason {
            Some(reason) => {
                self.flush(reason)?;
                Ok(Some(reason))
            }
            None => Ok(None),
        }
    }

    /// Seal the active buffer and upload it off the hot path. Returns
    /// whether a flush was actually started: a no-op when one is already
    /// running or the manager is being destroyed.
    pub fn flush(&self, reason: FlushReason) -> Result<bool, ManagerError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.destroying {
            warn!(session_id = %inner.key.session_id, "flush requested during destroy");
            return Ok(false);
        }
        if state.flushing.is_some() {
            warn!(
                session_id = %inner.key.session_id,
                reason = %reason,
                "flush already in progress, skipping"
            );
            return Ok(false);
        }
        let Some(sealed) = state.active.take() else {
            warn!(session_id = %inner.key.session_id, "flush requested after destroy");
            return Ok(false);
        };

        // Swap first so appends continue against a fresh file; the sealed
        // buffer is validated inside the guarded pipeline.
        let fresh = match SessionBuffer::open(
            &inner.config.buffer_directory(),
            inner.key.team_id,
            &inner.key.session_id,
            inner.clock.now_ms(),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(
                    session_id = %inner.key.session_id,
                    "failed to open replacement buffer: {}",
                    e
                );
                state.active = Some(sealed);
                return Err(e.into());
            }
        };
        state.active = Some(fresh);
        state.flushing = Some(sealed);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.upload_cancel = Some(cancel_tx);

        let task = tokio::spawn({
            let inner = Arc::clone(inner);
            async move { inner.run_flush(reason, cancel_rx).await }
        });
        state.flush_task = Some(task);

        Ok(true)
    }

    /// Lowest unflushed source-log offset across the manager's buffers,
    /// the watermark below which the dispatcher must not commit.
    pub fn get_lowest_offset(&self) -> Option<i64> {
        let state = self.inner.state.lock();
        let active = state.active.as_ref()?;
        // TODO: fold the flushing buffer's offsets into the empty-active
        // case; as written a flush in progress is invisible to the
        // watermark once the new active buffer is still empty.
        if active.is_empty() {
            return None;
        }
        let active_lowest = active.offsets().map(|span| span.lowest);
        let flushing_lowest = state
            .flushing
            .as_ref()
            .and_then(|buffer| buffer.offsets())
            .map(|span| span.lowest);
        match (active_lowest, flushing_lowest) {
            (Some(a), Some(f)) => Some(a.min(f)),
            (a, f) => a.or(f),
        }
    }

    /// Whether both buffers hold no messages
    pub fn is_empty(&self) -> bool {
        let state = self.inner.state.lock();
        let active_empty = state
            .active
            .as_ref()
            .map(|buffer| buffer.is_empty())
            .unwrap_or(true);
        let flushing_empty = state
            .flushing
            .as_ref()
            .map(|buffer| buffer.is_empty())
            .unwrap_or(true);
        active_empty && flushing_empty
    }

    /// Snapshot of the active buffer (for logging and tests)
    pub fn stats(&self) -> SessionManagerStats {
        let state = self.inner.state.lock();
        match state.active.as_ref() {
            Some(active) => SessionManagerStats {
                buffer_id: active.id().to_string(),
                count: active.count(),
                size_estimate: active.size_estimate(),
                oldest_source_ts: active.oldest_source_ts(),
                flush_in_progress: state.flushing.is_some(),
            },
            None => SessionManagerStats {
                buffer_id: String::new(),
                count: 0,
                size_estimate: 0,
                oldest_source_ts: None,
                flush_in_progress: state.flushing.is_some(),
            },
        }
    }

    /// The age multiplier sampled at construction, in [1 - J, 1]
    pub fn flush_jitter_multiplier(&self) -> f64 {
        self.inner.jitter_multiplier
    }

    /// Await completion of any in-flight flush attempt
    pub async fn wait_for_in_flight_flush(&self) {
        let task = self.inner.state.lock().flush_task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Terminal teardown: unsubscribe from realtime activation, abort any
    /// in-progress upload (waiting for its pipeline to settle so offsets
    /// are still reported), then close and delete both buffer files.
    pub async fn destroy(&self) {
        let (cancel, flush_task, subscription_task) = {
            let mut state = self.inner.state.lock();
            state.destroying = true;
            (
                state.upload_cancel.take(),
                state.flush_task.take(),
                state.subscription_task.take(),
            )
        };

        if let Some(task) = subscription_task {
            task.abort();
        }
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        if let Some(task) = flush_task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(
                        session_id = %self.inner.key.session_id,
                        "flush pipeline failed during destroy: {}",
                        e
                    );
                }
            }
        }

        let (active, flushing) = {
            let mut state = self.inner.state.lock();
            (state.active.take(), state.flushing.take())
        };
        for buffer in [active, flushing].into_iter().flatten() {
            if let Err(e) = buffer.destroy().await {
                warn!(
                    session_id = %self.inner.key.session_id,
                    "failed to remove buffer file during destroy: {}",
                    e
                );
            }
        }

        debug!(
            team_id = self.inner.key.team_id,
            session_id = %self.inner.key.session_id,
            "session manager destroyed"
        );
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("team_id", &self.inner.key.team_id)
            .field("session_id", &self.inner.key.session_id)
            .field("partition", &self.inner.key.partition)
            .finish()
    }
}

impl ManagerInner {
    /// One flush attempt end to end: upload the sealed buffer, record the
    /// outcome, then always run `end_flush` so the attempt terminates
    /// exactly once.
    async fn run_flush(self: Arc<Self>, reason: FlushReason, cancel_rx: oneshot::Receiver<()>) {
        let started = Instant::now();
        let result = self.upload_flushing_buffer(cancel_rx).await;

        match result {
            Ok(stats) => {
                counter!("recording_s3_files_written", "flushReason" => reason.as_str())
                    .increment(1);
                histogram!("recording_s3_lines_written_histogram").record(stats.lines as f64);
                histogram!("recording_blob_ingestion_s3_kb_written").record(stats.size_kb);
                histogram!("recording_blob_ingestion_session_age_seconds")
                    .record(stats.age_seconds);
                histogram!("recording_blob_ingestion_session_size_kb").record(stats.size_kb);
                histogram!("recording_blob_ingestion_session_lines").record(stats.lines as f64);
                info!(
                    team_id = self.key.team_id,
                    session_id = %self.key.session_id,
                    reason = %reason,
                    key = %stats.key,
                    lines = stats.lines,
                    "flushed session buffer"
                );
            }
            Err(FlushError::Aborted) if self.state.lock().destroying => {
                debug!(
                    session_id = %self.key.session_id,
                    "upload aborted during destroy"
                );
            }
            Err(e @ (FlushError::EmptyBuffer | FlushError::MissingEventsRange)) => {
                error!(
                    session_id = %self.key.session_id,
                    reason = %reason,
                    "flush pipeline rejected sealed buffer: {}",
                    e
                );
            }
            Err(e) => {
                counter!("recording_s3_write_errored").increment(1);
                error!(
                    team_id = self.key.team_id,
                    session_id = %self.key.session_id,
                    reason = %reason,
                    "session buffer flush failed: {}",
                    e
                );
            }
        }

        histogram!("recording_blob_ingestion_session_flush_time_seconds")
            .record(started.elapsed().as_secs_f64());
        self.end_flush().await;
    }

    /// Validate the sealed buffer, derive its object key and stream it
    /// through gzip into a multipart upload under the hard deadline. On
    /// deadline expiry the upload task is abandoned, not cancelled; it
    /// may still complete or error on its own and is ignored.
    async fn upload_flushing_buffer(
        &self,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<FlushStats, FlushError> {
        let (path, writer, count, size_estimate, oldest_source_ts, events_range) = {
            let mut state = self.state.lock();
            let flushing = state
                .flushing
                .as_mut()
                .expect("flush pipeline started without a flushing buffer");
            (
                flushing.path().to_path_buf(),
                flushing.take_writer(),
                flushing.count(),
                flushing.size_estimate(),
                flushing.oldest_source_ts(),
                flushing.events_range(),
            )
        };

        if count == 0 {
            return Err(FlushError::EmptyBuffer);
        }
        let Some(range) = events_range else {
            return Err(FlushError::MissingEventsRange);
        };

        // The key is uniquely defined by the batch's event-payload range
        let key = format!(
            "{}/team_id/{}/session_id/{}/data/{}-{}",
            self.config.remote_folder, self.key.team_id, self.key.session_id, range.first, range.last
        );

        let upload_task = tokio::spawn(stream_file_to_store(
            Arc::clone(&self.blob_store),
            writer,
            path,
            key.clone(),
            self.config.slow_io_warning_after,
            cancel_rx,
        ));

        match tokio::time::timeout(self.config.max_flush_time, upload_task).await {
            Err(_elapsed) => Err(FlushError::HardTimeout),
            Ok(Err(join_err)) => Err(FlushError::TaskFailed(join_err.to_string())),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(()))) => Ok(FlushStats {
                key,
                lines: count,
                size_kb: size_estimate as f64 / 1024.0,
                age_seconds: oldest_source_ts
                    .map(|ts| (self.clock.now_ms() as i64).saturating_sub(ts) as f64 / 1000.0)
                    .unwrap_or(0.0),
            }),
        }
    }

    /// Terminate one flush attempt: capture the sealed buffer's offsets,
    /// drop the cancel handle, disable the realtime mirror (the file is no
    /// longer the canonical source), delete the buffer file, and report
    /// the offsets to the dispatcher. Runs exactly once per attempt,
    /// success or failure.
    async fn end_flush(&self) {
        let (flushed, offsets) = {
            let mut state = self.state.lock();
            let flushed = state.flushing.take();
            state.upload_cancel = None;
            state.realtime_active = false;
            let offsets = flushed.as_ref().and_then(|buffer| buffer.offsets());
            (flushed, offsets)
        };

        if let Some(buffer) = flushed {
            if let Err(e) = buffer.destroy().await {
                warn!(
                    session_id = %self.key.session_id,
                    "failed to remove flushed buffer file: {}",
                    e
                );
            }
        }

        if let Some(span) = offsets {
            (self.on_finish)(span.lowest, span.highest);
        }
    }

    /// Realtime activation: ship the live buffer's current contents to
    /// the realtime sink, then mirror subsequent appends. Idempotent; a
    /// failed bootstrap leaves the mirror flag set so appends still
    /// publish best-effort.
    async fn start_realtime(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.destroying || state.realtime_active {
                return;
            }
            let Some(active) = state.active.as_mut() else {
                return;
            };
            if let Err(e) = active.flush_writer() {
                warn!(
                    session_id = %self.key.session_id,
                    "failed to flush buffer before realtime bootstrap: {}",
                    e
                );
            }
            let snapshot = (active.path().to_path_buf(), active.oldest_source_ts());
            state.realtime_active = true;
            snapshot
        };
        let (path, oldest_source_ts) = snapshot;

        info!(
            team_id = self.key.team_id,
            session_id = %self.key.session_id,
            "realtime mirror activated"
        );

        match tokio::fs::read(&path).await {
            Ok(content) => {
                if let Err(e) = self
                    .realtime
                    .publish_buffer(
                        self.key.team_id,
                        &self.key.session_id,
                        content,
                        oldest_source_ts.unwrap_or(0),
                    )
                    .await
                {
                    error!(
                        session_id = %self.key.session_id,
                        "realtime bootstrap failed: {}",
                        e
                    );
                }
            }
            Err(e) => {
                error!(
                    session_id = %self.key.session_id,
                    "failed to read buffer file for realtime bootstrap: {}",
                    e
                );
            }
        }
    }
}

/// End the sealed buffer's writer, then gzip-stream its file into a
/// multipart upload. Runs as its own task so the hard deadline can
/// abandon it and `destroy` can cancel it through `cancel_rx`.
async fn stream_file_to_store(
    store: Arc<dyn BlobStore>,
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    key: String,
    slow_after: Duration,
    cancel_rx: oneshot::Receiver<()>,
) -> Result<(), FlushError> {
    use tokio::io::AsyncReadExt;

    if let Some(writer) = writer {
        let end = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut writer = writer;
            writer.flush()?;
            writer.get_ref().sync_all()
        });
        match warn_if_slow("buffer file end", slow_after, end).await {
            Ok(io_result) => io_result.map_err(FlushError::Io)?,
            Err(join_err) => return Err(FlushError::TaskFailed(join_err.to_string())),
        }
    }

    let mut upload = store.start_upload(&key).await.map_err(FlushError::Io)?;

    // Only an explicit signal aborts; a dropped sender means the attempt
    // was abandoned and this upload should run to its own conclusion.
    let cancel_wait = async move {
        match cancel_rx.await {
            Ok(()) => (),
            Err(_) => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(cancel_wait);

    let cancelled = {
        let pump = async {
            let file = tokio::fs::File::open(&path).await?;
            let reader = tokio::io::BufReader::new(file);
            let mut encoder = async_compression::tokio::bufread::GzipEncoder::new(reader);
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                let n = encoder.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                upload.write(&chunk[..n]).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        tokio::pin!(pump);

        tokio::select! {
            result = &mut pump => {
                result.map_err(FlushError::Io)?;
                false
            }
            _ = &mut cancel_wait => true,
        }
    };

    if cancelled {
        if let Err(e) = upload.abort().await {
            warn!(key = %key, "failed to abort multipart upload: {}", e);
        }
        return Err(FlushError::Aborted);
    }

    warn_if_slow("multipart upload complete", slow_after, upload.complete())
        .await
        .map_err(FlushError::Io)
}

/// Soft timeout guard: emits one warning when `fut` takes longer than
/// `limit`, then keeps awaiting. Never cancels.
async fn warn_if_slow<F: Future>(label: &str, limit: Duration, fut: F) -> F::Output {
    tokio::pin!(fut);
    match tokio::time::timeout(limit, &mut fut).await {
        Ok(output) => output,
        Err(_) => {
            warn!("{} taking longer than {:?}", label, limit);
            fut.await
        }
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Wall-clock reads feeding the `buffer_age_realtime` decision and the
/// `created_at` stamp on each buffer. Source-log time never goes through
/// here; the dispatcher supplies it on every age tick. Tests install a
/// `SimulatedClock` and step it across the threshold explicitly instead
/// of sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Manually stepped clock for tests. Clones share the same time, so the
/// test harness and the manager under test observe every step together.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    now_ms: Arc<Mutex<u64>>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            now_ms: Arc::new(Mutex::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        *self.now_ms.lock() += delta_ms;
    }

    pub fn set(&self, now_ms: u64) {
        *self.now_ms.lock() = now_ms;
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock()
    }
}
