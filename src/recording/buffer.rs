//! Session Buffer
//!
//! One generation of a session's on-disk batch: an append-only
//! line-delimited JSON file plus the running metadata a flush needs
//! (record count, byte estimate, source-timestamp span, offset span,
//! event-payload range).
//!
//! Appends are synchronous buffered writes to local disk; the owning
//! manager holds its lock for the duration, the same discipline as a WAL
//! writer appending entries. Write failures are logged and do not
//! interrupt the append path; the next flush surfaces them when the
//! stream is read back.

use crate::recording::message::RecordingMessage;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Error as IoError, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Error type for buffer operations
#[derive(Debug)]
pub enum BufferError {
    /// I/O error creating or closing the buffer file
    Io(IoError),
    /// Message could not be serialized to its persisted form
    Serialization(serde_json::Error),
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Io(e) => write!(f, "I/O error: {}", e),
            BufferError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for BufferError {}

impl From<IoError> for BufferError {
    fn from(e: IoError) -> Self {
        BufferError::Io(e)
    }
}

impl From<serde_json::Error> for BufferError {
    fn from(e: serde_json::Error) -> Self {
        BufferError::Serialization(e)
    }
}

/// Min/max source-log offsets across the buffer's messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSpan {
    pub lowest: i64,
    pub highest: i64,
}

/// Min/max event-payload timestamps across the buffer's messages.
/// These define the remote object key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventsRange {
    pub first: i64,
    pub last: i64,
}

/// One append-only on-disk batch for a session
pub struct SessionBuffer {
    id: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: u64,
    size_estimate: u64,
    created_at_ms: u64,
    oldest_source_ts: Option<i64>,
    newest_source_ts: Option<i64>,
    offsets: Option<OffsetSpan>,
    events_range: Option<EventsRange>,
}

impl SessionBuffer {
    /// Create a fresh buffer with a new on-disk file opened for append
    pub fn open(
        dir: &Path,
        team_id: u64,
        session_id: &str,
        created_at_ms: u64,
    ) -> Result<Self, BufferError> {
        std::fs::create_dir_all(dir)?;

        let id = uuid::Uuid::new_v4().to_string();
        let path = dir.join(format!("{}.{}.{}.jsonl", team_id, session_id, id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        Ok(SessionBuffer {
            id,
            path,
            writer: Some(BufWriter::new(file)),
            count: 0,
            size_estimate: 0,
            created_at_ms,
            oldest_source_ts: None,
            newest_source_ts: None,
            offsets: None,
            events_range: None,
        })
    }

    /// Append one serialized message line, updating all running metadata.
    ///
    /// The write itself is best-effort: an I/O failure is logged and the
    /// metadata still updates, so accounting matches what the dispatcher
    /// believes was delivered. The failure resurfaces at flush time.
    pub fn append(&mut self, message: &RecordingMessage, line: &str) {
        let source_ts = message.metadata.timestamp;
        self.oldest_source_ts = Some(match self.oldest_source_ts {
            Some(ts) => ts.min(source_ts),
            None => source_ts,
        });
        self.newest_source_ts = Some(match self.newest_source_ts {
            Some(ts) => ts.max(source_ts),
            None => source_ts,
        });

        self.update_events_range(message);

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(line.as_bytes()) {
                error!(
                    buffer_id = %self.id,
                    path = %self.path.display(),
                    "buffer file write failed: {}",
                    e
                );
            }
        }

        self.count += 1;
        self.size_estimate += line.len() as u64;

        let offset = message.metadata.offset;
        self.offsets = Some(match self.offsets {
            Some(span) => OffsetSpan {
                lowest: span.lowest.min(offset),
                highest: span.highest.max(offset),
            },
            None => OffsetSpan {
                lowest: offset,
                highest: offset,
            },
        });

        debug_assert!(
            self.oldest_source_ts.is_some(),
            "non-empty buffer must have a source timestamp"
        );
    }

    /// Widen the event-payload range from a message's first/last events.
    ///
    /// A missing or zero first-event timestamp skips the update entirely.
    /// A missing or zero last-event timestamp degrades to the first
    /// event's timestamp; both cases emit a diagnostic.
    fn update_events_range(&mut self, message: &RecordingMessage) {
        let Some(first_event) = message.events.first() else {
            warn!(buffer_id = %self.id, "message with no events, skipping range update");
            return;
        };
        let start = first_event.timestamp;
        if start == 0 {
            warn!(
                buffer_id = %self.id,
                "first event has no timestamp, skipping range update"
            );
            return;
        }

        let end_raw = message
            .events
            .last()
            .map(|e| e.timestamp)
            .unwrap_or_default();
        let end = if end_raw != 0 {
            end_raw
        } else {
            warn!(
                buffer_id = %self.id,
                "last event has no timestamp, degrading range end to range start"
            );
            start
        };

        self.events_range = Some(match self.events_range {
            Some(range) => EventsRange {
                first: range.first.min(start),
                last: range.last.max(end),
            },
            None => EventsRange {
                first: start,
                last: end,
            },
        });
    }

    /// Flush buffered bytes through to the OS without closing the file.
    /// Used before reading the file back for a realtime bootstrap.
    pub fn flush_writer(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Take the writer out for ending (flush + fsync) off the hot path.
    /// After this the buffer is sealed; further appends only write metadata.
    pub fn take_writer(&mut self) -> Option<BufWriter<File>> {
        self.writer.take()
    }

    /// Close the writer and delete the buffer file. A missing file is not
    /// an error (it may already have been unlinked).
    pub async fn destroy(mut self) -> std::io::Result<()> {
        drop(self.writer.take());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Uncompressed bytes written, newlines included
    pub fn size_estimate(&self) -> u64 {
        self.size_estimate
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn oldest_source_ts(&self) -> Option<i64> {
        self.oldest_source_ts
    }

    pub fn newest_source_ts(&self) -> Option<i64> {
        self.newest_source_ts
    }

    pub fn offsets(&self) -> Option<OffsetSpan> {
        self.offsets
    }

    pub fn events_range(&self) -> Option<EventsRange> {
        self.events_range
    }
}

impl std::fmt::Debug for SessionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuffer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("count", &self.count)
            .field("size_estimate", &self.size_estimate)
            .field("oldest_source_ts", &self.oldest_source_ts)
            .field("newest_source_ts", &self.newest_source_ts)
            .finish()
    }
}
