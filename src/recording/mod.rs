//! Per-Session Buffering and Flush Engine
//!
//! The upstream partition consumer routes each recording message to a
//! session-scoped manager keyed by `(team, session)`. Messages accumulate
//! in an on-disk buffer, get compressed and uploaded to an object store
//! when a flush triggers, and the flushed offsets flow back so the
//! consumer can advance its commits. An on-demand realtime mirror makes
//! the live buffer readable by other services while it is still being
//! written.
//!
//! ## Architecture
//!
//! ```text
//! Message → SessionManager.add → buffer file (jsonl)
//!                 ↓ (size / age threshold)
//!            swap buffers → gzip → multipart upload → on_finish(offsets)
//! ```
//!
//! ## Key properties
//!
//! - **Double buffer via swap**: flushing swaps in a fresh file-backed
//!   buffer; appends never block on the object store
//! - **One flush at a time**: a running flush makes further triggers no-ops
//! - **Offsets always advance**: a terminal flush failure still reports
//!   its offsets, trading durability for liveness

pub mod blob_store;
pub mod buffer;
pub mod config;
pub mod manager;
pub mod message;
pub mod realtime;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use blob_store::{BlobStore, BlobUpload, InMemoryBlobStore, LocalFsBlobStore, StoreFuture};
pub use buffer::{BufferError, EventsRange, OffsetSpan, SessionBuffer};
pub use config::RecordingConfig;
pub use manager::{
    Clock, FlushReason, ManagerError, OnFlushComplete, SessionKey, SessionManager,
    SessionManagerStats, SimulatedClock, SystemClock,
};
pub use message::{
    convert_to_persisted_message, serialize_line, MessageMetadata, PersistedMessage,
    RecordingEvent, RecordingMessage,
};
pub use realtime::{ActivationReceiver, InMemoryRealtimeSink, RealtimeSink};
#[cfg(feature = "s3")]
pub use s3_store::{S3BlobStore, S3Config};
