pub mod recording;

pub use recording::{
    BlobStore, FlushReason, RealtimeSink, RecordingConfig, RecordingMessage, SessionKey,
    SessionManager,
};
