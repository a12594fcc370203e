//! Incoming Message Model and On-Disk Transform
//!
//! A `RecordingMessage` is one consumed batch of recording events for a
//! single session, carrying the source log's metadata (timestamp, offset,
//! partition, topic). Buffers persist the message as a single JSON line:
//! `convert_to_persisted_message` strips consumer-side metadata down to the
//! fields replay needs, and `serialize_line` appends the trailing newline.

use serde::{Deserialize, Serialize};

/// Metadata assigned by the durable log for one consumed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Source-log timestamp in milliseconds
    pub timestamp: i64,
    /// Source-log offset within the partition
    pub offset: i64,
    /// Partition the message was consumed from
    pub partition: i32,
    /// Topic the message was consumed from
    pub topic: String,
}

/// One recording event inside a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    /// Event-payload timestamp in milliseconds. Zero means missing.
    #[serde(default)]
    pub timestamp: i64,
    /// Opaque event body
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// One consumed message routed to a session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMessage {
    pub team_id: u64,
    pub session_id: String,
    pub distinct_id: String,
    pub metadata: MessageMetadata,
    pub events: Vec<RecordingEvent>,
}

/// The on-disk record for one message: the replay payload without
/// consumer-side bookkeeping (offset, partition, topic).
#[derive(Debug, Clone, Serialize)]
pub struct PersistedMessage<'a> {
    pub team_id: u64,
    pub session_id: &'a str,
    pub distinct_id: &'a str,
    /// Source-log timestamp of the originating message
    pub timestamp: i64,
    pub events: &'a [RecordingEvent],
}

/// Project a consumed message down to its persisted form
pub fn convert_to_persisted_message(message: &RecordingMessage) -> PersistedMessage<'_> {
    PersistedMessage {
        team_id: message.team_id,
        session_id: &message.session_id,
        distinct_id: &message.distinct_id,
        timestamp: message.metadata.timestamp,
        events: &message.events,
    }
}

/// Serialize a message to its line-delimited JSON form (trailing `\n`)
pub fn serialize_line(message: &RecordingMessage) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&convert_to_persisted_message(message))?;
    line.push('\n');
    Ok(line)
}
