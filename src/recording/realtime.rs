//! Realtime Mirror Store Abstraction
//!
//! Other services can read a session while it is still being written: on a
//! subscription signal the manager ships the live buffer's contents to a
//! low-latency store and mirrors every subsequent append. This trait is the
//! slice of that store the engine consumes; the production implementation
//! (a TTL'd key/value store with a pub/sub channel) lives outside this
//! crate.

use super::blob_store::StoreFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiver for realtime activation signals. One signal per external
/// subscription request; dropping the receiver unsubscribes.
pub type ActivationReceiver = mpsc::UnboundedReceiver<()>;

/// Realtime mirror store operations consumed by the engine
pub trait RealtimeSink: Send + Sync + 'static {
    /// Drop any mirrored state for the session
    fn clear_session<'a>(&'a self, team_id: u64, session_id: &'a str) -> StoreFuture<'a, ()>;

    /// Register for activation signals for the session
    fn subscribe(&self, team_id: u64, session_id: &str) -> ActivationReceiver;

    /// Publish one persisted line for an actively mirrored session
    fn publish_message<'a>(
        &'a self,
        team_id: u64,
        session_id: &'a str,
        line: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Bootstrap a newly activated mirror with the buffer's current
    /// contents and the oldest source timestamp they cover
    fn publish_buffer<'a>(
        &'a self,
        team_id: u64,
        session_id: &'a str,
        content: Vec<u8>,
        oldest_source_ts: i64,
    ) -> StoreFuture<'a, ()>;
}

// ============================================================================
// InMemoryRealtimeSink - For tests
// ============================================================================

#[derive(Debug, Default)]
struct RealtimeState {
    /// Lines published per session since the last clear
    messages: HashMap<(u64, String), Vec<String>>,
    /// Bootstrap payloads per session: (content, oldest_source_ts)
    bootstraps: HashMap<(u64, String), Vec<(Vec<u8>, i64)>>,
}

/// In-memory realtime sink for unit tests
///
/// Records publishes and bootstraps for assertions, and hands out
/// activation channels that tests fire via `request_realtime`.
#[derive(Clone, Default)]
pub struct InMemoryRealtimeSink {
    state: Arc<RwLock<RealtimeState>>,
    subscribers: Arc<RwLock<HashMap<(u64, String), mpsc::UnboundedSender<()>>>>,
}

impl InMemoryRealtimeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an external reader requesting the live session
    pub fn request_realtime(&self, team_id: u64, session_id: &str) {
        let key = (team_id, session_id.to_string());
        if let Some(tx) = self.subscribers.read().get(&key) {
            let _ = tx.send(());
        }
    }

    /// Lines published for the session since the last clear (for testing)
    pub fn published(&self, team_id: u64, session_id: &str) -> Vec<String> {
        self.state
            .read()
            .messages
            .get(&(team_id, session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Bootstrap payloads received for the session (for testing)
    pub fn bootstraps(&self, team_id: u64, session_id: &str) -> Vec<(Vec<u8>, i64)> {
        self.state
            .read()
            .bootstraps
            .get(&(team_id, session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any subscriber channel is registered for the session
    pub fn has_subscriber(&self, team_id: u64, session_id: &str) -> bool {
        self.subscribers
            .read()
            .get(&(team_id, session_id.to_string()))
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

impl RealtimeSink for InMemoryRealtimeSink {
    fn clear_session<'a>(&'a self, team_id: u64, session_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let key = (team_id, session_id.to_string());
            let mut state = self.state.write();
            state.messages.remove(&key);
            state.bootstraps.remove(&key);
            Ok(())
        })
    }

    fn subscribe(&self, team_id: u64, session_id: &str) -> ActivationReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .insert((team_id, session_id.to_string()), tx);
        rx
    }

    fn publish_message<'a>(
        &'a self,
        team_id: u64,
        session_id: &'a str,
        line: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .messages
                .entry((team_id, session_id.to_string()))
                .or_default()
                .push(line.to_string());
            Ok(())
        })
    }

    fn publish_buffer<'a>(
        &'a self,
        team_id: u64,
        session_id: &'a str,
        content: Vec<u8>,
        oldest_source_ts: i64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .bootstraps
                .entry((team_id, session_id.to_string()))
                .or_default()
                .push((content, oldest_source_ts));
            Ok(())
        })
    }
}
