//! Session Manager Integration Tests
//!
//! Drives the full engine against in-memory stores: size- and
//! age-triggered flushes, flush reason precedence, flush de-duplication,
//! destroy-during-upload cancellation, realtime activation and offset
//! accounting. A simulated clock makes the wall-clock scenarios
//! deterministic; no test sleeps its way past a threshold.

use parking_lot::Mutex;
use recording_ingester::recording::{
    FlushReason, InMemoryBlobStore, InMemoryRealtimeSink, MessageMetadata, RecordingConfig,
    RecordingEvent, RecordingMessage, SessionKey, SessionManager, SimulatedClock,
};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "session_recording_events";

/// Initialize logging once across the test binary; later calls are no-ops
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

fn make_key(team_id: u64, session_id: &str) -> SessionKey {
    SessionKey {
        team_id,
        session_id: session_id.to_string(),
        partition: 0,
        topic: TOPIC.to_string(),
    }
}

fn make_message(session_id: &str, source_ts: i64, offset: i64) -> RecordingMessage {
    make_padded_message(session_id, source_ts, offset, 8)
}

/// Message whose serialized line carries `fill` bytes of payload padding
fn make_padded_message(
    session_id: &str,
    source_ts: i64,
    offset: i64,
    fill: usize,
) -> RecordingMessage {
    RecordingMessage {
        team_id: 1,
        session_id: session_id.to_string(),
        distinct_id: "d1".to_string(),
        metadata: MessageMetadata {
            timestamp: source_ts,
            offset,
            partition: 0,
            topic: TOPIC.to_string(),
        },
        events: vec![RecordingEvent {
            timestamp: source_ts,
            payload: serde_json::json!({"type": 3, "data": "x".repeat(fill)}),
        }],
    }
}

struct Harness {
    manager: SessionManager,
    store: InMemoryBlobStore,
    sink: InMemoryRealtimeSink,
    clock: SimulatedClock,
    finished: Arc<Mutex<Vec<(i64, i64)>>>,
    buffer_dir: std::path::PathBuf,
}

impl Harness {
    async fn new(config: RecordingConfig, store: InMemoryBlobStore) -> Self {
        init_tracing();

        let sink = InMemoryRealtimeSink::new();
        let clock = SimulatedClock::new(0);
        let finished: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        let buffer_dir = config.buffer_directory();

        let on_finish = {
            let finished = Arc::clone(&finished);
            Box::new(move |low, high| finished.lock().push((low, high)))
        };

        let manager = SessionManager::create(
            config,
            Arc::new(store.clone()),
            Arc::new(sink.clone()),
            make_key(1, "s1"),
            Arc::new(clock.clone()),
            on_finish,
        )
        .await
        .expect("manager creation");

        Harness {
            manager,
            store,
            sink,
            clock,
            finished,
            buffer_dir,
        }
    }

    fn buffer_file_count(&self) -> usize {
        match std::fs::read_dir(&self.buffer_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    fn cleanup(&self) {
        std::fs::remove_dir_all(&self.buffer_dir).ok();
    }
}

async fn gunzip_lines(data: &[u8]) -> Vec<String> {
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt;

    let mut decoder = GzipDecoder::new(std::io::Cursor::new(data.to_vec()));
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .await
        .expect("uploaded object should be valid gzip");
    out.lines().map(str::to_string).collect()
}

// =============================================================================
// Flush triggers
// =============================================================================

#[tokio::test]
async fn test_size_triggered_flush() {
    let config = RecordingConfig {
        max_buffer_size_kb: 1,
        ..RecordingConfig::test()
    };
    let harness = Harness::new(config, InMemoryBlobStore::new()).await;

    // Each line lands around 300 bytes, so the threshold crosses on the
    // fourth append
    let line_len = recording_ingester::recording::serialize_line(&make_padded_message(
        "s1", 1_000, 1, 200,
    ))
    .unwrap()
    .len();
    assert!(
        (257..=341).contains(&line_len),
        "expected the 1 KiB threshold to cross on the fourth append, line is {} bytes",
        line_len
    );

    for i in 0..4 {
        harness
            .manager
            .add(&make_padded_message("s1", 1_000 + i, 1 + i, 200))
            .unwrap();
    }
    assert!(
        harness.manager.stats().flush_in_progress,
        "fourth append crosses the threshold and seals the buffer"
    );

    harness.manager.wait_for_in_flight_flush().await;
    assert_eq!(harness.store.uploads_started(), 1);

    // Fifth message goes to the fresh active buffer
    harness
        .manager
        .add(&make_padded_message("s1", 1_004, 5, 200))
        .unwrap();

    let stats = harness.manager.stats();
    assert!(!stats.flush_in_progress);
    assert_eq!(stats.count, 1);

    let keys = harness.store.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("session_recordings/team_id/1/session_id/s1/data/"));

    let lines = gunzip_lines(&harness.store.object(&keys[0]).unwrap()).await;
    assert_eq!(lines.len(), 4);

    assert_eq!(*harness.finished.lock(), vec![(1, 4)]);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_age_triggered_flush_source_time() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    harness.manager.add(&make_message("s1", 1_000_000, 7)).unwrap();

    // Source-log age 10_001 ms >= 10s threshold
    let reason = harness
        .manager
        .flush_if_session_buffer_is_old(1_010_001)
        .unwrap();
    assert_eq!(reason, Some(FlushReason::BufferAge));

    harness.manager.wait_for_in_flight_flush().await;
    assert_eq!(harness.store.len(), 1);
    assert_eq!(*harness.finished.lock(), vec![(7, 7)]);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_age_under_threshold_does_not_flush() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    harness.manager.add(&make_message("s1", 1_000_000, 7)).unwrap();

    let reason = harness
        .manager
        .flush_if_session_buffer_is_old(1_005_000)
        .unwrap();
    assert_eq!(reason, None);
    assert!(harness.store.is_empty());

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_wall_clock_age_flush() {
    let config = RecordingConfig {
        buffer_age_in_memory_multiplier: 1.5,
        ..RecordingConfig::test()
    };
    let harness = Harness::new(config, InMemoryBlobStore::new()).await;

    // Buffer created at wall time 0
    harness.manager.add(&make_message("s1", 1_000_000, 1)).unwrap();

    // Source-log age is only 500 ms but the buffer has sat in memory past
    // 10s * 1.5
    harness.clock.set(15_001);
    let reason = harness
        .manager
        .flush_if_session_buffer_is_old(1_000_500)
        .unwrap();
    assert_eq!(reason, Some(FlushReason::BufferAgeRealtime));

    harness.manager.wait_for_in_flight_flush().await;
    assert_eq!(harness.store.len(), 1);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_source_time_reason_wins_when_both_fire() {
    let config = RecordingConfig {
        buffer_age_in_memory_multiplier: 1.5,
        ..RecordingConfig::test()
    };
    let harness = Harness::new(config, InMemoryBlobStore::new()).await;

    harness.manager.add(&make_message("s1", 1_000_000, 1)).unwrap();
    harness.clock.set(100_000);

    let reason = harness
        .manager
        .flush_if_session_buffer_is_old(1_100_000)
        .unwrap();
    assert_eq!(reason, Some(FlushReason::BufferAge));

    harness.manager.destroy().await;
    harness.cleanup();
}

// =============================================================================
// Flush pipeline
// =============================================================================

#[tokio::test]
async fn test_flush_deduplication() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::stalled()).await;

    harness.manager.add(&make_message("s1", 1_000, 1)).unwrap();

    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());
    assert!(!harness.manager.flush(FlushReason::BufferAge).unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.store.uploads_started(), 1);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_object_key_spans_event_payload_range() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    let mut message = make_message("s1", 5_000, 1);
    message.events = vec![
        RecordingEvent {
            timestamp: 4_200,
            payload: serde_json::json!({"type": 2}),
        },
        RecordingEvent {
            timestamp: 4_900,
            payload: serde_json::json!({"type": 3}),
        },
    ];
    harness.manager.add(&message).unwrap();

    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());
    harness.manager.wait_for_in_flight_flush().await;

    let keys = harness.store.keys();
    assert_eq!(
        keys,
        vec!["session_recordings/team_id/1/session_id/s1/data/4200-4900".to_string()]
    );

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_flushed_object_contains_exactly_pre_swap_messages() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    for i in 0..3 {
        harness
            .manager
            .add(&make_message("s1", 1_000 + i, 10 + i))
            .unwrap();
    }
    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());

    // Appended after the swap; must not appear in the flushed object
    harness.manager.add(&make_message("s1", 9_999, 99)).unwrap();

    harness.manager.wait_for_in_flight_flush().await;

    let keys = harness.store.keys();
    let lines = gunzip_lines(&harness.store.object(&keys[0]).unwrap()).await;
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["timestamp"], 1_000 + i as i64, "delivery order preserved");
    }

    assert_eq!(*harness.finished.lock(), vec![(10, 12)]);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_hard_timeout_abandons_upload_and_reports_offsets() {
    let config = RecordingConfig {
        max_flush_time: Duration::from_millis(100),
        ..RecordingConfig::test()
    };
    let harness = Harness::new(config, InMemoryBlobStore::stalled()).await;

    harness.manager.add(&make_message("s1", 1_000, 3)).unwrap();
    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());

    harness.manager.wait_for_in_flight_flush().await;

    // The attempt terminated without an object, the upload was abandoned
    // rather than aborted, and offsets still advanced
    assert!(harness.store.is_empty());
    assert_eq!(harness.store.uploads_aborted(), 0);
    assert_eq!(*harness.finished.lock(), vec![(3, 3)]);

    // The manager accepts a new flush afterwards
    harness.manager.add(&make_message("s1", 2_000, 4)).unwrap();
    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());

    harness.manager.destroy().await;
    harness.cleanup();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_destroy_during_upload_aborts_and_reports_once() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::stalled()).await;

    for i in 0..3 {
        harness
            .manager
            .add(&make_message("s1", 1_000 + i, 20 + i))
            .unwrap();
    }
    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());
    assert_eq!(harness.buffer_file_count(), 2);

    harness.manager.destroy().await;

    assert_eq!(harness.store.uploads_aborted(), 1);
    assert!(harness.store.is_empty());
    assert_eq!(harness.buffer_file_count(), 0, "both buffer files unlinked");
    assert_eq!(*harness.finished.lock(), vec![(20, 22)]);

    harness.cleanup();
}

#[tokio::test]
async fn test_offset_watermark_monotonic_across_flushes() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    let mut last_watermark = i64::MIN;
    for round in 0..3 {
        for i in 0..2 {
            let offset = round * 10 + i;
            harness
                .manager
                .add(&make_message("s1", 1_000 + offset, offset))
                .unwrap();
        }
        let watermark = harness
            .manager
            .get_lowest_offset()
            .expect("non-empty active buffer");
        assert!(watermark >= last_watermark);
        last_watermark = watermark;

        assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());
        harness.manager.wait_for_in_flight_flush().await;
    }

    assert_eq!(harness.store.len(), 3);
    assert_eq!(
        *harness.finished.lock(),
        vec![(0, 1), (10, 11), (20, 21)]
    );

    harness.manager.destroy().await;
    harness.cleanup();
}

// =============================================================================
// Realtime mirror
// =============================================================================

#[tokio::test]
async fn test_realtime_activation_bootstraps_then_mirrors() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    harness.manager.add(&make_message("s1", 1_000, 1)).unwrap();
    harness.manager.add(&make_message("s1", 2_000, 2)).unwrap();

    harness.sink.request_realtime(1, "s1");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bootstraps = harness.sink.bootstraps(1, "s1");
    assert_eq!(bootstraps.len(), 1);
    let (content, oldest_ts) = &bootstraps[0];
    assert_eq!(*oldest_ts, 1_000);
    let content = String::from_utf8(content.clone()).unwrap();
    assert_eq!(content.lines().count(), 2);

    // Subsequent appends publish individually
    harness.manager.add(&make_message("s1", 3_000, 3)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let published = harness.sink.published(1, "s1");
    assert_eq!(published.len(), 1);
    let value: serde_json::Value = serde_json::from_str(published[0].trim()).unwrap();
    assert_eq!(value["timestamp"], 3_000);

    // A successful flush disables the mirror
    assert!(harness.manager.flush(FlushReason::BufferAge).unwrap());
    harness.manager.wait_for_in_flight_flush().await;

    harness.manager.add(&make_message("s1", 4_000, 4)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.sink.published(1, "s1").len(), 1, "mirror disabled");

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_realtime_activation_is_idempotent() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    harness.manager.add(&make_message("s1", 1_000, 1)).unwrap();

    harness.sink.request_realtime(1, "s1");
    harness.sink.request_realtime(1, "s1");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.sink.bootstraps(1, "s1").len(), 1);

    harness.manager.destroy().await;
    harness.cleanup();
}

#[tokio::test]
async fn test_destroy_unsubscribes_from_activation_channel() {
    let harness = Harness::new(RecordingConfig::test(), InMemoryBlobStore::new()).await;

    assert!(harness.sink.has_subscriber(1, "s1"));
    harness.manager.destroy().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.sink.has_subscriber(1, "s1"));

    harness.cleanup();
}
