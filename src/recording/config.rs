//! Configuration for the Buffering & Flush Engine
//!
//! All settings can be loaded from environment variables for 12-factor
//! deployments; `Default` carries production values and `test()` provides
//! small thresholds and fast timeouts for unit tests.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Subdirectory of `local_directory` holding per-session buffer files
pub const BUFFER_FILE_SUBDIR: &str = "session-buffer-files";

/// Configuration for session buffering and flushing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Buffer size threshold in KiB for a `buffer_size` flush
    pub max_buffer_size_kb: u64,
    /// Base age threshold in seconds for age-triggered flushes
    pub max_buffer_age_seconds: u64,
    /// Jitter fraction J in [0, 1): each manager samples a multiplier
    /// uniformly from [1 - J, 1] at construction
    pub buffer_age_jitter: f64,
    /// Multiplier (>= 1) applied to the wall-clock age threshold so the
    /// source-time reason wins when the consumer is nearly caught up
    pub buffer_age_in_memory_multiplier: f64,
    /// Root directory for buffer files
    pub local_directory: PathBuf,
    /// Object-store key prefix for flushed batches
    pub remote_folder: String,
    /// Destination bucket
    pub bucket: String,
    /// Hard deadline for one flush attempt; on expiry the attempt is
    /// abandoned (the upload itself is not cancelled)
    #[serde(with = "duration_millis")]
    pub max_flush_time: Duration,
    /// Soft guard: slow file-end and upload awaits emit a warning after
    /// this long, without cancelling anything
    #[serde(with = "duration_millis")]
    pub slow_io_warning_after: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        RecordingConfig {
            max_buffer_size_kb: 50 * 1024,
            max_buffer_age_seconds: 300,
            buffer_age_jitter: 0.3,
            buffer_age_in_memory_multiplier: 1.2,
            local_directory: PathBuf::from("/tmp"),
            remote_folder: "session_recordings".to_string(),
            bucket: "recordings".to_string(),
            max_flush_time: Duration::from_secs(60),
            slow_io_warning_after: Duration::from_secs(5),
        }
    }
}

impl RecordingConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable
    pub fn from_env() -> Self {
        let defaults = RecordingConfig::default();
        RecordingConfig {
            max_buffer_size_kb: env_parse(
                "SESSION_RECORDING_MAX_BUFFER_SIZE_KB",
                defaults.max_buffer_size_kb,
            ),
            max_buffer_age_seconds: env_parse(
                "SESSION_RECORDING_MAX_BUFFER_AGE_SECONDS",
                defaults.max_buffer_age_seconds,
            ),
            buffer_age_jitter: env_parse(
                "SESSION_RECORDING_BUFFER_AGE_JITTER",
                defaults.buffer_age_jitter,
            ),
            buffer_age_in_memory_multiplier: env_parse(
                "SESSION_RECORDING_BUFFER_AGE_IN_MEMORY_MULTIPLIER",
                defaults.buffer_age_in_memory_multiplier,
            ),
            local_directory: std::env::var("SESSION_RECORDING_LOCAL_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_directory),
            remote_folder: std::env::var("SESSION_RECORDING_REMOTE_FOLDER")
                .unwrap_or(defaults.remote_folder),
            bucket: std::env::var("OBJECT_STORAGE_BUCKET").unwrap_or(defaults.bucket),
            max_flush_time: defaults.max_flush_time,
            slow_io_warning_after: defaults.slow_io_warning_after,
        }
    }

    /// Configuration for tests (small thresholds, fast timeouts, temp dir)
    pub fn test() -> Self {
        RecordingConfig {
            max_buffer_size_kb: 512,
            max_buffer_age_seconds: 10,
            buffer_age_jitter: 0.0,
            buffer_age_in_memory_multiplier: 1.0,
            local_directory: temp_directory(),
            remote_folder: "session_recordings".to_string(),
            bucket: "test-recordings".to_string(),
            max_flush_time: Duration::from_secs(5),
            slow_io_warning_after: Duration::from_millis(500),
        }
    }

    /// Directory that buffer files are created in
    pub fn buffer_directory(&self) -> PathBuf {
        self.local_directory.join(BUFFER_FILE_SUBDIR)
    }

    /// Size threshold in bytes for a `buffer_size` flush
    pub fn max_buffer_size_bytes(&self) -> u64 {
        self.max_buffer_size_kb * 1024
    }

    /// Base age threshold in milliseconds
    pub fn max_buffer_age_ms(&self) -> u64 {
        self.max_buffer_age_seconds * 1000
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Fresh temp directory for tests
pub fn temp_directory() -> PathBuf {
    std::env::temp_dir().join(format!(
        "recording-ingester-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_nanos()
    ))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
