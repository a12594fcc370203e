//! Blob Store Abstraction
//!
//! The flush pipeline streams a gzipped buffer file into a multipart
//! upload. This trait captures the slice of the object-store client the
//! engine actually consumes: start an upload, feed it chunks, then either
//! complete or abort it. `destroy` relies on abort to cancel an in-flight
//! upload mid-stream.
//!
//! Implementations:
//! - `InMemoryBlobStore`: for unit tests; optional stall mode where
//!   uploads never resolve, for exercising cancellation paths
//! - `LocalFsBlobStore`: for development and local testing
//! - `S3BlobStore`: for production (feature-gated, see `s3_store`)

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by the store traits
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// One in-progress multipart upload
pub trait BlobUpload: Send {
    /// Append a chunk to the upload
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Finish the upload, making the object visible under its key
    fn complete(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Cancel the upload, discarding any parts already written
    fn abort(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// Object store abstraction trait
pub trait BlobStore: Send + Sync + 'static {
    /// Begin a multipart upload to the given key
    fn start_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Box<dyn BlobUpload>>;
}

// ============================================================================
// InMemoryBlobStore - For tests
// ============================================================================

#[derive(Debug, Default)]
struct InMemoryState {
    objects: HashMap<String, Vec<u8>>,
    uploads_started: u64,
    uploads_completed: u64,
    uploads_aborted: u64,
}

/// In-memory blob store for unit tests
///
/// In stall mode, `write` and `complete` never resolve while `abort`
/// still does, which simulates an object store that has stopped
/// responding and lets tests drive the destroy-during-upload path.
#[derive(Debug, Clone)]
pub struct InMemoryBlobStore {
    state: Arc<RwLock<InMemoryState>>,
    stall: bool,
}

impl InMemoryBlobStore {
    /// Create a new in-memory blob store
    pub fn new() -> Self {
        InMemoryBlobStore {
            state: Arc::new(RwLock::new(InMemoryState::default())),
            stall: false,
        }
    }

    /// Create a store whose uploads never complete
    pub fn stalled() -> Self {
        InMemoryBlobStore {
            stall: true,
            ..Self::new()
        }
    }

    /// Get a completed object's contents (for testing)
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().objects.get(key).cloned()
    }

    /// Keys of all completed objects, sorted (for testing)
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of completed objects (for testing)
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if no objects have been completed (for testing)
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    /// Number of uploads ever started (for testing)
    pub fn uploads_started(&self) -> u64 {
        self.state.read().uploads_started
    }

    /// Number of uploads aborted (for testing)
    pub fn uploads_aborted(&self) -> u64 {
        self.state.read().uploads_aborted
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryUpload {
    key: String,
    buffer: Vec<u8>,
    state: Arc<RwLock<InMemoryState>>,
    stall: bool,
}

impl BlobUpload for InMemoryUpload {
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.stall {
                futures::future::pending::<()>().await;
            }
            self.buffer.extend_from_slice(chunk);
            Ok(())
        })
    }

    fn complete(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let this = *self;
            if this.stall {
                futures::future::pending::<()>().await;
            }
            let mut state = this.state.write();
            state.objects.insert(this.key, this.buffer);
            state.uploads_completed += 1;
            Ok(())
        })
    }

    fn abort(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.state.write().uploads_aborted += 1;
            Ok(())
        })
    }
}

impl BlobStore for InMemoryBlobStore {
    fn start_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Box<dyn BlobUpload>> {
        Box::pin(async move {
            self.state.write().uploads_started += 1;
            Ok(Box::new(InMemoryUpload {
                key: key.to_string(),
                buffer: Vec::new(),
                state: Arc::clone(&self.state),
                stall: self.stall,
            }) as Box<dyn BlobUpload>)
        })
    }
}

// ============================================================================
// LocalFsBlobStore - For development
// ============================================================================

/// Local filesystem blob store for development and testing
///
/// Multipart semantics are modelled as write-to-temp then rename on
/// complete, so a partial upload never becomes visible under its key.
#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    base_path: PathBuf,
}

impl LocalFsBlobStore {
    /// Create a new local filesystem blob store
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsBlobStore { base_path }
    }

    /// Create with a temporary directory (for tests)
    pub fn temp() -> IoResult<Self> {
        let dir = crate::recording::config::temp_directory();
        std::fs::create_dir_all(&dir)?;
        Ok(LocalFsBlobStore::new(dir))
    }

    /// Get the base path (for testing)
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn final_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn partial_path(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(".partial").join(upload_id)
    }
}

struct LocalFsUpload {
    file: tokio::fs::File,
    partial: PathBuf,
    target: PathBuf,
}

impl BlobUpload for LocalFsUpload {
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            self.file.write_all(chunk).await
        })
    }

    fn complete(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let LocalFsUpload {
                mut file,
                partial,
                target,
            } = *self;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&partial, &target).await
        })
    }

    fn abort(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let LocalFsUpload { file, partial, .. } = *self;
            drop(file);
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }
}

impl BlobStore for LocalFsBlobStore {
    fn start_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Box<dyn BlobUpload>> {
        Box::pin(async move {
            if key.is_empty() || key.contains("..") {
                return Err(IoError::new(
                    ErrorKind::InvalidInput,
                    format!("invalid object key: {}", key),
                ));
            }

            let upload_id = uuid::Uuid::new_v4().to_string();
            let partial = self.partial_path(&upload_id);
            if let Some(parent) = partial.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(&partial).await?;

            Ok(Box::new(LocalFsUpload {
                file,
                partial,
                target: self.final_path(key),
            }) as Box<dyn BlobUpload>)
        })
    }
}
