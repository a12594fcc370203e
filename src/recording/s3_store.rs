//! S3 Blob Store Implementation
//!
//! Production object store backed by the `object_store` crate from the
//! Arrow ecosystem. Supports AWS S3 and S3-compatible services (MinIO,
//! LocalStack) via a custom endpoint.
//!
//! Multipart parts are buffered to the S3 minimum part size before being
//! submitted; `abort` maps to the store's multipart abort so partial
//! uploads never become visible.

use crate::recording::blob_store::{BlobStore, BlobUpload, StoreFuture};
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{MultipartUpload, ObjectStore as ObjectStoreTrait, PutPayload};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// Minimum part size S3 accepts for non-terminal multipart parts
const PART_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// S3 configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Destination bucket
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// S3 blob store for production deployments
#[derive(Clone)]
pub struct S3BlobStore {
    store: Arc<dyn ObjectStoreTrait>,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    ///
    /// Credentials come from the standard environment variables:
    /// - AWS_ACCESS_KEY_ID
    /// - AWS_SECRET_ACCESS_KEY
    pub fn new(config: S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        builder = builder
            .with_access_key_id(std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default())
            .with_secret_access_key(std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3BlobStore {
            store: Arc::new(store),
        })
    }

    /// Create from an existing object store (for testing)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>) -> Self {
        S3BlobStore { store }
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => {
                IoError::new(ErrorKind::NotFound, err.to_string())
            }
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore").finish()
    }
}

struct S3Upload {
    upload: Box<dyn MultipartUpload>,
    /// Bytes accumulated towards the next part
    buffer: Vec<u8>,
}

impl S3Upload {
    async fn submit_buffered_part(&mut self) -> IoResult<()> {
        let part = Bytes::from(std::mem::take(&mut self.buffer));
        self.upload
            .put_part(PutPayload::from(part))
            .await
            .map_err(S3BlobStore::map_error)
    }
}

impl BlobUpload for S3Upload {
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.buffer.extend_from_slice(chunk);
            while self.buffer.len() >= PART_SIZE_BYTES {
                let remainder = self.buffer.split_off(PART_SIZE_BYTES);
                let part = Bytes::from(std::mem::replace(&mut self.buffer, remainder));
                self.upload
                    .put_part(PutPayload::from(part))
                    .await
                    .map_err(S3BlobStore::map_error)?;
            }
            Ok(())
        })
    }

    fn complete(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let mut this = *self;
            if !this.buffer.is_empty() {
                this.submit_buffered_part().await?;
            }
            this.upload
                .complete()
                .await
                .map(|_| ())
                .map_err(S3BlobStore::map_error)
        })
    }

    fn abort(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let mut this = *self;
            this.upload.abort().await.map_err(S3BlobStore::map_error)
        })
    }
}

impl BlobStore for S3BlobStore {
    fn start_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Box<dyn BlobUpload>> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            let upload = self
                .store
                .put_multipart(&path)
                .await
                .map_err(Self::map_error)?;
            Ok(Box::new(S3Upload {
                upload,
                buffer: Vec::new(),
            }) as Box<dyn BlobUpload>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_upload_roundtrip_through_object_store() {
        let backing = Arc::new(InMemory::new());
        let store = S3BlobStore::from_store(backing.clone());

        let mut upload = store
            .start_upload("session_recordings/team_id/1/session_id/s1/data/100-200")
            .await
            .unwrap();
        upload.write(b"hello ").await.unwrap();
        upload.write(b"world").await.unwrap();
        upload.complete().await.unwrap();

        let path =
            ObjectPath::from("session_recordings/team_id/1/session_id/s1/data/100-200");
        let result = backing.get(&path).await.unwrap();
        let data = result.bytes().await.unwrap();
        assert_eq!(data.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_no_object() {
        let backing = Arc::new(InMemory::new());
        let store = S3BlobStore::from_store(backing.clone());

        let mut upload = store.start_upload("data/aborted").await.unwrap();
        upload.write(b"junk").await.unwrap();
        upload.abort().await.unwrap();

        let path = ObjectPath::from("data/aborted");
        assert!(backing.get(&path).await.is_err());
    }
}
