//! Object storage client.
//!
//! [`StorageClient`] is the only way the rest of the crate talks to object storage. Each
//! operation is a single backend call wrapped by the storage [`Retrier`]; backends report
//! failures through the closed [`StorageError`] classification so the retry decision never
//! depends on error text.

pub mod local;
pub mod s3;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{StorageBackendKind, StorageConfig};
use crate::retry::{Retrier, RetryPolicy, Retryable};

pub use local::LocalBackend;
pub use s3::S3Backend;

pub const DEFAULT_LIST_MAX_KEYS: usize = 1000;
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);

/// Service error codes that describe a transient condition.
pub const RETRYABLE_ERROR_CODES: [&str; 12] = [
    "ThrottlingException",
    "Throttling",
    "RequestTimeout",
    "RequestTimeoutException",
    "ServiceUnavailable",
    "InternalError",
    "InternalServerError",
    "SlowDown",
    "TooManyRequests",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "RequestThrottled",
];

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection error during {operation}: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },
    #[error("timed out during {operation}: {message}")]
    Timeout {
        operation: &'static str,
        message: String,
    },
    #[error("storage service returned {code} during {operation}: {message}")]
    Service {
        operation: &'static str,
        code: String,
        message: String,
    },
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("S3 bucket not configured")]
    NotConfigured,
    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("local storage I/O failed for {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} is not supported by the {backend} storage backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error("invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn code(&self) -> &str {
        match self {
            Self::Connection { .. } => "ConnectionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Service { code, .. } => code.as_str(),
            Self::NotFound { .. } => "NoSuchKey",
            Self::NotConfigured => "BucketNotConfigured",
            Self::InvalidKey { .. } => "InvalidObjectName",
            Self::LocalIo { .. } => "LocalIoError",
            Self::Unsupported { .. } => "NotImplemented",
            Self::Config(_) => "InvalidConfiguration",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn local_io(path: &Path, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_ERROR_CODES.contains(&code)
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Service { code, .. } => is_retryable_code(code),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Put,
}

/// One raw call per method; no retries happen at this level.
pub trait ObjectBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<(), StorageError>;

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError>;

    fn head(&self, key: &str) -> Result<ObjectMetadata, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    fn list(&self, prefix: Option<&str>, max_keys: usize)
        -> Result<Vec<ObjectMetadata>, StorageError>;

    fn get_tags(&self, key: &str) -> Result<Tags, StorageError>;

    fn put_tags(&self, key: &str, tags: &Tags) -> Result<(), StorageError>;

    fn presign(
        &self,
        method: PresignMethod,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    /// Public location of `key`, as reported in webhooks.
    fn object_url(&self, key: &str) -> String;
}

#[derive(Clone)]
pub struct StorageClient {
    backend: Arc<dyn ObjectBackend>,
    retrier: Retrier,
    presign_expiry: Duration,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("backend", &self.backend.name())
            .field("retrier", &self.retrier)
            .field("presign_expiry", &self.presign_expiry)
            .finish()
    }
}

impl StorageClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, retrier: Retrier) -> Self {
        Self {
            backend,
            retrier,
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
        }
    }

    /// Builds the configured backend. The S3 connection itself is created on first use.
    pub fn from_config(config: &StorageConfig, policy: RetryPolicy) -> Result<Self, StorageError> {
        let backend: Arc<dyn ObjectBackend> = match config.backend {
            StorageBackendKind::S3 => Arc::new(S3Backend::new(config.clone())),
            StorageBackendKind::Local => Arc::new(LocalBackend::new(&config.local_root)?),
        };

        Ok(Self::new(backend, Retrier::new(policy))
            .with_presign_expiry(Duration::from_secs(config.presign_expiry_secs)))
    }

    pub fn with_presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn object_url(&self, key: &str) -> String {
        self.backend.object_url(key)
    }

    /// Uploads `path` under `key` and returns the object's URL. The content type is
    /// guessed from the file extension when not given.
    pub fn upload_file(
        &self,
        path: &Path,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let content_type = content_type.map(ToString::to_string).unwrap_or_else(|| {
            mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

        self.retrier.run("upload_file", || {
            self.backend.put_file(path, key, &content_type)
        })?;

        let url = self.backend.object_url(key);
        info!(key, url = %url, "Uploaded object");
        Ok(url)
    }

    pub fn download_file(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        self.retrier
            .run("download_file", || self.backend.get_to_file(key, dest))?;
        info!(key, dest = %dest.display(), "Downloaded object");
        Ok(())
    }

    pub fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.retrier.run("object_exists", || self.backend.head(key)) {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.retrier.run("delete_object", || self.backend.delete(key))?;
        info!(key, "Deleted object");
        Ok(())
    }

    /// Deletes every key and returns how many were removed.
    pub fn delete_objects(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for key in keys {
            self.retrier
                .run("delete_objects", || self.backend.delete(key))?;
            deleted += 1;
        }
        info!(count = deleted, "Deleted objects");
        Ok(deleted)
    }

    pub fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.retrier
            .run("copy_object", || self.backend.copy(from, to))?;
        info!(from, to, "Copied object");
        Ok(())
    }

    pub fn get_object_metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        self.retrier
            .run("get_object_metadata", || self.backend.head(key))
    }

    pub fn list_objects(
        &self,
        prefix: Option<&str>,
        max_keys: usize,
    ) -> Result<Vec<ObjectMetadata>, StorageError> {
        self.retrier
            .run("list_objects", || self.backend.list(prefix, max_keys))
    }

    pub fn get_object_tags(&self, key: &str) -> Result<Tags, StorageError> {
        self.retrier
            .run("get_object_tags", || self.backend.get_tags(key))
    }

    pub fn set_object_tags(&self, key: &str, tags: &Tags) -> Result<(), StorageError> {
        self.retrier
            .run("set_object_tags", || self.backend.put_tags(key, tags))
    }

    /// Merges `tags` into the object's existing tags; new values win.
    pub fn update_object_tags(&self, key: &str, tags: &Tags) -> Result<Tags, StorageError> {
        let mut merged = self.get_object_tags(key)?;
        merged.extend(tags.iter().map(|(name, value)| (name.clone(), value.clone())));
        self.set_object_tags(key, &merged)?;
        Ok(merged)
    }

    pub fn delete_object_tags(&self, key: &str) -> Result<(), StorageError> {
        self.set_object_tags(key, &Tags::new())
    }

    /// Lists objects under `prefix` whose tags contain every pair in `required`.
    pub fn list_objects_by_tags(
        &self,
        prefix: Option<&str>,
        required: &Tags,
    ) -> Result<Vec<ObjectMetadata>, StorageError> {
        let candidates = self.list_objects(prefix, DEFAULT_LIST_MAX_KEYS)?;
        let mut matching = Vec::new();

        for object in candidates {
            let tags = match self.get_object_tags(&object.key) {
                Ok(tags) => tags,
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            };
            if required
                .iter()
                .all(|(name, value)| tags.get(name) == Some(value))
            {
                matching.push(object);
            }
        }

        Ok(matching)
    }

    pub fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, StorageError> {
        let expires_in = expires_in.unwrap_or(self.presign_expiry);
        self.retrier.run("presigned_get_url", || {
            self.backend.presign(PresignMethod::Get, key, expires_in)
        })
    }

    pub fn presigned_put_url(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, StorageError> {
        let expires_in = expires_in.unwrap_or(self.presign_expiry);
        self.retrier.run("presigned_put_url", || {
            self.backend.presign(PresignMethod::Put, key, expires_in)
        })
    }

    /// Lists at most one key. Never returns an error.
    pub fn test_connection(&self) -> bool {
        match self.backend.list(None, 1) {
            Ok(_) => {
                info!(backend = self.backend.name(), "Storage connection test succeeded");
                true
            }
            Err(error) => {
                warn!(
                    backend = self.backend.name(),
                    error = %error,
                    "Storage connection test failed"
                );
                false
            }
        }
    }
}
