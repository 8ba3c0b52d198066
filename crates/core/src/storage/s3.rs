//! S3 (and S3-compatible) backend built on `object_store`.
//!
//! The connection is created lazily on first use and owns a private current-thread
//! runtime, so callers stay fully blocking. `object_store`'s internal retries are switched
//! off; the storage [`Retrier`](crate::retry::Retrier) is the only retry layer.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{
    Attribute, AttributeValue, Attributes, ClientOptions, GetOptions, ObjectStore,
    PutMultipartOpts, PutOptions, PutPayload, RetryConfig, WriteMultipart,
};
use tracing::debug;

use super::{ObjectBackend, ObjectMetadata, PresignMethod, StorageError, Tags};
use crate::config::StorageConfig;

const TAG_METADATA_PREFIX: &str = "tag-";
/// Files larger than this go up as a multipart upload in parts of this size.
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

struct Connection {
    store: AmazonS3,
    runtime: tokio::runtime::Runtime,
}

pub struct S3Backend {
    config: StorageConfig,
    connection: OnceLock<Connection>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.config.bucket)
            .field("region", &self.config.region)
            .field("endpoint", &self.config.endpoint)
            .field("connected", &self.connection.get().is_some())
            .finish()
    }
}

impl S3Backend {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            connection: OnceLock::new(),
        }
    }

    fn bucket(&self) -> Result<&str, StorageError> {
        self.config
            .bucket
            .as_deref()
            .map(str::trim)
            .filter(|bucket| !bucket.is_empty())
            .ok_or(StorageError::NotConfigured)
    }

    fn connection(&self) -> Result<&Connection, StorageError> {
        if let Some(connection) = self.connection.get() {
            return Ok(connection);
        }

        let built = self.connect()?;
        Ok(self.connection.get_or_init(|| built))
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let bucket = self.bucket()?;
        let config = &self.config;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(config.region.as_str())
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            })
            .with_client_options(
                ClientOptions::new()
                    .with_timeout(Duration::from_secs(config.request_timeout_secs))
                    .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs)),
            );

        if let Some(endpoint) = config.endpoint.as_deref().filter(|value| !value.is_empty()) {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }
        if let Some(access_key_id) = config.access_key_id.as_deref() {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret_access_key) = config.secret_access_key.as_deref() {
            builder = builder.with_secret_access_key(secret_access_key);
        }

        let store = builder
            .build()
            .map_err(|error| StorageError::Config(format!("S3: {error}")))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| StorageError::Config(format!("failed to create S3 runtime: {error}")))?;

        debug!(
            bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "Created S3 connection"
        );
        Ok(Connection { store, runtime })
    }

    fn object_path(key: &str) -> Result<ObjectPath, StorageError> {
        ObjectPath::parse(key).map_err(|error| StorageError::InvalidKey {
            key: key.to_string(),
            reason: error.to_string(),
        })
    }

    async fn rewrite_attributes(
        store: &AmazonS3,
        location: &ObjectPath,
        key: &str,
        tags: &Tags,
    ) -> Result<(), StorageError> {
        let current = store
            .get(location)
            .await
            .map_err(|error| classify("put_tags", key, error))?;

        let mut attributes = Attributes::new();
        for (attribute, value) in current.attributes.iter() {
            let is_tag = matches!(
                attribute,
                Attribute::Metadata(name) if name.starts_with(TAG_METADATA_PREFIX)
            );
            if !is_tag {
                attributes.insert(attribute.clone(), value.clone());
            }
        }
        for (name, value) in tags {
            attributes.insert(
                Attribute::Metadata(Cow::Owned(format!("{TAG_METADATA_PREFIX}{name}"))),
                AttributeValue::from(value.clone()),
            );
        }

        let body = current
            .bytes()
            .await
            .map_err(|error| classify("put_tags", key, error))?;
        store
            .put_opts(
                location,
                PutPayload::from(body),
                PutOptions {
                    attributes,
                    ..PutOptions::default()
                },
            )
            .await
            .map_err(|error| classify("put_tags", key, error))?;
        Ok(())
    }
}

impl Drop for S3Backend {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.runtime.shutdown_background();
        }
    }
}

impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<(), StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );

        connection.runtime.block_on(put_file_streaming(
            &connection.store,
            &location,
            path,
            key,
            attributes,
            UPLOAD_PART_SIZE,
        ))
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;
        let partial = partial_path(dest);

        let result = connection.runtime.block_on(async {
            let response = connection
                .store
                .get(&location)
                .await
                .map_err(|error| classify("get_to_file", key, error))?;

            let mut file = fs::File::create(&partial)
                .map_err(|error| StorageError::local_io(&partial, error))?;
            let mut stream = response.into_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|error| classify("get_to_file", key, error))?;
                file.write_all(&chunk)
                    .map_err(|error| StorageError::local_io(&partial, error))?;
            }
            file.sync_all()
                .map_err(|error| StorageError::local_io(&partial, error))
        });

        if let Err(error) = result {
            let _ = fs::remove_file(&partial);
            return Err(error);
        }

        fs::rename(&partial, dest).map_err(|error| StorageError::local_io(dest, error))
    }

    fn head(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;

        connection.runtime.block_on(async {
            let response = connection
                .store
                .get_opts(
                    &location,
                    GetOptions {
                        head: true,
                        ..GetOptions::default()
                    },
                )
                .await
                .map_err(|error| classify("head", key, error))?;

            let mut content_type = None;
            let mut metadata = BTreeMap::new();
            for (attribute, value) in response.attributes.iter() {
                match attribute {
                    Attribute::ContentType => content_type = Some(value.to_string()),
                    Attribute::Metadata(name) => {
                        metadata.insert(name.to_string(), value.to_string());
                    }
                    _ => {}
                }
            }

            Ok(ObjectMetadata {
                key: key.to_string(),
                size_bytes: response.meta.size as u64,
                last_modified: Some(response.meta.last_modified),
                etag: response.meta.e_tag.clone(),
                content_type,
                metadata,
            })
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;
        connection.runtime.block_on(async {
            connection
                .store
                .delete(&location)
                .await
                .map_err(|error| classify("delete", key, error))
        })
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let connection = self.connection()?;
        let source = Self::object_path(from)?;
        let dest = Self::object_path(to)?;
        connection.runtime.block_on(async {
            connection
                .store
                .copy(&source, &dest)
                .await
                .map_err(|error| classify("copy", from, error))
        })
    }

    fn list(
        &self,
        prefix: Option<&str>,
        max_keys: usize,
    ) -> Result<Vec<ObjectMetadata>, StorageError> {
        let connection = self.connection()?;
        let prefix_path = match prefix.filter(|prefix| !prefix.is_empty()) {
            Some(prefix) => Some(Self::object_path(prefix.trim_end_matches('/'))?),
            None => None,
        };

        connection.runtime.block_on(async {
            let mut stream = connection.store.list(prefix_path.as_ref());
            let mut objects = Vec::new();
            while objects.len() < max_keys {
                let Some(entry) = stream.next().await else {
                    break;
                };
                let meta = entry.map_err(|error| classify("list", prefix.unwrap_or(""), error))?;
                let key = meta.location.to_string();
                if prefix.is_some_and(|prefix| !key.starts_with(prefix)) {
                    continue;
                }
                objects.push(ObjectMetadata {
                    key,
                    size_bytes: meta.size as u64,
                    last_modified: Some(meta.last_modified),
                    etag: meta.e_tag,
                    content_type: None,
                    metadata: BTreeMap::new(),
                });
            }
            Ok(objects)
        })
    }

    fn get_tags(&self, key: &str) -> Result<Tags, StorageError> {
        let metadata = self.head(key)?;
        Ok(metadata
            .metadata
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(TAG_METADATA_PREFIX)
                    .map(|tag| (tag.to_string(), value))
            })
            .collect())
    }

    fn put_tags(&self, key: &str, tags: &Tags) -> Result<(), StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;
        connection
            .runtime
            .block_on(Self::rewrite_attributes(&connection.store, &location, key, tags))
    }

    fn presign(
        &self,
        method: PresignMethod,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let connection = self.connection()?;
        let location = Self::object_path(key)?;
        let http_method = match method {
            PresignMethod::Get => reqwest::Method::GET,
            PresignMethod::Put => reqwest::Method::PUT,
        };

        connection.runtime.block_on(async {
            connection
                .store
                .signed_url(http_method, &location, expires_in)
                .await
                .map(|url| url.to_string())
                .map_err(|error| classify("presign", key, error))
        })
    }

    fn object_url(&self, key: &str) -> String {
        let bucket = self.config.bucket.as_deref().unwrap_or_default();
        object_url_for(
            self.config.endpoint.as_deref(),
            bucket,
            &self.config.region,
            key,
        )
    }
}

/// `<endpoint>/<bucket>/<key>` for custom endpoints, virtual-hosted AWS URLs otherwise.
pub fn object_url_for(endpoint: Option<&str>, bucket: &str, region: &str, key: &str) -> String {
    match endpoint.map(str::trim).filter(|endpoint| !endpoint.is_empty()) {
        Some(endpoint) => format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/')),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

/// Uploads `path` without holding it in memory. Files up to one part are sent with a
/// single PUT; larger files are streamed part by part and the upload is aborted on error.
async fn put_file_streaming<S: ObjectStore + ?Sized>(
    store: &S,
    location: &ObjectPath,
    path: &Path,
    key: &str,
    attributes: Attributes,
    part_size: usize,
) -> Result<(), StorageError> {
    let mut file = fs::File::open(path).map_err(|error| StorageError::local_io(path, error))?;
    let len = file
        .metadata()
        .map_err(|error| StorageError::local_io(path, error))?
        .len();

    if len <= part_size as u64 {
        let mut body = Vec::with_capacity(len as usize);
        file.read_to_end(&mut body)
            .map_err(|error| StorageError::local_io(path, error))?;
        return store
            .put_opts(
                location,
                PutPayload::from(body),
                PutOptions {
                    attributes,
                    ..PutOptions::default()
                },
            )
            .await
            .map(|_| ())
            .map_err(|error| classify("put_file", key, error));
    }

    let upload = store
        .put_multipart_opts(
            location,
            PutMultipartOpts {
                attributes,
                ..PutMultipartOpts::default()
            },
        )
        .await
        .map_err(|error| classify("put_file", key, error))?;
    let mut writer = WriteMultipart::new_with_chunk_size(upload, part_size);
    let mut buffer = vec![0u8; part_size];

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) => {
                let _ = writer.abort().await;
                return Err(StorageError::local_io(path, error));
            }
        };
        if let Err(error) = writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await {
            let _ = writer.abort().await;
            return Err(classify("put_file", key, error));
        }
        writer.write(&buffer[..read]);
    }

    debug!(key, bytes = len, "Finishing multipart upload");
    writer
        .finish()
        .await
        .map(|_| ())
        .map_err(|error| classify("put_file", key, error))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Maps an `object_store` failure onto the closed storage classification.
fn classify(operation: &'static str, key: &str, error: object_store::Error) -> StorageError {
    match error {
        object_store::Error::NotFound { .. } => StorageError::NotFound {
            key: key.to_string(),
        },
        object_store::Error::InvalidPath { source } => StorageError::InvalidKey {
            key: key.to_string(),
            reason: source.to_string(),
        },
        object_store::Error::NotSupported { source } => StorageError::Service {
            operation,
            code: "NotImplemented".to_string(),
            message: source.to_string(),
        },
        other => classify_message(operation, other.to_string()),
    }
}

pub(crate) fn classify_message(operation: &'static str, message: String) -> StorageError {
    if let Some(code) = extract_error_code(&message) {
        return StorageError::Service {
            operation,
            code,
            message,
        };
    }

    if let Some(status) = extract_http_status(&message) {
        let code = match status {
            404 => {
                return StorageError::Service {
                    operation,
                    code: "NoSuchKey".to_string(),
                    message,
                }
            }
            408 => "RequestTimeout",
            429 => "TooManyRequests",
            500 => "InternalError",
            503 => "ServiceUnavailable",
            403 => "AccessDenied",
            400 => "BadRequest",
            other => return http_status_error(operation, other, message),
        };
        return StorageError::Service {
            operation,
            code: code.to_string(),
            message,
        };
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        StorageError::Timeout { operation, message }
    } else if lower.contains("connect")
        || lower.contains("error sending request")
        || lower.contains("connection")
        || lower.contains("broken pipe")
    {
        StorageError::Connection { operation, message }
    } else {
        StorageError::Service {
            operation,
            code: "Unknown".to_string(),
            message,
        }
    }
}

fn http_status_error(operation: &'static str, status: u16, message: String) -> StorageError {
    let code = if (500..600).contains(&status) {
        "InternalServerError".to_string()
    } else {
        format!("Http{status}")
    };
    StorageError::Service {
        operation,
        code,
        message,
    }
}

fn extract_error_code(message: &str) -> Option<String> {
    let start = message.find("<Code>")? + "<Code>".len();
    let end = message[start..].find("</Code>")? + start;
    let code = message[start..end].trim();
    (!code.is_empty()).then(|| code.to_string())
}

fn extract_http_status(message: &str) -> Option<u16> {
    message.match_indices("status").find_map(|(index, marker)| {
        let rest = message[index + marker.len()..].trim_start_matches([' ', ':']);
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.len() == 3 {
            digits.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::retry::Retryable;

    use object_store::memory::InMemory;

    async fn stored(store: &InMemory, key: &str) -> (Vec<u8>, Option<String>) {
        let response = store.get(&ObjectPath::from(key)).await.unwrap();
        let content_type = response
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| value.to_string());
        (response.bytes().await.unwrap().to_vec(), content_type)
    }

    fn wav_attributes() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, AttributeValue::from("audio/wav"));
        attributes
    }

    #[tokio::test]
    async fn small_files_are_uploaded_in_one_put() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocals.wav");
        fs::write(&path, b"RIFF-small").unwrap();
        let store = InMemory::new();

        put_file_streaming(
            &store,
            &ObjectPath::from("v1/vocals.wav"),
            &path,
            "v1/vocals.wav",
            wav_attributes(),
            1024,
        )
        .await
        .unwrap();

        let (body, content_type) = stored(&store, "v1/vocals.wav").await;
        assert_eq!(body, b"RIFF-small");
        assert_eq!(content_type.as_deref(), Some("audio/wav"));
    }

    #[tokio::test]
    async fn large_files_are_streamed_in_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drums.wav");
        let content: Vec<u8> = (0..10_000u32).map(|value| (value % 251) as u8).collect();
        fs::write(&path, &content).unwrap();
        let store = InMemory::new();

        put_file_streaming(
            &store,
            &ObjectPath::from("v1/drums.wav"),
            &path,
            "v1/drums.wav",
            wav_attributes(),
            1024,
        )
        .await
        .unwrap();

        let (body, content_type) = stored(&store, "v1/drums.wav").await;
        assert_eq!(body, content);
        assert_eq!(content_type.as_deref(), Some("audio/wav"));
    }

    #[tokio::test]
    async fn missing_source_file_is_a_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemory::new();

        let error = put_file_streaming(
            &store,
            &ObjectPath::from("v1/bass.wav"),
            &dir.path().join("absent.wav"),
            "v1/bass.wav",
            Attributes::new(),
            1024,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, StorageError::LocalIo { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn object_url_uses_endpoint_when_configured() {
        assert_eq!(
            object_url_for(Some("http://minio:9000/"), "stems", "us-east-1", "v1/drums.wav"),
            "http://minio:9000/stems/v1/drums.wav"
        );
        assert_eq!(
            object_url_for(None, "stems", "eu-west-1", "v1/drums.wav"),
            "https://stems.s3.eu-west-1.amazonaws.com/v1/drums.wav"
        );
        assert_eq!(
            object_url_for(Some("  "), "stems", "us-east-1", "k"),
            "https://stems.s3.us-east-1.amazonaws.com/k"
        );
    }

    #[test]
    fn missing_bucket_is_reported_without_connecting() {
        let backend = S3Backend::new(StorageConfig {
            bucket: None,
            ..StorageConfig::default()
        });
        let error = backend
            .head("v1/drums.wav")
            .expect_err("missing bucket should fail");
        assert!(matches!(error, StorageError::NotConfigured));
        assert_eq!(error.to_string(), "S3 bucket not configured");
        assert!(!error.is_retryable());
    }

    #[test]
    fn service_code_is_read_from_xml_body() {
        let message = "Client error with status 503 Service Unavailable: <?xml version=\"1.0\"?><Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>".to_string();
        let error = classify_message("put_file", message);
        assert_eq!(error.code(), "SlowDown");
        assert!(error.is_retryable());
    }

    #[test]
    fn http_status_is_used_when_body_has_no_code() {
        let error = classify_message("head", "Server error with status 500 Internal Server Error".to_string());
        assert_eq!(error.code(), "InternalError");
        assert!(error.is_retryable());

        let error = classify_message("head", "Client error with status: 403 Forbidden".to_string());
        assert_eq!(error.code(), "AccessDenied");
        assert!(!error.is_retryable());

        let error = classify_message("head", "Server error with status 504 Gateway Timeout".to_string());
        assert_eq!(error.code(), "InternalServerError");
        assert!(error.is_retryable());
    }

    #[test]
    fn transport_failures_map_to_connection_and_timeout() {
        let timeout = classify_message("get_to_file", "operation timed out".to_string());
        assert!(matches!(timeout, StorageError::Timeout { .. }));

        let connection = classify_message(
            "get_to_file",
            "error sending request for url (http://127.0.0.1:9/bucket/key)".to_string(),
        );
        assert!(matches!(connection, StorageError::Connection { .. }));
        assert!(connection.is_retryable());

        let unknown = classify_message("get_to_file", "checksum mismatch".to_string());
        assert!(!unknown.is_retryable());
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/ws/input.wav")),
            PathBuf::from("/tmp/ws/input.wav.part")
        );
    }
}
