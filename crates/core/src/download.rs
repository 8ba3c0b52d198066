//! Fetching the job's source audio into its workspace.
//!
//! HTTP(S) locators are downloaded with the download retry policy; `s3://bucket/key`
//! and bare object keys go through the [`StorageClient`].

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};
use url::Url;

use crate::logging::redact_sensitive_text;
use crate::retry::{Retrier, RetryPolicy, Retryable};
use crate::storage::StorageClient;

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const INPUT_FILE_STEM: &str = "input";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLocator {
    Http(Url),
    Object { bucket: Option<String>, key: String },
}

impl InputLocator {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("input locator is empty");
        }

        if !raw.contains("://") {
            return Ok(Self::Object {
                bucket: None,
                key: raw.trim_start_matches('/').to_string(),
            });
        }

        let parsed = Url::parse(raw)
            .with_context(|| format!("invalid input locator: {}", redact_sensitive_text(raw)))?;

        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http(parsed)),
            "s3" => {
                let bucket = parsed
                    .host_str()
                    .filter(|bucket| !bucket.is_empty())
                    .context("s3 locator is missing a bucket")?
                    .to_string();
                let key = parsed.path().trim_start_matches('/').to_string();
                if key.is_empty() {
                    bail!("s3 locator is missing an object key");
                }
                Ok(Self::Object {
                    bucket: Some(bucket),
                    key,
                })
            }
            scheme => bail!(
                "unsupported input locator scheme '{scheme}' for '{}' (expected http, https or s3)",
                redacted_url_for_display(&parsed)
            ),
        }
    }

    /// Printable form with query strings and credentials removed.
    pub fn display(&self) -> String {
        match self {
            Self::Http(url) => redacted_url_for_display(url),
            Self::Object {
                bucket: Some(bucket),
                key,
            } => format!("s3://{bucket}/{key}"),
            Self::Object { bucket: None, key } => key.clone(),
        }
    }
}

/// Input file extension for a response/object content type. Unknown types are treated as wav.
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match essence.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/ogg" => "ogg",
        _ => "wav",
    }
}

pub fn input_file_name(content_type: Option<&str>) -> String {
    format!("{INPUT_FILE_STEM}.{}", extension_for_content_type(content_type))
}

#[derive(Debug, Clone)]
pub struct InputFetcher {
    client: reqwest::blocking::Client,
    retrier: Retrier,
    storage: StorageClient,
}

impl InputFetcher {
    pub fn new(storage: StorageClient, policy: RetryPolicy) -> Result<Self> {
        Self::with_retrier(storage, Retrier::new(policy))
    }

    pub fn with_retrier(storage: StorageClient, retrier: Retrier) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client for input download")?;

        Ok(Self {
            client,
            retrier,
            storage,
        })
    }

    /// Places the source audio in `dest_dir` as `input.<ext>` and returns its path.
    pub fn fetch(&self, locator: &InputLocator, dest_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("failed to create input dir: {}", dest_dir.display()))?;

        let path = match locator {
            InputLocator::Http(url) => self.download_http(url, dest_dir)?,
            InputLocator::Object { bucket, key } => {
                self.fetch_object(bucket.as_deref(), key, dest_dir)?
            }
        };

        let size_bytes = fs::metadata(&path).map(|meta| meta.len()).unwrap_or_default();
        info!(
            source = %locator.display(),
            path = %path.display(),
            size_bytes,
            "Fetched input audio"
        );
        Ok(path)
    }

    fn fetch_object(&self, bucket: Option<&str>, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        if let Some(bucket) = bucket {
            debug!(bucket, key, "Fetching input from the configured storage bucket");
        }

        let metadata = self
            .storage
            .get_object_metadata(key)
            .with_context(|| format!("failed to look up input object {key}"))?;
        let dest = dest_dir.join(input_file_name(metadata.content_type.as_deref()));
        self.storage
            .download_file(key, &dest)
            .with_context(|| format!("failed to download input object {key}"))?;
        Ok(dest)
    }

    fn download_http(&self, url: &Url, dest_dir: &Path) -> Result<PathBuf> {
        let redacted = redacted_url_for_display(url);
        debug!(url = %redacted, "Downloading input audio");

        let result = self
            .retrier
            .run("download_input", || download_once(&self.client, url, &redacted, dest_dir));

        match result {
            Ok(path) => Ok(path),
            Err(DownloadAttemptError {
                retryable: true,
                error,
            }) => Err(anyhow!(
                "download failed after {} attempts for {}: {:#}",
                self.retrier.policy().effective_max_attempts(),
                redacted,
                error
            )),
            Err(attempt_error) => Err(attempt_error.error),
        }
    }
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &Url,
    redacted_url: &str,
    dest_dir: &Path,
) -> std::result::Result<PathBuf, DownloadAttemptError> {
    let mut response = client.get(url.as_str()).send().map_err(|err| {
        DownloadAttemptError::from_reqwest(err, format!("failed to start download from {redacted_url}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let wrapped = anyhow!(
            "download request returned HTTP {} for {}",
            status.as_u16(),
            redacted_url
        );
        return Err(if is_retryable_status(status) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let final_path = dest_dir.join(input_file_name(content_type.as_deref()));
    let tmp_path = part_path(&final_path);

    let _ = fs::remove_file(&tmp_path);
    let mut tmp_file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

    response.copy_to(&mut tmp_file).map_err(|err| {
        DownloadAttemptError::from_reqwest(
            err,
            format!("failed while reading HTTP body from {redacted_url}"),
        )
    })?;

    tmp_file
        .flush()
        .and_then(|()| tmp_file.sync_all())
        .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    drop(tmp_file);

    fs::rename(&tmp_path, &final_path)
        .with_context(|| {
            format!(
                "failed to move {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })
        .map_err(DownloadAttemptError::fatal)?;

    tmp_guard.disarm();
    Ok(final_path)
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

struct DownloadAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl DownloadAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }

    /// Keeps the transport error as the cause. Its URL is dropped so query secrets stay out
    /// of logs and webhooks.
    fn from_reqwest(err: reqwest::Error, context: String) -> Self {
        let retryable = is_retryable_reqwest_error(&err);
        let wrapped = anyhow::Error::new(err.without_url()).context(context);
        if retryable {
            Self::retryable(wrapped)
        } else {
            Self::fatal(wrapped)
        }
    }
}

impl fmt::Display for DownloadAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl Retryable for DownloadAttemptError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(self.path);
        }
    }
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    if !redacted.username().is_empty() || redacted.password().is_some() {
        let _ = redacted.set_username("");
        let _ = redacted.set_password(None);
    }
    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;

    use tempfile::tempdir;

    use crate::retry::RecordingSleeper;
    use crate::storage::LocalBackend;

    enum ServerResponse {
        Audio {
            content_type: &'static str,
            body: Vec<u8>,
        },
        Status {
            code: u16,
            reason: &'static str,
        },
        TruncatedBody {
            announced_len: usize,
            sent: Vec<u8>,
        },
    }

    fn spawn_sequence_server(
        responses: Vec<ServerResponse>,
    ) -> (String, Arc<AtomicUsize>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_for_thread = Arc::clone(&request_count);

        let handle = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                request_count_for_thread.fetch_add(1, Ordering::SeqCst);
                consume_request_headers(&mut stream);

                match response {
                    ServerResponse::Audio { content_type, body } => {
                        write_response(&mut stream, 200, "OK", Some(content_type), body.len(), &body)
                    }
                    ServerResponse::Status { code, reason } => {
                        write_response(&mut stream, code, reason, None, 4, b"nope")
                    }
                    ServerResponse::TruncatedBody {
                        announced_len,
                        sent,
                    } => write_response(
                        &mut stream,
                        200,
                        "OK",
                        Some("audio/wav"),
                        announced_len,
                        &sent,
                    ),
                }
                let _ = stream.flush();
            }
        });

        (format!("http://{addr}"), request_count, handle)
    }

    fn consume_request_headers(stream: &mut TcpStream) {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buffer = [0u8; 4096];
        let _ = stream.read(&mut buffer);
    }

    fn write_response(
        stream: &mut TcpStream,
        status: u16,
        reason: &str,
        content_type: Option<&str>,
        content_len: usize,
        body: &[u8],
    ) {
        let content_type = content_type
            .map(|value| format!("Content-Type: {value}\r\n"))
            .unwrap_or_default();
        let headers = format!(
            "HTTP/1.1 {status} {reason}\r\n{content_type}Content-Length: {content_len}\r\nConnection: close\r\n\r\n"
        );
        let _ = stream.write_all(headers.as_bytes());
        let _ = stream.write_all(body);
    }

    fn fetcher(storage_root: &Path) -> (InputFetcher, Arc<RecordingSleeper>) {
        let storage = StorageClient::new(
            Arc::new(LocalBackend::new(storage_root).unwrap()),
            Retrier::with_sleeper(RetryPolicy::no_retry(), Arc::new(RecordingSleeper::new())),
        );
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrier = Retrier::with_sleeper(RetryPolicy::download_default(), sleeper.clone());
        (InputFetcher::with_retrier(storage, retrier).unwrap(), sleeper)
    }

    fn assert_no_part_files(dir: &Path) {
        let leftovers: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "leftover part files: {leftovers:?}");
    }

    #[test]
    fn parses_http_s3_and_bare_key_locators() {
        assert!(matches!(
            InputLocator::parse("https://cdn.example.com/a.mp3").unwrap(),
            InputLocator::Http(_)
        ));
        assert_eq!(
            InputLocator::parse("s3://uploads/v1/source.flac").unwrap(),
            InputLocator::Object {
                bucket: Some("uploads".to_string()),
                key: "v1/source.flac".to_string()
            }
        );
        assert_eq!(
            InputLocator::parse("/v1/source.flac").unwrap(),
            InputLocator::Object {
                bucket: None,
                key: "v1/source.flac".to_string()
            }
        );
        assert!(InputLocator::parse("   ").is_err());
        assert!(InputLocator::parse("s3://uploads/").is_err());

        let error = InputLocator::parse("ftp://files.example.com/a.wav?token=hush").unwrap_err();
        assert!(error.to_string().contains("unsupported input locator scheme"));
        assert!(!error.to_string().contains("hush"));
    }

    #[test]
    fn content_type_maps_to_extension() {
        assert_eq!(extension_for_content_type(Some("audio/x-wav")), "wav");
        assert_eq!(extension_for_content_type(Some("audio/wave")), "wav");
        assert_eq!(extension_for_content_type(Some("audio/mpeg")), "mp3");
        assert_eq!(extension_for_content_type(Some("Audio/MP3; charset=binary")), "mp3");
        assert_eq!(extension_for_content_type(Some("audio/x-flac")), "flac");
        assert_eq!(extension_for_content_type(Some("audio/ogg")), "ogg");
        assert_eq!(extension_for_content_type(Some("application/octet-stream")), "wav");
        assert_eq!(extension_for_content_type(None), "wav");
        assert_eq!(input_file_name(Some("audio/flac")), "input.flac");
    }

    #[test]
    fn downloads_http_input_named_by_content_type() {
        let scratch = tempdir().unwrap();
        let (base_url, request_count, server) = spawn_sequence_server(vec![ServerResponse::Audio {
            content_type: "audio/mpeg",
            body: b"ID3-mp3-bytes".to_vec(),
        }]);
        let (fetcher, _) = fetcher(&scratch.path().join("bucket"));
        let workspace = scratch.path().join("ws");

        let locator = InputLocator::parse(&format!("{base_url}/song.mp3?sig=abc")).unwrap();
        let path = fetcher.fetch(&locator, &workspace).unwrap();
        server.join().unwrap();

        assert_eq!(path, workspace.join("input.mp3"));
        assert_eq!(fs::read(&path).unwrap(), b"ID3-mp3-bytes");
        assert_eq!(request_count.load(Ordering::SeqCst), 1);
        assert_no_part_files(&workspace);
    }

    #[test]
    fn retries_retryable_status_then_succeeds() {
        let scratch = tempdir().unwrap();
        let (base_url, request_count, server) = spawn_sequence_server(vec![
            ServerResponse::Status {
                code: 503,
                reason: "Service Unavailable",
            },
            ServerResponse::Audio {
                content_type: "audio/wav",
                body: b"RIFF".to_vec(),
            },
        ]);
        let (fetcher, sleeper) = fetcher(&scratch.path().join("bucket"));
        let workspace = scratch.path().join("ws");

        let locator = InputLocator::parse(&format!("{base_url}/a.wav")).unwrap();
        let path = fetcher.fetch(&locator, &workspace).unwrap();
        server.join().unwrap();

        assert_eq!(request_count.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(250)]);
        assert_eq!(fs::read(path).unwrap(), b"RIFF");
    }

    #[test]
    fn client_error_fails_without_retry_or_leaking_query() {
        let scratch = tempdir().unwrap();
        let (base_url, request_count, server) = spawn_sequence_server(vec![ServerResponse::Status {
            code: 404,
            reason: "Not Found",
        }]);
        let (fetcher, sleeper) = fetcher(&scratch.path().join("bucket"));
        let workspace = scratch.path().join("ws");

        let locator = InputLocator::parse(&format!("{base_url}/gone.wav?token=top-secret")).unwrap();
        let error = fetcher.fetch(&locator, &workspace).unwrap_err();
        server.join().unwrap();

        let message = format!("{error:#}");
        assert!(message.contains("HTTP 404"), "{message}");
        assert!(!message.contains("top-secret"), "{message}");
        assert_eq!(request_count.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
        assert_no_part_files(&workspace);
    }

    #[test]
    fn refused_connection_keeps_transport_cause() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let scratch = tempdir().unwrap();
        let (fetcher, sleeper) = fetcher(&scratch.path().join("bucket"));
        let workspace = scratch.path().join("ws");

        let locator = InputLocator::parse(&format!("http://{addr}/song.wav?sig=classified")).unwrap();
        let error = fetcher.fetch(&locator, &workspace).unwrap_err();

        let message = format!("{error:#}");
        assert!(message.contains("failed to start download from"), "{message}");
        assert!(message.contains("error sending request"), "{message}");
        assert!(!message.contains("classified"), "{message}");
        assert_eq!(sleeper.delays().len(), 2);
        assert_no_part_files(&workspace);
    }

    #[test]
    fn truncated_bodies_exhaust_retries_and_clean_part_file() {
        let scratch = tempdir().unwrap();
        let responses = (0..3)
            .map(|_| ServerResponse::TruncatedBody {
                announced_len: 64,
                sent: b"tiny".to_vec(),
            })
            .collect();
        let (base_url, request_count, server) = spawn_sequence_server(responses);
        let (fetcher, sleeper) = fetcher(&scratch.path().join("bucket"));
        let workspace = scratch.path().join("ws");

        let locator = InputLocator::parse(&format!("{base_url}/broken.wav?api_key=hush")).unwrap();
        let error = fetcher.fetch(&locator, &workspace).unwrap_err();
        server.join().unwrap();

        let message = error.to_string();
        assert!(message.contains("download failed after 3 attempts"), "{message}");
        assert!(message.contains("failed while reading HTTP body"), "{message}");
        assert!(!message.contains("hush"), "{message}");
        assert_eq!(request_count.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays().len(), 2);
        assert!(!workspace.join("input.wav").exists());
        assert_no_part_files(&workspace);
    }

    #[test]
    fn fetches_object_key_through_storage() {
        let scratch = tempdir().unwrap();
        let bucket = scratch.path().join("bucket");
        let (fetcher, _) = fetcher(&bucket);
        let source = scratch.path().join("upload.flac");
        fs::write(&source, b"fLaC").unwrap();
        fetcher
            .storage
            .upload_file(&source, "uploads/v1.flac", Some("audio/flac"))
            .unwrap();

        let workspace = scratch.path().join("ws");
        let path = fetcher
            .fetch(&InputLocator::parse("s3://stems/uploads/v1.flac").unwrap(), &workspace)
            .unwrap();
        assert_eq!(path, workspace.join("input.flac"));
        assert_eq!(fs::read(path).unwrap(), b"fLaC");

        let missing = fetcher
            .fetch(&InputLocator::parse("uploads/missing.wav").unwrap(), &workspace)
            .unwrap_err();
        assert!(format!("{missing:#}").contains("object not found"));
    }
}
