use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "STEMSPLIT_DATA_DIR";
pub const DEFAULT_WEBHOOK_ALLOWLIST: &str = "https://api.track-tree.com/webhooks/demucs";

const ENV_PORT: &str = "PORT";
const ENV_TOKEN: &str = "DEMUCSSVC_TOKEN";
const ENV_ALLOWLIST: &str = "API_WEBHOOK_URL_ALLOWLIST";
const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT";
const ENV_S3_REGION: &str = "S3_REGION";
const ENV_S3_BUCKET: &str = "S3_BUCKET";
const ENV_S3_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
const ENV_S3_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
const ENV_CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub retry: RetrySettings,
    pub webhook: WebhookConfig,
    pub worker: WorkerConfig,
    pub separator: SeparatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared HMAC secret for inbound requests and outbound webhooks.
    pub token: String,
    pub webhook_allowlist: Vec<String>,
    pub max_timestamp_skew_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub local_root: PathBuf,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub presign_expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub storage: RetryPolicy,
    pub download: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
    /// How long finished job records stay queryable.
    pub result_retention_secs: u64,
    /// Parent directory for job workspaces; the system temp dir when unset.
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeparatorBackendKind {
    #[default]
    Demucs,
    Mock,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    #[default]
    Auto,
    Cuda,
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeparatorConfig {
    pub backend: SeparatorBackendKind,
    pub binary: String,
    pub device: DeviceSelection,
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_visible_devices: Option<String>,
}

impl SecurityConfig {
    /// The shared token signs every request and webhook; running without one is refused.
    pub fn require_token(&self) -> Result<&str> {
        let token = self.token.trim();
        if token.is_empty() {
            bail!("no shared token configured; set {ENV_TOKEN} or security.token");
        }
        Ok(&self.token)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            webhook_allowlist: vec![DEFAULT_WEBHOOK_ALLOWLIST.to_string()],
            max_timestamp_skew_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::S3,
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
            local_root: PathBuf::from("storage"),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            presign_expiry_secs: 3600,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            storage: RetryPolicy::storage_default(),
            download: RetryPolicy::download_default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_capacity: 64,
            soft_time_limit_secs: 1500,
            hard_time_limit_secs: 1800,
            result_retention_secs: 3600,
            workspace_root: None,
        }
    }
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        Self {
            backend: SeparatorBackendKind::Demucs,
            binary: "demucs".to_string(),
            device: DeviceSelection::Auto,
            default_model: "htdemucs".to_string(),
            cuda_visible_devices: None,
        }
    }
}

impl SeparatorConfig {
    /// `auto` picks cuda when `CUDA_VISIBLE_DEVICES` names a device.
    pub fn resolved_device(&self) -> DeviceSelection {
        match self.device {
            DeviceSelection::Auto => {
                let has_gpu = self
                    .cuda_visible_devices
                    .as_deref()
                    .map(str::trim)
                    .is_some_and(|devices| !devices.is_empty() && devices != "-1");
                if has_gpu {
                    DeviceSelection::Cuda
                } else {
                    DeviceSelection::Cpu
                }
            }
            explicit => explicit,
        }
    }
}

impl DeviceSelection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Applies the deployment environment variables on top of the file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(port) = non_empty(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {port}"))?;
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.security.token = token;
        }
        if let Some(allowlist) = non_empty(ENV_ALLOWLIST) {
            self.security.webhook_allowlist = allowlist
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(endpoint) = non_empty(ENV_S3_ENDPOINT) {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(region) = non_empty(ENV_S3_REGION) {
            self.storage.region = region;
        }
        if let Some(bucket) = non_empty(ENV_S3_BUCKET) {
            self.storage.bucket = Some(bucket);
        }
        if let Some(access_key_id) = non_empty(ENV_S3_ACCESS_KEY_ID) {
            self.storage.access_key_id = Some(access_key_id);
        }
        if let Some(secret_access_key) = non_empty(ENV_S3_SECRET_ACCESS_KEY) {
            self.storage.secret_access_key = Some(secret_access_key);
        }
        if let Some(devices) = lookup(ENV_CUDA_VISIBLE_DEVICES) {
            self.separator.cuda_visible_devices = Some(devices);
        }

        Ok(())
    }

    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|name| env::var(name).ok())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. STEMSPLIT_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
