use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use stemsplit_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
    SeparatorBackendKind,
};
use stemsplit_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use stemsplit_core::pipeline::JobPipeline;
use stemsplit_core::queue::{JobQueue, NotifierFactory, PipelineFactory, QueueSettings};
use stemsplit_core::retry::RetryPolicy;
use stemsplit_core::server::{app_router, AppState};
use stemsplit_core::signing::{unix_now, CallbackAllowlist, RequestSigner};
use stemsplit_core::storage::StorageClient;
use stemsplit_core::types::SplitRequest;
use stemsplit_core::webhook::WebhookNotifier;

#[derive(Parser)]
#[command(
    name = "stemsplit",
    about = "Audio stem separation job service",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP front door and the job workers (the default).
    Serve,
    /// Run one job in the foreground and print its result.
    Run(RunArgs),
    /// Print the signature headers for a request body.
    Sign(SignArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to a job JSON file (the POST /split body)")]
    job: PathBuf,
}

#[derive(Args)]
struct SignArgs {
    #[arg(help = "Path to the payload to sign")]
    payload: PathBuf,
    #[arg(long, help = "Unix timestamp to sign with (defaults to now)")]
    timestamp: Option<i64>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Some(Commands::Run(run)) => run_job_file(run.job, resolved_data_dir).await,
        Some(Commands::Sign(sign)) => sign_payload(&sign.payload, sign.timestamp, &resolved_data_dir),
        Some(Commands::Serve) | None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&init_options);
    let console_filter = filters.console_filter;
    let file_filter = filters.file_filter;

    match logging::build_file_sink_plan(&init_options) {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Config file (created with defaults on first run), then environment overrides.
/// Relative storage and workspace paths are anchored at the data directory.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = AppConfig::load_from_path(&cfg_path)?;
    config
        .apply_process_env()
        .context("invalid environment configuration")?;

    config.storage.local_root = resolve_relative_to(data_dir, &config.storage.local_root);
    config.worker.workspace_root = config
        .worker
        .workspace_root
        .as_deref()
        .map(|root| resolve_relative_to(data_dir, root));

    Ok(config)
}

fn pipeline_factory(config: AppConfig) -> PipelineFactory {
    Arc::new(move || JobPipeline::from_config(&config))
}

fn failure_notifier(config: &AppConfig) -> NotifierFactory {
    let token = config.security.token.clone();
    let webhook = config.webhook.clone();
    Arc::new(move || WebhookNotifier::new(RequestSigner::new(&token), &webhook))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir)?;
    config.security.require_token()?;

    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    if config.separator.backend == SeparatorBackendKind::Demucs {
        stemsplit_core::runtime::log_tool_status(&[config.separator.binary.as_str(), "ffprobe"]);
    }

    check_storage(&config).await;

    let queue = JobQueue::start_with_failure_notifier(
        QueueSettings::from(&config.worker),
        pipeline_factory(config.clone()),
        failure_notifier(&config),
    );
    let state = AppState::from_config(&config, queue);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting stemsplit server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Startup probe only; an unreachable store is logged and the server still starts.
async fn check_storage(config: &AppConfig) {
    let storage_config = config.storage.clone();
    let probe = tokio::task::spawn_blocking(move || {
        StorageClient::from_config(&storage_config, RetryPolicy::no_retry())
            .map(|client| (client.backend_name(), client.test_connection()))
    })
    .await;

    match probe {
        Ok(Ok((backend, true))) => info!(backend, "Object storage reachable"),
        Ok(Ok((backend, false))) => {
            warn!(backend, "Object storage is not reachable; jobs will fail at upload")
        }
        Ok(Err(error)) => warn!(error = %error, "Object storage is not configured"),
        Err(error) => warn!(error = %error, "Object storage check did not finish"),
    }
}

fn read_split_request(path: &Path) -> Result<SplitRequest> {
    if !path.exists() {
        bail!("Job file does not exist: {}", path.display());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse job JSON: {}", path.display()))
}

async fn run_job_file(job_path: PathBuf, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir)?;
    config.security.require_token()?;
    let request = read_split_request(&job_path)?;

    let allowlist = CallbackAllowlist::new(&config.security.webhook_allowlist);
    if !allowlist.is_allowed(&request.callback_url) {
        bail!("callback_url is not allowlisted: {}", request.callback_url);
    }

    let descriptor = request.into_descriptor();
    info!(job_id = %descriptor.job_id, model = %descriptor.model_name, "Running job in the foreground");

    let result = tokio::task::spawn_blocking(move || -> Result<_> {
        let pipeline = JobPipeline::from_config(&config)?;
        pipeline
            .run(&descriptor, &CancellationToken::new())
            .map_err(anyhow::Error::from)
    })
    .await
    .context("job thread panicked")??;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn sign_payload(payload_path: &Path, timestamp: Option<i64>, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let token = config.security.require_token()?;
    let payload = std::fs::read_to_string(payload_path)
        .with_context(|| format!("Failed to read payload: {}", payload_path.display()))?;

    let signer = RequestSigner::new(token);
    let headers = signer.webhook_headers_at(&payload, timestamp.unwrap_or_else(unix_now));
    for (name, value) in headers.pairs() {
        println!("{name}: {value}");
    }
    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["stemsplit", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn run_and_sign_take_paths() {
        let cli = Cli::try_parse_from(["stemsplit", "run", "job.json", "-v"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run(ref run)) if run.job == Path::new("job.json")));
        assert_eq!(cli.verbose, 1);

        let cli =
            Cli::try_parse_from(["stemsplit", "sign", "body.json", "--timestamp", "1700000000"])
                .unwrap();
        match cli.command {
            Some(Commands::Sign(sign)) => {
                assert_eq!(sign.payload, PathBuf::from("body.json"));
                assert_eq!(sign.timestamp, Some(1_700_000_000));
            }
            _ => panic!("expected sign subcommand"),
        }
    }
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "hyper=warn,reqwest=warn,separator_stderr=error";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("stemsplit_core=trace"));
        assert_eq!(selected, "stemsplit_core=trace");
    }
}
