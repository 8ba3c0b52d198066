//! Stem duration lookup through `ffprobe`.

use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::runtime::command_for;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reports the playback length of an audio file. Implementations never fail: an
/// unreadable duration is reported as `0.0`.
pub trait DurationProbe: Send + Sync {
    fn duration_seconds(&self, path: &Path) -> f64;
}

#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    binary: String,
    timeout: Duration,
}

impl Default for FfprobeDuration {
    fn default() -> Self {
        Self::with_binary("ffprobe")
    }
}

impl FfprobeDuration {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl DurationProbe for FfprobeDuration {
    fn duration_seconds(&self, path: &Path) -> f64 {
        match run_ffprobe_duration(&self.binary, path, self.timeout) {
            Ok(seconds) => seconds,
            Err(error) => {
                warn!(path = %path.display(), error = %format!("{error:#}"), "Could not probe duration");
                0.0
            }
        }
    }
}

/// Runs ffprobe and kills it if it has not exited within `timeout`.
pub fn run_ffprobe_duration(binary: &str, path: &Path, timeout: Duration) -> Result<f64> {
    let mut child = command_for(binary)
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {binary}; is FFmpeg installed?"))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for {binary}"))?
        {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{binary} did not finish within {}s", timeout.as_secs_f64());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)
            .with_context(|| format!("failed to read {binary} output"))?;
    }
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        bail!("{binary} exited with status {status}: {}", stderr.trim());
    }

    parse_duration_output(&stdout)
}

/// Parses the single `csv=p=0` line ffprobe prints for `format=duration`.
pub fn parse_duration_output(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("ffprobe printed no duration")?;
    let seconds: f64 = line
        .parse()
        .with_context(|| format!("unparseable ffprobe duration: {line}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("invalid ffprobe duration: {line}");
    }
    Ok(seconds)
}
