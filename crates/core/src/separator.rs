//! The stem separation model, treated as an opaque tool:
//! `input file, model name -> <out>/<model>/<stem>.wav` for each produced stem.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::config::{DeviceSelection, SeparatorBackendKind, SeparatorConfig};
use crate::logging::SEPARATOR_STDERR_TARGET;
use crate::runtime::{command_for, resolve_binary};
use crate::types::StemType;

const FOUR_STEMS: &[StemType] = &[
    StemType::Drums,
    StemType::Bass,
    StemType::Other,
    StemType::Vocals,
];
const SIX_STEMS: &[StemType] = &StemType::CANONICAL;
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub stems: &'static [StemType],
}

pub const MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        name: "htdemucs",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "htdemucs_ft",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "htdemucs_6s",
        stems: SIX_STEMS,
    },
    ModelSpec {
        name: "hdemucs_mmi",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "mdx",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "mdx_extra",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "mdx_q",
        stems: FOUR_STEMS,
    },
    ModelSpec {
        name: "mdx_extra_q",
        stems: FOUR_STEMS,
    },
];

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let wanted = name.trim();
    MODEL_CATALOG
        .iter()
        .find(|model| model.name == wanted)
        .copied()
        .ok_or_else(|| {
            let known: Vec<&str> = MODEL_CATALOG.iter().map(|model| model.name).collect();
            anyhow!("unknown model '{wanted}' (known: {})", known.join(", "))
        })
}

/// Where a separator must leave `stem` for `model` under `out_dir`.
pub fn stem_output_path(out_dir: &Path, model: &ModelSpec, stem: StemType) -> PathBuf {
    out_dir.join(model.name).join(stem.file_name())
}

pub trait Separator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks the model can be run before any separation work starts.
    fn load_model(&self, model: &ModelSpec) -> Result<()>;

    fn separate(&self, input: &Path, model: &ModelSpec, out_dir: &Path) -> Result<()>;
}

pub fn separator_from_config(config: &SeparatorConfig) -> Arc<dyn Separator> {
    match config.backend {
        SeparatorBackendKind::Demucs => Arc::new(DemucsCli::from_config(config)),
        SeparatorBackendKind::Mock => Arc::new(MockSeparator::default()),
    }
}

/// Runs the `demucs` command line tool.
#[derive(Debug, Clone)]
pub struct DemucsCli {
    binary: String,
    device: DeviceSelection,
    cuda_visible_devices: Option<String>,
}

impl DemucsCli {
    pub fn from_config(config: &SeparatorConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            device: config.resolved_device(),
            cuda_visible_devices: config.cuda_visible_devices.clone(),
        }
    }

    pub fn build_args(&self, input: &Path, model: &ModelSpec, out_dir: &Path) -> Vec<String> {
        vec![
            "-n".to_string(),
            model.name.to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().into_owned(),
            "--filename".to_string(),
            "{stem}.{ext}".to_string(),
            "--device".to_string(),
            self.device.as_str().to_string(),
            input.to_string_lossy().into_owned(),
        ]
    }
}

impl Separator for DemucsCli {
    fn name(&self) -> &'static str {
        "demucs"
    }

    fn load_model(&self, model: &ModelSpec) -> Result<()> {
        let path = resolve_binary(&self.binary)
            .with_context(|| format!("separator binary '{}' not found", self.binary))?;
        info!(
            model = model.name,
            binary = %path.display(),
            device = self.device.as_str(),
            "Separator ready"
        );
        Ok(())
    }

    fn separate(&self, input: &Path, model: &ModelSpec, out_dir: &Path) -> Result<()> {
        let args = self.build_args(input, model, out_dir);
        debug!(binary = %self.binary, ?args, "Launching separator");

        let mut command = command_for(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(devices) = self.cuda_visible_devices.as_deref() {
            command.env("CUDA_VISIBLE_DEVICES", devices);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch {}; is demucs installed?", self.binary))?;

        let stderr = child
            .stderr
            .take()
            .context("separator stderr was not captured")?;
        let stderr_thread = thread::spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        debug!(target: SEPARATOR_STDERR_TARGET, "{}", line);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Err(e) => {
                        debug!(target: SEPARATOR_STDERR_TARGET, "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            tail
        });

        let status = child.wait().context("failed to wait for separator")?;
        let tail = stderr_thread.join().unwrap_or_default();

        if !status.success() {
            let tail: Vec<String> = tail.into_iter().collect();
            bail!(
                "{} exited with status {}: {}",
                self.binary,
                status,
                tail.join("\n").trim()
            );
        }
        Ok(())
    }
}

/// Writes a copy of the input for each stem. Used for development and tests.
#[derive(Debug, Clone, Default)]
pub struct MockSeparator {
    only: Option<Vec<StemType>>,
    fail_with: Option<String>,
}

impl MockSeparator {
    /// Produce only these stems instead of every stem the model defines.
    pub fn producing(stems: impl IntoIterator<Item = StemType>) -> Self {
        Self {
            only: Some(stems.into_iter().collect()),
            fail_with: None,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            only: None,
            fail_with: Some(message.into()),
        }
    }
}

impl Separator for MockSeparator {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load_model(&self, _model: &ModelSpec) -> Result<()> {
        Ok(())
    }

    fn separate(&self, input: &Path, model: &ModelSpec, out_dir: &Path) -> Result<()> {
        if let Some(message) = &self.fail_with {
            bail!("{message}");
        }

        let model_dir = out_dir.join(model.name);
        fs::create_dir_all(&model_dir)
            .with_context(|| format!("failed to create {}", model_dir.display()))?;

        for stem in model.stems {
            if self.only.as_ref().is_some_and(|only| !only.contains(stem)) {
                continue;
            }
            let dest = stem_output_path(out_dir, model, *stem);
            fs::copy(input, &dest)
                .with_context(|| format!("failed to write mock stem {}", dest.display()))?;
        }
        Ok(())
    }
}
