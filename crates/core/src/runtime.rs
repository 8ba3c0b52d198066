//! Locating the external tools the pipeline shells out to (`ffprobe`, `demucs`).

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

/// Directories searched before `PATH`, in order:
///   1. `<exe_dir>/`
///   2. `<exe_dir>/bin/`
///   3. `<exe_dir>/../bin/`
///   4. `<cwd>/`
///   5. `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        for dir in [cwd.clone(), cwd.join("bin")] {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![
        format!("{binary}.exe"),
        format!("{binary}.cmd"),
        binary.to_string(),
    ]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

fn is_explicit_path(binary: &str) -> bool {
    Path::new(binary).components().count() > 1
}

/// Full path of `binary`: explicit paths as given, then the bundled locations, then `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if is_explicit_path(binary) {
        let path = PathBuf::from(binary);
        return path.is_file().then_some(path);
    }

    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        return Some(path);
    }

    let search_path = env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = env::split_paths(&search_path).collect();
    find_binary_in_dirs(binary, &dirs)
}

/// A command for `binary`, preferring a bundled copy next to the executable.
pub fn command_for(binary: &str) -> ProcessCommand {
    if !is_explicit_path(binary) {
        if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
            return ProcessCommand::new(path);
        }
    }
    ProcessCommand::new(binary)
}

/// Logs where each external tool resolves to. Call after tracing is initialized.
pub fn log_tool_status(binaries: &[&str]) {
    for binary in binaries {
        match resolve_binary(binary) {
            Some(path) => info!(tool = %binary, path = %path.display(), "External tool found"),
            None => warn!(tool = %binary, "External tool not found on PATH"),
        }
    }
}
