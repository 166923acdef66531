//! Startup checks module for the relay
//!
//! Provides preflight checks run before the ingest server accepts connections:
//! - Transcoder binary resolution (config, `FFMPEG_PATH`, then `PATH`)
//! - FFmpeg version check
//! - `rtmps` output support probe

use crate::config::Config;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Oldest FFmpeg major version with the flags the relay passes
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the startup checks learned about the transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub path: String,
    pub major_version: Option<u32>,
    /// Whether the engine can write `rtmps://` outputs
    pub rtmps_supported: bool,
}

impl EngineInfo {
    /// Used with `--skip-checks`: trust the configured path and assume TLS output
    pub fn unchecked(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            major_version: None,
            rtmps_supported: true,
        }
    }
}

/// Search the directories of a `PATH`-style variable for an executable file
pub fn find_in_path(program: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Resolve the transcoder binary
///
/// A configured value containing a path separator must exist as given; a bare name
/// is looked up on `PATH`.
pub fn resolve_ffmpeg_path(configured: Option<&str>) -> Result<String, StartupError> {
    let name = configured.unwrap_or("ffmpeg");

    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return if Path::new(name).is_file() {
            Ok(name.to_string())
        } else {
            Err(StartupError::FfmpegNotFound(format!(
                "{} does not exist; set transcoder.ffmpeg_path or FFMPEG_PATH",
                name
            )))
        };
    }

    find_in_path(name, std::env::var_os("PATH"))
        .map(|p| p.to_string_lossy().into_owned())
        .ok_or_else(|| {
            StartupError::FfmpegNotFound(format!(
                "'{}' is not on PATH; set transcoder.ffmpeg_path or FFMPEG_PATH",
                name
            ))
        })
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    // Handle n-prefixed versions (e.g., "n6.1-...")
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Run `<ffmpeg> -version` and check the major version
pub fn check_ffmpeg_version(ffmpeg: &str) -> Result<u32, StartupError> {
    let output = Command::new(ffmpeg).arg("-version").output().map_err(|e| {
        StartupError::FfmpegVersion(format!("Failed to run {} -version: {}", ffmpeg, e))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegVersion(format!(
            "{} -version failed",
            ffmpeg
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(major_version)
}

/// Whether `-protocols` output lists `rtmps` under `Output:`
pub fn parse_rtmps_output_support(protocols_output: &str) -> bool {
    let mut in_output = false;
    for line in protocols_output.lines() {
        let line = line.trim();
        match line {
            "Input:" => in_output = false,
            "Output:" => in_output = true,
            "rtmps" if in_output => return true,
            _ => {}
        }
    }
    false
}

/// Probe `<ffmpeg> -hide_banner -protocols`; a failed probe counts as unsupported
pub fn probe_rtmps_output(ffmpeg: &str) -> bool {
    match Command::new(ffmpeg)
        .args(["-hide_banner", "-protocols"])
        .output()
    {
        Ok(output) if output.status.success() => {
            parse_rtmps_output_support(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            tracing::warn!(status = %output.status, "ffmpeg -protocols failed");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "ffmpeg -protocols could not run");
            false
        }
    }
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Transcoder resolution
/// 2. FFmpeg version
/// 3. `rtmps` output probe (never fatal)
pub fn run_startup_checks(cfg: &Config) -> Result<EngineInfo, StartupError> {
    let path = resolve_ffmpeg_path(cfg.transcoder.ffmpeg_path.as_deref())?;
    let major_version = check_ffmpeg_version(&path)?;
    let rtmps_supported = probe_rtmps_output(&path);

    tracing::info!(ffmpeg = %path, major_version, rtmps_supported, "transcoder checks passed");
    if !rtmps_supported {
        tracing::warn!("ffmpeg lacks rtmps output, rtmps:// destinations will be downgraded to rtmp://");
    }

    Ok(EngineInfo {
        path,
        major_version: Some(major_version),
        rtmps_supported,
    })
}
