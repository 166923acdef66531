//! Transcoding engine abstraction
//!
//! The engine is an external binary. [`Transcoder`] spawns one process per session and
//! hands back its input, its diagnostic output and a [`ProcessControl`] for signalling;
//! the supervisor never touches the concrete process type, so tests substitute a fake.

pub mod diagnostics;
pub mod ffmpeg;
#[cfg(test)]
pub mod fake;

use std::io;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use diagnostics::{is_fatal_input_error, parse_progress, split_lines, Progress};
pub use ffmpeg::{build_ffmpeg_command, FfmpegTranscoder, TranscodeSpec};

/// Error type for transcoder operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The engine binary could not be started
    #[error("failed to spawn transcoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process started but one of its pipes was not captured
    #[error("transcoder {0} was not captured")]
    MissingPipe(&'static str),
}

/// How a transcoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Signalling and reaping for one spawned process
pub trait ProcessControl: Send {
    /// Non-blocking exit check
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process unconditionally
    fn kill(&mut self) -> io::Result<()>;
}

/// Handles to a freshly spawned process
pub struct TranscodeProcess {
    pub pid: Option<u32>,
    /// Media input (the process's stdin)
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Diagnostic output (the process's stderr)
    pub diagnostics: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn ProcessControl>,
}

/// Something that can start a transcoding process for a session
pub trait Transcoder: Send + Sync {
    fn spawn(&self, spec: &TranscodeSpec) -> Result<TranscodeProcess, TranscodeError>;
}

/// Result of [`terminate_with_grace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Exited on its own or after SIGTERM within the grace period
    Exited(ExitOutcome),
    /// Still running after the grace period and was killed
    Killed,
}

pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stop a process: SIGTERM, wait up to `grace`, then SIGKILL
///
/// Safe to call on a process that already exited; signalling errors are ignored because
/// the process may exit between the check and the signal.
pub async fn terminate_with_grace(control: &mut dyn ProcessControl, grace: Duration) -> Teardown {
    if let Ok(Some(outcome)) = control.try_wait() {
        return Teardown::Exited(outcome);
    }

    if let Err(e) = control.terminate() {
        tracing::debug!(error = %e, "terminate signal failed");
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if let Ok(Some(outcome)) = control.try_wait() {
            return Teardown::Exited(outcome);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    if let Ok(Some(outcome)) = control.try_wait() {
        return Teardown::Exited(outcome);
    }

    tracing::warn!(grace_ms = grace.as_millis() as u64, "transcoder ignored SIGTERM, killing");
    if let Err(e) = control.kill() {
        tracing::debug!(error = %e, "kill failed");
    }
    Teardown::Killed
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeBehavior, FakeTranscoder};
    use super::*;
    use crate::protocol::InputFormat;

    fn spec() -> TranscodeSpec {
        TranscodeSpec {
            input_format: InputFormat::Webm,
            fps: 30,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            width: None,
            height: None,
            preset: "veryfast".to_string(),
            output_url: "rtmp://host/app/key".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_process_exits_within_grace() {
        let transcoder = FakeTranscoder::new(FakeBehavior::default());
        let mut process = transcoder.spawn(&spec()).unwrap();

        let teardown = terminate_with_grace(process.control.as_mut(), Duration::from_secs(4)).await;

        assert!(matches!(teardown, Teardown::Exited(_)));
        let handle = transcoder.last().unwrap();
        assert_eq!(handle.terminate_calls(), 1);
        assert_eq!(handle.kill_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_process_is_killed_after_grace() {
        let transcoder = FakeTranscoder::new(FakeBehavior {
            ignore_terminate: true,
            ..FakeBehavior::default()
        });
        let mut process = transcoder.spawn(&spec()).unwrap();

        let start = tokio::time::Instant::now();
        let teardown = terminate_with_grace(process.control.as_mut(), Duration::from_secs(4)).await;

        assert_eq!(teardown, Teardown::Killed);
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(transcoder.last().unwrap().kill_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_exited_process_is_not_signalled() {
        let transcoder = FakeTranscoder::new(FakeBehavior::default());
        let mut process = transcoder.spawn(&spec()).unwrap();
        transcoder.last().unwrap().exit(1);

        let teardown = terminate_with_grace(process.control.as_mut(), Duration::from_secs(4)).await;

        assert_eq!(teardown, Teardown::Exited(ExitOutcome { code: Some(1) }));
        assert_eq!(transcoder.last().unwrap().terminate_calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_ignoring_sigterm_is_killed() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .kill_on_drop(true)
            .spawn()
            .expect("sh should be available");
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut control = ffmpeg::ChildControl::new(child);
        let teardown = terminate_with_grace(&mut control, Duration::from_millis(300)).await;
        assert_eq!(teardown, Teardown::Killed);

        child = control.into_inner();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
