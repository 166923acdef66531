//! Transcode process supervisor
//!
//! Owns the transcoder process of one session. Three tasks run per process:
//! - a writer draining the frame channel into the process input
//! - a reader splitting diagnostic output into lines
//! - a reaper that polls for exit and performs graceful termination on request
//!
//! The reaper is the only owner of the [`ProcessControl`], so exit detection and
//! termination never race on the handle. Every exit is reported as a
//! [`SupervisorEvent::Exited`] tagged with the process generation; events from a
//! process that has already been replaced are ignored.

use crate::outbound::{redact_key, UrlError};
use crate::protocol::{classify_frame, close_code, FrameKind};
use crate::session::{Session, SessionState, StopReason};
use crate::transcode::{
    is_fatal_input_error, parse_progress, split_lines, terminate_with_grace, ExitOutcome,
    ProcessControl, Progress, Teardown, TranscodeError, TranscodeProcess, TranscodeSpec,
    Transcoder, EXIT_POLL_INTERVAL,
};
use live_relay_config::Config;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Partial diagnostic lines longer than this are discarded
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Error type for starting a supervised process
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid destination: {0}")]
    Destination(#[from] UrlError),

    #[error(transparent)]
    Spawn(#[from] TranscodeError),
}

impl SupervisorError {
    /// Close code reported to the encoder
    pub fn close_code(&self) -> u16 {
        match self {
            SupervisorError::Destination(_) => close_code::INVALID_DESTINATION,
            SupervisorError::Spawn(_) => close_code::SPAWN_FAILED,
        }
    }
}

/// Settings shared by every supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub preset: String,
    pub default_endpoint: String,
    /// When false, `rtmps://` destinations are downgraded to `rtmp://`
    pub rtmps_supported: bool,
    pub grace_period: Duration,
    pub backpressure_limit: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config, rtmps_supported: bool) -> Self {
        Self {
            preset: config.transcoder.preset.clone(),
            default_endpoint: config.destination.default_endpoint.clone(),
            rtmps_supported,
            grace_period: Duration::from_millis(config.transcoder.grace_period_ms),
            backpressure_limit: config.transcoder.backpressure_limit_bytes,
            max_reconnect_attempts: config.transcoder.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.transcoder.reconnect_delay_ms),
        }
    }
}

/// Something the session's connection handler must react to
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// One diagnostic output line
    Diagnostic {
        line: String,
        progress: Option<Progress>,
    },
    /// A process exited (or was terminated)
    Exited { generation: u64, outcome: ExitOutcome },
    /// The reconnect delay elapsed
    Respawn { generation: u64 },
}

impl SupervisorEvent {
    pub fn is_fatal_diagnostic(&self) -> bool {
        matches!(self, SupervisorEvent::Diagnostic { line, .. } if is_fatal_input_error(line))
    }
}

/// What happened to one binary chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Forwarded,
    /// Audio-tagged chunk, counted only
    Audio,
    /// Dropped by backpressure or because no process is running
    Dropped,
}

/// Final state of a session and how to close its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub state: SessionState,
    pub code: u16,
    pub message: String,
}

/// Result of handling a process exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAction {
    /// Exit of a process that was already replaced or torn down
    Ignored,
    /// A respawn is scheduled
    Reconnecting,
    Finished(Termination),
}

struct Running {
    generation: u64,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    queued: Arc<AtomicUsize>,
    terminate: oneshot::Sender<()>,
    reaper: JoinHandle<ExitOutcome>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Supervisor for one session's transcoder
///
/// Dropping a supervisor with a running process terminates it in the background.
pub struct Supervisor {
    session: Arc<Session>,
    transcoder: Arc<dyn Transcoder>,
    settings: Arc<SupervisorSettings>,
    spec: TranscodeSpec,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
    running: Option<Running>,
}

impl Supervisor {
    /// Normalize the destination and spawn the first process
    ///
    /// On error the session is left `FAILED` and nothing is running.
    pub fn start(
        session: Arc<Session>,
        transcoder: Arc<dyn Transcoder>,
        settings: Arc<SupervisorSettings>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SupervisorEvent>), SupervisorError> {
        let spec = match TranscodeSpec::for_session(
            &session.config,
            &settings.preset,
            &settings.default_endpoint,
            settings.rtmps_supported,
        ) {
            Ok(spec) => spec,
            Err(e) => {
                session.set_state(SessionState::Failed);
                tracing::warn!(session_id = %session.id, error = %e, "rejecting destination");
                return Err(e.into());
            }
        };

        let (events, events_rx) = mpsc::unbounded_channel();
        let mut supervisor = Self {
            session,
            transcoder,
            settings,
            spec,
            events,
            generation: 0,
            running: None,
        };

        supervisor.session.set_state(SessionState::Spawning);
        if let Err(e) = supervisor.spawn_process() {
            supervisor.session.set_state(SessionState::Failed);
            tracing::error!(session_id = %supervisor.session.id, error = %e, "transcoder spawn failed");
            return Err(e);
        }
        supervisor.session.set_state(SessionState::Streaming);

        Ok((supervisor, events_rx))
    }

    fn spawn_process(&mut self) -> Result<(), SupervisorError> {
        let TranscodeProcess {
            pid,
            input,
            diagnostics,
            control,
        } = self.transcoder.spawn(&self.spec)?;

        self.generation += 1;
        let generation = self.generation;
        self.session.set_pid(pid);
        tracing::info!(
            session_id = %self.session.id,
            pid = pid.unwrap_or(0),
            generation,
            url = %redact_key(&self.spec.output_url, &self.session.config.stream_key),
            "transcoder started"
        );

        let queued = Arc::new(AtomicUsize::new(0));
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (terminate, terminate_rx) = oneshot::channel();

        let writer = tokio::spawn(write_input(input, frames_rx, queued.clone()));
        let reader = tokio::spawn(read_diagnostics(
            diagnostics,
            self.session.clone(),
            self.events.clone(),
        ));
        let reaper = tokio::spawn(reap(
            control,
            terminate_rx,
            self.settings.grace_period,
            self.events.clone(),
            generation,
        ));

        self.running = Some(Running {
            generation,
            frames,
            queued,
            terminate,
            reaper,
            writer,
            reader,
        });
        Ok(())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Route one binary chunk into the transcoder input
    ///
    /// Never blocks: when the bytes already queued for the input reach the
    /// backpressure limit, the chunk is dropped.
    pub fn feed(&self, frame: Vec<u8>) -> FeedOutcome {
        self.session.record_bytes(frame.len());

        if classify_frame(self.spec.input_format, &frame) == FrameKind::Audio {
            self.session.record_audio_frame();
            return FeedOutcome::Audio;
        }

        let Some(running) = &self.running else {
            self.session.record_dropped_frame();
            return FeedOutcome::Dropped;
        };

        let len = frame.len();
        if running.queued.load(Ordering::Acquire) >= self.settings.backpressure_limit {
            self.session.record_dropped_frame();
            return FeedOutcome::Dropped;
        }

        running.queued.fetch_add(len, Ordering::AcqRel);
        if running.frames.send(frame).is_err() {
            // Writer already gone, the process is exiting
            running.queued.fetch_sub(len, Ordering::AcqRel);
            self.session.record_dropped_frame();
            return FeedOutcome::Dropped;
        }

        self.session.record_video_frame();
        FeedOutcome::Forwarded
    }

    /// React to an [`SupervisorEvent::Exited`]
    pub fn handle_exit(&mut self, generation: u64, outcome: ExitOutcome) -> ExitAction {
        match &self.running {
            Some(running) if running.generation == generation => {}
            _ => return ExitAction::Ignored,
        }
        if let Some(running) = self.running.take() {
            running.writer.abort();
        }
        self.session.set_pid(None);

        let id = self.session.id;

        if let Some(reason) = self.session.stop_reason() {
            self.session.set_state(SessionState::Closed);
            return ExitAction::Finished(Termination {
                state: self.session.state(),
                code: reason.close_code(),
                message: reason.message().to_string(),
            });
        }

        if outcome.success() {
            tracing::info!(session_id = %id, "transcoder finished");
            self.session.set_state(SessionState::Closed);
            return ExitAction::Finished(Termination {
                state: self.session.state(),
                code: close_code::NORMAL,
                message: "transcoder finished".to_string(),
            });
        }

        if self.session.reconnects() < u64::from(self.settings.max_reconnect_attempts) {
            let attempt = self.session.record_reconnect();
            self.session.set_state(SessionState::Reconnecting);
            tracing::warn!(
                session_id = %id,
                %outcome,
                attempt,
                max_attempts = self.settings.max_reconnect_attempts,
                "transcoder exited, reconnecting"
            );

            let events = self.events.clone();
            let delay = self.settings.reconnect_delay;
            let generation = self.generation;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(SupervisorEvent::Respawn { generation });
            });
            return ExitAction::Reconnecting;
        }

        tracing::error!(session_id = %id, %outcome, "transcoder failed");
        self.session.set_state(SessionState::Failed);
        ExitAction::Finished(Termination {
            state: self.session.state(),
            code: close_code::TRANSCODER_FAILED,
            message: format!("transcoder failed ({})", outcome),
        })
    }

    /// React to a [`SupervisorEvent::Respawn`]
    ///
    /// Returns `Ok(false)` when the respawn is stale. A failed respawn leaves the
    /// session `FAILED`.
    pub fn respawn(&mut self, generation: u64) -> Result<bool, SupervisorError> {
        if generation != self.generation
            || self.running.is_some()
            || self.session.state() != SessionState::Reconnecting
        {
            return Ok(false);
        }

        match self.spawn_process() {
            Ok(()) => {
                self.session.set_state(SessionState::Streaming);
                Ok(true)
            }
            Err(e) => {
                self.session.set_state(SessionState::Failed);
                tracing::error!(session_id = %self.session.id, error = %e, "transcoder respawn failed");
                Err(e)
            }
        }
    }

    /// Tear down the running process: close input, SIGTERM, wait, SIGKILL
    ///
    /// Safe to call when no process is running or the session already ended.
    pub async fn shutdown(&mut self, reason: StopReason) -> Termination {
        self.session.set_state(SessionState::Closing);
        self.stop_process().await;

        self.session.set_state(SessionState::Closed);
        Termination {
            state: self.session.state(),
            code: reason.close_code(),
            message: reason.message().to_string(),
        }
    }

    /// Tear down after the transcoder reported input it cannot decode
    ///
    /// Restarting would only fail on the same bytes, so the session ends `FAILED`.
    pub async fn fail_input(&mut self, line: &str) -> Termination {
        tracing::error!(session_id = %self.session.id, line = %line, "ending session on unreadable input");
        self.session.set_state(SessionState::Closing);
        self.stop_process().await;

        self.session.set_state(SessionState::Failed);
        Termination {
            state: self.session.state(),
            code: close_code::TRANSCODER_FAILED,
            message: format!("transcoder cannot decode input: {}", line),
        }
    }

    async fn stop_process(&mut self) {
        if let Some(running) = self.running.take() {
            let Running {
                terminate,
                reaper,
                writer,
                reader,
                ..
            } = running;

            // Dropping the writer task closes the process input
            writer.abort();
            let _ = terminate.send(());
            match reaper.await {
                Ok(outcome) => {
                    tracing::info!(session_id = %self.session.id, %outcome, "transcoder stopped")
                }
                Err(e) => tracing::warn!(session_id = %self.session.id, error = %e, "reaper task failed"),
            }
            reader.abort();
            self.session.set_pid(None);
        }
    }
}

async fn write_input(
    mut input: Box<dyn AsyncWrite + Send + Unpin>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(frame) = frames.recv().await {
        let result = input.write_all(&frame).await;
        queued.fetch_sub(frame.len(), Ordering::AcqRel);
        if let Err(e) = result {
            tracing::debug!(error = %e, "transcoder input closed");
            return;
        }
    }
    let _ = input.shutdown().await;
}

async fn read_diagnostics(
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    session: Arc<Session>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match output.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        for line in split_lines(&mut pending) {
            let progress = parse_progress(&line);
            match progress {
                Some(p) => session.set_progress(p),
                None if is_fatal_input_error(&line) => {
                    tracing::warn!(session_id = %session.id, line = %line, "transcoder cannot decode input")
                }
                None => tracing::debug!(session_id = %session.id, line = %line, "transcoder"),
            }
            if events.send(SupervisorEvent::Diagnostic { line, progress }).is_err() {
                return;
            }
        }

        if pending.len() > MAX_PENDING_LINE {
            pending.clear();
        }
    }
}

async fn reap(
    mut control: Box<dyn ProcessControl>,
    mut terminate: oneshot::Receiver<()>,
    grace: Duration,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
) -> ExitOutcome {
    let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);

    // A dropped sender also means terminate
    let outcome = loop {
        tokio::select! {
            _ = &mut terminate => {
                break match terminate_with_grace(control.as_mut(), grace).await {
                    Teardown::Exited(outcome) => outcome,
                    Teardown::Killed => ExitOutcome { code: None },
                };
            }
            _ = poll.tick() => match control.try_wait() {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "cannot query transcoder status");
                    break ExitOutcome { code: None };
                }
            },
        }
    };

    let _ = events.send(SupervisorEvent::Exited {
        generation,
        outcome,
    });
    outcome
}
