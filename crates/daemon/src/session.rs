//! Session state for one live broadcast.
//!
//! A [`Session`] is shared between its connection handler, its supervisor and the
//! monitoring API. Counters are atomics so readers never block the ingest path; the
//! lifecycle state only ever moves forward and never leaves a terminal state.

use crate::protocol::{close_code, SessionConfig};
use crate::transcode::Progress;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

/// Identifier of a live session, unique for the lifetime of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SessionId)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created from a valid handshake, no process yet.
    Init,
    /// Transcoder launch requested.
    Spawning,
    /// Media is flowing into a running transcoder.
    Streaming,
    /// Transcoder crashed and is being restarted.
    Reconnecting,
    /// Teardown in progress.
    Closing,
    /// Ended after a close request or a clean transcoder exit.
    Closed,
    /// Transcoder could not start or failed mid-stream.
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Spawning => "SPAWNING",
            SessionState::Streaming => "STREAMING",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Counted as an active stream in fleet statistics.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Reconnecting)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Init
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The encoder closed its connection.
    PeerClosed,
    /// Stopped through the control API.
    Admin,
    /// The server is shutting down.
    Shutdown,
    /// The connection stopped answering pings.
    Unresponsive,
}

impl StopReason {
    /// Close code sent to the encoder.
    pub fn close_code(&self) -> u16 {
        match self {
            StopReason::PeerClosed | StopReason::Unresponsive => close_code::NORMAL,
            StopReason::Admin => close_code::ADMIN_STOPPED,
            StopReason::Shutdown => close_code::GOING_AWAY,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            StopReason::PeerClosed => "connection closed",
            StopReason::Admin => "stream stopped by administrator",
            StopReason::Shutdown => "server shutting down",
            StopReason::Unresponsive => "connection unresponsive",
        }
    }
}

/// One live broadcast.
pub struct Session {
    pub id: SessionId,
    pub config: SessionConfig,
    started: Instant,
    state: Mutex<SessionState>,
    /// 0 while no process is running.
    pid: AtomicU32,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    dropped_frames: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
    busy_since: Mutex<Option<Instant>>,
    progress: Mutex<Option<Progress>>,
    stop: watch::Sender<Option<StopReason>>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        let (stop, _) = watch::channel(None);

        Self {
            id,
            config,
            started: Instant::now(),
            state: Mutex::new(SessionState::Init),
            pid: AtomicU32::new(0),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            busy_since: Mutex::new(None),
            progress: Mutex::new(None),
            stop,
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `next`. Returns false (and changes nothing) once the session is terminal.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
    }

    /// Count every received binary message, forwarded or not.
    pub fn record_bytes(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        *lock(&self.last_frame) = Some(Instant::now());
    }

    /// A video chunk reached the transcoder input; ends any run of drops.
    pub fn record_video_frame(&self) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        lock(&self.busy_since).take();
    }

    pub fn record_audio_frame(&self) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A chunk was dropped by backpressure; starts a busy period if none is running.
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        lock(&self.busy_since).get_or_insert_with(Instant::now);
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_progress(&self, progress: Progress) {
        *lock(&self.progress) = Some(progress);
    }

    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn last_frame(&self) -> Option<Instant> {
        *lock(&self.last_frame)
    }

    pub fn busy_since(&self) -> Option<Instant> {
        *lock(&self.busy_since)
    }

    pub fn progress(&self) -> Option<Progress> {
        *lock(&self.progress)
    }

    /// Ask the session's connection handler to tear down.
    ///
    /// Idempotent: the first reason wins and later calls return false. A stopping
    /// session reports `CLOSING` until its handler finishes the teardown.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let first = self.stop.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            self.set_state(SessionState::Closing);
        }
        first
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop.borrow()
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<Option<StopReason>> {
        self.stop.subscribe()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

/// Session locks guard plain values, so a poisoned lock still holds usable data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
