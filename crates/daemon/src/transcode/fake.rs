//! In-memory transcoder for tests
//!
//! Each spawned fake records the bytes written to its input and exits only when told to
//! (or on terminate/kill), so tests drive process exits deterministically.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::{ExitOutcome, ProcessControl, TranscodeError, TranscodeProcess, TranscodeSpec, Transcoder};

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Keep running after SIGTERM so only a kill stops it
    pub ignore_terminate: bool,
    pub fail_spawn: bool,
    /// Never read input, so writes back up once the pipe buffer is full
    pub stall_input: bool,
    pub input_capacity: usize,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            ignore_terminate: false,
            fail_spawn: false,
            stall_input: false,
            input_capacity: 64 * 1024,
        }
    }
}

pub struct FakeTranscoder {
    behavior: Mutex<FakeBehavior>,
    handles: Mutex<Vec<FakeHandle>>,
    specs: Mutex<Vec<TranscodeSpec>>,
}

impl FakeTranscoder {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            handles: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Successful spawns so far
    pub fn spawn_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<FakeHandle> {
        self.handles.lock().unwrap().last().cloned()
    }

    pub fn handles(&self) -> Vec<FakeHandle> {
        self.handles.lock().unwrap().clone()
    }

    pub fn last_spec(&self) -> Option<TranscodeSpec> {
        self.specs.lock().unwrap().last().cloned()
    }
}

impl Transcoder for FakeTranscoder {
    fn spawn(&self, spec: &TranscodeSpec) -> Result<TranscodeProcess, TranscodeError> {
        let behavior = self.behavior.lock().unwrap().clone();
        if behavior.fail_spawn {
            return Err(TranscodeError::Spawn {
                program: "fake-ffmpeg".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "fake spawn failure"),
            });
        }

        let (input, input_peer) = tokio::io::duplex(behavior.input_capacity);
        let (diag_writer, diagnostics) = tokio::io::duplex(64 * 1024);

        let mut handles = self.handles.lock().unwrap();
        let state = Arc::new(FakeState {
            pid: 1000 + handles.len() as u32,
            exit: Mutex::new(None),
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            input_closed: AtomicBool::new(false),
            diagnostics: tokio::sync::Mutex::new(Some(diag_writer)),
            stalled_input: Mutex::new(None),
        });

        if behavior.stall_input {
            *state.stalled_input.lock().unwrap() = Some(input_peer);
        } else {
            tokio::spawn(collect_input(input_peer, state.clone()));
        }

        let handle = FakeHandle {
            state: state.clone(),
        };
        handles.push(handle);
        self.specs.lock().unwrap().push(spec.clone());

        Ok(TranscodeProcess {
            pid: Some(state.pid),
            input: Box::new(input),
            diagnostics: Box::new(diagnostics),
            control: Box::new(FakeControl {
                state,
                ignore_terminate: behavior.ignore_terminate,
            }),
        })
    }
}

async fn collect_input(mut input: DuplexStream, state: Arc<FakeState>) {
    let mut buf = [0u8; 8192];
    loop {
        match input.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => state.received.lock().unwrap().extend_from_slice(&buf[..n]),
        }
    }
    state.input_closed.store(true, Ordering::SeqCst);
}

struct FakeState {
    pid: u32,
    exit: Mutex<Option<ExitOutcome>>,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    received: Mutex<Vec<u8>>,
    input_closed: AtomicBool,
    diagnostics: tokio::sync::Mutex<Option<DuplexStream>>,
    stalled_input: Mutex<Option<DuplexStream>>,
}

impl FakeState {
    /// First exit wins; closes the diagnostic stream like a real process would
    fn set_exit(&self, outcome: ExitOutcome) {
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(outcome);
            if let Ok(mut diag) = self.diagnostics.try_lock() {
                diag.take();
            }
        }
    }
}

/// Test-side view of one spawned fake process
#[derive(Clone)]
pub struct FakeHandle {
    state: Arc<FakeState>,
}

impl FakeHandle {
    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    /// Make the process exit with `code`
    pub fn exit(&self, code: i32) {
        self.state.set_exit(ExitOutcome { code: Some(code) });
    }

    pub fn has_exited(&self) -> bool {
        self.state.exit.lock().unwrap().is_some()
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.state.kill_calls.load(Ordering::SeqCst)
    }

    /// Every byte the process has read from its input
    pub fn received(&self) -> Vec<u8> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn input_closed(&self) -> bool {
        self.state.input_closed.load(Ordering::SeqCst)
    }

    /// Write one line to the process's diagnostic output
    pub async fn emit(&self, line: &str) {
        let mut diag = self.state.diagnostics.lock().await;
        if let Some(writer) = diag.as_mut() {
            let _ = writer.write_all(line.as_bytes()).await;
            let _ = writer.write_all(b"\n").await;
        }
    }
}

struct FakeControl {
    state: Arc<FakeState>,
    ignore_terminate: bool,
}

impl ProcessControl for FakeControl {
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(*self.state.exit.lock().unwrap())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.state.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            // ffmpeg exits 255 after SIGTERM
            self.state.set_exit(ExitOutcome { code: Some(255) });
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.state.set_exit(ExitOutcome { code: None });
        Ok(())
    }
}
