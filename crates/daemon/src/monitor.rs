//! Monitoring module for the relay
//!
//! Fleet and per-session statistics are derived from live session state at request
//! time. Host figures (CPU, memory, load, own RSS) come from `sysinfo` and are sampled
//! by a background task because CPU usage needs two refreshes to be meaningful.

use crate::session::{Session, SessionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::RwLock;

/// Interval between host samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Memory used by the relay process itself
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMemory {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

/// Latest host sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSample {
    pub system: SystemMetrics,
    pub memory: ProcessMemory,
}

/// Shared host sample, written by the sampler and read by the API
pub type SharedHostSample = Arc<RwLock<HostSample>>;

pub fn new_shared_host_sample() -> SharedHostSample {
    Arc::new(RwLock::new(HostSample::default()))
}

/// Encoding parameters of a session as reported by the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigMetrics {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub input_format: String,
}

/// Per-session statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub id: u64,
    pub pid: Option<u32>,
    pub uptime_secs: f64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub dropped_frames: u64,
    pub bytes_received: u64,
    /// Forwarded video frames divided by uptime
    pub fps: f64,
    /// Rate reported by the transcoder's own status line
    pub encoder_fps: Option<f32>,
    pub reconnects: u64,
    pub state: SessionState,
    pub resolution: String,
    pub last_frame_secs_ago: Option<f64>,
    /// How long frames have been dropped without interruption
    pub busy_secs: Option<f64>,
    pub config: SessionConfigMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub uptime_secs: f64,
    pub memory: ProcessMemory,
    pub system: SystemMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamsMetrics {
    /// Sessions in `STREAMING` or `RECONNECTING`
    pub active: usize,
    pub max: usize,
    pub utilization_percent: f64,
    pub list: Vec<SessionMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_video_frames: u64,
    pub total_audio_frames: u64,
    pub total_dropped_frames: u64,
    pub total_bytes_received: u64,
    pub avg_fps: f64,
    pub total_reconnects: u64,
}

/// Response of the fleet statistics endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub timestamp_unix_ms: i64,
    pub server: ServerMetrics,
    pub streams: StreamsMetrics,
    pub totals: Totals,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionCounts {
    pub active: usize,
    pub max: usize,
}

/// Response of the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub uptime_secs: f64,
    pub memory: ProcessMemory,
    pub sessions: SessionCounts,
    pub timestamp_unix_ms: i64,
}

pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Share of capacity in use, 0 when no capacity is configured
pub fn utilization_percent(active: usize, max: usize) -> f64 {
    if max == 0 {
        return 0.0;
    }
    active as f64 / max as f64 * 100.0
}

/// Statistics of one session as of `now`
pub fn session_metrics(session: &Session, now: Instant) -> SessionMetrics {
    let uptime = now.saturating_duration_since(session.started()).as_secs_f64();
    let video_frames = session.video_frames();
    let fps = if uptime > 0.0 {
        video_frames as f64 / uptime
    } else {
        0.0
    };
    let config = &session.config;

    SessionMetrics {
        id: session.id.0,
        pid: session.pid(),
        uptime_secs: uptime,
        video_frames,
        audio_frames: session.audio_frames(),
        dropped_frames: session.dropped_frames(),
        bytes_received: session.bytes_received(),
        fps,
        encoder_fps: session.progress().map(|p| p.fps),
        reconnects: session.reconnects(),
        state: session.state(),
        resolution: config.resolution(),
        last_frame_secs_ago: session
            .last_frame()
            .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        busy_secs: session
            .busy_since()
            .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        config: SessionConfigMetrics {
            width: config.width,
            height: config.height,
            fps: config.fps,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            input_format: config.input_format.as_str().to_string(),
        },
    }
}

/// Build the fleet statistics from the registered sessions
pub fn collect_stats(
    sessions: &[Arc<Session>],
    max_sessions: usize,
    uptime: Duration,
    host: &HostSample,
) -> StatsSnapshot {
    let now = Instant::now();
    let list: Vec<SessionMetrics> = sessions.iter().map(|s| session_metrics(s, now)).collect();

    let active: Vec<&SessionMetrics> = list.iter().filter(|m| m.state.is_active()).collect();
    let mut totals = Totals::default();
    for m in &list {
        totals.total_video_frames += m.video_frames;
        totals.total_audio_frames += m.audio_frames;
        totals.total_dropped_frames += m.dropped_frames;
        totals.total_bytes_received += m.bytes_received;
        totals.total_reconnects += m.reconnects;
    }
    if !active.is_empty() {
        totals.avg_fps = active.iter().map(|m| m.fps).sum::<f64>() / active.len() as f64;
    }

    StatsSnapshot {
        timestamp_unix_ms: unix_time_ms(),
        server: ServerMetrics {
            uptime_secs: uptime.as_secs_f64(),
            memory: host.memory,
            system: host.system.clone(),
        },
        streams: StreamsMetrics {
            active: active.len(),
            max: max_sessions,
            utilization_percent: utilization_percent(active.len(), max_sessions),
            list,
        },
        totals,
    }
}

/// Keeps a `sysinfo::System` between samples so CPU usage has a baseline
pub struct HostSampler {
    sys: System,
    pid: Option<Pid>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Collects current host metrics using sysinfo
    pub fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total_memory = self.sys.total_memory();
        let used_memory = self.sys.used_memory();
        let mem_usage = if total_memory > 0 {
            (used_memory as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };
        let load_avg = System::load_average();

        let memory = match self.pid {
            Some(pid) => {
                self.sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    ProcessRefreshKind::new().with_memory(),
                );
                self.sys
                    .process(pid)
                    .map(|p| ProcessMemory {
                        rss_bytes: p.memory(),
                        virtual_bytes: p.virtual_memory(),
                    })
                    .unwrap_or_default()
            }
            None => ProcessMemory::default(),
        };

        HostSample {
            system: SystemMetrics {
                cpu_usage_percent: self.sys.global_cpu_usage(),
                mem_usage_percent: mem_usage,
                load_avg_1: load_avg.one as f32,
                load_avg_5: load_avg.five as f32,
                load_avg_15: load_avg.fifteen as f32,
            },
            memory,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh `shared` every `interval` until the task is aborted
pub async fn run_host_sampler(shared: SharedHostSample, interval: Duration) {
    let mut sampler = HostSampler::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let sample = sampler.sample();
        *shared.write().await = sample;
    }
}
