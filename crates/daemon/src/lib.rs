//! Live Relay
//!
//! Accepts browser/encoder broadcasts over WebSocket, runs one ffmpeg process per
//! broadcast to republish it to an RTMP(S) destination, and serves a monitoring and
//! control API for the running fleet.

pub mod api;
pub mod daemon;
pub mod ingest;
pub mod monitor;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod startup;
pub mod supervisor;
pub mod transcode;

pub use live_relay_config as config;
pub use live_relay_config::Config;
pub use api::{create_router, ApiError, ApiState, StopAllResponse, StopResponse};
pub use daemon::{wait_for_teardown, Daemon, DaemonError, ServerError};
pub use ingest::{serve_connection, ConnectionEnd, IngestState, Inbound, Outbound};
pub use monitor::{
    collect_stats, session_metrics, HealthSnapshot, HostSample, HostSampler, SessionMetrics,
    StatsSnapshot, SystemMetrics,
};
pub use outbound::{build_outbound_url, build_outbound_url_with_default, redact_key, UrlError};
pub use protocol::{
    classify_frame, parse_handshake, FrameKind, HandshakeError, InputFormat, ServerEvent,
    SessionConfig,
};
pub use registry::{Registry, RegistryError, SharedRegistry};
pub use session::{Session, SessionId, SessionState, StopReason};
pub use startup::{
    check_ffmpeg_version, parse_ffmpeg_version, parse_rtmps_output_support, resolve_ffmpeg_path,
    run_startup_checks, EngineInfo, StartupError,
};
pub use supervisor::{Supervisor, SupervisorError, SupervisorEvent, SupervisorSettings, Termination};
pub use transcode::{
    build_ffmpeg_command, ExitOutcome, FfmpegTranscoder, TranscodeError, TranscodeSpec, Transcoder,
};
