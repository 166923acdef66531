//! Daemon startup and main loop for the relay
//!
//! Wires the registry, transcoder, ingest endpoint and monitoring API into one
//! HTTP server, and stops every session on shutdown.

use crate::api::{create_router, ApiState};
use crate::config::{Config, ConfigError};
use crate::ingest::{self, IngestState};
use crate::monitor::{new_shared_host_sample, run_host_sampler, SharedHostSample, SAMPLE_INTERVAL};
use crate::registry::{Registry, SharedRegistry};
use crate::session::{Session, StopReason};
use crate::startup::{run_startup_checks, EngineInfo, StartupError};
use crate::transcode::{FfmpegTranscoder, Transcoder};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;

/// How often shutdown checks whether stopped sessions finished tearing down
const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for server operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// What the startup checks learned about ffmpeg
    pub engine: EngineInfo,
    registry: SharedRegistry,
    host: SharedHostSample,
    transcoder: Arc<dyn Transcoder>,
    started: Instant,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// This performs the full startup sequence:
    /// 1. Validate the configuration
    /// 2. Run startup checks (ffmpeg path, version, rtmps output)
    /// 3. Build the registry and transcoder
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let engine = run_startup_checks(&config)?;
        let transcoder = Arc::new(FfmpegTranscoder::new(engine.path.clone()));
        Ok(Self::with_transcoder(config, engine, transcoder))
    }

    /// Initialize the daemon without running startup checks
    ///
    /// The configured ffmpeg path (or `ffmpeg`) is trusted as is.
    pub fn new_without_checks(config: Config) -> Self {
        let path = config
            .transcoder
            .ffmpeg_path
            .clone()
            .unwrap_or_else(|| "ffmpeg".to_string());
        let engine = EngineInfo::unchecked(path);
        let transcoder = Arc::new(FfmpegTranscoder::new(engine.path.clone()));
        Self::with_transcoder(config, engine, transcoder)
    }

    /// Initialize the daemon around any transcoder
    pub fn with_transcoder(
        config: Config,
        engine: EngineInfo,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let registry = Registry::shared(config.server.max_sessions, config.server.admission);
        Self {
            config,
            engine,
            registry,
            host: new_shared_host_sample(),
            transcoder,
            started: Instant::now(),
        }
    }

    /// The shared session registry
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Ingest endpoint merged with the monitoring API
    pub fn router(&self) -> Router {
        let ingest_state = IngestState::from_config(
            &self.config,
            self.registry.clone(),
            self.transcoder.clone(),
            self.engine.rtmps_supported,
        );
        let api_state = ApiState {
            registry: self.registry.clone(),
            host: self.host.clone(),
            started: self.started,
        };

        ingest::router(&self.config.server.ingest_path, ingest_state).merge(create_router(api_state))
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn run(&self) -> Result<(), DaemonError> {
        let addr = self.config.server.bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        tracing::info!(
            %addr,
            ingest_path = %self.config.server.ingest_path,
            max_sessions = self.config.server.max_sessions,
            "relay listening"
        );

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then stop every session
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sampler = tokio::spawn(run_host_sampler(self.host.clone(), SAMPLE_INTERVAL));

        let app = self.router();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        self.registry.stop_all(StopReason::Shutdown).await;
        let sessions = self.registry.snapshot().await;
        let deadline = Duration::from_millis(self.config.transcoder.grace_period_ms)
            + Duration::from_secs(1);
        if !wait_for_teardown(&sessions, deadline).await {
            let remaining = sessions.iter().filter(|s| !s.state().is_terminal()).count();
            tracing::warn!(remaining, "sessions still tearing down at exit");
        }

        sampler.abort();
        tracing::info!(stopped = sessions.len(), "relay shut down");

        result.map_err(ServerError::Serve)?;
        Ok(())
    }
}

/// Wait until every session reached a terminal state; false if `deadline` passed first
pub async fn wait_for_teardown(sessions: &[Arc<Session>], deadline: Duration) -> bool {
    let all_done = async {
        while !sessions.iter().all(|s| s.state().is_terminal()) {
            tokio::time::sleep(TEARDOWN_POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(deadline, all_done).await.is_ok()
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
