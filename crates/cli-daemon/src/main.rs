//! CLI entry point for the live relay
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use live_relay::config::ConfigError;
use live_relay::{Config, Daemon};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Live Relay - WebSocket ingest to RTMP(S) republishing
#[derive(Parser, Debug)]
#[command(name = "live-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overriding server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (ffmpeg version, rtmps probe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the config file, falling back to defaults plus environment when it is missing
fn load_config(path: &Path, bind: Option<String>) -> Result<Config, ConfigError> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        tracing::warn!(
            path = %path.display(),
            "config file not found, using defaults and environment"
        );
        Config::from_env()?
    };

    if let Some(bind) = bind {
        config.server.bind_addr = bind;
        config.validate()?;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    tracing::info!(config = %args.config.display(), "live relay starting");

    let config = match load_config(&args.config, args.bind) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let daemon_result = if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Ok(Daemon::new_without_checks(config))
    } else {
        Daemon::new(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        ffmpeg = %daemon.engine.path,
        rtmps = daemon.engine.rtmps_supported,
        "daemon initialized"
    );

    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["live-relay"]);
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert_eq!(args.bind, None);
        assert!(!args.skip_checks);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "live-relay",
            "--config",
            "/etc/relay.toml",
            "--bind",
            "127.0.0.1:9000",
            "--skip-checks",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/relay.toml"));
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000"));
        assert!(args.skip_checks);
    }

    #[test]
    fn test_bind_override_is_validated() {
        let missing = Path::new("/nonexistent/relay/config.toml");

        let config = load_config(missing, Some("127.0.0.1:9000".to_string())).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");

        assert!(load_config(missing, Some("nowhere".to_string())).is_err());
    }
}
