//! Switchboard CLI
//!
//! Runs the federation proxy: applications connect over TCP, the agent
//! talks MCP over this process's stdin/stdout. Logs go to stderr so they
//! never interleave with protocol frames.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{ProxyConfig, ProxyServer, TracingEventSink};
use tracing_subscriber::EnvFilter;

/// Switchboard - one MCP endpoint for many desktop applications
///
/// Applications connect to the listen address and register their tools;
/// the agent on stdio sees the merged catalog.
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address applications connect to
    #[arg(short, long, env = "SWITCHBOARD_LISTEN", default_value = "127.0.0.1:8765")]
    listen: String,

    /// Maximum concurrently connected applications
    #[arg(long, env = "SWITCHBOARD_MAX_CONNECTIONS", default_value_t = 64)]
    max_connections: usize,

    /// Seconds to wait for an application to answer a tool call
    #[arg(long, env = "SWITCHBOARD_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Seconds to keep records of disconnected applications
    #[arg(long, env = "SWITCHBOARD_RETENTION_SECS", default_value_t = 3600)]
    retention_secs: u64,

    /// Seconds to wait for in-flight work during shutdown
    #[arg(long, env = "SWITCHBOARD_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    shutdown_timeout_secs: u64,

    /// Largest accepted frame, in bytes
    #[arg(long, env = "SWITCHBOARD_MAX_FRAME_BYTES", default_value_t = 1024 * 1024)]
    max_frame_bytes: usize,

    /// Log format: text or json
    #[arg(short = 'f', long = "log-format", default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig::new()
            .with_listen_addr(self.listen.clone())
            .with_max_connections(self.max_connections)
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
            .with_disconnected_retention(Duration::from_secs(self.retention_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .with_max_frame_bytes(self.max_frame_bytes)
    }
}

fn init_logging(format: &OutputFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        OutputFormat::Text => builder.init(),
        OutputFormat::Json => builder.json().init(),
    }
}

/// Grace period for runtime threads once serving has returned
///
/// The stdin reader runs on a blocking thread that cannot be interrupted, so
/// the runtime must not wait for it.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.format);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(args));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    code
}

async fn run(args: Args) -> ExitCode {
    let json_output = matches!(args.format, OutputFormat::Json);
    let event_sink = Arc::new(TracingEventSink::new(json_output));

    let server = match ProxyServer::bind_with_events(args.proxy_config(), event_sink).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = server.handle();
    let serve = server.serve_stdio();
    tokio::pin!(serve);

    let result = tokio::select! {
        result = &mut serve => result,
        interrupted = tokio::signal::ctrl_c() => {
            match interrupted {
                Ok(()) => {
                    tracing::info!("Interrupted");
                    handle.shutdown();
                }
                Err(e) => tracing::warn!("Cannot listen for Ctrl-C: {e}"),
            }
            serve.await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_proxy_config() {
        let args = Args::try_parse_from(["switchboard"]).unwrap();
        let config = args.proxy_config();
        assert_eq!(config.listen_addr, "127.0.0.1:8765");
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.disconnected_retention(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "switchboard",
            "--listen",
            "0.0.0.0:9000",
            "--call-timeout-secs",
            "2",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(args.format, OutputFormat::Json));

        let config = args.proxy_config();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.call_timeout(), Duration::from_secs(2));
    }
}
