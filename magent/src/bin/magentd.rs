//! Host metrics agent daemon.
//!
//! Watches containerd for sandbox lifecycle, scrapes every running sandbox
//! shim and federates the results behind one HTTP endpoint.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use magent::agent::{AgentOptions, MetricsAgent};
use magent::containerd::ContainerdHost;
use magent::telemetry::AgentMetrics;
use magent::{server, util};
use magent_shared::{MagentError, MagentResult};

/// Sandbox metrics agent daemon
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "magent - federates sandbox shim metrics behind one endpoint"
)]
struct MagentArgs {
    /// Path to a JSON file with agent options
    ///
    /// Flags below override values from the file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Containerd gRPC socket path
    #[arg(long)]
    containerd_address: Option<PathBuf>,

    /// Containerd state root under which shims publish their metrics address
    #[arg(long)]
    state_root: Option<PathBuf>,

    /// Address the HTTP endpoint binds
    #[arg(long)]
    listen_address: Option<SocketAddr>,

    /// Runtime shim name whose containers are tracked
    #[arg(long)]
    runtime: Option<String>,

    /// Directory for rotated log files; logs go to stderr when unset
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Initialize tracing, to a daily-rotated file under `log_dir` or to stderr.
///
/// Returns the WorkerGuard that must be kept alive to maintain the
/// background writer thread.
fn init_logging(log_dir: Option<&Path>) -> tracing_appender::non_blocking::WorkerGuard {
    // Set up env filter (defaults to "info" if RUST_LOG not set)
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let (non_blocking, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).expect("Failed to create log directory");
            let file_appender = tracing_appender::rolling::daily(dir, "magentd.log");
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    util::register_to_tracing(non_blocking, env_filter);

    guard
}

/// Options from the config file (when given) with flag overrides applied.
fn load_options(args: &MagentArgs) -> MagentResult<AgentOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                MagentError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                MagentError::Config(format!("invalid config {}: {}", path.display(), e))
            })?
        }
        None => AgentOptions::default(),
    };

    if let Some(address) = &args.containerd_address {
        options.containerd_address = address.clone();
    }
    if let Some(root) = &args.state_root {
        options.state_root = root.clone();
    }
    if let Some(listen) = args.listen_address {
        options.listen_address = listen;
    }
    if let Some(runtime) = &args.runtime {
        options.runtime_name = runtime.clone();
    }

    Ok(options)
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, stopping on Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[tokio::main]
async fn main() -> MagentResult<()> {
    let args = MagentArgs::parse();

    // Keep guard alive until end of main to ensure logs are written
    let _log_guard = init_logging(args.log_dir.as_deref());

    let options = load_options(&args)?;
    tracing::info!(
        containerd = %options.containerd_address.display(),
        listen = %options.listen_address,
        runtime = %options.runtime_name,
        "magentd starting"
    );

    let metrics = AgentMetrics::new()?;
    let host = Arc::new(ContainerdHost::new(&options.containerd_address));
    let mut agent = MetricsAgent::new(options.clone(), host, metrics).await?;
    agent.start();

    let shutdown = agent.shutdown_token();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let result = server::serve(options.listen_address, agent.app_state(), shutdown).await;

    agent.shutdown().await;

    result
}
