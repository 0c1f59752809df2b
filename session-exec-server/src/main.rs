use clap::Parser;
use session_exec::{Limits, SessionManager};
use session_exec_server::{create_app, run_server};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    addr: SocketAddr,

    /// Maximum number of live sessions
    #[arg(long, default_value = "40")]
    max_sessions: usize,

    /// Wall-clock budget per execution in milliseconds
    #[arg(long, default_value = "2000")]
    exec_timeout_ms: u64,

    /// Resident-memory ceiling per worker in bytes
    #[arg(long, default_value = "104857600")] // 100MB
    memory_limit: u64,

    /// Idle time in seconds before a session is reclaimed
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Memory sampling cadence in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Reaper wake-up cadence in seconds
    #[arg(long, default_value = "60")]
    reap_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let limits = Limits {
        exec_timeout: Duration::from_millis(args.exec_timeout_ms),
        memory_limit: args.memory_limit,
        max_sessions: args.max_sessions,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        reap_interval: Duration::from_secs(args.reap_interval_secs),
    };

    let manager = SessionManager::new(limits).await?;
    let app = create_app(manager.clone());

    run_server(app, args.addr).await?;

    // Orderly teardown once the listener has drained.
    manager.close_all().await;

    Ok(())
}
