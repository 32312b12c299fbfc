//! Privilege separation helper: runs gpg for clients connecting on a Unix socket

#[cfg(unix)]
use clap::Parser;
#[cfg(unix)]
use std::path::PathBuf;

/// gpg-task helper - runs gpg on behalf of sandboxed clients
#[cfg(unix)]
#[derive(Parser, Debug)]
#[command(name = "gpg-task-helper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Socket to listen on (default: from the config file, else the temp dir)
    #[arg(short, long, env = "GPG_TASK_HELPER_SOCKET")]
    socket: Option<PathBuf>,

    /// gpg executable to run instead of searching for one
    #[arg(long, env = "GPG_TASK_GPG")]
    gpg: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> gpg_task::Result<()> {
    use gpg_task::Config;
    use gpg_task::helper::{HelperServer, run_with_shutdown};

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| config.helper.socket_path.clone());

    let mut server = HelperServer::new(config.task, &config.helper);
    if let Some(gpg) = args.gpg {
        server = server.with_gpg_path(gpg);
    }

    let listener = HelperServer::bind(&socket)?;
    tracing::info!(socket = %socket.display(), "gpg-task-helper listening");
    let served = run_with_shutdown(server, listener).await;

    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!(error = %e, "socket already removed");
    }
    served
}

#[cfg(not(unix))]
fn main() {
    eprintln!("gpg-task-helper requires a unix platform");
    std::process::exit(1);
}
