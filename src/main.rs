//! edge-bridge CLI entrypoint.
//!
//! `edge-bridge start` (also the default with no subcommand) runs the
//! daemon in the foreground until it receives SIGINT/SIGTERM. `status`
//! checks the local `/readyz` surface; `health` checks backend
//! reachability. Restart/stop/log-tailing are left to the process
//! supervisor (systemd/launchd unit) wrapping this binary.

use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_STATUS_BIND: &str = "127.0.0.1:8787";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let subcommand = args.get(1).map(String::as_str).unwrap_or("start");

    match subcommand {
        "start" => start().await,
        "status" => status().await,
        "health" => health().await,
        other => {
            eprintln!("unknown subcommand '{other}' (expected: start, status, health)");
            std::process::exit(2);
        }
    }
}

async fn start() {
    let config = match edge_bridge::config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %config.edge.agent_id,
        "edge-bridge starting"
    );

    let status_bind =
        std::env::var("STATUS_HTTP_BIND").unwrap_or_else(|_| DEFAULT_STATUS_BIND.to_owned());
    let supervisor = edge_bridge::supervisor::Supervisor::new(config, status_bind);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = supervisor.run(shutdown_rx).await {
        eprintln!("FATAL: supervisor exited with error: {e}");
        std::process::exit(1);
    }
    info!("edge-bridge shut down gracefully");
}

async fn status() {
    let status_bind =
        std::env::var("STATUS_HTTP_BIND").unwrap_or_else(|_| DEFAULT_STATUS_BIND.to_owned());
    let ready = reqwest::get(format!("http://{status_bind}/readyz"))
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    if ready {
        println!("ready");
    } else {
        println!("not ready");
        std::process::exit(1);
    }
}

async fn health() {
    let config = match edge_bridge::config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    let client = match edge_bridge::backend_client::BackendClient::new(
        config.backend.url,
        config.edge.secret,
        config.edge.agent_id,
        config.backend.request_timeout_ms,
        config.backend.max_concurrent_requests,
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: failed to build backend client: {e}");
            std::process::exit(1);
        }
    };
    if client.health().await {
        println!("backend reachable");
    } else {
        println!("backend unreachable");
        std::process::exit(1);
    }
}

fn init_tracing(logging: &edge_bridge::config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    match &logging.file {
        Some(path) => {
            let dir = std::path::Path::new(path)
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "edge-bridge.log".to_owned());
            let file_appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leaked deliberately: the guard must outlive the process for
            // buffered lines to flush, and this runs exactly once at startup.
            Box::leak(Box::new(guard));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
