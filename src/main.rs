use kernelgate::build_router;
use kernelgate::config::{Config, LoggingConfig};
use kernelgate::pool::{ConnectionPool, PoolConfig};
use kernelgate::server::GatewayServer;
use kernelgate::supervisor::Supervisor;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Config file read when no path is given
const DEFAULT_CONFIG_PATH: &str = "kernelgate.toml";

/// Name of the disk log inside `logging.directory`
const DISK_LOG_FILE: &str = "kernelgate.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // A missing default file means defaults; a missing explicit file is an error
    let config = if explicit_path.is_none() && !config_path.exists() {
        Config::from_env()?
    } else {
        Config::load(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path.display(), e))?
    };

    init_logging(&config.logging)?;
    print_startup_banner(&config, &config_path);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let supervisor = Supervisor::new(
        config.backend.clone(),
        Arc::clone(&pool),
        config.server.request_timeout(),
    );
    if let Err(e) = supervisor.init() {
        // Keep serving: bridges and the local service proxy work without the kernel server
        error!(error = %e, "Failed to launch kernel server");
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::bind(bind_addr).await?;
    let router = Arc::new(build_router(
        &config,
        server.local_addr().port(),
        Arc::clone(&pool),
        Some(Arc::clone(&supervisor)),
    ));

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(router, shutdown_rx).await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping kernel server...");
    supervisor.close();

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        forwarded_requests = pool.stats().get_total_requests(),
        "Shutdown complete"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", config.filter, e))?;

    let disk_layer = if config.disk_log {
        let directory = Path::new(&config.directory);
        std::fs::create_dir_all(directory).map_err(|e| {
            anyhow::anyhow!("Failed to create log directory '{}': {}", config.directory, e)
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(directory.join(DISK_LOG_FILE))?;
        Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(disk_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    Ok(())
}

fn print_startup_banner(config: &Config, config_path: &Path) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        subcommand = %config.backend.subcommand,
        port_search_start = config.backend.port,
        root_dir = %config.backend.root_dir,
        content_dir = %config.backend.content_dir,
        startup_timeout_secs = config.backend.startup_timeout_secs,
        "Kernel server settings"
    );
    info!(
        reverse_proxy = config.features.reverse_proxy,
        terminal = config.features.terminal,
        plain_shell = config.features.plain_shell,
        disk_log = config.logging.disk_log,
        "Features"
    );
}
