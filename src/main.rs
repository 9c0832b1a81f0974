use forerunner::config::{Config, DEFAULT_CONFIG_PATH};
use forerunner::gateway::{AdmissionGateway, FrontDoor, ProcfileLauncher};
use forerunner::procfile::{self, load_env_files};
use forerunner::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const USAGE: &str = "usage: forerunner [start|serve] [config.toml]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forerunner=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "start".to_string());
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(name = PKG_NAME, version = VERSION, command = %command, "Starting");
    info!(path = %config_path.display(), exists = config_path.exists(), "Configuration loaded");

    match command.as_str() {
        "start" => run_start(config).await,
        "serve" => run_serve(config).await,
        other => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

/// Run every process in the Procfile until they exit or a signal arrives
async fn run_start(config: Config) -> anyhow::Result<()> {
    let options = config.supervisor.start_options();
    info!(
        dir = %options.dir.display(),
        procfile = %options.procfile,
        base_port = options.base_port,
        concurrency = ?options.concurrency,
        "Supervisor configuration"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    procfile::start(options, async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    })
    .await?;

    signals.abort();
    Ok(())
}

/// Serve the front door until a signal arrives
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let gateway_config = &config.gateway;
    let bind_addr = gateway_config.bind_addr()?;
    let ports = Arc::new(config.ports.port_manager()?);
    let grace_period = Duration::from_secs(config.supervisor.shutdown_grace_period_secs);

    let (pool_dir, procfile) = gateway_config.procfile_location();
    let extra_env = load_env_files(&pool_dir, &config.supervisor.env_files)?;

    info!(
        bind = %bind_addr,
        pool_dir = %pool_dir.display(),
        group = %gateway_config.group,
        instances = gateway_config.instances,
        idle_timeout_secs = gateway_config.idle_timeout_secs,
        port_range = %format!("{}-{}", ports.min_port(), ports.max_port()),
        "Gateway configuration"
    );

    let launcher = ProcfileLauncher::new(pool_dir, &gateway_config.group, gateway_config.instances, ports)
        .with_procfile(procfile)
        .with_base_port(config.supervisor.base_port)
        .with_grace_period(grace_period)
        .with_extra_env(extra_env);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (gateway, coordinator) = AdmissionGateway::spawn(launcher, gateway_config.settings(), shutdown_rx.clone());

    let front_door = FrontDoor::new(bind_addr, gateway, shutdown_rx);
    let server = tokio::spawn(async move {
        if let Err(e) = front_door.run().await {
            error!(error = %e, "Front door error");
        }
    });

    shutdown_signal().await?;
    let _ = shutdown_tx.send(true);

    // Wait for the pool to stop (with timeout)
    let _ = tokio::time::timeout(grace_period + Duration::from_secs(5), async {
        let _ = server.await;
        let _ = coordinator.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() -> anyhow::Result<()> {
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
