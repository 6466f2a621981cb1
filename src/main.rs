//! softstop - serve listeners and shut down gracefully
//!
//! Usage:
//!     softstop --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::info;

use softstop::config::{load_config, Config, JobConfig, ListenerConfig, Protocol};
use softstop::metrics::{MetricsCollector, MetricsServer};
use softstop::net::ListenerAdapter;
use softstop::util::init_logging;
use softstop::{echo, http, ShutdownCoordinator};

/// Serve configured listeners and drain them gracefully on SIGINT, SIGTERM or SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "softstop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Hard shutdown: {}", config.shutdown.hard_shutdown);
        match config.shutdown.grace_period {
            Some(grace) => println!("  Grace period: {}", humantime::format_duration(grace)),
            None => println!("  Grace period: none (wait indefinitely)"),
        }
        println!("  Listeners: {}", config.listeners.len());
        for listener in &config.listeners {
            println!(
                "    - {} ({:?}) on {}",
                listener.name, listener.protocol, listener.address
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listeners = config.listeners.len(),
        hard_shutdown = config.shutdown.hard_shutdown,
        grace_period = ?config.shutdown.grace_period,
        "softstop starting"
    );

    run(config)
}

/// Run the service with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point.
async fn run_async(config: Config) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    coordinator.set_hard_shutdown_allowed(config.shutdown.hard_shutdown)?;

    match config.shutdown.grace_period {
        Some(grace) => coordinator.listen_with_timeout(false, grace).await,
        None => coordinator.listen(false).await,
    }
    .context("failed to listen for termination signals")?;

    if !config.shutdown.hard_shutdown && config.shutdown.grace_period.is_none() {
        info!("no grace period and hard shutdown disabled, shutdown will wait for all in-flight work");
    }

    if config.metrics.enabled {
        let collector = MetricsCollector::new(coordinator.clone());
        let server = MetricsServer::bind(
            config.metrics.address,
            config.metrics.path.clone(),
            collector,
        )
        .await
        .with_context(|| format!("failed to bind metrics server on {}", config.metrics.address))?;
        tokio::spawn(server.run(coordinator.shutdown_complete()));
    }

    let mut handles = Vec::new();
    for listener in config.listeners {
        let name = listener.name.clone();
        let address = listener.address.clone();
        let handle = start_listener(listener, &coordinator)
            .await
            .with_context(|| format!("failed to start listener '{name}' on {address}"))?;
        handles.push(handle);
    }

    if let Some(job) = config.job {
        tokio::spawn(run_job(coordinator.clone(), job));
    }

    info!("softstop is running");
    info!("press Ctrl+C to stop, twice to force");

    coordinator.shutdown_complete().wait().await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("softstop shut down complete");
    Ok(())
}

/// Bind one listener and spawn the task serving it.
async fn start_listener(
    config: ListenerConfig,
    coordinator: &ShutdownCoordinator,
) -> Result<JoinHandle<()>> {
    match config.protocol {
        Protocol::Http => {
            let listener = http::bind(config.socket_addr()?, coordinator)
                .await?
                .with_keepalive(config.keepalive);
            let coordinator = coordinator.clone();
            Ok(tokio::spawn(async move {
                http::serve(listener, &coordinator, http::demo_handler).await;
            }))
        }
        Protocol::Tcp => {
            let listener = ListenerAdapter::bind(config.socket_addr()?, coordinator)
                .await?
                .with_keepalive(config.keepalive);
            let initiated = coordinator.shutdown_initiated();
            Ok(tokio::spawn(async move {
                echo::serve(&config.name, listener, initiated).await;
            }))
        }
        #[cfg(unix)]
        Protocol::Unix => {
            let listener = tokio::net::UnixListener::bind(&config.address)?;
            let listener = ListenerAdapter::new(listener, coordinator)?;
            let initiated = coordinator.shutdown_initiated();
            Ok(tokio::spawn(async move {
                echo::serve(&config.name, listener, initiated).await;
                if let Err(e) = std::fs::remove_file(&config.address) {
                    tracing::warn!(path = %config.address, error = %e, "failed to remove socket file");
                }
            }))
        }
        #[cfg(not(unix))]
        Protocol::Unix => anyhow::bail!("unix listeners are not supported on this platform"),
    }
}

/// Periodic job that registers each run as an in-flight operation, so a
/// run that has started is allowed to finish before the process exits.
async fn run_job(coordinator: ShutdownCoordinator, job: JobConfig) {
    let initiated = coordinator.shutdown_initiated();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(job.interval) => {}
            _ = initiated.wait() => break,
        }

        let _operation = coordinator.track_operation();
        info!(duration = %humantime::format_duration(job.duration), "background job started");
        tokio::time::sleep(job.duration).await;
        info!("background job finished");
    }
}
