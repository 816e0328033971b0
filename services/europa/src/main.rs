//! Registry server binary.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use europa::config::RegistryConfig;
use europa::sync::{RepoMonitorTask, SyncWorker};
use europa::{RegistryContext, RegistryResult};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Multi-backend container registry")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_config(cli: &Cli) -> eyre::Result<RegistryConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading configuration from {path}"))?;
            toml_edit::de::from_str(&text)
                .wrap_err_with(|| format!("parsing configuration from {path}"))?
        }
        None => RegistryConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    Ok(config)
}

async fn sync_once(ctx: &RegistryContext, domain: &str) -> RegistryResult<()> {
    for monitor in RepoMonitorTask::watched(ctx, domain).await? {
        if let Err(error) = monitor.run(ctx).await {
            tracing::warn!(%error, "Repository monitor failed");
        }
    }
    let report = SyncWorker::new(ctx.clone()).run_pending().await?;
    if report.completed > 0 || !report.failed.is_empty() {
        tracing::info!(
            completed = report.completed,
            failed = report.failed.len(),
            "Sync tasks finished"
        );
    }
    Ok(())
}

async fn sync_loop(ctx: RegistryContext, domain: String, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(error) = sync_once(&ctx, &domain).await {
            tracing::error!(%error, "Sync pass failed");
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Unable to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = load_config(&cli)?;

    let mut builder = config.builder()?;
    let ctx = builder.build_context()?;
    let app = builder.build()?;

    if let Some(period) = config.sync_interval() {
        tracing::info!(?period, "Polling mirrored repositories");
        tokio::spawn(sync_loop(ctx, config.domain.clone(), period));
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!(domain = %config.domain, "Registry listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
