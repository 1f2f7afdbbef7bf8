use anyhow::{Context, Result};
use clap::Parser;
use ferry_core::{BackendResources, Stencil};
use ferry_server::bridgestrap::{Bridgestrap, TestPool, TestPoolConfig};
use ferry_server::{api::ApiConfig, config::Config, kraken};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

/// How long in-flight requests get to drain during shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
struct Args {
    /// Use verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,
}

impl Args {
    fn init_tracing(&self) {
        let level_filter = match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        tracing_subscriber::fmt()
            .with_max_level(level_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.init_tracing();
    tracing::debug!("args: {args:?}");

    let cfg = Config::load(&args.config)?;
    let shutdown = CancellationToken::new();

    // The test pool's inbox is threaded through every hashring as the
    // on-add hook, so resources get tested as they enter the collection.
    let tester = Arc::new(Bridgestrap::new(cfg.backend.bridgestrap_endpoint.clone()));
    let pool = TestPool::new(TestPoolConfig::default(), tester);
    let stencil = Stencil::from_proportions(&cfg.backend.distribution_proportions);
    let resources = Arc::new(BackendResources::new(
        &cfg.backend.supported_resources,
        stencil,
        Some(pool.hook()),
    ));
    let pool_handle = pool.spawn(resources.clone(), shutdown.clone());

    let (ready, kraken_handle) = kraken::spawn(
        cfg.backend.extrainfo_file.clone(),
        resources.clone(),
        shutdown.clone(),
    );
    ready.await.context("kraken failed during initial reload")?;

    let router = ApiConfig::new(resources.clone(), cfg.backend.api_tokens.clone()).into_router(
        &cfg.backend.resources_endpoint,
        &cfg.backend.resource_stream_endpoint,
        &cfg.backend.status_endpoint,
    );

    let addr: SocketAddr = cfg
        .backend
        .web_api
        .api_address
        .parse()
        .context("invalid api_address")?;
    let server_handle = axum_server::Handle::new();
    {
        let server_handle = server_handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
            server_handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
        });
    }

    tracing::info!(%addr, "listening");
    match (&cfg.backend.web_api.cert_file, &cfg.backend.web_api.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_file, key_file)
                .await
                .context("cannot load TLS materials")?;
            axum_server::bind_rustls(addr, tls)
                .handle(server_handle)
                .serve(router.into_make_service())
                .await?;
        }
        _ => {
            axum_server::bind(addr)
                .handle(server_handle)
                .serve(router.into_make_service())
                .await?;
        }
    }

    tracing::info!("waiting for background tasks to stop");
    kraken_handle.await?;
    pool_handle.await?;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");

        tracing::info!("starting shutdown (SIGINT)");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;

        tracing::info!("starting shutdown (SIGTERM)");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
