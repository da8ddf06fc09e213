use crate::admission::Webhook;
use crate::config::{Config, LogFormat};
use crate::metrics::CounterRegistry;
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod admission;
mod config;
mod image_reference;
mod metrics;
mod policy;
mod rewrite;
mod tls;
mod webserver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_format);
    info!("Starting docker-proxy-webhook {}", env!("CARGO_PKG_VERSION"));

    let policy = config::load_policy(&config.config_path, config.reject_overlapping_domains)?;
    policy.log_summary();

    let registry = Arc::new(CounterRegistry::new());
    let webhook = Arc::new(Webhook::new(
        Arc::new(policy),
        config.pull_secret().map(str::to_string),
        registry.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let health = serve(
        "health",
        config.health_addr,
        webserver::create_health_app(),
        shutdown.clone(),
    );
    let metrics = serve(
        "metrics",
        config.metrics_addr,
        webserver::create_metrics_app(registry),
        shutdown.clone(),
    );

    let webhook_app = webserver::create_webhook_app(webhook);
    let webhook_addr = config.webhook_addr();
    let mutate = async {
        if config.disable_tls {
            return serve("webhook", webhook_addr, webhook_app, shutdown.clone()).await;
        }
        let tls_config = tls::load_server_config(&config.tls_cert_path(), &config.tls_key_path())?;
        let listener = TcpListener::bind(webhook_addr)
            .await
            .with_context(|| format!("Failed to bind webhook server to {}", webhook_addr))?;
        info!("Starting webhook server with TLS on {}", webhook_addr);
        tls::serve_tls(listener, webhook_app, tls_config, shutdown.clone()).await
    };

    tokio::try_join!(health, metrics, mutate)?;
    info!("Shut down docker-proxy-webhook");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn serve(
    name: &str,
    addr: SocketAddr,
    app: axum::Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server to {}", name, addr))?;
    info!("Starting {} server on {}", name, addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{} server failed", name))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
    shutdown.cancel();
}
