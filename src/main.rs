use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use lead_relay::agents::builtin_registry;
use lead_relay::channels::{DryRunChannel, HttpGateway, OutboundChannel};
use lead_relay::config::{GatewayConfig, PipelineConfig, ServerConfig};
use lead_relay::pipeline::{MessagePipeline, spawn_sweep_task};
use lead_relay::server::routes;
use lead_relay::store::{Database, LibSqlBackend};

/// Console logging by default; `LEAD_RELAY_LOG_DIR` switches to a daily
/// rolling file and `LEAD_RELAY_LOG_FORMAT=json` to JSON lines. The guard
/// must live until exit so buffered lines are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LEAD_RELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let (writer, guard) = match std::env::var("LEAD_RELAY_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        Err(_) => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    guard
}

async fn open_database(path: &str) -> anyhow::Result<Arc<dyn Database>> {
    let backend = if path == ":memory:" {
        warn!("Using an in-memory database; conversations will not survive a restart");
        LibSqlBackend::new_memory().await?
    } else {
        LibSqlBackend::new_local(Path::new(path))
            .await
            .with_context(|| format!("failed to open database at {path}"))?
    };
    Ok(Arc::new(backend))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let server = ServerConfig::from_env();
    let config = PipelineConfig::from_env();
    config.validate().context("invalid pipeline configuration")?;

    let db = open_database(&server.db_path).await?;

    let channel: Arc<dyn OutboundChannel> = match GatewayConfig::from_env() {
        Some(gateway) => {
            info!(base_url = %gateway.base_url, instance = %gateway.instance, "Gateway channel configured");
            Arc::new(HttpGateway::new(gateway))
        }
        None => {
            warn!("LEAD_RELAY_GATEWAY_URL not set; replies will only be logged");
            Arc::new(DryRunChannel)
        }
    };

    let pipeline = Arc::new(MessagePipeline::new(config, db, channel, builtin_registry()));
    let _sweeper = spawn_sweep_task(Arc::clone(&pipeline), server.sweep_interval);

    let listener = tokio::net::TcpListener::bind(&server.bind)
        .await
        .with_context(|| format!("failed to bind {}", server.bind))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server.bind,
        db = %server.db_path,
        "lead-relay listening"
    );

    axum::serve(listener, routes(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
