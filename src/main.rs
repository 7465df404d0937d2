//! Application entry point for the `telemetry-bridge` service.
//!
//! This binary orchestrates the full startup sequence for the telemetry
//! ingestion bridge, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Building the configured delivery sink (HTTP forward or PostgreSQL insert)
//! - Connecting to RabbitMQ and subscribing one consumer per instance
//! - Serving the `/health` probe via the `routes` gateway (EMBP pattern)
//! - Draining in-flight messages on SIGINT/SIGTERM before exiting
//!
//! # Environment Variables
//! See [`config::load_from_env`] for the bridge settings. Logging is tuned with:
//! - `LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `LOG_FORMAT` (optional) – `json` for JSON lines, compact text otherwise
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Connection setup failures are fatal and end the process with an error, so
//! an external supervisor can restart it with backoff.
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use uuid::Uuid;

mod config;
mod consumer;
mod error;
mod models;
mod normalize;
mod queue;
mod retry;
mod routes;
mod schema;
mod sink;

use config::{Config, SinkConfig};
use consumer::{ConsumerState, ConsumerStatus, EventConsumer};
use normalize::Normalizer;
use queue::AmqpConnection;
use sink::{DbSink, HttpSink, Sink};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let sink = build_sink(&cfg).await?;
    let normalizer = Normalizer::new(cfg.schema_variant, cfg.tenant_tag.clone());
    let retry_policy = cfg.retry_policy();
    tracing::info!(
        max_attempts = retry_policy.max_attempts(),
        "Delivery retry policy ready"
    );

    let connection = AmqpConnection::connect(&cfg).await?;
    let shutdown = CancellationToken::new();

    let mut consumers = JoinSet::new();
    let mut statuses = Vec::with_capacity(cfg.consumer_instances);
    for instance in 0..cfg.consumer_instances {
        // ---
        let consumer_tag = format!("{}-{}-{}", cfg.app_name, instance, Uuid::new_v4());
        let source = connection.subscribe(&consumer_tag).await?;

        let status = Arc::new(ConsumerStatus::new(instance));
        status.set_state(ConsumerState::Connected);
        statuses.push(status.clone());

        let consumer = EventConsumer::new(
            source,
            normalizer.clone(),
            sink.clone(),
            retry_policy,
            cfg.drain_timeout,
            status,
        );
        let span = tracing::info_span!("consumer", app = %cfg.app_name, instance, %consumer_tag);
        consumers.spawn(consumer.run(shutdown.clone()).instrument(span));
    }

    // Build app from routes gateway (EMBP)
    let app = routes::router(statuses);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.health_port));
    tracing::info!("Health probe listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    // One failed instance takes the whole process down for a clean restart.
    let mut failed = false;
    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Consumer instance failed");
                failed = true;
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "Consumer task panicked");
                failed = true;
                shutdown.cancel();
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
    server.await??;

    if failed {
        return Err(anyhow!("one or more consumer instances failed"));
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

// ---

/// Construct the configured sink, preparing its destination if needed.
async fn build_sink(cfg: &Config) -> Result<Arc<dyn Sink>> {
    // ---
    match &cfg.sink {
        SinkConfig::Http {
            api_base_url,
            resource_path,
            request_timeout,
        } => {
            let sink = HttpSink::new(api_base_url, resource_path, *request_timeout)
                .context("Failed to build HTTP client")?;
            tracing::info!(endpoint = sink.endpoint(), "Forwarding records over HTTP");
            Ok(Arc::new(sink))
        }
        SinkConfig::Db {
            db_url,
            db_pool_max,
        } => {
            tracing::info!("Attempting to connect to database");

            let pool = PgPoolOptions::new()
                .max_connections(*db_pool_max)
                .connect(db_url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            Ok(Arc::new(DbSink::new(pool)))
        }
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, draining"),
        _ = terminate => tracing::info!("received SIGTERM, draining"),
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - JSON lines when `LOG_FORMAT=json`, otherwise compact text with target,
///   file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,lapin=warn"))
    };

    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(span_events)
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(span_events)
            .with_env_filter(env_filter)
            .with_ansi(use_color)
            .compact()
            .init();
    }
}
