//! Mailflow - mail-triggered headless browser job orchestrator.
//!
//! One process runs the whole pipeline: the webhook-fed mailbox and its
//! watcher, the mail dispatcher, the job orchestrator with its browser
//! session pool, and the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailflow::mail::Credentials;
use mailflow::{
    web, AppState, Browser, BrowserSessionPool, Config, CorrelationIndex, MailWatcher,
    Orchestrator, ResultStore, WebDriverBrowser, WebhookInbox,
};

/// How long in-flight jobs get to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Mail events buffered between the watcher and the dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("mailflow_starting");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        port = config.port,
        api_auth_configured = config.api_token.is_some(),
        cloudflare_auth_configured = config.cloudflare_auth_token.is_some(),
        mailgun_signing_configured = config.mailgun_signing_key.is_some(),
        pool_max_sessions = config.pool_max_sessions,
        max_attempts = config.max_attempts,
        retry_scope = ?config.retry_scope,
        correlation_field = ?config.correlation_field,
        correlation_match = ?config.correlation_match,
        webdriver_url = %config.webdriver_url,
        result_store_path = ?config.result_store_path,
        "config_loaded"
    );

    let store = Arc::new(match &config.result_store_path {
        Some(path) => ResultStore::open(config.result_retention(), path)
            .await
            .context("Failed to load result store")?,
        None => ResultStore::new(config.result_retention()),
    });

    let browser: Arc<dyn Browser> = Arc::new(WebDriverBrowser::new(config.webdriver_settings())?);
    let pool = BrowserSessionPool::new(Arc::clone(&browser), config.pool_settings());
    let index = Arc::new(CorrelationIndex::new(config.match_rule()));
    let orchestrator = Orchestrator::new(
        index,
        pool.clone(),
        browser,
        Arc::clone(&store),
        config.orchestrator_settings(),
    );

    let inbox = WebhookInbox::new(config.mail_inbox_capacity);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watcher = MailWatcher::new(
        inbox.clone(),
        Credentials::default(),
        config.watcher_settings(),
        config.extractor()?,
        events_tx,
    )
    .start(config.poll_interval(), config.filter_rules());

    let dispatcher = orchestrator.spawn_dispatcher(events_rx);
    let reaper = pool.spawn_reaper(config.reaper_interval());
    let sweeper = store.spawn_sweeper(config.reaper_interval());

    let state = AppState::new(
        config.clone(),
        Arc::clone(&orchestrator),
        inbox.clone(),
        watcher.health_receiver(),
    );
    let app = web::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "api_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop intake first, then drain jobs, then release browsers.
    watcher.stop().await;
    inbox.close().await;
    if let Err(e) = dispatcher.await {
        error!(error = %e, "mail_dispatcher_task_failed");
    }

    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    sweeper.abort();
    pool.shutdown().await;
    reaper.abort();

    if let Err(e) = store.persist().await {
        warn!(error = %e, "result_store_persist_failed");
    }

    info!("mailflow_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("mailflow_shutting_down");
}
