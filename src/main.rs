use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use relay_forward::channels::{CachedAuthorDirectory, TelegramApi, TelegramSender, spawn_poller};
use relay_forward::config::{ForwarderConfig, TelegramConfig};
use relay_forward::pipeline::{DefaultPayloadBuilder, Forwarder, ForwarderDeps, ShutdownMode};
use relay_forward::store::{JsonStore, LastSeenIds, RuleBook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ForwarderConfig::from_env();
    let telegram = TelegramConfig::from_env()
        .context("export TELEGRAM_BOT_TOKEN=123456:ABC... to run the forwarder")?;

    // ── Storage ──────────────────────────────────────────────────────────
    let data_dir =
        std::env::var("FORWARDER_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let store = JsonStore::new(&data_dir);
    let rules = Arc::new(
        RuleBook::load(&store)
            .await
            .with_context(|| format!("loading rules from {data_dir}"))?,
    );
    let last_seen = Arc::new(
        LastSeenIds::load(store.clone())
            .await
            .with_context(|| format!("loading last-seen ids from {data_dir}"))?,
    );

    eprintln!("📨 Relay Forward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", data_dir);
    eprintln!("   Rules: {} ({} enabled)", rules.len(), rules.enabled_sources().len());

    // ── Telegram ─────────────────────────────────────────────────────────
    let api = TelegramApi::new(telegram.bot_token);
    let username = api.get_me().await.context("verifying Telegram bot token")?;
    eprintln!("   Bot: @{}", username);

    let directory = Arc::new(CachedAuthorDirectory::new());
    let deps = ForwarderDeps {
        rules: rules.clone(),
        authors: directory.clone(),
        sender: Arc::new(TelegramSender::new(api.clone())),
        payloads: Arc::new(DefaultPayloadBuilder::with_authors(directory.clone())),
        last_seen: last_seen.clone(),
    };
    let forwarder = Arc::new(Forwarder::start(config, deps)?);

    let (poller, poller_shutdown) = spawn_poller(
        api,
        Arc::clone(&forwarder),
        directory,
        telegram.poll_timeout_secs,
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    eprintln!("\nShutting down...");

    poller_shutdown.store(true, Ordering::Relaxed);
    poller.abort();

    let report = forwarder.shutdown(ShutdownMode::Abandon).await;
    tracing::info!(
        abandoned_queued = report.abandoned_queued,
        abandoned_albums = report.abandoned_albums,
        abandoned_deferred = report.abandoned_deferred,
        "Pipeline stopped"
    );

    last_seen.persist().await.context("saving last-seen ids")?;
    rules.save(&store).await.context("saving rules")?;

    Ok(())
}
