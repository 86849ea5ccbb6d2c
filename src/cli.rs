use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::domain::WebhookEventStatus;
use crate::AppState;

#[derive(Parser)]
#[command(name = "payflow-core")]
#[command(about = "Payflow Core - payment event and ledger pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server, event workers and expiry scheduler (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Webhook event administration
    #[command(subcommand)]
    Events(EventCommands),

    /// Reward batch maintenance
    #[command(subcommand)]
    Rewards(RewardCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum EventCommands {
    /// Re-enqueue a FAILED event from its stored payload
    Replay {
        #[arg(value_name = "EVENT_ID")]
        event_id: String,
    },

    /// List FAILED events
    ListFailed {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum RewardCommands {
    /// Expire batches whose expiry has passed
    Expire {
        #[arg(short, long)]
        limit: Option<i64>,
    },
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::migrate(&pool).await?;
    println!("✓ Database migrations completed");

    Ok(())
}

pub async fn handle_events_replay(state: &AppState, event_id: &str) -> anyhow::Result<()> {
    let outcome = state.intake.replay(event_id).await?;
    tracing::info!(event_id = %event_id, outcome = ?outcome, "Event replayed from CLI");
    println!("✓ Event {} replayed ({:?})", event_id, outcome);
    Ok(())
}

pub async fn handle_events_list_failed(state: &AppState, limit: i64) -> anyhow::Result<()> {
    let events = state
        .events
        .list_by_status(WebhookEventStatus::Failed, limit)
        .await?;

    if events.is_empty() {
        println!("No failed events");
        return Ok(());
    }

    println!("{:<32} {:<36} {:<20} Error", "Event ID", "Type", "Received");
    println!("{}", "-".repeat(110));
    for event in events {
        println!(
            "{:<32} {:<36} {:<20} {}",
            event.event_id,
            event.event_type,
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.error.unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn handle_rewards_expire(
    state: &AppState,
    config: &Config,
    limit: Option<i64>,
) -> anyhow::Result<()> {
    let limit = limit.unwrap_or(config.expiry_sweep_limit);
    let summary = state.rewards.expire(Utc::now(), limit).await?;
    println!(
        "✓ Expired {} batch(es), forfeited {}",
        summary.batches, summary.forfeited
    );
    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Redis URL: {}", mask_password(&config.redis_url));
    println!("  Gateway API URL: {}", config.gateway_api_url);
    println!("  Gateway API Key: {}", mask_secret(&config.gateway_api_key));
    println!("  Platform Fee: {}%", config.platform_fee_percent);
    println!("  Workers: {}", config.worker_concurrency);
    println!(
        "  Queue: {} attempts, {}ms backoff",
        config.job_options().max_attempts,
        config.queue_backoff_ms
    );
    println!(
        "  Locks: {}ms TTL, {} retries from {}ms",
        config.lock_ttl_ms, config.lock_retry_attempts, config.lock_retry_delay_ms
    );
    println!("  Expiry Sweep: '{}' (limit {})", config.expiry_sweep_cron, config.expiry_sweep_limit);

    println!("✓ Configuration loaded");
    Ok(())
}

/// Replaces the password of a connection URL, leaving everything else readable.
fn mask_password(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => match parsed.set_password(Some("****")) {
            Ok(()) => parsed.to_string(),
            Err(()) => "****".to_string(),
        },
        _ => raw.to_string(),
    }
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(7).collect();
    if secret.chars().count() <= 7 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}
