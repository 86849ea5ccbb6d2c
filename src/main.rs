use clap::Parser;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payflow_core::cli::{Cli, Commands, DbCommands, EventCommands, RewardCommands};
use payflow_core::config::{Config, LogFormat};
use payflow_core::services::ExpiryScheduler;
use payflow_core::{cli, create_app, db, startup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Db(DbCommands::Migrate)) => cli::handle_db_migrate(&config).await,
        Some(Commands::Events(command)) => {
            let pool = db::create_pool(&config).await?;
            let state = startup::build_state(&config, pool).await?;
            match command {
                EventCommands::Replay { event_id } => {
                    cli::handle_events_replay(&state, &event_id).await
                }
                EventCommands::ListFailed { limit } => {
                    cli::handle_events_list_failed(&state, limit).await
                }
            }
        }
        Some(Commands::Rewards(RewardCommands::Expire { limit })) => {
            let pool = db::create_pool(&config).await?;
            let state = startup::build_state(&config, pool).await?;
            cli::handle_rewards_expire(&state, &config, limit).await
        }
        Some(Commands::Config) => {
            cli::handle_config_validate(&config)?;
            let pool = db::create_pool(&config).await?;
            let report = startup::validate_environment(&config, &pool).await?;
            report.print();
            if !report.is_valid() {
                anyhow::bail!("Configuration validation failed");
            }
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;
    db::migrate(&pool).await?;

    let state = startup::build_state(&config, pool).await?;
    let scheduler = ExpiryScheduler::new(
        &config.expiry_sweep_cron,
        state.rewards.clone(),
        config.expiry_sweep_limit,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = state
        .worker_pool(config.worker_settings())
        .spawn(shutdown_rx.clone());
    background.push(tokio::spawn(scheduler.run(shutdown_rx)));
    tracing::info!(workers = config.worker_concurrency, "Background workers started");

    let app = create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("Background task ended abnormally: {}", e);
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
