use anyhow::{Context, Result};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;

use crate::adapters::{PgEventStore, PgJobQueue, PgLedgerStore, RedisLockStore};
use crate::config::Config;
use crate::gateway::HttpGateway;
use crate::{AppState, Components, PipelineSettings};

/// Outcome of one startup check.
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub failure: Option<String>,
}

impl Check {
    fn from_result(name: &'static str, result: Result<()>) -> Self {
        Check {
            name,
            failure: result.err().map(|e| format!("{:#}", e)),
        }
    }

    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
pub struct ValidationReport {
    pub checks: Vec<Check>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(Check::passed)
    }

    pub fn print(&self) {
        println!("\nStartup checks:");
        for check in &self.checks {
            match &check.failure {
                None => println!("  ✓ {}", check.name),
                Some(reason) => println!("  ✗ {}: {}", check.name, reason),
            }
        }
        let failed = self.checks.iter().filter(|c| !c.passed()).count();
        if failed == 0 {
            println!("All {} checks passed\n", self.checks.len());
        } else {
            println!("{} of {} checks failed\n", failed, self.checks.len());
        }
    }
}

/// Runs every check; a failing one does not stop the rest.
pub async fn validate_environment(config: &Config, pool: &PgPool) -> Result<ValidationReport> {
    let checks = vec![
        Check::from_result("settings", validate_settings(config)),
        Check::from_result("postgres", check_postgres(pool).await),
        Check::from_result("migrations", check_migrations(pool).await),
        Check::from_result("redis", check_redis(&config.redis_url).await),
    ];
    Ok(ValidationReport { checks })
}

fn validate_settings(config: &Config) -> Result<()> {
    let required = [
        ("DATABASE_URL", &config.database_url),
        ("REDIS_URL", &config.redis_url),
        ("GATEWAY_API_KEY", &config.gateway_api_key),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            anyhow::bail!("{} is empty", name);
        }
    }
    if config.server_port == 0 {
        anyhow::bail!("SERVER_PORT cannot be 0");
    }
    if config.platform_fee_percent > 100 {
        anyhow::bail!(
            "PLATFORM_FEE_PERCENT must be at most 100, got {}",
            config.platform_fee_percent
        );
    }

    url::Url::parse(&config.gateway_api_url).context("GATEWAY_API_URL is not a valid URL")?;
    cron::Schedule::from_str(&config.expiry_sweep_cron)
        .map_err(|e| anyhow::anyhow!("EXPIRY_SWEEP_CRON is invalid: {}", e))?;

    Ok(())
}

async fn check_postgres(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("query against the pool failed")?;
    Ok(())
}

async fn check_migrations(pool: &PgPool) -> Result<()> {
    let ledger_table: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('public.transactions')::text")
            .fetch_one(pool)
            .await
            .context("could not inspect the schema")?;

    if ledger_table.is_none() {
        anyhow::bail!("ledger tables are missing, run `payflow-core db migrate`");
    }
    Ok(())
}

async fn check_redis(redis_url: &str) -> Result<()> {
    let client = redis::Client::open(redis_url).context("REDIS_URL is not a valid redis URL")?;
    let mut conn = client
        .get_multiplexed_tokio_connection()
        .await
        .context("could not connect")?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("PING failed")?;
    if pong != "PONG" {
        anyhow::bail!("unexpected PING reply '{}'", pong);
    }
    Ok(())
}

/// Wires the Postgres, Redis and HTTP gateway adapters into a pipeline.
pub async fn build_state(config: &Config, pool: PgPool) -> Result<AppState> {
    let locks = RedisLockStore::connect(&config.redis_url)
        .await
        .context("Failed to connect lock store")?;

    let components = Components {
        ledger: Arc::new(PgLedgerStore::new(pool.clone(), config.statement_timeout())),
        events: Arc::new(PgEventStore::new(pool.clone())),
        queue: Arc::new(PgJobQueue::new(pool)),
        locks: Arc::new(locks),
        gateway: Arc::new(HttpGateway::new(
            config.gateway_api_url.clone(),
            config.gateway_api_key.clone(),
        )),
    };
    let settings = PipelineSettings {
        job_options: config.job_options(),
        lock_options: config.lock_options(),
        platform_fee_percent: config.platform_fee_percent,
    };

    Ok(AppState::build(components, settings))
}
