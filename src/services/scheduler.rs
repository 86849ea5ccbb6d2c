use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

use crate::services::rewards::RewardService;

pub struct ExpiryScheduler {
    schedule: Schedule,
    rewards: RewardService,
    limit: i64,
}

impl ExpiryScheduler {
    pub fn new(expression: &str, rewards: RewardService, limit: i64) -> anyhow::Result<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", expression, e))?;
        Ok(Self {
            schedule,
            rewards,
            limit,
        })
    }

    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// Sweeps until fewer than `limit` batches come back, so a backlog is
    /// cleared in bounded transactions.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut total = 0;
        loop {
            match self.rewards.expire(now, self.limit).await {
                Ok(summary) => {
                    total += summary.batches;
                    if (summary.batches as i64) < self.limit {
                        break;
                    }
                }
                Err(e) => {
                    error!("Expiry sweep failed: {}", e);
                    break;
                }
            }
        }
        total
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Expiry scheduler started");

        while !*shutdown.borrow() {
            let now = Utc::now();
            let Some(next) = self.next_run_after(now) else {
                info!("Cron schedule has no further runs");
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = sleep(wait) => {}
            }

            let expired = self.sweep(Utc::now()).await;
            info!(expired, next = ?self.next_run_after(Utc::now()), "Expiry sweep finished");
        }

        info!("Expiry scheduler stopped");
    }
}
