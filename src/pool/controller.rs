//! The warm-pool reconciliation loop.
//!
//! Each tick re-reads the counts from cloud tags, scales up when the free
//! reserve dips under `min_free`, scales down oldest-first when it exceeds
//! `max_free` and the cooldown has lapsed, and otherwise sleeps. Nothing is
//! remembered between ticks except the scale-down stamp, so the loop is
//! correct under arbitrary restarts.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::target::PoolTarget;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::events::{Event, EventLogger, EventType};

pub struct PoolController {
    target: Arc<dyn PoolTarget>,
    config: PoolConfig,
    events: EventLogger,
    last_scale_down: Option<Instant>,
}

impl PoolController {
    pub fn new(
        target: Arc<dyn PoolTarget>,
        config: PoolConfig,
        events: EventLogger,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            target,
            config,
            events,
            last_scale_down: None,
        })
    }

    /// Runs ticks until cancelled. In-flight cloud operations finish (they
    /// are idempotent) but no new work starts after cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        let kind = self.target.kind();
        info!(
            "pool({}): controller started (min {}, max {}, cap {}, every {:?})",
            kind,
            self.config.min_free,
            self.config.max_free,
            self.config.max_total,
            self.config.check_interval
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.tick(&cancel).await {
                error!("pool({}): tick failed ({}): {}", kind, err.kind(), err);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
        info!("pool({}): controller stopped", kind);
    }

    /// One reconciliation pass. Public so tests (and an operator CLI) can
    /// step the loop deterministically.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        let kind = self.target.kind();
        let counts = self.target.counts().await?;
        debug!(
            "pool({}): free {} / total {} (cap {})",
            kind, counts.free, counts.total, self.config.max_total
        );

        if counts.free < self.config.min_free {
            if counts.total >= self.config.max_total {
                warn!(
                    "pool({}): saturated, free {} below min {} but total {} at cap {}",
                    kind, counts.free, self.config.min_free, counts.total, self.config.max_total
                );
                return Ok(());
            }
            let desired = std::cmp::min(
                self.config.min_free - counts.free,
                self.config.max_total - counts.total,
            );
            self.scale_up(desired, cancel).await;
            return Ok(());
        }

        if counts.free > self.config.max_free {
            let cooled = self
                .last_scale_down
                .map(|stamp| stamp.elapsed() > self.config.scale_down_cooldown)
                .unwrap_or(true);
            if !cooled {
                debug!("pool({}): scale-down suppressed by cooldown", kind);
                return Ok(());
            }
            self.scale_down(counts.free - self.config.max_free, cancel).await?;
        }
        Ok(())
    }

    /// Launches `desired` creations in parallel. Each is independent;
    /// failures are logged and retried by a later tick.
    async fn scale_up(&self, desired: usize, cancel: &CancellationToken) {
        let kind = self.target.kind();
        info!("pool({}): scaling up by {}", kind, desired);
        let results = join_all((0..desired).map(|_| self.target.create_one(cancel))).await;
        let mut created = 0;
        for result in results {
            match result {
                Ok(name) => {
                    created += 1;
                    debug!("pool({}): created {}", kind, name);
                }
                Err(err) => {
                    error!("pool({}): creation failed ({}): {}", kind, err.kind(), err);
                }
            }
        }
        if created > 0 {
            self.events
                .write(Event::new(EventType::ScaleUp).details(serde_json::json!({
                    "pool": kind,
                    "requested": desired,
                    "created": created,
                })))
                .await;
        }
    }

    /// Deletes the oldest free resources in parallel and stamps the
    /// cooldown even when some deletions fail; the next eligible tick
    /// re-observes and finishes the job.
    async fn scale_down(&mut self, excess: usize, cancel: &CancellationToken) -> Result<()> {
        let kind = self.target.kind();
        let victims = self.target.oldest_free(excess).await?;
        info!(
            "pool({}): scaling down by {} ({} selected)",
            kind,
            excess,
            victims.len()
        );
        let results = join_all(
            victims
                .iter()
                .map(|victim| self.target.delete_one(victim, cancel)),
        )
        .await;
        let mut deleted = 0;
        for (victim, result) in victims.iter().zip(results) {
            match result {
                Ok(()) => {
                    deleted += 1;
                    debug!("pool({}): deleted {}", kind, victim.name);
                }
                Err(err) => {
                    error!(
                        "pool({}): deletion of {} failed ({}): {}",
                        kind,
                        victim.name,
                        err.kind(),
                        err
                    );
                }
            }
        }
        self.last_scale_down = Some(Instant::now());
        if deleted > 0 {
            self.events
                .write(Event::new(EventType::ScaleDown).details(serde_json::json!({
                    "pool": kind,
                    "excess": excess,
                    "deleted": deleted,
                })))
                .await;
        }
        Ok(())
    }
}
