//! Background Prefetcher: tops a model's pool up to the target size.
//!
//! Minting is deliberately sequential with a pacing delay between rounds so
//! a refill never bursts the signing server. One failed mint skips that
//! slot and moves on; refill itself never fails. Overlapping refills for
//! the same model can over-provision slightly; pooled tokens do not expire,
//! so that is cheaper than cross-invocation locking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::Minter;
use crate::pool::{TokenPool, TokenPoolEntry};

pub const DEFAULT_MINT_PACING: Duration = Duration::from_millis(200);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_millis(500);

/// What one refill pass actually did. Returned instead of an error so
/// callers (and tests) can observe partial failure without refill ever
/// propagating one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefillReport {
    pub attempted: usize,
    pub minted: usize,
}

pub struct Prefetcher {
    pool: Arc<TokenPool>,
    minter: Arc<dyn Minter>,
    target_pool_size: usize,
    pacing: Duration,
    failure_backoff: Duration,
}

impl Prefetcher {
    pub fn new(pool: Arc<TokenPool>, minter: Arc<dyn Minter>, target_pool_size: usize) -> Self {
        Self {
            pool,
            minter,
            target_pool_size,
            pacing: DEFAULT_MINT_PACING,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }

    /// Override the inter-mint delays. Tests set both to zero.
    pub fn with_pacing(mut self, pacing: Duration, failure_backoff: Duration) -> Self {
        self.pacing = pacing;
        self.failure_backoff = failure_backoff;
        self
    }

    /// Refill with no budget limit beyond the target size.
    pub async fn refill(&self, model: &str) -> RefillReport {
        self.refill_bounded(model, usize::MAX).await
    }

    /// Mints up to `min(target - current, budget)` tokens for `model`,
    /// enqueueing each as it lands. Safe to call repeatedly or concurrently.
    pub async fn refill_bounded(&self, model: &str, budget: usize) -> RefillReport {
        let current = self.pool.len(model).await;
        let needed = self.target_pool_size.saturating_sub(current);
        let to_fetch = needed.min(budget);
        if to_fetch == 0 {
            debug!(model, current, "pool already at target, nothing to refill");
            return RefillReport::default();
        }

        info!(model, current, to_fetch, "refilling token pool");
        let mut report = RefillReport::default();
        for attempt in 1..=to_fetch {
            report.attempted += 1;
            // The delay spaces consecutive mints; the last slot has nothing
            // after it, so it sleeps for nobody.
            let more_to_come = attempt < to_fetch;
            match self.minter.mint_one(model).await {
                Ok(minted) => {
                    let entry = TokenPoolEntry {
                        token: minted.token,
                        signed_token: minted.signed_token,
                    };
                    match self.pool.push(model, entry).await {
                        Ok(()) => report.minted += 1,
                        Err(e) => warn!(model, error = %e, "failed to store prefetched token"),
                    }
                    if more_to_come {
                        sleep(self.pacing).await;
                    }
                }
                Err(e) => {
                    // Skip this slot, keep going; the pool just ends up one
                    // entry shorter than target.
                    warn!(model, attempt, error = %e, "background mint failed");
                    if more_to_come {
                        sleep(self.failure_backoff).await;
                    }
                }
            }
        }

        debug!(
            model,
            attempted = report.attempted,
            minted = report.minted,
            "refill pass complete"
        );
        report
    }
}

/// Detached worker draining refill requests from the coordinator. Runs
/// until every sender is dropped.
pub fn spawn_prefetch_worker(
    prefetcher: Arc<Prefetcher>,
    mut requests: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(model) = requests.recv().await {
            let report = prefetcher.refill(&model).await;
            debug!(
                model,
                minted = report.minted,
                attempted = report.attempted,
                "background refill finished"
            );
        }
    })
}
