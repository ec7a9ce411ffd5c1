//! Token Acquisition Coordinator: the `get_token` entry point.
//!
//! Pool hit: pop, return immediately, top up in the background if the pool
//! dropped below half target. Pool miss: mint synchronously on the caller's
//! behalf (the one latency-visible path), then schedule a background refill
//! unconditionally. The caller never waits on refill completion.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::Minter;
use crate::error::Result;
use crate::pool::TokenPool;
use crate::registry::KeyRegistry;

/// Per-model pool size the prefetcher aims for.
pub const DEFAULT_TARGET_POOL_SIZE: usize = 5;

/// What `get_token` hands back. `is_new` tells the caller a signing-server
/// round trip was just paid for, so a purchased-credit counter upstream can
/// be decremented.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub signed_token: String,
    pub is_new: bool,
}

pub struct TokenCoordinator {
    registry: Arc<KeyRegistry>,
    pool: Arc<TokenPool>,
    minter: Arc<dyn Minter>,
    prefetch_tx: mpsc::UnboundedSender<String>,
    target_pool_size: usize,
}

impl TokenCoordinator {
    pub fn new(
        registry: Arc<KeyRegistry>,
        pool: Arc<TokenPool>,
        minter: Arc<dyn Minter>,
        prefetch_tx: mpsc::UnboundedSender<String>,
        target_pool_size: usize,
    ) -> Self {
        Self {
            registry,
            pool,
            minter,
            prefetch_tx,
            target_pool_size,
        }
    }

    /// Returns a ready-to-spend (token, signature) pair for `model`, either
    /// from the pool or freshly minted. Never returns a pending state.
    pub async fn get_token(&self, model: &str) -> Result<IssuedToken> {
        // An unregistered model is a configuration error; bail before
        // touching pool or signer.
        self.registry.lookup(model)?;

        if let Some(entry) = self.pool.pop(model).await {
            let remaining = self.pool.len(model).await;
            if remaining * 2 < self.target_pool_size {
                self.schedule_prefetch(model);
            }
            debug!(model, remaining, "token served from pool");
            return Ok(IssuedToken {
                token: entry.token,
                signed_token: entry.signed_token,
                is_new: false,
            });
        }

        info!(model, "pool empty, minting synchronously");
        let minted = self.minter.mint_one(model).await?;
        self.schedule_prefetch(model);

        Ok(IssuedToken {
            token: minted.token,
            signed_token: minted.signed_token,
            is_new: true,
        })
    }

    /// Fire-and-forget: hands the model to the prefetch worker. A closed
    /// channel means the worker is gone (shutdown); dropping the request is
    /// the right thing then.
    fn schedule_prefetch(&self, model: &str) {
        if self.prefetch_tx.send(model.to_string()).is_err() {
            warn!(model, "prefetch worker unavailable, skipping refill request");
        }
    }
}
