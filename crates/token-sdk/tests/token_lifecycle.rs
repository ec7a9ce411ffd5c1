//! End-to-end lifecycle over real crypto: blind-sign-unblind-verify against
//! an in-process signer, pooled delivery, and background refill.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::RsaPublicKey;
use tokio::sync::mpsc;
use tokio::time::sleep;

use veiltoken::testutil::{local_registry, LocalSigner};
use veiltoken::{
    blind, spawn_prefetch_worker, BlindSignatureEngine, Minter, Prefetcher, TokenCoordinator,
    TokenPool, DEFAULT_TARGET_POOL_SIZE,
};

struct Stack {
    signer: Arc<LocalSigner>,
    pool: Arc<TokenPool>,
    coordinator: TokenCoordinator,
    worker: tokio::task::JoinHandle<()>,
}

fn build_stack() -> Stack {
    let signer = Arc::new(LocalSigner::new());
    let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
    let pool = Arc::new(TokenPool::in_memory());
    let engine: Arc<dyn Minter> =
        Arc::new(BlindSignatureEngine::new(registry.clone(), signer.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    let prefetcher = Arc::new(
        Prefetcher::new(pool.clone(), engine.clone(), DEFAULT_TARGET_POOL_SIZE)
            .with_pacing(Duration::ZERO, Duration::ZERO),
    );
    let worker = spawn_prefetch_worker(prefetcher, rx);

    let coordinator = TokenCoordinator::new(
        registry,
        pool.clone(),
        engine,
        tx,
        DEFAULT_TARGET_POOL_SIZE,
    );

    Stack {
        signer,
        pool,
        coordinator,
        worker,
    }
}

async fn wait_for_pool(pool: &TokenPool, model: &str, len: usize) {
    for _ in 0..600 {
        if pool.len(model).await >= len {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("pool never reached {} entries", len);
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_then_pooled_delivery() {
    let stack = build_stack();

    // Cold start: the pool is empty, so the caller pays for one mint.
    let first = stack.coordinator.get_token("gpt-test").await.unwrap();
    assert!(first.is_new);

    // The background worker tops the pool up to target.
    wait_for_pool(&stack.pool, "gpt-test", DEFAULT_TARGET_POOL_SIZE).await;

    // Warm path: served from the pool, no signing round trip. With a full
    // pool the remaining four entries are above half target, so no refill
    // is scheduled either.
    let calls_before = stack.signer.calls();
    let second = stack.coordinator.get_token("gpt-test").await.unwrap();
    assert!(!second.is_new);
    assert_eq!(stack.signer.calls(), calls_before);
    assert_ne!(first.token, second.token);

    // Every pooled pair carries a signature that verifies against the
    // model's public key over the original token bytes.
    let pubkey = RsaPublicKey::from(stack.signer.private_key());
    let mut drained = 0;
    while let Some(entry) = stack.pool.pop("gpt-test").await {
        let token = BASE64.decode(&entry.token).unwrap();
        let signature = BASE64.decode(&entry.signed_token).unwrap();
        blind::verify(&pubkey, &token, &signature).unwrap();
        drained += 1;
    }
    assert_eq!(drained, DEFAULT_TARGET_POOL_SIZE - 1);

    drop(stack.coordinator);
    stack.worker.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_cold_callers_each_get_a_distinct_token() {
    let stack = build_stack();
    let coordinator = Arc::new(stack.coordinator);

    let a = {
        let c = coordinator.clone();
        tokio::spawn(async move { c.get_token("gpt-test").await })
    };
    let b = {
        let c = coordinator.clone();
        tokio::spawn(async move { c.get_token("gpt-test").await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_ne!(a.token, b.token);

    drop(coordinator);
    stack.worker.await.unwrap();
}

#[tokio::test]
async fn refill_entries_are_real_verified_tokens() {
    let signer = Arc::new(LocalSigner::new());
    let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
    let pool = Arc::new(TokenPool::in_memory());
    let engine: Arc<dyn Minter> = Arc::new(BlindSignatureEngine::new(registry, signer.clone()));
    let prefetcher = Prefetcher::new(pool.clone(), engine, DEFAULT_TARGET_POOL_SIZE)
        .with_pacing(Duration::ZERO, Duration::ZERO);

    let report = prefetcher.refill_bounded("gpt-test", 2).await;
    assert_eq!(report.minted, 2);

    let pubkey = RsaPublicKey::from(signer.private_key());
    while let Some(entry) = pool.pop("gpt-test").await {
        let token = BASE64.decode(&entry.token).unwrap();
        let signature = BASE64.decode(&entry.signed_token).unwrap();
        blind::verify(&pubkey, &token, &signature).unwrap();
    }
}
