//! Top-level facade wiring transport, registry, engine, pool, coordinator
//! and the prefetch worker together.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use veilnet::{AnonHttpClient, Config as TransportConfig};

use crate::coordinator::{IssuedToken, TokenCoordinator, DEFAULT_TARGET_POOL_SIZE};
use crate::engine::{BlindSignatureEngine, HttpSigningServer, Minter};
use crate::error::{Result, TokenError};
use crate::pool::{FileBackend, MemoryBackend, PoolBackend, TokenPool};
use crate::prefetcher::{spawn_prefetch_worker, Prefetcher, RefillReport};
use crate::registry::KeyRegistry;
use crate::relay::{ChatMessage, RelayClient, RelayOutcome};

pub struct ClientConfig {
    /// Base URL of the signing/relay server.
    pub server_url: String,
    /// Session cookie sent on signing requests (identifies the payer; the
    /// blinded token hides what gets signed).
    pub session_cookie: String,
    /// SOCKS5 proxy address for the anonymizing transport.
    pub socks_addr: String,
    /// `(model, SPKI PEM)` pairs for the key registry.
    pub model_keys: Vec<(String, String)>,
    /// Directory for the durable token pool; `None` keeps it in memory.
    pub pool_dir: Option<PathBuf>,
    pub target_pool_size: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session_cookie: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_cookie: session_cookie.into(),
            socks_addr: veilnet::DEFAULT_SOCKS_ADDR.to_string(),
            model_keys: Vec::new(),
            pool_dir: None,
            target_pool_size: DEFAULT_TARGET_POOL_SIZE,
        }
    }

    pub fn with_model_key(mut self, model: impl Into<String>, pem: impl Into<String>) -> Self {
        self.model_keys.push((model.into(), pem.into()));
        self
    }

    pub fn with_pool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pool_dir = Some(dir.into());
        self
    }
}

pub struct VeilClient {
    transport: Arc<AnonHttpClient>,
    coordinator: TokenCoordinator,
    relay: RelayClient,
    prefetcher: Arc<Prefetcher>,
    worker: JoinHandle<()>,
    anonymity_verified: bool,
}

impl VeilClient {
    /// Builds the full stack. Must run inside a tokio runtime; the prefetch
    /// worker is spawned here.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport_config = TransportConfig::default().with_socks_addr(&config.socks_addr);
        let transport = Arc::new(
            AnonHttpClient::new(transport_config)
                .map_err(|e| TokenError::Config(e.to_string()))?,
        );

        let registry = Arc::new(KeyRegistry::from_pem_entries(
            config
                .model_keys
                .iter()
                .map(|(model, pem)| (model.as_str(), pem.as_str())),
        )?);

        let backend: Arc<dyn PoolBackend> = match &config.pool_dir {
            Some(dir) => Arc::new(FileBackend::new(dir)?),
            None => Arc::new(MemoryBackend::new()),
        };
        let pool = Arc::new(TokenPool::new(backend));

        let signer = Arc::new(HttpSigningServer::new(
            transport.clone(),
            config.server_url.clone(),
            config.session_cookie.clone(),
        ));
        let engine: Arc<dyn Minter> = Arc::new(BlindSignatureEngine::new(registry.clone(), signer));

        let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
        let prefetcher = Arc::new(Prefetcher::new(
            pool.clone(),
            engine.clone(),
            config.target_pool_size,
        ));
        let worker = spawn_prefetch_worker(prefetcher.clone(), prefetch_rx);

        let coordinator = TokenCoordinator::new(
            registry,
            pool,
            engine,
            prefetch_tx,
            config.target_pool_size,
        );
        let relay = RelayClient::new(transport.clone(), config.server_url);

        Ok(Self {
            transport,
            coordinator,
            relay,
            prefetcher,
            worker,
            anonymity_verified: false,
        })
    }

    /// Refuses to send anything sensitive until the transport demonstrably
    /// exits through the anonymizing network. Checked once, then cached.
    async fn ensure_anonymous(&mut self) -> Result<()> {
        if self.anonymity_verified {
            return Ok(());
        }

        let anonymous = self
            .transport
            .verify_anonymous()
            .await
            .map_err(|e| TokenError::AnonymityRequired(e.to_string()))?;
        if !anonymous {
            return Err(TokenError::AnonymityRequired(
                "traffic does not exit through the anonymizing proxy".into(),
            ));
        }

        info!("anonymizing transport verified");
        self.anonymity_verified = true;
        Ok(())
    }

    /// The core operation: a usable (token, signature) pair for `model`.
    pub async fn get_token(&mut self, model: &str) -> Result<IssuedToken> {
        self.ensure_anonymous().await?;
        self.coordinator.get_token(model).await
    }

    /// Obtains a token and spends it on one relayed chat request.
    pub async fn chat(
        &mut self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<RelayOutcome> {
        self.ensure_anonymous().await?;
        let issued = self.coordinator.get_token(model).await?;
        self.relay
            .chat(model, &issued.token, &issued.signed_token, messages)
            .await
    }

    /// Warms `model`'s pool up to the target size, synchronously. Useful
    /// right after sign-in, before the first chat.
    pub async fn warm_pool(&mut self, model: &str) -> Result<RefillReport> {
        self.ensure_anonymous().await?;
        Ok(self.prefetcher.refill(model).await)
    }

    pub fn is_anonymity_verified(&self) -> bool {
        self.anonymity_verified
    }

    /// Forces a fresh anonymity check before the next request, e.g. after
    /// the proxy was restarted.
    pub fn invalidate_anonymity_verification(&mut self) {
        self.anonymity_verified = false;
    }

    /// Stops the background prefetch worker and waits for it to finish the
    /// refill it may be running.
    pub async fn shutdown(self) {
        let VeilClient {
            coordinator, worker, ..
        } = self;
        // Dropping the coordinator drops the last refill sender; the worker
        // loop ends once the channel drains.
        drop(coordinator);
        let _ = worker.await;
    }
}
