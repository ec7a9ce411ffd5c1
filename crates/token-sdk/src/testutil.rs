//! Test doubles: a local signing server backed by a generated RSA key, and
//! scripted minters for coordinator/prefetcher behavior tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::blind;
use crate::engine::{BlindedTokenSigner, MintedToken, Minter};
use crate::error::{Result, TokenError};
use crate::registry::KeyRegistry;

/// One shared 2048-bit keypair per process; generation is too slow to
/// repeat in every test.
pub fn test_keypair() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 2048).expect("RSA key generation failed")
    })
}

/// In-process signing server: performs the raw private-key operation the
/// real server would, without any HTTP in between.
pub struct LocalSigner {
    private_key: &'static RsaPrivateKey,
    calls: AtomicUsize,
}

impl LocalSigner {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            private_key: test_keypair(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        self.private_key
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlindedTokenSigner for LocalSigner {
    async fn sign_blinded(
        &self,
        _model: &str,
        _request_id: &str,
        blinded_token_b64: &str,
    ) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let blinded = BASE64
            .decode(blinded_token_b64)
            .map_err(|e| TokenError::Serialization(e.to_string()))?;
        blind::sign_blinded(self.private_key, &blinded)
    }
}

/// Registry whose models all share the local signer's public key.
pub fn local_registry(signer: &LocalSigner, models: &[&str]) -> KeyRegistry {
    let mut registry = KeyRegistry::new();
    for model in models {
        registry.insert(*model, RsaPublicKey::from(signer.private_key()));
    }
    registry
}

/// Signer that refuses everything, as a quota-exhausted server would.
pub struct RejectingSigner;

#[async_trait]
impl BlindedTokenSigner for RejectingSigner {
    async fn sign_blinded(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>> {
        Err(TokenError::SigningServerRejected("no quota left".into()))
    }
}

/// Signer that signs correctly, then corrupts one byte of the response.
pub struct TamperingSigner {
    inner: Arc<LocalSigner>,
}

impl TamperingSigner {
    pub fn wrapping(inner: Arc<LocalSigner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BlindedTokenSigner for TamperingSigner {
    async fn sign_blinded(
        &self,
        model: &str,
        request_id: &str,
        blinded_token_b64: &str,
    ) -> Result<Vec<u8>> {
        let mut signed = self
            .inner
            .sign_blinded(model, request_id, blinded_token_b64)
            .await?;
        signed[7] ^= 0x01;
        Ok(signed)
    }
}

/// Minter that counts invocations and fails on scripted call numbers
/// (1-based). Produces deterministic fake pairs, so no crypto is involved.
pub struct CountingMinter {
    calls: AtomicUsize,
    fail_on: Vec<usize>,
}

impl CountingMinter {
    pub fn new() -> Self {
        Self::failing_on(&[])
    }

    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: calls.to_vec(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for CountingMinter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Minter for CountingMinter {
    async fn mint_one(&self, model: &str) -> Result<MintedToken> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&call) {
            return Err(TokenError::SigningServerRejected(format!(
                "scripted failure on call {}",
                call
            )));
        }
        Ok(MintedToken {
            token: format!("token-{}-{}", model, call),
            signed_token: format!("sig-{}-{}", model, call),
        })
    }
}
