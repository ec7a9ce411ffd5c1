//! Blind Signature Engine: one complete mint round per call.
//!
//! A mint resolves the model's public key, draws a fresh random token,
//! blinds it, submits the blinded message to the signing server, then
//! unblinds and verifies the response. The blinding state lives on this
//! call's stack only and is consumed by finalization.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use veilnet::AnonHttpClient;

use crate::blind;
use crate::error::{Result, TokenError};
use crate::registry::KeyRegistry;

/// Token identifier width in bytes.
pub const TOKEN_LEN: usize = 32;

/// A finalized, verified (token, signature) pair, both standard base64.
#[derive(Clone, Debug)]
pub struct MintedToken {
    pub token: String,
    pub signed_token: String,
}

/// Anything that can produce one verified token for a model. The
/// coordinator and prefetcher depend on this trait, not on the concrete
/// engine, so their behavior is testable without a signing server.
#[async_trait]
pub trait Minter: Send + Sync {
    async fn mint_one(&self, model: &str) -> Result<MintedToken>;
}

/// The signing-server boundary: submit one blinded token, get back the raw
/// signed-blinded bytes. No retry here; retry policy belongs to callers.
#[async_trait]
pub trait BlindedTokenSigner: Send + Sync {
    async fn sign_blinded(
        &self,
        model: &str,
        request_id: &str,
        blinded_token_b64: &str,
    ) -> Result<Vec<u8>>;
}

#[derive(Serialize)]
struct SignTokenRequest<'a> {
    #[serde(rename = "RequestID")]
    request_id: &'a str,
    #[serde(rename = "BlindedToken")]
    blinded_token: &'a str,
    #[serde(rename = "ModelName")]
    model_name: &'a str,
}

#[derive(Deserialize)]
struct SignTokenResponse {
    data: SignTokenData,
}

#[derive(Deserialize)]
struct SignTokenData {
    #[serde(rename = "SignedBlindedToken")]
    signed_blinded_token: String,
}

/// Production signer: `POST {base}/api/v1/auth-token/{model}` over the
/// anonymizing transport, authenticated with the session cookie. The
/// session identifies the payer; the blinded token hides what is signed.
pub struct HttpSigningServer {
    transport: Arc<AnonHttpClient>,
    base_url: String,
    session_cookie: String,
}

impl HttpSigningServer {
    pub fn new(
        transport: Arc<AnonHttpClient>,
        base_url: impl Into<String>,
        session_cookie: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            session_cookie: session_cookie.into(),
        }
    }
}

#[async_trait]
impl BlindedTokenSigner for HttpSigningServer {
    async fn sign_blinded(
        &self,
        model: &str,
        request_id: &str,
        blinded_token_b64: &str,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/api/v1/auth-token/{}", self.base_url, model);
        let body = SignTokenRequest {
            request_id,
            blinded_token: blinded_token_b64,
            model_name: model,
        };

        let response = self
            .transport
            .post_json_with_headers(&url, &[("Cookie", &self.session_cookie)], &body)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(TokenError::SigningServerRejected(format!(
                "HTTP {}: {}",
                status, details
            )));
        }

        let parsed: SignTokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Serialization(format!("Malformed signing response: {}", e)))?;

        BASE64
            .decode(parsed.data.signed_blinded_token)
            .map_err(|e| TokenError::Serialization(format!("Bad signed-token base64: {}", e)))
    }
}

pub struct BlindSignatureEngine {
    registry: Arc<KeyRegistry>,
    signer: Arc<dyn BlindedTokenSigner>,
}

impl BlindSignatureEngine {
    pub fn new(registry: Arc<KeyRegistry>, signer: Arc<dyn BlindedTokenSigner>) -> Self {
        Self { registry, signer }
    }
}

#[async_trait]
impl Minter for BlindSignatureEngine {
    async fn mint_one(&self, model: &str) -> Result<MintedToken> {
        let pubkey = self.registry.lookup(model)?;

        let mut token = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut token);

        let (blinded, ctx) = blind::blind(pubkey, &token)?;

        let mut rid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut rid);
        let request_id = hex::encode(rid);

        debug!(model, %request_id, "requesting blind signature");
        let signed_blinded = self
            .signer
            .sign_blinded(model, &request_id, &BASE64.encode(blinded))
            .await?;

        // Unblind and verify in one step; the blinding context is consumed
        // here whether or not the signature checks out.
        let signature = blind::finalize(pubkey, ctx, &signed_blinded)?;
        debug!(model, "minted and verified anonymous token");

        Ok(MintedToken {
            token: BASE64.encode(token),
            signed_token: BASE64.encode(signature),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{local_registry, LocalSigner, RejectingSigner, TamperingSigner};
    use rsa::RsaPublicKey;

    #[tokio::test]
    async fn mint_produces_a_verifiable_pair() {
        let signer = Arc::new(LocalSigner::new());
        let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
        let engine = BlindSignatureEngine::new(registry, signer.clone());

        let minted = engine.mint_one("gpt-test").await.unwrap();

        let token = BASE64.decode(&minted.token).unwrap();
        let signature = BASE64.decode(&minted.signed_token).unwrap();
        assert_eq!(token.len(), TOKEN_LEN);

        let pubkey = RsaPublicKey::from(signer.private_key());
        blind::verify(&pubkey, &token, &signature).unwrap();
    }

    #[tokio::test]
    async fn consecutive_mints_use_fresh_tokens() {
        let signer = Arc::new(LocalSigner::new());
        let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
        let engine = BlindSignatureEngine::new(registry, signer);

        let a = engine.mint_one("gpt-test").await.unwrap();
        let b = engine.mint_one("gpt-test").await.unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.signed_token, b.signed_token);
    }

    #[tokio::test]
    async fn unknown_model_fails_before_contacting_signer() {
        let signer = Arc::new(LocalSigner::new());
        let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
        let engine = BlindSignatureEngine::new(registry, signer.clone());

        let err = engine.mint_one("nonexistent-model").await.unwrap_err();
        assert!(matches!(err, TokenError::UnknownModel(_)));
        assert_eq!(signer.calls(), 0);
    }

    #[tokio::test]
    async fn server_rejection_is_propagated_untouched() {
        let local = LocalSigner::new();
        let registry = Arc::new(local_registry(&local, &["gpt-test"]));
        let engine = BlindSignatureEngine::new(registry, Arc::new(RejectingSigner));

        let err = engine.mint_one("gpt-test").await.unwrap_err();
        assert!(matches!(err, TokenError::SigningServerRejected(_)));
    }

    #[tokio::test]
    async fn tampered_server_response_fails_verification() {
        let signer = Arc::new(LocalSigner::new());
        let registry = Arc::new(local_registry(&signer, &["gpt-test"]));
        let engine =
            BlindSignatureEngine::new(registry, Arc::new(TamperingSigner::wrapping(signer)));

        let err = engine.mint_one("gpt-test").await.unwrap_err();
        assert!(matches!(err, TokenError::InvalidSignature));
    }
}
