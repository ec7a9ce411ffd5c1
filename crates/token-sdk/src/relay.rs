//! Downstream relay consumption: spends a (token, signature) pair on one
//! chat-completion request through the reverse proxy. The pair rides along
//! as out-of-band credentials; the request itself carries no session
//! identity and goes out over the anonymizing transport.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use veilnet::AnonHttpClient;

use crate::error::{Result, TokenError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    extra_body: ExtraBody<'a>,
}

#[derive(Serialize)]
struct ExtraBody<'a> {
    llmmask: TokenCredentials<'a>,
}

#[derive(Serialize)]
struct TokenCredentials<'a> {
    #[serde(rename = "Token")]
    token: &'a str,
    #[serde(rename = "SignedToken")]
    signed_token: &'a str,
    #[serde(rename = "ModelName")]
    model_name: &'a str,
}

#[derive(Deserialize)]
struct RelayEnvelope {
    data: RelayData,
}

#[derive(Deserialize)]
struct RelayData {
    #[serde(default)]
    proxy_response: String,
    #[serde(default)]
    is_blocked: bool,
    #[serde(default)]
    blocked_reason: Option<String>,
}

/// Outcome of one relayed request. Blocking is a policy signal from the
/// proxy, not an error; the token is consumed either way.
#[derive(Clone, Debug)]
pub enum RelayOutcome {
    /// The upstream chat completion, as returned by the provider.
    Completed(serde_json::Value),
    Blocked { reason: String },
}

pub struct RelayClient {
    transport: Arc<AnonHttpClient>,
    base_url: String,
}

impl RelayClient {
    pub fn new(transport: Arc<AnonHttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    /// Sends one chat request with the given token pair attached. The pair
    /// must come from `get_token` and must not be reused afterwards.
    pub async fn chat(
        &self,
        model: &str,
        token: &str,
        signed_token: &str,
        messages: &[ChatMessage],
    ) -> Result<RelayOutcome> {
        let url = format!("{}/api/v1/llm-proxy", self.base_url);
        let body = RelayRequest {
            model,
            messages,
            extra_body: ExtraBody {
                llmmask: TokenCredentials {
                    token,
                    signed_token,
                    model_name: model,
                },
            },
        };

        debug!(model, "relaying chat request");
        let response = self
            .transport
            .post_json(&url, &body)
            .await
            .map_err(|e| TokenError::Relay(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(TokenError::Relay(format!("HTTP {}: {}", status, details)));
        }

        let envelope: RelayEnvelope = response
            .json()
            .await
            .map_err(|e| TokenError::Serialization(format!("Malformed relay response: {}", e)))?;

        decode_relay_data(envelope.data)
    }
}

fn decode_relay_data(data: RelayData) -> Result<RelayOutcome> {
    if data.is_blocked {
        let reason = data
            .blocked_reason
            .unwrap_or_else(|| "Blocked by relay".to_string());
        warn!(%reason, "relay blocked the request");
        return Ok(RelayOutcome::Blocked { reason });
    }

    let raw = BASE64
        .decode(data.proxy_response)
        .map_err(|e| TokenError::Serialization(format!("Bad relay payload base64: {}", e)))?;
    let completion = serde_json::from_slice(&raw)
        .map_err(|e| TokenError::Serialization(format!("Bad relay payload JSON: {}", e)))?;

    Ok(RelayOutcome::Completed(completion))
}
