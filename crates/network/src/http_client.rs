use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, TransportError};

/// HTTP client that sends every request through the configured SOCKS5
/// proxy. The `socks5h` scheme is deliberate: hostname resolution happens
/// at the proxy, so DNS queries never leave from the caller's machine.
pub struct AnonHttpClient {
    client: Client,
    config: Config,
}

impl AnonHttpClient {
    pub fn new(config: Config) -> Result<Self> {
        let proxy_url = format!("socks5h://{}", config.socks_addr);
        let proxy = Proxy::all(&proxy_url)
            .map_err(|e| TransportError::Config(format!("Invalid proxy URL: {}", e)))?;

        let mut builder = Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(config.timeout_secs));

        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to build client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Unproxied client. Only for tests against local fixtures; a direct
    /// client leaks the caller's network origin.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_direct() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            config: Config::default(),
        })
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.client.get(url).send().await.map_err(classify)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get(url).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Body(format!("JSON parse failed: {}", e)))
    }

    pub async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<Response> {
        self.post_json_with_headers(url, &[], body).await
    }

    /// POST a JSON body with extra request headers (session cookies and the
    /// like). Returns the raw response so callers can inspect the status
    /// line themselves; a non-2xx here is not a transport failure.
    pub async fn post_json_with_headers<T: Serialize>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &T,
    ) -> Result<Response> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("Invalid header value: {}", e)))?;
            header_map.insert(name, value);
        }

        debug!(url, "sending proxied POST");
        self.client
            .post(url)
            .headers(header_map)
            .json(body)
            .send()
            .await
            .map_err(classify)
    }

    pub async fn get_exit_ip(&self) -> Result<String> {
        let response = self.get("https://api.ipify.org").await?;
        response
            .text()
            .await
            .map_err(|e| TransportError::Body(format!("Failed to get IP: {}", e)))
    }

    /// Asks the Tor project's check endpoint whether this client's traffic
    /// actually exits through Tor.
    pub async fn verify_anonymous(&self) -> Result<bool> {
        let response = self.get("https://check.torproject.org/api/ip").await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Body(format!("JSON parse failed: {}", e)))?;

        Ok(json.get("IsTor").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        // Nothing answered on the SOCKS port; the proxy daemon is down or
        // listening elsewhere.
        TransportError::ProxyNotAvailable(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}
