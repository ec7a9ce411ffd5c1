//! Origin-hiding HTTP transport. Every request is routed through a SOCKS5
//! proxy (a local Tor daemon by default) so the remote endpoint never sees
//! the caller's network origin.
//!
//! ```rust,no_run
//! use veilnet::{AnonHttpClient, Config};
//!
//! #[tokio::main]
//! async fn main() -> veilnet::Result<()> {
//!     let client = AnonHttpClient::new(Config::default())?;
//!
//!     // All requests go through the proxy
//!     let ip = client.get_exit_ip().await?;
//!     println!("Exit IP: {}", ip);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http_client;

pub use config::{Config, DEFAULT_SOCKS_ADDR, DEFAULT_TIMEOUT_SECS};
pub use error::{Result, TransportError};
pub use http_client::AnonHttpClient;

pub fn anon_client() -> Result<AnonHttpClient> {
    AnonHttpClient::new(Config::default())
}

// no proxy, just for testing
#[cfg(any(test, feature = "test-utils"))]
pub fn direct_client() -> Result<AnonHttpClient> {
    AnonHttpClient::new_direct()
}
