//! Anonymous usage tokens for metered LLM access.
//!
//! A client proves "I am authorized to make requests of model M" without
//! the server ever linking a request to an account. The flow:
//!
//! 1. The client draws a random token and blinds it against the model's
//!    RSA public key ([`blind`]).
//! 2. The signing server signs the blinded message (it sees only noise)
//!    and charges the session's quota ([`engine`]).
//! 3. The client unblinds and verifies the signature; the resulting pair
//!    is a bearer credential unlinkable to the signing request.
//! 4. Pairs are pooled per model ([`pool`]) and topped up in the
//!    background ([`prefetcher`]), so most requests never pay the minting
//!    round trip ([`coordinator`]).
//! 5. Spending a pair on a relayed chat request carries no session
//!    identity at all ([`relay`]).
//!
//! All server traffic rides the origin-hiding transport from `veilnet`.

pub mod blind;
pub mod client;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod pool;
pub mod prefetcher;
pub mod registry;
pub mod relay;

#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;

pub use client::{ClientConfig, VeilClient};
pub use coordinator::{IssuedToken, TokenCoordinator, DEFAULT_TARGET_POOL_SIZE};
pub use engine::{
    BlindSignatureEngine, BlindedTokenSigner, HttpSigningServer, MintedToken, Minter, TOKEN_LEN,
};
pub use error::{Result, TokenError};
pub use pool::{FileBackend, MemoryBackend, PoolBackend, TokenPool, TokenPoolEntry};
pub use prefetcher::{
    spawn_prefetch_worker, Prefetcher, RefillReport, DEFAULT_FAILURE_BACKOFF, DEFAULT_MINT_PACING,
};
pub use registry::KeyRegistry;
pub use relay::{ChatMessage, RelayClient, RelayOutcome};
