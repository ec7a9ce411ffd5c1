use thiserror::Error;

pub type Result<T> = std::result::Result<T, TokenError>;

#[derive(Error, Debug)]
pub enum TokenError {
    /// No public key is registered for the requested model. This is a
    /// configuration problem, never retried.
    #[error("No public key registered for model: {0}")]
    UnknownModel(String),

    /// The signing server refused to sign, or the round trip to it failed.
    #[error("Signing server rejected the request: {0}")]
    SigningServerRejected(String),

    /// The unblinded signature did not verify against the token and the
    /// model's public key. Indicates a protocol bug or a misbehaving
    /// signer; must never be swallowed.
    #[error("Finalized signature failed verification")]
    InvalidSignature,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Pool storage error: {0}")]
    Storage(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Anonymous transport required: {0}")]
    AnonymityRequired(String),
}

/// At this layer a dropped circuit and a refusing server look the same to
/// the caller, and the recovery action is identical.
impl From<veilnet::TransportError> for TokenError {
    fn from(e: veilnet::TransportError) -> Self {
        TokenError::SigningServerRejected(e.to_string())
    }
}
