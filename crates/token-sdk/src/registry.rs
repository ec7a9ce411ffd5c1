//! Model-to-public-key registry. Loaded once at startup from static
//! configuration, read-only afterwards.

use std::collections::HashMap;

use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;

use crate::error::{Result, TokenError};

#[derive(Clone, Debug, Default)]
pub struct KeyRegistry {
    keys: HashMap<String, RsaPublicKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, key: RsaPublicKey) {
        self.keys.insert(model.into(), key);
    }

    /// Builds a registry from `(model, SPKI PEM)` pairs. A malformed PEM is
    /// a hard configuration error.
    pub fn from_pem_entries<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut registry = Self::new();
        for (model, pem) in entries {
            let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| {
                TokenError::Config(format!("Invalid public key for model {}: {}", model, e))
            })?;
            registry.insert(model, key);
        }
        Ok(registry)
    }

    pub fn lookup(&self, model: &str) -> Result<&RsaPublicKey> {
        self.keys
            .get(model)
            .ok_or_else(|| TokenError::UnknownModel(model.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
