//! Signing identity supplied to the client.
//!
//! Key storage and generation policy live outside this crate; the client only
//! asks a [`KeyManager`] whether a secret key is available.

use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("secret key is not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid secret key: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Source of the local identity.
pub trait KeyManager: Send + Sync {
    /// Secret key used for signing, `None` for a read-only session.
    fn secret_key(&self) -> Option<SecretKey>;

    /// Public key of the local identity, if one is known.
    fn public_key(&self) -> Option<XOnlyPublicKey> {
        self.keypair().map(|kp| kp.x_only_public_key().0)
    }

    fn keypair(&self) -> Option<Keypair> {
        let secp = Secp256k1::signing_only();
        self.secret_key()
            .map(|sk| Keypair::from_secret_key(&secp, &sk))
    }
}

/// No identity. The client can read but not publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeyManager for NoKeys {
    fn secret_key(&self) -> Option<SecretKey> {
        None
    }
}

/// Fixed secret key held in memory.
#[derive(Clone)]
pub struct StaticKeys {
    secret: SecretKey,
}

impl StaticKeys {
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Parse a 64-character hex secret key.
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim())?;
        Ok(Self::new(SecretKey::from_slice(&bytes)?))
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::new(SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn public_hex(&self) -> String {
        self.public_key()
            .map(|pk| hex::encode(pk.serialize()))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl KeyManager for StaticKeys {
    fn secret_key(&self) -> Option<SecretKey> {
        Some(self.secret)
    }
}
