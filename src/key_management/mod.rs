//! Signing-key provider interface
//!
//! The pipeline never handles raw key material of its own. Change locking
//! scripts are built from public keys derived by a `SigningKeyProvider`,
//! and wallet-owned inputs are signed by handing the provider a sighash
//! digest. Remote signers and hardware devices implement the same trait.

pub mod root_key_deriver;

use async_trait::async_trait;
use secp256k1::{ecdsa::Signature, PublicKey};
use serde::{Deserialize, Serialize};

use crate::errors::WalletResult;

pub use root_key_deriver::RootKeyDeriver;

/// Derivation path of a wallet-owned key: a per-action prefix and a
/// per-output suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDerivation {
    pub prefix: String,
    pub suffix: String,
}

impl KeyDerivation {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Invoice string the derivation is keyed on
    pub fn invoice(&self) -> String {
        format!("{} {}", self.prefix, self.suffix)
    }
}

#[async_trait]
pub trait SigningKeyProvider: Send + Sync {
    /// Public key for a derivation path, used to build locking scripts
    async fn public_key(&self, derivation: &KeyDerivation) -> WalletResult<PublicKey>;

    /// Sign a 32 byte digest with the key at `derivation`
    async fn sign_digest(
        &self,
        derivation: &KeyDerivation,
        digest: [u8; 32],
    ) -> WalletResult<Signature>;
}
