//! Local key provider deriving child keys from a single root key
//!
//! child = root + SHA256(root_pub || invoice) (mod n). The same tweak applied
//! to the root public key gives the child public key, so locking scripts can
//! be derived without touching the private key.

use async_trait::async_trait;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
    errors::{KeyManagementError, WalletResult},
    key_management::{KeyDerivation, SigningKeyProvider},
};

pub struct RootKeyDeriver {
    secp: Secp256k1<All>,
    root_key: SecretKey,
    root_public_key: PublicKey,
}

impl RootKeyDeriver {
    pub fn new(root_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let root_public_key = PublicKey::from_secret_key(&secp, &root_key);
        Self {
            secp,
            root_key,
            root_public_key,
        }
    }

    /// Build from 32 raw bytes; the input buffer is wiped afterwards
    pub fn from_bytes(mut bytes: [u8; 32]) -> WalletResult<Self> {
        let key = SecretKey::from_slice(&bytes).map_err(KeyManagementError::from);
        bytes.zeroize();
        Ok(Self::new(key?))
    }

    pub fn root_public_key(&self) -> PublicKey {
        self.root_public_key
    }

    fn tweak(&self, derivation: &KeyDerivation) -> WalletResult<Scalar> {
        let mut hasher = Sha256::new();
        hasher.update(self.root_public_key.serialize());
        hasher.update(derivation.invoice().as_bytes());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Scalar::from_be_bytes(digest).map_err(|_| {
            KeyManagementError::DerivationFailed(format!(
                "tweak out of range for derivation '{}'",
                derivation.invoice()
            ))
            .into()
        })
    }

    fn private_key(&self, derivation: &KeyDerivation) -> WalletResult<SecretKey> {
        let tweak = self.tweak(derivation)?;
        self.root_key
            .add_tweak(&tweak)
            .map_err(|e| KeyManagementError::DerivationFailed(e.to_string()).into())
    }
}

#[async_trait]
impl SigningKeyProvider for RootKeyDeriver {
    async fn public_key(&self, derivation: &KeyDerivation) -> WalletResult<PublicKey> {
        let tweak = self.tweak(derivation)?;
        self.root_public_key
            .add_exp_tweak(&self.secp, &tweak)
            .map_err(|e| KeyManagementError::DerivationFailed(e.to_string()).into())
    }

    async fn sign_digest(
        &self,
        derivation: &KeyDerivation,
        digest: [u8; 32],
    ) -> WalletResult<Signature> {
        let key = self.private_key(derivation)?;
        let message = Message::from_digest(digest);
        Ok(self.secp.sign_ecdsa(&message, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> RootKeyDeriver {
        RootKeyDeriver::from_bytes([0x11; 32]).unwrap()
    }

    #[tokio::test]
    async fn derived_public_key_matches_private_key() {
        let deriver = deriver();
        let derivation = KeyDerivation::new("abc", "def");
        let public = deriver.public_key(&derivation).await.unwrap();
        let private = deriver.private_key(&derivation).unwrap();
        assert_eq!(public, PublicKey::from_secret_key(&deriver.secp, &private));
        assert_ne!(public, deriver.root_public_key());
    }

    #[tokio::test]
    async fn different_suffixes_give_different_keys() {
        let deriver = deriver();
        let a = deriver.public_key(&KeyDerivation::new("p", "1")).await.unwrap();
        let b = deriver.public_key(&KeyDerivation::new("p", "2")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn signatures_verify_under_derived_key() {
        let deriver = deriver();
        let derivation = KeyDerivation::new("prefix", "suffix");
        let digest = [0x42u8; 32];
        let signature = deriver.sign_digest(&derivation, digest).await.unwrap();
        let public = deriver.public_key(&derivation).await.unwrap();
        let secp = Secp256k1::verification_only();
        assert!(secp
            .verify_ecdsa(&Message::from_digest(digest), &signature, &public)
            .is_ok());
    }

    #[test]
    fn zero_key_is_rejected() {
        assert!(RootKeyDeriver::from_bytes([0u8; 32]).is_err());
    }
}
