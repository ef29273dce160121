//! Pay-to-public-key-hash locking, unlocking and signature checks

use std::sync::Arc;

use async_trait::async_trait;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use crate::{
    data_structures::{
        Script, Transaction, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160,
    },
    errors::{WalletError, WalletResult},
    fee_model::P2PKH_UNLOCKING_SCRIPT_LENGTH,
    key_management::{KeyDerivation, SigningKeyProvider},
    signing::{
        sighash::{sighash_digest, SIGHASH_ALL_FORKID, SIGHASH_FORKID},
        templates::UnlockingScriptTemplate,
    },
};

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG
pub fn lock_to_hash(pubkey_hash: &[u8; 20]) -> Script {
    let mut script = Script::default();
    script.push_opcode(OP_DUP);
    script.push_opcode(OP_HASH160);
    script.push_data(pubkey_hash);
    script.push_opcode(OP_EQUALVERIFY);
    script.push_opcode(OP_CHECKSIG);
    script
}

pub fn lock(public_key: &PublicKey) -> Script {
    lock_to_hash(&hash160(&public_key.serialize()))
}

/// <DER signature || sighash byte> <compressed public key>
pub fn unlocking_script(signature: &Signature, sighash_type: u32, public_key: &PublicKey) -> Script {
    let der = signature.serialize_der();
    let mut sig = Vec::with_capacity(der.len() + 1);
    sig.extend_from_slice(&der);
    sig.push(sighash_type as u8);

    let mut script = Script::default();
    script.push_data(&sig);
    script.push_data(&public_key.serialize());
    script
}

/// Check that `unlocking` satisfies the P2PKH output it spends.
///
/// Scripts that are not P2PKH are left to the caller and accepted as is.
pub fn verify(
    tx: &Transaction,
    input_index: usize,
    source_satoshis: u64,
    source_locking_script: &Script,
    unlocking: &Script,
) -> WalletResult<()> {
    let Some(expected_hash) = source_locking_script.p2pkh_hash() else {
        return Ok(());
    };
    let invalid = |reason: &str| {
        WalletError::ValidationError(format!(
            "Invalid P2PKH unlocking script for input {input_index}: {reason}"
        ))
    };

    let chunks = unlocking
        .chunks()
        .map_err(|e| invalid(&e.to_string()))?;
    let (sig_bytes, pubkey_bytes) = match chunks.as_slice() {
        [sig, key] => match (&sig.data, &key.data) {
            (Some(sig), Some(key)) if !sig.is_empty() => (sig.clone(), key.clone()),
            _ => return Err(invalid("expected two data pushes")),
        },
        _ => return Err(invalid("expected two data pushes")),
    };

    if hash160(&pubkey_bytes) != expected_hash {
        return Err(invalid("public key does not match the locking script"));
    }
    let public_key = PublicKey::from_slice(&pubkey_bytes).map_err(|e| invalid(&e.to_string()))?;

    let (der, sighash_byte) = sig_bytes.split_at(sig_bytes.len() - 1);
    let sighash_type = sighash_byte[0] as u32;
    if sighash_type & SIGHASH_FORKID == 0 {
        return Err(invalid("signature does not commit with FORKID"));
    }
    let mut signature = Signature::from_der(der).map_err(|e| invalid(&e.to_string()))?;
    signature.normalize_s();

    let digest = sighash_digest(
        tx,
        input_index,
        source_locking_script,
        source_satoshis,
        sighash_type,
    )?;
    Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(digest), &signature, &public_key)
        .map_err(|_| invalid("signature does not verify"))
}

/// Signs through a key provider for outputs locked to a derived key
pub struct P2pkhUnlock {
    keys: Arc<dyn SigningKeyProvider>,
    derivation: KeyDerivation,
    sighash_type: u32,
}

impl P2pkhUnlock {
    pub fn new(keys: Arc<dyn SigningKeyProvider>, derivation: KeyDerivation) -> Self {
        Self {
            keys,
            derivation,
            sighash_type: SIGHASH_ALL_FORKID,
        }
    }
}

#[async_trait]
impl UnlockingScriptTemplate for P2pkhUnlock {
    async fn sign(
        &self,
        tx: &Transaction,
        input_index: usize,
        source_satoshis: u64,
        source_locking_script: &Script,
    ) -> WalletResult<Script> {
        let digest = sighash_digest(
            tx,
            input_index,
            source_locking_script,
            source_satoshis,
            self.sighash_type,
        )?;
        let signature = self.keys.sign_digest(&self.derivation, digest).await?;
        let public_key = self.keys.public_key(&self.derivation).await?;
        Ok(unlocking_script(&signature, self.sighash_type, &public_key))
    }

    fn estimate_length(&self) -> usize {
        P2PKH_UNLOCKING_SCRIPT_LENGTH
    }
}
