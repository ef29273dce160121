//! Script templates used while signing
//!
//! An unlocking template knows how to produce the unlocking script for one
//! input and how long that script will be, so funding can size the fee
//! before any signature exists.

pub mod p2pkh;

use async_trait::async_trait;

use crate::{
    data_structures::{Script, Transaction},
    errors::WalletResult,
};

pub use p2pkh::P2pkhUnlock;

#[async_trait]
pub trait UnlockingScriptTemplate: Send + Sync {
    /// Produce the unlocking script for `input_index`, which spends an output
    /// of `source_satoshis` locked by `source_locking_script`
    async fn sign(
        &self,
        tx: &Transaction,
        input_index: usize,
        source_satoshis: u64,
        source_locking_script: &Script,
    ) -> WalletResult<Script>;

    /// Upper bound on the unlocking script length in bytes
    fn estimate_length(&self) -> usize;
}
