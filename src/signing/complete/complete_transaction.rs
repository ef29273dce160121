//! Transaction completer
//!
//! Merges caller-supplied unlocking scripts into a signable action, signs
//! the wallet's own inputs, verifies the result and records it as signed.
//! Any failure here leaves the action `Signable` so the caller can retry
//! with corrected scripts or abort.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    data_structures::{ActionStatus, InputSource, Script},
    errors::{WalletError, WalletResult},
    key_management::SigningKeyProvider,
    signing::{
        models::types::{get_supported_version, SignActionResult},
        prepare::signable_transaction::{assemble_transaction, check_sources_in_beef},
        templates::{p2pkh, P2pkhUnlock, UnlockingScriptTemplate},
    },
    storage::{SignedCommit, WalletStorage},
};

/// Unlocking script supplied for one input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignActionSpend {
    pub unlocking_script: Script,
    #[serde(default)]
    pub sequence_number: Option<u32>,
}

impl SignActionSpend {
    pub fn new(unlocking_script: Script) -> Self {
        Self {
            unlocking_script,
            sequence_number: None,
        }
    }
}

pub struct TransactionCompleter {
    storage: Arc<dyn WalletStorage>,
    keys: Arc<dyn SigningKeyProvider>,
}

impl TransactionCompleter {
    pub fn new(storage: Arc<dyn WalletStorage>, keys: Arc<dyn SigningKeyProvider>) -> Self {
        Self { storage, keys }
    }

    /// Complete the action `reference` with `spends`, keyed by input index
    pub async fn complete(
        &self,
        reference: &str,
        spends: BTreeMap<u32, SignActionSpend>,
    ) -> WalletResult<SignActionResult> {
        let action = self
            .storage
            .get_action_by_reference(reference)
            .await?
            .ok_or_else(|| WalletError::ResourceNotFound(format!("Action {reference}")))?;
        let action_id = action
            .id
            .ok_or_else(|| WalletError::InternalError(format!("Action {reference} has no ID")))?;
        if action.status != ActionStatus::Signable {
            return Err(WalletError::ValidationError(format!(
                "Action {reference} is {}, expected signable",
                action.status
            )));
        }

        let inputs = self.storage.get_action_inputs(action_id).await?;
        let outputs = self.storage.get_action_outputs(action_id).await?;
        check_sources_in_beef(&action, &inputs)?;
        let mut tx = assemble_transaction(&action, &inputs, &outputs)?;

        for (&index, spend) in &spends {
            let input = inputs.get(index as usize).ok_or_else(|| {
                WalletError::ValidationError(format!(
                    "Unlocking script supplied for input {index}, but the action has {} inputs",
                    inputs.len()
                ))
            })?;
            if matches!(input.source, InputSource::Storage { .. }) {
                return Err(WalletError::ValidationError(format!(
                    "Input {index} is funded by the wallet and signed internally"
                )));
            }
            if input.unlocking_script.is_some() {
                return Err(WalletError::ValidationError(format!(
                    "Input {index} already has an unlocking script"
                )));
            }
            let tx_input = &mut tx.inputs[index as usize];
            tx_input.unlocking_script = spend.unlocking_script.clone();
            if let Some(sequence) = spend.sequence_number {
                tx_input.sequence = sequence;
            }
        }

        if let Some(missing) = inputs.iter().find(|input| {
            matches!(input.source, InputSource::You { .. })
                && tx.inputs[input.vin as usize].unlocking_script.is_empty()
        }) {
            warn!(
                target: "wallet::complete",
                action_id,
                input_index = missing.vin,
                "Completion is missing an unlocking script"
            );
            return Err(WalletError::IncompleteSignature {
                input_index: missing.vin,
            });
        }

        // Wallet inputs are signed after every caller script and sequence is in place
        for input in &inputs {
            let index = input.vin as usize;
            if !tx.inputs[index].unlocking_script.is_empty() {
                continue;
            }
            let Some(derivation) = input.source.derivation() else {
                continue;
            };
            let template = P2pkhUnlock::new(self.keys.clone(), derivation.clone());
            let script = template
                .sign(
                    &tx,
                    index,
                    input.source_satoshis,
                    &input.source_locking_script,
                )
                .await?;
            tx.inputs[index].unlocking_script = script;
        }

        for input in &inputs {
            let index = input.vin as usize;
            p2pkh::verify(
                &tx,
                index,
                input.source_satoshis,
                &input.source_locking_script,
                &tx.inputs[index].unlocking_script,
            )?;
        }

        let total_in: u64 = inputs.iter().map(|i| i.source_satoshis).sum();
        let total_out = tx.total_output_satoshis();
        let actual = total_in.checked_sub(total_out).ok_or_else(|| {
            WalletError::InternalError(format!(
                "Action {reference} spends {total_out} satoshis from {total_in}"
            ))
        })?;
        let size = tx.size();
        let required = action.fee_model.fee_for_size(size);
        if required > actual {
            warn!(
                target: "wallet::complete",
                action_id,
                size,
                required,
                actual,
                "Signed transaction underpays its fee"
            );
            return Err(WalletError::FeeMismatch { required, actual });
        }

        let raw_tx = tx.to_bytes();
        let txid = tx.txid();
        let mut beef = action.beef.clone();
        beef.merge_raw_tx(raw_tx.clone(), None);
        beef.sort_txs();

        let unlocking_scripts = tx
            .inputs
            .iter()
            .enumerate()
            .map(|(vin, input)| (vin as u32, input.unlocking_script.clone()))
            .collect();
        self.storage
            .complete_signed_action(&SignedCommit {
                action_id,
                txid,
                raw_tx: raw_tx.clone(),
                unlocking_scripts,
                beef: beef.clone(),
            })
            .await?;
        info!(
            target: "wallet::complete",
            action_id,
            txid = %txid,
            size,
            fee = actual,
            "Action signed"
        );
        if let Err(e) = self
            .storage
            .store_simple_event(action_id, "signed", &txid.to_hex())
            .await
        {
            debug!(target: "wallet::complete", action_id, error = %e, "Failed to store event");
        }

        Ok(SignActionResult {
            version: get_supported_version(),
            reference: action.reference,
            txid,
            raw_tx: hex::encode(raw_tx),
            beef,
        })
    }
}
