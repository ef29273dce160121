//! Signable transaction builder
//!
//! Rebuilds the unsigned transaction of a funded action from storage and
//! describes, for every input the wallet does not sign itself, what has to
//! be signed. The result depends only on persisted state, so building it
//! twice yields the same skeleton.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    data_structures::{double_sha256, ActionStatus, InputSource, Transaction, TxInput, TxOutput},
    errors::{WalletError, WalletResult},
    signing::{
        models::{
            transaction_metadata::TransactionMetadata,
            types::{get_supported_version, SignableTransaction, SigningInstruction, SigningTemplate},
        },
        sighash::{sighash_preimage, SIGHASH_ALL_FORKID},
    },
    storage::{StoredAction, StoredInput, StoredOutput, WalletStorage},
};

/// Unsigned transaction for an action, ordered by vin and vout.
///
/// Inputs carry whatever unlocking script is already recorded, else an empty one.
pub fn assemble_transaction(
    action: &StoredAction,
    inputs: &[StoredInput],
    outputs: &[StoredOutput],
) -> WalletResult<Transaction> {
    let mut tx = Transaction::new(action.version, action.lock_time);
    for (expected, input) in inputs.iter().enumerate() {
        if input.vin as usize != expected {
            return Err(WalletError::InternalError(format!(
                "Action inputs are not contiguous: expected vin {expected}, found {}",
                input.vin
            )));
        }
        tx.inputs.push(TxInput {
            previous_output: input.outpoint,
            unlocking_script: input.unlocking_script.clone().unwrap_or_default(),
            sequence: input.sequence,
        });
    }
    for (expected, output) in outputs.iter().enumerate() {
        if output.vout as usize != expected {
            return Err(WalletError::InternalError(format!(
                "Action outputs are not contiguous: expected vout {expected}, found {}",
                output.vout
            )));
        }
        tx.outputs.push(TxOutput {
            satoshis: output.satoshis,
            locking_script: output.locking_script.clone(),
        });
    }
    Ok(tx)
}

/// Every input's source output must be present, in full, in the action's bundle
pub fn check_sources_in_beef(action: &StoredAction, inputs: &[StoredInput]) -> WalletResult<()> {
    for input in inputs {
        let outpoint = input.outpoint;
        let source = action.beef.find_transaction(&outpoint.txid)?.ok_or_else(|| {
            WalletError::ValidationError(format!(
                "Source transaction {} for input {} is missing from the proof bundle",
                outpoint.txid, input.vin
            ))
        })?;
        let matches = source.outputs.get(outpoint.vout as usize).is_some_and(|o| {
            o.satoshis == input.source_satoshis && o.locking_script == input.source_locking_script
        });
        if !matches {
            return Err(WalletError::ValidationError(format!(
                "Source transaction {} does not match input {}",
                outpoint.txid, input.vin
            )));
        }
    }
    Ok(())
}

pub struct SignableTransactionBuilder {
    storage: Arc<dyn WalletStorage>,
}

impl SignableTransactionBuilder {
    pub fn new(storage: Arc<dyn WalletStorage>) -> Self {
        Self { storage }
    }

    pub async fn build(&self, reference: &str) -> WalletResult<SignableTransaction> {
        let action = self
            .storage
            .get_action_by_reference(reference)
            .await?
            .ok_or_else(|| WalletError::ResourceNotFound(format!("Action {reference}")))?;
        let action_id = action
            .id
            .ok_or_else(|| WalletError::InternalError(format!("Action {reference} has no ID")))?;
        if !matches!(action.status, ActionStatus::Funded | ActionStatus::Signable) {
            return Err(WalletError::ValidationError(format!(
                "Action {reference} is {}, expected funded",
                action.status
            )));
        }

        let inputs = self.storage.get_action_inputs(action_id).await?;
        let outputs = self.storage.get_action_outputs(action_id).await?;
        let tx = assemble_transaction(&action, &inputs, &outputs)?;
        check_sources_in_beef(&action, &inputs)?;

        let mut instructions = Vec::new();
        for input in &inputs {
            if input.unlocking_script.is_some() {
                continue;
            }
            let template = match &input.source {
                InputSource::Storage { .. } => continue,
                InputSource::Me { derivation, .. } => SigningTemplate::P2pkh {
                    derivation: derivation.clone(),
                },
                InputSource::You { .. } => SigningTemplate::CallerSupplied {
                    unlocking_script_length: input.unlocking_script_length,
                },
            };
            let preimage = sighash_preimage(
                &tx,
                input.vin as usize,
                &input.source_locking_script,
                input.source_satoshis,
                SIGHASH_ALL_FORKID,
            )?;
            instructions.push(SigningInstruction {
                input_index: input.vin,
                outpoint: input.outpoint,
                source_satoshis: input.source_satoshis,
                source_locking_script: input.source_locking_script.clone(),
                sighash_type: SIGHASH_ALL_FORKID,
                template,
                digest: hex::encode(double_sha256(&preimage)),
                preimage: hex::encode(preimage),
            });
        }

        if action.status == ActionStatus::Funded {
            let moved = self
                .storage
                .transition_action_status(action_id, ActionStatus::Funded, ActionStatus::Signable)
                .await?;
            if moved {
                info!(
                    target: "wallet::signable",
                    action_id,
                    instructions = instructions.len(),
                    "Action is signable"
                );
                if let Err(e) = self
                    .storage
                    .store_simple_event(action_id, "signable", &instructions.len().to_string())
                    .await
                {
                    debug!(target: "wallet::signable", action_id, error = %e, "Failed to store event");
                }
            } else {
                let current = self.storage.get_action(action_id).await?.map(|a| a.status);
                if current != Some(ActionStatus::Signable) {
                    return Err(WalletError::ConflictError(format!(
                        "Action {reference} changed state while building its signable transaction"
                    )));
                }
            }
        }

        Ok(SignableTransaction {
            version: get_supported_version(),
            reference: action.reference.clone(),
            transaction: tx,
            instructions,
            metadata: TransactionMetadata::new(
                action.fee,
                action.version,
                action.lock_time,
                action.fee_model,
            ),
            beef: action.beef,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_structures::{Outpoint, OutputOrigin, Script, Txid},
        fee_model::FeeModel,
        storage::OutputStatus,
    };

    fn action() -> StoredAction {
        StoredAction::new_unfunded(
            "ref".to_string(),
            "assemble test".to_string(),
            1,
            0,
            FeeModel::default(),
            false,
            Vec::new(),
        )
    }

    fn input(vin: u32) -> StoredInput {
        StoredInput {
            id: None,
            action_id: 1,
            vin,
            outpoint: Outpoint::new(Txid::from_bytes([vin as u8; 32]), 0),
            source_satoshis: 100,
            source_locking_script: Script::new(vec![0x51]),
            sequence: 0xffff_ffff,
            unlocking_script: None,
            unlocking_script_length: 1,
            description: None,
            source: InputSource::You { output_id: None },
        }
    }

    fn output(vout: u32) -> StoredOutput {
        StoredOutput {
            id: None,
            action_id: Some(1),
            basket_id: None,
            txid: None,
            vout,
            satoshis: 50,
            locking_script: Script::new(vec![0x51]),
            spendable: false,
            origin: OutputOrigin::Caller,
            description: None,
            custom_instructions: None,
            tags: Vec::new(),
            sort_key: vout,
            status: OutputStatus::Unspent,
            locked_by_action: None,
            spent_by_action: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn assembles_in_vin_and_vout_order() {
        let tx = assemble_transaction(&action(), &[input(0), input(1)], &[output(0)]).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert!(tx.inputs[0].unlocking_script.is_empty());
        assert_eq!(tx.outputs[0].satoshis, 50);
    }

    #[test]
    fn gaps_are_internal_errors() {
        let err = assemble_transaction(&action(), &[input(0)], &[output(0), output(2)]).unwrap_err();
        assert!(matches!(err, WalletError::InternalError(_)));
    }

    #[test]
    fn missing_source_is_a_validation_error() {
        let err = check_sources_in_beef(&action(), &[input(0)]).unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));
    }
}
