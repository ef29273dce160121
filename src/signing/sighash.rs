//! BIP-143 style signature hash with the FORKID flag
//!
//! Preimage = version || hashPrevouts || hashSequence || outpoint || scriptCode ||
//!            value || nSequence || hashOutputs || locktime || sighashType

use crate::{
    data_structures::{double_sha256, write_varint, Script, Transaction},
    errors::{WalletError, WalletResult},
};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Scope used for every wallet-produced signature
pub const SIGHASH_ALL_FORKID: u32 = SIGHASH_ALL | SIGHASH_FORKID;

fn base_type(sighash_type: u32) -> u32 {
    sighash_type & 0x1f
}

/// Serialized preimage for signing input `input_index` of `tx`, which spends
/// an output of `satoshis` locked by `script_code`
pub fn sighash_preimage(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    satoshis: u64,
    sighash_type: u32,
) -> WalletResult<Vec<u8>> {
    let input = tx.inputs.get(input_index).ok_or_else(|| {
        WalletError::ValidationError(format!(
            "Cannot sign input {input_index}: transaction has {} inputs",
            tx.inputs.len()
        ))
    })?;
    if sighash_type & SIGHASH_FORKID == 0 {
        return Err(WalletError::ValidationError(format!(
            "Sighash type 0x{sighash_type:02x} is missing the FORKID flag"
        )));
    }

    let anyone_can_pay = sighash_type & SIGHASH_ANYONECANPAY != 0;
    let base = base_type(sighash_type);

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut buf = Vec::with_capacity(tx.inputs.len() * 36);
        for i in &tx.inputs {
            buf.extend_from_slice(i.previous_output.txid.as_bytes());
            buf.extend_from_slice(&i.previous_output.vout.to_le_bytes());
        }
        double_sha256(&buf)
    };

    let hash_sequence = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        [0u8; 32]
    } else {
        let mut buf = Vec::with_capacity(tx.inputs.len() * 4);
        for i in &tx.inputs {
            buf.extend_from_slice(&i.sequence.to_le_bytes());
        }
        double_sha256(&buf)
    };

    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        let mut buf = Vec::new();
        for output in &tx.outputs {
            output.write_to(&mut buf);
        }
        double_sha256(&buf)
    } else if base == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let mut buf = Vec::new();
        tx.outputs[input_index].write_to(&mut buf);
        double_sha256(&buf)
    } else {
        [0u8; 32]
    };

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(input.previous_output.txid.as_bytes());
    preimage.extend_from_slice(&input.previous_output.vout.to_le_bytes());
    write_varint(&mut preimage, script_code.len() as u64);
    preimage.extend_from_slice(script_code.as_bytes());
    preimage.extend_from_slice(&satoshis.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
    preimage.extend_from_slice(&sighash_type.to_le_bytes());
    Ok(preimage)
}

/// Digest actually signed: double SHA-256 of the preimage
pub fn sighash_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    satoshis: u64,
    sighash_type: u32,
) -> WalletResult<[u8; 32]> {
    let preimage = sighash_preimage(tx, input_index, script_code, satoshis, sighash_type)?;
    Ok(double_sha256(&preimage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::{Outpoint, TxInput, TxOutput, Txid, DEFAULT_SEQUENCE};

    fn two_input_tx() -> Transaction {
        let mut tx = Transaction::new(1, 0);
        for seed in [1u8, 2] {
            tx.inputs.push(TxInput {
                previous_output: Outpoint::new(Txid::from_bytes([seed; 32]), seed as u32),
                unlocking_script: Script::default(),
                sequence: DEFAULT_SEQUENCE,
            });
        }
        tx.outputs.push(TxOutput {
            satoshis: 900,
            locking_script: Script::new(vec![0x51]),
        });
        tx
    }

    #[test]
    fn preimage_layout_for_sighash_all() {
        let tx = two_input_tx();
        let script = Script::new(vec![0xac; 25]);
        let preimage = sighash_preimage(&tx, 1, &script, 1000, SIGHASH_ALL_FORKID).unwrap();
        assert_eq!(preimage.len(), 4 + 32 + 32 + 36 + 1 + 25 + 8 + 4 + 32 + 4 + 4);
        assert_eq!(&preimage[preimage.len() - 4..], &[0x41, 0, 0, 0]);
        // outpoint of the signed input follows the two hashes
        assert_eq!(&preimage[68..100], &[2u8; 32]);
    }

    #[test]
    fn digest_commits_to_outputs_and_value() {
        let tx = two_input_tx();
        let script = Script::new(vec![0x51]);
        let base = sighash_digest(&tx, 0, &script, 1000, SIGHASH_ALL_FORKID).unwrap();
        assert_eq!(
            base,
            sighash_digest(&tx, 0, &script, 1000, SIGHASH_ALL_FORKID).unwrap()
        );
        assert_ne!(
            base,
            sighash_digest(&tx, 0, &script, 1001, SIGHASH_ALL_FORKID).unwrap()
        );

        let mut changed = tx.clone();
        changed.outputs[0].satoshis = 901;
        assert_ne!(
            base,
            sighash_digest(&changed, 0, &script, 1000, SIGHASH_ALL_FORKID).unwrap()
        );
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let tx = two_input_tx();
        let script = Script::new(vec![0x51]);
        let flags = SIGHASH_ALL_FORKID | SIGHASH_ANYONECANPAY;
        let preimage = sighash_preimage(&tx, 0, &script, 5, flags).unwrap();
        assert_eq!(&preimage[4..68], &[0u8; 64]);
    }

    #[test]
    fn rejects_missing_forkid_and_bad_index() {
        let tx = two_input_tx();
        let script = Script::new(vec![0x51]);
        assert!(sighash_preimage(&tx, 0, &script, 5, SIGHASH_ALL).is_err());
        assert!(sighash_preimage(&tx, 2, &script, 5, SIGHASH_ALL_FORKID).is_err());
    }
}
