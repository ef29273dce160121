//! Fee model and serialized size estimation
//!
//! Funding sizes the transaction before any signature exists, so sizes are
//! estimated from unlocking script lengths declared up front. The same
//! model is applied again at completion to the real serialized size.

use serde::{Deserialize, Serialize};

use crate::data_structures::varint_size;

/// Bytes of a P2PKH unlocking script: DER signature with sighash byte and a
/// compressed public key, each with a one byte push
pub const P2PKH_UNLOCKING_SCRIPT_LENGTH: usize = 107;
/// Bytes of a P2PKH locking script
pub const P2PKH_LOCKING_SCRIPT_LENGTH: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModelKind {
    /// Satoshis per 1000 bytes
    #[serde(rename = "sat/kb")]
    SatPerKb,
}

/// Minimum fee rate, used both to enforce the fee and to size change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeModel {
    pub model: FeeModelKind,
    pub value: u64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self::sat_per_kb(1)
    }
}

impl FeeModel {
    pub fn sat_per_kb(value: u64) -> Self {
        Self {
            model: FeeModelKind::SatPerKb,
            value,
        }
    }

    /// Minimum fee for a transaction of `size` bytes, rounded up
    pub fn fee_for_size(&self, size: usize) -> u64 {
        match self.model {
            FeeModelKind::SatPerKb => {
                let product = (size as u128) * (self.value as u128);
                product.div_ceil(1000) as u64
            }
        }
    }

    /// Minimum fee for a transaction with the given script lengths
    pub fn fee_for(&self, unlocking_script_lengths: &[usize], locking_script_lengths: &[usize]) -> u64 {
        self.fee_for_size(estimate_transaction_size(
            unlocking_script_lengths,
            locking_script_lengths,
        ))
    }
}

/// Serialized size of a transaction with these input and output scripts
pub fn estimate_transaction_size(
    unlocking_script_lengths: &[usize],
    locking_script_lengths: &[usize],
) -> usize {
    let inputs: usize = unlocking_script_lengths
        .iter()
        .map(|len| 32 + 4 + varint_size(*len as u64) + len + 4)
        .sum();
    let outputs: usize = locking_script_lengths
        .iter()
        .map(|len| 8 + varint_size(*len as u64) + len)
        .sum();
    4 + varint_size(unlocking_script_lengths.len() as u64)
        + inputs
        + varint_size(locking_script_lengths.len() as u64)
        + outputs
        + 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_one_in_two_out_is_226_bytes() {
        let size = estimate_transaction_size(
            &[P2PKH_UNLOCKING_SCRIPT_LENGTH],
            &[P2PKH_LOCKING_SCRIPT_LENGTH, P2PKH_LOCKING_SCRIPT_LENGTH],
        );
        assert_eq!(size, 226);
    }

    #[test]
    fn fee_rounds_up() {
        let model = FeeModel::sat_per_kb(1);
        assert_eq!(model.fee_for_size(1), 1);
        assert_eq!(model.fee_for_size(1000), 1);
        assert_eq!(model.fee_for_size(1001), 2);
        assert_eq!(FeeModel::sat_per_kb(0).fee_for_size(5000), 0);
        // one satoshi per byte
        assert_eq!(FeeModel::sat_per_kb(1000).fee_for_size(226), 226);
        assert_eq!(FeeModel::sat_per_kb(500).fee_for_size(225), 113);
    }

    #[test]
    fn serde_uses_sat_per_kb_tag() {
        let json = serde_json::to_string(&FeeModel::sat_per_kb(50)).unwrap();
        assert_eq!(json, r#"{"model":"sat/kb","value":50}"#);
        let back: FeeModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, 50);
        assert!(serde_json::from_str::<FeeModel>(r#"{"model":"sat/kb","value":-1}"#).is_err());
    }
}
