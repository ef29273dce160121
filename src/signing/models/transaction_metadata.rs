use serde::{Deserialize, Serialize};

use crate::{data_structures::DEFAULT_TX_VERSION, fee_model::FeeModel};

/// Transaction-level fields fixed at funding time
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransactionMetadata {
    /// The absolute fee for the transaction
    pub fee: u64,
    pub version: u32,
    /// The earliest block or time this transaction can be mined
    pub lock_time: u32,
    /// Rate the fee was sized with
    pub fee_model: FeeModel,
}

impl Default for TransactionMetadata {
    fn default() -> Self {
        Self::new(0, DEFAULT_TX_VERSION, 0, FeeModel::default())
    }
}

impl TransactionMetadata {
    pub fn new(fee: u64, version: u32, lock_time: u32, fee_model: FeeModel) -> Self {
        Self {
            fee,
            version,
            lock_time,
            fee_model,
        }
    }
}
