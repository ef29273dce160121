use serde::{Deserialize, Serialize};

use crate::{
    beef::Beef,
    data_structures::{ActionStatus, InputSource, Outpoint, Script, Txid},
    fee_model::FeeModel,
    storage::StoredOutput,
};

/// Named pool of outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBasket {
    pub id: Option<u32>,
    pub name: String,
    pub created_at: Option<String>,
}

impl StoredBasket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            created_at: None,
        }
    }
}

/// One transaction under construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAction {
    pub id: Option<u32>,
    /// Random reference handed to callers
    pub reference: String,
    pub status: ActionStatus,
    pub description: String,
    pub version: u32,
    pub lock_time: u32,
    /// Fee model snapshot taken when the action was created
    pub fee_model: FeeModel,
    pub fee: u64,
    /// Net change in wallet balance once this action settles
    pub satoshis: i64,
    pub no_send: bool,
    pub labels: Vec<String>,
    /// Merged proof bundle for every input's source transaction
    pub beef: Beef,
    pub txid: Option<Txid>,
    pub raw_tx: Option<Vec<u8>>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl StoredAction {
    pub fn new_unfunded(
        reference: String,
        description: String,
        version: u32,
        lock_time: u32,
        fee_model: FeeModel,
        no_send: bool,
        labels: Vec<String>,
    ) -> Self {
        Self {
            id: None,
            reference,
            status: ActionStatus::Unfunded,
            description,
            version,
            lock_time,
            fee_model,
            fee: 0,
            satoshis: 0,
            no_send,
            labels,
            beef: Beef::new(),
            txid: None,
            raw_tx: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A transaction input of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInput {
    pub id: Option<u32>,
    pub action_id: u32,
    pub vin: u32,
    pub outpoint: Outpoint,
    pub source_satoshis: u64,
    pub source_locking_script: Script,
    pub sequence: u32,
    /// Present once supplied by the caller or produced at completion
    pub unlocking_script: Option<Script>,
    /// Length assumed when the fee was sized
    pub unlocking_script_length: usize,
    pub description: Option<String>,
    pub source: InputSource,
}

/// Serialized transaction kept so later bundles can include it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub txid: Txid,
    pub raw_tx: Vec<u8>,
    pub merkle_path: Option<Vec<u8>>,
}

/// Everything funding writes in one atomic step
#[derive(Debug, Clone)]
pub struct FundingCommit {
    pub action_id: u32,
    /// Outputs that must still be locked by this action at commit time
    pub locked_output_ids: Vec<u32>,
    pub inputs: Vec<StoredInput>,
    pub outputs: Vec<StoredOutput>,
    pub fee: u64,
    pub satoshis: i64,
    pub beef: Beef,
}

/// Everything completion writes in one atomic step
#[derive(Debug, Clone)]
pub struct SignedCommit {
    pub action_id: u32,
    pub txid: Txid,
    pub raw_tx: Vec<u8>,
    /// Final unlocking script per vin
    pub unlocking_scripts: Vec<(u32, Script)>,
    pub beef: Beef,
}

/// Audit record written at each status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleEvent {
    pub action_id: u32,
    pub event_type: String,
    pub event_data: String,
}
