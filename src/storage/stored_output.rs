use serde::{Deserialize, Serialize};

use crate::{
    data_structures::{Outpoint, OutputOrigin, Script, Txid},
    storage::OutputStatus,
};

/// A transaction output known to the wallet: funding candidates, change and
/// every output of an action under construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutput {
    /// Unique output ID (database primary key)
    pub id: Option<u32>,
    /// Action that created this output, `None` for outputs imported from elsewhere
    pub action_id: Option<u32>,
    pub basket_id: Option<u32>,

    /// Unknown until the creating action is signed
    pub txid: Option<Txid>,
    pub vout: u32,
    pub satoshis: u64,
    pub locking_script: Script,

    /// Eligible for automatic funding once unspent and unlocked
    pub spendable: bool,
    pub origin: OutputOrigin,
    pub description: Option<String>,
    pub custom_instructions: Option<String>,
    pub tags: Vec<String>,
    /// Persisted ordering key, independent of `vout`
    pub sort_key: u32,

    pub status: OutputStatus,
    /// In-flight action holding this output as an input
    pub locked_by_action: Option<u32>,
    pub spent_by_action: Option<u32>,

    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl StoredOutput {
    /// A confirmed, spendable output sitting in `basket_id`
    pub fn spendable_in_basket(
        outpoint: Outpoint,
        satoshis: u64,
        locking_script: Script,
        basket_id: u32,
        origin: OutputOrigin,
    ) -> Self {
        Self {
            id: None,
            action_id: None,
            basket_id: Some(basket_id),
            txid: Some(outpoint.txid),
            vout: outpoint.vout,
            satoshis,
            locking_script,
            spendable: true,
            origin,
            description: None,
            custom_instructions: None,
            tags: Vec::new(),
            sort_key: 0,
            status: OutputStatus::Unspent,
            locked_by_action: None,
            spent_by_action: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn outpoint(&self) -> Option<Outpoint> {
        self.txid.map(|txid| Outpoint::new(txid, self.vout))
    }

    pub fn is_unspent(&self) -> bool {
        self.status == OutputStatus::Unspent && self.spent_by_action.is_none()
    }

    /// Free for `action_id` to take: unspent and not locked by anyone else
    pub fn is_available_to(&self, action_id: u32) -> bool {
        self.is_unspent() && self.locked_by_action.map_or(true, |owner| owner == action_id)
    }

    /// Candidate for automatic funding
    pub fn is_selectable(&self) -> bool {
        self.spendable && self.is_unspent() && self.locked_by_action.is_none()
    }
}
