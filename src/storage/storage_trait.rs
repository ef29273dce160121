//! Storage trait definition for action persistence
//!
//! `WalletStorage` is the only channel between pipeline stages. Locks,
//! action status and the merged proof bundle live here so that building and
//! signing can happen in different processes, hours apart. Every method that
//! changes more than one record is atomic in each backend.

use async_trait::async_trait;

use crate::{
    data_structures::{ActionStatus, Outpoint, Txid},
    errors::WalletResult,
    storage::{
        FundingCommit, OutputStatus, SignedCommit, SimpleEvent, StoredAction, StoredBasket,
        StoredInput, StoredOutput, StoredTransaction,
    },
};

/// Query filters for retrieving outputs
#[derive(Debug, Clone, Default)]
pub struct OutputFilter {
    pub basket_id: Option<u32>,
    /// Outputs created by this action
    pub action_id: Option<u32>,
    pub status: Option<OutputStatus>,
    pub spendable: Option<bool>,
    /// Outputs locked by this action
    pub locked_by_action: Option<u32>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl OutputFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_basket_id(mut self, basket_id: u32) -> Self {
        self.basket_id = Some(basket_id);
        self
    }

    pub fn with_action_id(mut self, action_id: u32) -> Self {
        self.action_id = Some(action_id);
        self
    }

    pub fn with_status(mut self, status: OutputStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_spendable(mut self, spendable: bool) -> Self {
        self.spendable = Some(spendable);
        self
    }

    pub fn locked_by(mut self, action_id: u32) -> Self {
        self.locked_by_action = Some(action_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, output: &StoredOutput) -> bool {
        self.basket_id.map_or(true, |id| output.basket_id == Some(id))
            && self.action_id.map_or(true, |id| output.action_id == Some(id))
            && self.status.map_or(true, |s| output.status == s)
            && self.spendable.map_or(true, |s| output.spendable == s)
            && self
                .locked_by_action
                .map_or(true, |id| output.locked_by_action == Some(id))
    }
}

#[async_trait]
pub trait WalletStorage: Send + Sync {
    /// Create tables and indexes
    async fn initialize(&self) -> WalletResult<()>;

    // === Baskets ===

    async fn find_basket(&self, name: &str) -> WalletResult<Option<StoredBasket>>;

    /// Insert a basket, returning its ID. Names are unique.
    async fn save_basket(&self, basket: &StoredBasket) -> WalletResult<u32>;

    // === Outputs ===

    /// Insert an output (or replace it when `id` is set)
    async fn save_output(&self, output: &StoredOutput) -> WalletResult<u32>;

    async fn get_output(&self, output_id: u32) -> WalletResult<Option<StoredOutput>>;

    async fn get_output_by_outpoint(&self, outpoint: &Outpoint)
        -> WalletResult<Option<StoredOutput>>;

    /// Outputs matching `filter`, ordered by ID
    async fn get_outputs(&self, filter: OutputFilter) -> WalletResult<Vec<StoredOutput>>;

    /// Funding candidates in a basket: spendable, unspent and unlocked, smallest first
    async fn get_spendable_change(&self, basket_id: u32) -> WalletResult<Vec<StoredOutput>>;

    /// Lock every output in `output_ids` to `action_id`, or none of them.
    ///
    /// Fails with `ConflictError` if any output is spent or locked by another action.
    async fn lock_outputs(&self, action_id: u32, output_ids: &[u32]) -> WalletResult<()>;

    // === Actions ===

    async fn insert_action(&self, action: &StoredAction) -> WalletResult<u32>;

    async fn get_action(&self, action_id: u32) -> WalletResult<Option<StoredAction>>;

    async fn get_action_by_reference(&self, reference: &str)
        -> WalletResult<Option<StoredAction>>;

    async fn list_actions(&self, status: Option<ActionStatus>) -> WalletResult<Vec<StoredAction>>;

    /// Inputs ordered by vin
    async fn get_action_inputs(&self, action_id: u32) -> WalletResult<Vec<StoredInput>>;

    /// Outputs created by the action, ordered by vout
    async fn get_action_outputs(&self, action_id: u32) -> WalletResult<Vec<StoredOutput>>;

    /// Compare-and-set on the action status; returns whether it changed
    async fn transition_action_status(
        &self,
        action_id: u32,
        expected: ActionStatus,
        new_status: ActionStatus,
    ) -> WalletResult<bool>;

    /// Write inputs, outputs, fee and bundle and move `Unfunded → Funded`.
    ///
    /// Fails with `ConflictError` if any locked output was taken or spent since it was locked,
    /// or if another live action already spends one of the inputs.
    async fn commit_funding(&self, commit: &FundingCommit) -> WalletResult<()>;

    /// ID of an action that is not `Failed` and already has an input spending `outpoint`
    async fn find_spending_action(&self, outpoint: &Outpoint) -> WalletResult<Option<u32>>;

    /// Release every lock the action holds and mark it `Failed`
    async fn fail_action(&self, action_id: u32) -> WalletResult<()>;

    /// Record the signed transaction and move `Signable → Signed`, marking consumed outputs spent
    async fn complete_signed_action(&self, commit: &SignedCommit) -> WalletResult<()>;

    /// Move `Signed → Finalized` and release the action's change for funding
    async fn finalize_action(&self, action_id: u32) -> WalletResult<()>;

    // === Source transactions ===

    async fn get_source_transaction(&self, txid: &Txid)
        -> WalletResult<Option<StoredTransaction>>;

    /// Insert or merge; an existing merkle path is never dropped
    async fn save_source_transaction(&self, tx: &StoredTransaction) -> WalletResult<()>;

    // === Audit ===

    /// Store a simple event for auditing
    async fn store_simple_event(
        &self,
        action_id: u32,
        event_type: &str,
        event_data: &str,
    ) -> WalletResult<()>;

    async fn get_simple_events(&self, action_id: u32) -> WalletResult<Vec<SimpleEvent>>;
}
