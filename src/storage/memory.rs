//! In-memory storage backend
//!
//! All state sits behind one mutex and every trait method runs to completion
//! while holding it, so multi-record operations are atomic exactly like the
//! SQLite transactions. Used by tests and by hosts that persist elsewhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{
    data_structures::{ActionStatus, Outpoint, OutputOrigin, Txid},
    errors::{WalletError, WalletResult},
    storage::{
        FundingCommit, OutputFilter, OutputStatus, SignedCommit, SimpleEvent, StoredAction,
        StoredBasket, StoredInput, StoredOutput, StoredTransaction, WalletStorage,
    },
};

/// Injected failures for exercising rollback paths
#[derive(Debug, Clone, Default)]
pub struct MemoryFailureModes {
    /// Fail the next `commit_funding` call
    pub fail_commit_funding: bool,
    /// Fail the next `complete_signed_action` call
    pub fail_complete_signed_action: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    baskets: BTreeMap<u32, StoredBasket>,
    outputs: BTreeMap<u32, StoredOutput>,
    actions: BTreeMap<u32, StoredAction>,
    inputs: BTreeMap<u32, StoredInput>,
    transactions: HashMap<Txid, StoredTransaction>,
    events: Vec<SimpleEvent>,
    next_id: u32,
    failure_modes: MemoryFailureModes,
}

impl MemoryState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn action_mut(&mut self, action_id: u32) -> WalletResult<&mut StoredAction> {
        self.actions
            .get_mut(&action_id)
            .ok_or_else(|| WalletError::ResourceNotFound(format!("Action {action_id} not found")))
    }

    fn release_locks(&mut self, action_id: u32) {
        for output in self.outputs.values_mut() {
            if output.locked_by_action == Some(action_id) {
                output.locked_by_action = None;
            }
        }
    }

    /// A live (not failed) action other than `except` with an input on `outpoint`
    fn spending_action(&self, outpoint: &Outpoint, except: Option<u32>) -> Option<u32> {
        self.inputs
            .values()
            .filter(|input| input.outpoint == *outpoint && Some(input.action_id) != except)
            .map(|input| input.action_id)
            .find(|action_id| {
                self.actions
                    .get(action_id)
                    .is_some_and(|a| a.status != ActionStatus::Failed)
            })
    }

    fn merge_transaction(&mut self, tx: &StoredTransaction) {
        match self.transactions.get_mut(&tx.txid) {
            Some(existing) => {
                if existing.merkle_path.is_none() {
                    existing.merkle_path = tx.merkle_path.clone();
                }
            }
            None => {
                self.transactions.insert(tx.txid, tx.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure_modes(&self, modes: MemoryFailureModes) -> WalletResult<()> {
        self.lock()?.failure_modes = modes;
        Ok(())
    }

    fn lock(&self) -> WalletResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| WalletError::StorageError("In-memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl WalletStorage for InMemoryStorage {
    async fn initialize(&self) -> WalletResult<()> {
        Ok(())
    }

    async fn find_basket(&self, name: &str) -> WalletResult<Option<StoredBasket>> {
        let state = self.lock()?;
        Ok(state.baskets.values().find(|b| b.name == name).cloned())
    }

    async fn save_basket(&self, basket: &StoredBasket) -> WalletResult<u32> {
        let mut state = self.lock()?;
        if state
            .baskets
            .values()
            .any(|b| b.name == basket.name && b.id != basket.id)
        {
            return Err(WalletError::StorageError(format!(
                "Basket '{}' already exists",
                basket.name
            )));
        }
        let id = match basket.id {
            Some(id) => id,
            None => state.next_id(),
        };
        let mut stored = basket.clone();
        stored.id = Some(id);
        state.baskets.insert(id, stored);
        Ok(id)
    }

    async fn save_output(&self, output: &StoredOutput) -> WalletResult<u32> {
        let mut state = self.lock()?;
        let id = match output.id {
            Some(id) => id,
            None => state.next_id(),
        };
        let mut stored = output.clone();
        stored.id = Some(id);
        state.outputs.insert(id, stored);
        Ok(id)
    }

    async fn get_output(&self, output_id: u32) -> WalletResult<Option<StoredOutput>> {
        Ok(self.lock()?.outputs.get(&output_id).cloned())
    }

    async fn get_output_by_outpoint(
        &self,
        outpoint: &Outpoint,
    ) -> WalletResult<Option<StoredOutput>> {
        let state = self.lock()?;
        Ok(state
            .outputs
            .values()
            .find(|o| o.outpoint().as_ref() == Some(outpoint))
            .cloned())
    }

    async fn get_outputs(&self, filter: OutputFilter) -> WalletResult<Vec<StoredOutput>> {
        let state = self.lock()?;
        Ok(state
            .outputs
            .values()
            .filter(|o| filter.matches(o))
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_spendable_change(&self, basket_id: u32) -> WalletResult<Vec<StoredOutput>> {
        let state = self.lock()?;
        let mut candidates: Vec<StoredOutput> = state
            .outputs
            .values()
            .filter(|o| o.basket_id == Some(basket_id) && o.is_selectable())
            .cloned()
            .collect();
        candidates.sort_by_key(|o| (o.satoshis, o.id));
        Ok(candidates)
    }

    async fn lock_outputs(&self, action_id: u32, output_ids: &[u32]) -> WalletResult<()> {
        let mut state = self.lock()?;
        for id in output_ids {
            let output = state.outputs.get(id).ok_or_else(|| {
                WalletError::ResourceNotFound(format!("Output {id} not found"))
            })?;
            if !output.is_available_to(action_id) {
                return Err(WalletError::ConflictError(format!(
                    "Output {id} is already spent or locked by another action"
                )));
            }
        }
        for id in output_ids {
            if let Some(output) = state.outputs.get_mut(id) {
                output.locked_by_action = Some(action_id);
            }
        }
        Ok(())
    }

    async fn insert_action(&self, action: &StoredAction) -> WalletResult<u32> {
        let mut state = self.lock()?;
        if state
            .actions
            .values()
            .any(|a| a.reference == action.reference)
        {
            return Err(WalletError::StorageError(format!(
                "Action reference {} already exists",
                action.reference
            )));
        }
        let id = state.next_id();
        let mut stored = action.clone();
        stored.id = Some(id);
        state.actions.insert(id, stored);
        Ok(id)
    }

    async fn get_action(&self, action_id: u32) -> WalletResult<Option<StoredAction>> {
        Ok(self.lock()?.actions.get(&action_id).cloned())
    }

    async fn get_action_by_reference(
        &self,
        reference: &str,
    ) -> WalletResult<Option<StoredAction>> {
        let state = self.lock()?;
        Ok(state
            .actions
            .values()
            .find(|a| a.reference == reference)
            .cloned())
    }

    async fn list_actions(&self, status: Option<ActionStatus>) -> WalletResult<Vec<StoredAction>> {
        let state = self.lock()?;
        Ok(state
            .actions
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect())
    }

    async fn get_action_inputs(&self, action_id: u32) -> WalletResult<Vec<StoredInput>> {
        let state = self.lock()?;
        let mut inputs: Vec<StoredInput> = state
            .inputs
            .values()
            .filter(|i| i.action_id == action_id)
            .cloned()
            .collect();
        inputs.sort_by_key(|i| i.vin);
        Ok(inputs)
    }

    async fn get_action_outputs(&self, action_id: u32) -> WalletResult<Vec<StoredOutput>> {
        let state = self.lock()?;
        let mut outputs: Vec<StoredOutput> = state
            .outputs
            .values()
            .filter(|o| o.action_id == Some(action_id))
            .cloned()
            .collect();
        outputs.sort_by_key(|o| o.vout);
        Ok(outputs)
    }

    async fn transition_action_status(
        &self,
        action_id: u32,
        expected: ActionStatus,
        new_status: ActionStatus,
    ) -> WalletResult<bool> {
        let mut state = self.lock()?;
        let action = state.action_mut(action_id)?;
        if action.status != expected {
            return Ok(false);
        }
        action.status = new_status;
        Ok(true)
    }

    async fn commit_funding(&self, commit: &FundingCommit) -> WalletResult<()> {
        let mut state = self.lock()?;
        if state.failure_modes.fail_commit_funding {
            state.failure_modes.fail_commit_funding = false;
            return Err(WalletError::StorageError(
                "Injected failure: commit_funding".to_string(),
            ));
        }

        let status = state.action_mut(commit.action_id)?.status;
        if status != ActionStatus::Unfunded {
            return Err(WalletError::ConflictError(format!(
                "Action {} is {status}, expected unfunded",
                commit.action_id
            )));
        }
        for id in &commit.locked_output_ids {
            let held = state.outputs.get(id).is_some_and(|o| {
                o.is_unspent() && o.locked_by_action == Some(commit.action_id)
            });
            if !held {
                return Err(WalletError::ConflictError(format!(
                    "Output {id} was spent or taken by another action before funding committed"
                )));
            }
        }

        for input in &commit.inputs {
            if let Some(owner) = state.spending_action(&input.outpoint, Some(commit.action_id)) {
                return Err(WalletError::ConflictError(format!(
                    "Input {} is already spent by action {owner}",
                    input.outpoint
                )));
            }
        }

        for input in &commit.inputs {
            let id = state.next_id();
            let mut stored = input.clone();
            stored.id = Some(id);
            stored.action_id = commit.action_id;
            state.inputs.insert(id, stored);
        }
        for output in &commit.outputs {
            let id = state.next_id();
            let mut stored = output.clone();
            stored.id = Some(id);
            stored.action_id = Some(commit.action_id);
            state.outputs.insert(id, stored);
        }

        let action = state.action_mut(commit.action_id)?;
        action.fee = commit.fee;
        action.satoshis = commit.satoshis;
        action.beef = commit.beef.clone();
        action.status = ActionStatus::Funded;
        Ok(())
    }

    async fn find_spending_action(&self, outpoint: &Outpoint) -> WalletResult<Option<u32>> {
        Ok(self.lock()?.spending_action(outpoint, None))
    }

    async fn fail_action(&self, action_id: u32) -> WalletResult<()> {
        let mut state = self.lock()?;
        let action = state.action_mut(action_id)?;
        match action.status {
            ActionStatus::Failed => return Ok(()),
            ActionStatus::Signed | ActionStatus::Finalized => {
                return Err(WalletError::ValidationError(format!(
                    "Action {} is {} and can no longer fail",
                    action.reference, action.status
                )))
            }
            _ => action.status = ActionStatus::Failed,
        }
        state.release_locks(action_id);
        Ok(())
    }

    async fn complete_signed_action(&self, commit: &SignedCommit) -> WalletResult<()> {
        let mut state = self.lock()?;
        if state.failure_modes.fail_complete_signed_action {
            state.failure_modes.fail_complete_signed_action = false;
            return Err(WalletError::StorageError(
                "Injected failure: complete_signed_action".to_string(),
            ));
        }

        let action = state.action_mut(commit.action_id)?;
        if action.status != ActionStatus::Signable {
            return Err(WalletError::ConflictError(format!(
                "Action {} is {}, expected signable",
                action.reference, action.status
            )));
        }
        action.status = ActionStatus::Signed;
        action.txid = Some(commit.txid);
        action.raw_tx = Some(commit.raw_tx.clone());
        action.beef = commit.beef.clone();

        let scripts: HashMap<u32, _> = commit.unlocking_scripts.iter().cloned().collect();
        for input in state.inputs.values_mut() {
            if input.action_id == commit.action_id {
                if let Some(script) = scripts.get(&input.vin) {
                    input.unlocking_script = Some(script.clone());
                }
            }
        }
        for output in state.outputs.values_mut() {
            if output.action_id == Some(commit.action_id) {
                output.txid = Some(commit.txid);
            }
            if output.locked_by_action == Some(commit.action_id) {
                output.locked_by_action = None;
                output.spent_by_action = Some(commit.action_id);
                output.status = OutputStatus::Spent;
                output.spendable = false;
            }
        }
        state.merge_transaction(&StoredTransaction {
            txid: commit.txid,
            raw_tx: commit.raw_tx.clone(),
            merkle_path: None,
        });
        Ok(())
    }

    async fn finalize_action(&self, action_id: u32) -> WalletResult<()> {
        let mut state = self.lock()?;
        let action = state.action_mut(action_id)?;
        if action.status != ActionStatus::Signed {
            return Err(WalletError::ValidationError(format!(
                "Action {} is {}, only signed actions can be finalized",
                action.reference, action.status
            )));
        }
        action.status = ActionStatus::Finalized;
        let no_send = action.no_send;

        for output in state.outputs.values_mut() {
            if output.action_id != Some(action_id) {
                continue;
            }
            output.spendable = match &output.origin {
                OutputOrigin::Change { .. } => !no_send,
                OutputOrigin::Caller => output.basket_id.is_some(),
                OutputOrigin::Commission { .. } => false,
            };
        }
        Ok(())
    }

    async fn get_source_transaction(
        &self,
        txid: &Txid,
    ) -> WalletResult<Option<StoredTransaction>> {
        Ok(self.lock()?.transactions.get(txid).cloned())
    }

    async fn save_source_transaction(&self, tx: &StoredTransaction) -> WalletResult<()> {
        self.lock()?.merge_transaction(tx);
        Ok(())
    }

    async fn store_simple_event(
        &self,
        action_id: u32,
        event_type: &str,
        event_data: &str,
    ) -> WalletResult<()> {
        self.lock()?.events.push(SimpleEvent {
            action_id,
            event_type: event_type.to_string(),
            event_data: event_data.to_string(),
        });
        Ok(())
    }

    async fn get_simple_events(&self, action_id: u32) -> WalletResult<Vec<SimpleEvent>> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.action_id == action_id)
            .cloned()
            .collect())
    }
}
