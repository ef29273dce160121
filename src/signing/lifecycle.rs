//! Cancellation and hand-back from the broadcaster

use std::sync::Arc;

use tracing::info;

use crate::{
    data_structures::ActionStatus,
    errors::{WalletError, WalletResult},
    storage::{StoredAction, WalletStorage},
};

pub struct ActionLifecycle {
    storage: Arc<dyn WalletStorage>,
}

impl ActionLifecycle {
    pub fn new(storage: Arc<dyn WalletStorage>) -> Self {
        Self { storage }
    }

    async fn load(&self, reference: &str) -> WalletResult<(u32, StoredAction)> {
        let action = self
            .storage
            .get_action_by_reference(reference)
            .await?
            .ok_or_else(|| WalletError::ResourceNotFound(format!("Action {reference}")))?;
        let id = action
            .id
            .ok_or_else(|| WalletError::InternalError(format!("Action {reference} has no ID")))?;
        Ok((id, action))
    }

    /// Cancel an action that has not been signed, releasing its locked outputs.
    ///
    /// Aborting an already failed action is a no-op.
    pub async fn abort_action(&self, reference: &str) -> WalletResult<()> {
        let (action_id, action) = self.load(reference).await?;
        match action.status {
            ActionStatus::Failed => Ok(()),
            status if status.is_abortable() => {
                self.storage.fail_action(action_id).await?;
                info!(target: "wallet::lifecycle", action_id, from = %status, "Action aborted");
                self.storage
                    .store_simple_event(action_id, "aborted", status.as_str())
                    .await
            }
            status => Err(WalletError::ValidationError(format!(
                "Action {reference} is {status} and can no longer be aborted"
            ))),
        }
    }

    /// Record that the broadcaster accepted the signed transaction
    pub async fn mark_finalized(&self, reference: &str) -> WalletResult<()> {
        let (action_id, _) = self.load(reference).await?;
        self.storage.finalize_action(action_id).await?;
        info!(target: "wallet::lifecycle", action_id, "Action finalized");
        self.storage
            .store_simple_event(action_id, "finalized", reference)
            .await
    }
}
