//! `ActionWallet` ties the pipeline stages to one storage backend and key provider

pub mod builder;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    config::ActionEngineConfig,
    data_structures::ActionStatus,
    errors::{WalletError, WalletResult},
    key_management::SigningKeyProvider,
    signing::{
        ActionBuilder, ActionLifecycle, CreateActionResult, SignActionResult, SignActionSpend,
        SignableTransaction, SignableTransactionBuilder, TransactionCompleter,
    },
    storage::{StoredAction, StoredBasket, WalletStorage},
    validation::CreateActionArgs,
};

pub use builder::{ActionWalletBuilder, WalletBuildError};

pub struct ActionWallet {
    storage: Arc<dyn WalletStorage>,
    config: ActionEngineConfig,
    builder: ActionBuilder,
    signable: SignableTransactionBuilder,
    completer: TransactionCompleter,
    lifecycle: ActionLifecycle,
}

impl ActionWallet {
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        keys: Arc<dyn SigningKeyProvider>,
        config: ActionEngineConfig,
    ) -> Self {
        Self {
            builder: ActionBuilder::new(storage.clone(), keys.clone(), config.clone()),
            signable: SignableTransactionBuilder::new(storage.clone()),
            completer: TransactionCompleter::new(storage.clone(), keys),
            lifecycle: ActionLifecycle::new(storage.clone()),
            storage,
            config,
        }
    }

    pub fn config(&self) -> &ActionEngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn WalletStorage> {
        &self.storage
    }

    /// Create storage tables and the change basket if missing
    pub async fn initialize(&self) -> WalletResult<u32> {
        self.storage.initialize().await?;
        match self.storage.find_basket(&self.config.change_basket).await? {
            Some(StoredBasket { id: Some(id), .. }) => Ok(id),
            _ => {
                self.storage
                    .save_basket(&StoredBasket::new(self.config.change_basket.clone()))
                    .await
            }
        }
    }

    /// Validate, fund and persist a new action
    pub async fn create_action(&self, args: CreateActionArgs) -> WalletResult<CreateActionResult> {
        self.builder.create_action(args).await
    }

    /// Unsigned transaction and signing instructions for a funded action
    pub async fn signable_transaction(&self, reference: &str) -> WalletResult<SignableTransaction> {
        self.signable.build(reference).await
    }

    /// Merge unlocking scripts and sign the wallet's own inputs
    pub async fn sign_action(
        &self,
        reference: &str,
        spends: BTreeMap<u32, SignActionSpend>,
    ) -> WalletResult<SignActionResult> {
        self.completer.complete(reference, spends).await
    }

    /// Build and complete in one call, for actions with no caller-signed inputs
    pub async fn create_and_sign(&self, args: CreateActionArgs) -> WalletResult<SignActionResult> {
        let deferred = args
            .inputs
            .iter()
            .filter(|input| input.unlocking_script.is_none() && input.derivation.is_none())
            .count();
        if deferred > 0 {
            return Err(WalletError::ValidationError(format!(
                "{deferred} inputs need caller signatures; use create_action and sign_action"
            )));
        }

        let created = self.create_action(args).await?;
        if !created.inputs_requiring_signature.is_empty() {
            self.abort_action(&created.reference).await?;
            return Err(WalletError::ValidationError(format!(
                "Action {} has {} inputs that need caller signatures",
                created.reference,
                created.inputs_requiring_signature.len()
            )));
        }
        self.signable_transaction(&created.reference).await?;
        self.sign_action(&created.reference, BTreeMap::new()).await
    }

    pub async fn abort_action(&self, reference: &str) -> WalletResult<()> {
        self.lifecycle.abort_action(reference).await
    }

    pub async fn mark_finalized(&self, reference: &str) -> WalletResult<()> {
        self.lifecycle.mark_finalized(reference).await
    }

    pub async fn get_action(&self, reference: &str) -> WalletResult<Option<StoredAction>> {
        self.storage.get_action_by_reference(reference).await
    }

    pub async fn list_actions(&self, status: Option<ActionStatus>) -> WalletResult<Vec<StoredAction>> {
        self.storage.list_actions(status).await
    }
}
