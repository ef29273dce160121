//! Wallet builder module providing a fluent API for assembling an action wallet
//!
//! The builder collects the storage backend, the signing-key provider and
//! the engine configuration, and validates them together before handing
//! back a ready `ActionWallet`.

use std::sync::Arc;

use crate::{
    config::ActionEngineConfig,
    errors::WalletError,
    fee_model::FeeModel,
    key_management::SigningKeyProvider,
    storage::{InMemoryStorage, WalletStorage},
    wallet::ActionWallet,
};

/// Errors that can occur during wallet building
#[derive(Debug, Clone)]
pub enum WalletBuildError {
    /// Configuration validation error
    ConfigurationError(String),
    /// Missing required parameters
    MissingParameter(String),
}

impl std::fmt::Display for WalletBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletBuildError::ConfigurationError(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            WalletBuildError::MissingParameter(param) => {
                write!(f, "Missing required parameter: {}", param)
            }
        }
    }
}

impl std::error::Error for WalletBuildError {}

impl From<WalletError> for WalletBuildError {
    fn from(err: WalletError) -> Self {
        WalletBuildError::ConfigurationError(err.to_string())
    }
}

/// Builder for creating action wallets
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use lightweight_wallet_actions::key_management::RootKeyDeriver;
/// use lightweight_wallet_actions::wallet::ActionWalletBuilder;
///
/// let keys = Arc::new(RootKeyDeriver::from_bytes([7u8; 32]).unwrap());
/// let wallet = ActionWalletBuilder::new()
///     .with_keys(keys)
///     .with_change_basket("default")
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct ActionWalletBuilder {
    storage: Option<Arc<dyn WalletStorage>>,
    keys: Option<Arc<dyn SigningKeyProvider>>,
    config: ActionEngineConfig,
}

impl ActionWalletBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific storage backend. Without one the wallet keeps state in memory.
    pub fn with_storage(mut self, storage: Arc<dyn WalletStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn SigningKeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_config(mut self, config: ActionEngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_fee_model(mut self, fee_model: FeeModel) -> Self {
        self.config = self.config.with_fee_model(fee_model);
        self
    }

    pub fn with_change_basket<S: Into<String>>(mut self, basket: S) -> Self {
        self.config = self.config.with_change_basket(basket);
        self
    }

    pub fn build(self) -> Result<ActionWallet, WalletBuildError> {
        let keys = self
            .keys
            .ok_or_else(|| WalletBuildError::MissingParameter("signing key provider".into()))?;
        self.config.validate()?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn WalletStorage>);
        Ok(ActionWallet::new(storage, keys, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::RootKeyDeriver;

    #[test]
    fn keys_are_required() {
        let err = ActionWalletBuilder::new().build().err().unwrap();
        assert!(matches!(err, WalletBuildError::MissingParameter(_)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let keys = Arc::new(RootKeyDeriver::from_bytes([7; 32]).unwrap());
        let err = ActionWalletBuilder::new()
            .with_keys(keys)
            .with_change_basket("")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WalletBuildError::ConfigurationError(_)));
    }

    #[test]
    fn builds_with_defaults() {
        let keys = Arc::new(RootKeyDeriver::from_bytes([7; 32]).unwrap());
        let wallet = ActionWalletBuilder::new()
            .with_keys(keys)
            .with_fee_model(FeeModel::sat_per_kb(50))
            .build()
            .unwrap();
        assert_eq!(wallet.config().fee_model.value, 50);
        assert_eq!(wallet.config().change_basket, "default");
    }
}
