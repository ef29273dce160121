//! Engine configuration for action construction
//!
//! These are operator-level settings shared by every action a wallet builds.
//! Per-action overrides (fee model, output ordering) travel in the
//! `createAction` options instead.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{SerializationError, WalletError, WalletResult},
    fee_model::FeeModel,
};

/// Service commission added to every funded action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionConfig {
    /// Compressed public key, hex encoded
    pub public_key_hex: String,
    pub satoshis: u64,
}

impl CommissionConfig {
    pub fn new(public_key: &PublicKey, satoshis: u64) -> Self {
        Self {
            public_key_hex: hex::encode(public_key.serialize()),
            satoshis,
        }
    }

    pub fn public_key(&self) -> WalletResult<PublicKey> {
        let bytes = hex::decode(&self.public_key_hex).map_err(|e| {
            WalletError::ConfigurationError(format!("Commission public key is not hex: {e}"))
        })?;
        PublicKey::from_slice(&bytes).map_err(|e| {
            WalletError::ConfigurationError(format!("Invalid commission public key: {e}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionEngineConfig {
    /// Rate used when the caller does not override it
    pub fee_model: FeeModel,
    /// Basket that funding draws from and that new change lands in
    pub change_basket: String,
    pub commission: Option<CommissionConfig>,
    /// Give created outputs random ordering keys instead of sequential ones
    pub randomize_output_order_keys: bool,
    /// Funding passes before a lock race is surfaced as a conflict
    pub max_funding_attempts: u32,
}

impl Default for ActionEngineConfig {
    fn default() -> Self {
        Self {
            fee_model: FeeModel::default(),
            change_basket: "default".to_string(),
            commission: None,
            randomize_output_order_keys: false,
            max_funding_attempts: 3,
        }
    }
}

impl ActionEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fee_model(mut self, fee_model: FeeModel) -> Self {
        self.fee_model = fee_model;
        self
    }

    pub fn with_change_basket(mut self, basket: impl Into<String>) -> Self {
        self.change_basket = basket.into();
        self
    }

    pub fn with_commission(mut self, commission: CommissionConfig) -> Self {
        self.commission = Some(commission);
        self
    }

    pub fn with_randomized_order_keys(mut self, randomize: bool) -> Self {
        self.randomize_output_order_keys = randomize;
        self
    }

    pub fn with_max_funding_attempts(mut self, attempts: u32) -> Self {
        self.max_funding_attempts = attempts;
        self
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(s: &str) -> WalletResult<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| SerializationError::JsonDeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.change_basket.trim().is_empty() {
            return Err(WalletError::ConfigurationError(
                "Change basket name must not be empty".to_string(),
            ));
        }
        if self.max_funding_attempts == 0 {
            return Err(WalletError::ConfigurationError(
                "max_funding_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(commission) = &self.commission {
            commission.public_key()?;
            if commission.satoshis == 0 {
                return Err(WalletError::ConfigurationError(
                    "Commission must be at least one satoshi".to_string(),
                ));
            }
        }
        Ok(())
    }
}
