//! Error types for the action construction and signing pipeline
//!
//! `WalletError` is the single error surfaced by every pipeline stage. Its
//! variants follow the failure classes callers need to tell apart: caller
//! mistakes, missing funds, races against other actions, operator
//! misconfiguration, completion integrity failures and internal invariant
//! violations.

use thiserror::Error;

/// Result alias used throughout the crate
pub type WalletResult<T> = Result<T, WalletError>;

/// Top-level error for all wallet action operations
#[derive(Debug, Error)]
pub enum WalletError {
    /// Malformed or inconsistent caller input. Never retried.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Available funding does not cover outputs plus fee
    #[error("Insufficient funds: short by {shortfall} satoshis ({message})")]
    InsufficientFunds { shortfall: u64, message: String },

    /// Double-spend or lock race detected at commit time. The caller may retry.
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Missing basket, invalid fee model or other operator-level problem
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The signed transaction no longer pays the minimum fee for its real size
    #[error("Fee mismatch: transaction pays {actual} satoshis but {required} are required")]
    FeeMismatch { required: u64, actual: u64 },

    /// An input has no unlocking script at completion time
    #[error("Missing unlocking script for input {input_index}")]
    IncompleteSignature { input_index: u32 },

    /// Invariant violation inside the pipeline
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Key management error: {0}")]
    KeyManagementError(#[from] KeyManagementError),
}

impl WalletError {
    /// Only races may be retried blindly with fresh state
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::ConflictError(_))
    }

    /// Short, stable name of the error class, used in audit events
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::ValidationError(_) => "validation",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::ConflictError(_) => "conflict",
            WalletError::ConfigurationError(_) => "configuration",
            WalletError::FeeMismatch { .. } => "fee_mismatch",
            WalletError::IncompleteSignature { .. } => "incomplete_signature",
            WalletError::InternalError(_) => "internal",
            WalletError::StorageError(_) => "storage",
            WalletError::ResourceNotFound(_) => "not_found",
            WalletError::SerializationError(_) => "serialization",
            WalletError::KeyManagementError(_) => "key_management",
        }
    }
}

/// Errors raised while encoding or decoding wire data and payloads
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Hex decode error: {0}")]
    HexDecodeError(String),

    #[error("Unexpected end of data: needed {needed} bytes at offset {offset}")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("Trailing data: {0} bytes left after decoding")]
    TrailingData(usize),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Invalid txid: {0}")]
    InvalidTxid(String),

    #[error("Invalid outpoint: {0}")]
    InvalidOutpoint(String),

    #[error("JSON serialization error: {0}")]
    JsonSerializationError(String),

    #[error("JSON deserialization error: {0}")]
    JsonDeserializationError(String),
}

impl From<hex::FromHexError> for SerializationError {
    fn from(err: hex::FromHexError) -> Self {
        SerializationError::HexDecodeError(err.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(err: hex::FromHexError) -> Self {
        SerializationError::from(err).into()
    }
}

/// Errors raised by key derivation and signing providers
#[derive(Debug, Error)]
pub enum KeyManagementError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

impl From<secp256k1::Error> for KeyManagementError {
    fn from(err: secp256k1::Error) -> Self {
        KeyManagementError::InvalidKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(WalletError::ConflictError("race".into()).is_retryable());
        assert!(!WalletError::ValidationError("bad".into()).is_retryable());
        assert!(!WalletError::InsufficientFunds {
            shortfall: 10,
            message: String::new()
        }
        .is_retryable());
        assert!(!WalletError::InternalError("bug".into()).is_retryable());
    }

    #[test]
    fn incomplete_signature_names_the_input() {
        let err = WalletError::IncompleteSignature { input_index: 2 };
        assert_eq!(err.to_string(), "Missing unlocking script for input 2");
        assert_eq!(err.kind(), "incomplete_signature");
    }

    #[test]
    fn hex_errors_convert_into_serialization_errors() {
        let err: WalletError = hex::decode("zz").unwrap_err().into();
        assert!(matches!(
            err,
            WalletError::SerializationError(SerializationError::HexDecodeError(_))
        ));
    }
}
