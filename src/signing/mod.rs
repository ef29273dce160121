//! Action construction and signing pipeline
//!
//! `prepare` validates, funds and persists an action and later rebuilds it
//! for signing. `complete` merges unlocking scripts and records the signed
//! transaction. Phases share nothing in memory; storage is the hand-off.

pub mod complete;
pub mod lifecycle;
pub mod models;
pub mod prepare;
pub mod sighash;
pub mod templates;

pub use complete::{SignActionSpend, TransactionCompleter};
pub use lifecycle::ActionLifecycle;
pub use models::{
    get_supported_version, ActionInputInfo, ActionOutputInfo, CreateActionResult, HasVersion,
    SignActionResult, SignableTransaction, SigningInstruction, SigningTemplate,
    TransactionMetadata, TransactionResult,
};
pub use prepare::{ActionBuilder, SignableTransactionBuilder};
