//! Transaction construction and signing pipeline for BSV wallets
//!
//! This crate turns a caller's request (inputs to spend, outputs to create,
//! labels and options) into a funded, signable and finally signed
//! transaction, moving each action through
//! `Unfunded -> Funded -> Signable -> Signed -> Finalized` (or `Failed`).
//! Change outputs are selected from a basket, locked against concurrent
//! actions and released again on failure or abort.
//!
//! ## Features
//!
//! - `storage` (default): SQLite persistence through `tokio-rusqlite`
//! - `logging`: a `tracing-subscriber` setup helper for host applications
//!
//! Without the `storage` feature, only the in-memory backend is available.
//!
//! ```toml
//! [dependencies]
//! lightweight_wallet_actions = { version = "0.2", features = ["storage", "logging"] }
//! ```

pub mod beef;
pub mod config;
pub mod data_structures;
pub mod errors;
pub mod fee_model;
pub mod key_management;
#[cfg(feature = "logging")]
pub mod logging;
pub mod signing;
pub mod storage;
pub mod validation;
pub mod wallet;

pub use beef::{Beef, BeefTx};
pub use config::{ActionEngineConfig, CommissionConfig};
pub use errors::*;
pub use fee_model::FeeModel;
pub use key_management::{KeyDerivation, RootKeyDeriver, SigningKeyProvider};
pub use signing::{
    CreateActionResult, SignActionResult, SignActionSpend, SignableTransaction,
    SigningInstruction, SigningTemplate,
};
pub use storage::{InMemoryStorage, WalletStorage};
#[cfg(feature = "storage")]
pub use storage::SqliteStorage;
pub use validation::*;
pub use wallet::*;
