pub mod complete_transaction;

pub use complete_transaction::{SignActionSpend, TransactionCompleter};
