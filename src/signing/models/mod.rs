pub mod transaction_metadata;
pub mod types;

pub use transaction_metadata::TransactionMetadata;
pub use types::*;
