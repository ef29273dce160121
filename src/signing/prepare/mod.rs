pub mod change_allocator;
pub mod create_action;
pub mod signable_transaction;

pub use change_allocator::{allocate_change, ChangeAllocation, FundingCandidate, FundingRequest};
pub use create_action::ActionBuilder;
pub use signable_transaction::{assemble_transaction, SignableTransactionBuilder};
