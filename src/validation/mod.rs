//! Validation of caller requests
//!
//! Structural checks that need no storage access. Checks against stored
//! state (spent inputs, no-send change) happen in the action builder.

pub mod create_action_args;

pub use create_action_args::{
    normalize_identifiers, validate_create_action_args, CreateActionArgs, CreateActionInput,
    CreateActionOptions, CreateActionOutput, OutputAmount, ValidCreateActionArgs, MAX_SATOSHIS,
};
