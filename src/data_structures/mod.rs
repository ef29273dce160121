//! Core data structures: wire primitives and action provenance

pub mod action;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use action::{ActionStatus, InputSource, OutputOrigin, ProvidedBy};
pub use outpoint::{double_sha256, Outpoint, Txid};
pub use script::{
    Script, ScriptChunk, OP_0, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160, OP_PUSHDATA1,
    OP_PUSHDATA2, OP_PUSHDATA4, OP_RETURN,
};
pub use transaction::{
    varint_size, write_varint, ByteReader, Transaction, TxInput, TxOutput, DEFAULT_SEQUENCE,
    DEFAULT_TX_VERSION,
};
