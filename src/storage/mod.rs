//! Storage abstraction layer for actions and their outputs
//!
//! This module provides a trait-based storage system so the pipeline can
//! run against different backends. An in-memory backend is always
//! available; the SQLite backend sits behind the `storage` feature.

pub mod memory;
pub mod output_status;
#[cfg(feature = "storage")]
pub mod performance_optimizations;
#[cfg(feature = "storage")]
pub mod sqlite;
pub mod storage_trait;
pub mod stored_action;
pub mod stored_output;

pub use memory::*;
pub use output_status::*;
#[cfg(feature = "storage")]
pub use performance_optimizations::*;
#[cfg(feature = "storage")]
pub use sqlite::*;
pub use storage_trait::*;
pub use stored_action::*;
pub use stored_output::*;
