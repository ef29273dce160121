use serde::{Deserialize, Serialize};

/// Spend state of a stored output. Locks held by in-flight actions are
/// tracked separately through `StoredOutput::locked_by_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Unspent = 0,
    Spent = 1,
    /// Withheld from funding by the operator
    Frozen = 2,
}

impl From<u32> for OutputStatus {
    fn from(value: u32) -> Self {
        match value {
            1 => OutputStatus::Spent,
            2 => OutputStatus::Frozen,
            _ => OutputStatus::Unspent,
        }
    }
}

impl From<OutputStatus> for u32 {
    fn from(status: OutputStatus) -> Self {
        status as u32
    }
}
