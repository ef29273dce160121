//! Action status machine and input/output provenance

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::key_management::KeyDerivation;

/// Lifecycle of one transaction under construction.
///
/// `Unfunded → Funded → Signable → Signed → Finalized`, with `Failed`
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Unfunded = 0,
    Funded = 1,
    Signable = 2,
    Signed = 3,
    Finalized = 4,
    Failed = 5,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Finalized | ActionStatus::Failed)
    }

    /// Whether the action can still be cancelled and its locks released
    pub fn is_abortable(&self) -> bool {
        matches!(
            self,
            ActionStatus::Unfunded | ActionStatus::Funded | ActionStatus::Signable
        )
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        match (self, next) {
            (Unfunded, Funded) | (Funded, Signable) | (Signable, Signed) | (Signed, Finalized) => {
                true
            }
            (from, Failed) => from.is_abortable(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Unfunded => "unfunded",
            ActionStatus::Funded => "funded",
            ActionStatus::Signable => "signable",
            ActionStatus::Signed => "signed",
            ActionStatus::Finalized => "finalized",
            ActionStatus::Failed => "failed",
        }
    }
}

impl Display for ActionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for ActionStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ActionStatus::Unfunded),
            1 => Ok(ActionStatus::Funded),
            2 => Ok(ActionStatus::Signable),
            3 => Ok(ActionStatus::Signed),
            4 => Ok(ActionStatus::Finalized),
            5 => Ok(ActionStatus::Failed),
            other => Err(format!("Invalid action status: {other}")),
        }
    }
}

impl From<ActionStatus> for i32 {
    fn from(status: ActionStatus) -> Self {
        status as i32
    }
}

/// Who supplies an input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvidedBy {
    /// The caller named a wallet-owned output the wallet can sign for
    Me,
    /// The caller supplies it and is responsible for its unlocking script
    You,
    /// Added by the wallet during funding (change, commission)
    Storage,
}

/// Provenance of a transaction input, carrying only what each kind needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provided_by", rename_all = "snake_case")]
pub enum InputSource {
    /// Caller-supplied input. `output_id` is set when storage tracks the
    /// outpoint, so it can be locked.
    You { output_id: Option<u32> },
    /// Caller-listed input owned by this wallet
    Me {
        output_id: u32,
        derivation: KeyDerivation,
    },
    /// Change selected by funding
    Storage {
        output_id: u32,
        derivation: KeyDerivation,
    },
}

impl InputSource {
    pub fn provided_by(&self) -> ProvidedBy {
        match self {
            InputSource::You { .. } => ProvidedBy::You,
            InputSource::Me { .. } => ProvidedBy::Me,
            InputSource::Storage { .. } => ProvidedBy::Storage,
        }
    }

    /// Inputs not added by storage need a caller or template signature
    pub fn requires_external_signature(&self) -> bool {
        !matches!(self, InputSource::Storage { .. })
    }

    pub fn output_id(&self) -> Option<u32> {
        match self {
            InputSource::You { output_id } => *output_id,
            InputSource::Me { output_id, .. } | InputSource::Storage { output_id, .. } => {
                Some(*output_id)
            }
        }
    }

    pub fn derivation(&self) -> Option<&KeyDerivation> {
        match self {
            InputSource::You { .. } => None,
            InputSource::Me { derivation, .. } | InputSource::Storage { derivation, .. } => {
                Some(derivation)
            }
        }
    }
}

/// Why an output exists, carrying only what each kind needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputOrigin {
    /// Declared by the caller with their own locking script
    Caller,
    /// Wallet change, spendable through its derivation
    Change { derivation: KeyDerivation },
    /// Service commission locked to an offset of the commission key
    Commission { key_offset: String },
}

impl OutputOrigin {
    pub fn provided_by(&self) -> ProvidedBy {
        match self {
            OutputOrigin::Caller => ProvidedBy::You,
            OutputOrigin::Change { .. } | OutputOrigin::Commission { .. } => ProvidedBy::Storage,
        }
    }

    pub fn derivation(&self) -> Option<&KeyDerivation> {
        match self {
            OutputOrigin::Change { derivation } => Some(derivation),
            _ => None,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, OutputOrigin::Change { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_follow_the_pipeline() {
        use ActionStatus::*;
        assert!(Unfunded.can_transition_to(Funded));
        assert!(Funded.can_transition_to(Signable));
        assert!(Signable.can_transition_to(Signed));
        assert!(Signed.can_transition_to(Finalized));
        assert!(!Unfunded.can_transition_to(Signable));
        assert!(!Signed.can_transition_to(Funded));
    }

    #[test]
    fn failed_and_finalized_are_terminal() {
        use ActionStatus::*;
        for from in [Unfunded, Funded, Signable] {
            assert!(from.can_transition_to(Failed));
        }
        assert!(!Signed.can_transition_to(Failed));
        assert!(!Finalized.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Failed.is_terminal() && Finalized.is_terminal());
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0..6 {
            let status = ActionStatus::try_from(code).unwrap();
            assert_eq!(i32::from(status), code);
        }
        assert!(ActionStatus::try_from(6).is_err());
    }

    #[test]
    fn input_source_serializes_as_tagged_variant() {
        let source = InputSource::Storage {
            output_id: 4,
            derivation: KeyDerivation::new("prefix", "suffix"),
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["provided_by"], "storage");
        assert!(!source.requires_external_signature());
        assert!(InputSource::You { output_id: None }.requires_external_signature());
    }
}
