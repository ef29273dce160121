use semver::Version;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    beef::Beef,
    data_structures::{ActionStatus, Outpoint, ProvidedBy, Script, Transaction, Txid},
    errors::{SerializationError, WalletError},
    key_management::KeyDerivation,
    signing::models::transaction_metadata::TransactionMetadata,
};

const SUPPORTED_MAJOR: u64 = 1;
const SUPPORTED_MINOR: u64 = 0;
const SUPPORTED_PATCH: u64 = 0;

pub fn get_supported_version() -> Version {
    Version::new(SUPPORTED_MAJOR, SUPPORTED_MINOR, SUPPORTED_PATCH)
}

pub trait HasVersion {
    fn get_version(&self) -> &Version;
}

/// Payload handed between pipeline phases, possibly across processes
pub trait TransactionResult: HasVersion + Serialize + DeserializeOwned + Sized {
    fn from_json(s: &str) -> Result<Self, WalletError> {
        let value: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| SerializationError::JsonDeserializationError(e.to_string()))?;
        let version = value.get("version").ok_or_else(|| {
            SerializationError::JsonDeserializationError("Missing version".into())
        })?;
        let version: Version = serde_json::from_value(version.clone())
            .map_err(|e| SerializationError::JsonDeserializationError(e.to_string()))?;
        if version != get_supported_version() {
            return Err(SerializationError::JsonDeserializationError(format!(
                "Unsupported version. Expected '{}', got '{}'",
                get_supported_version(),
                version
            ))
            .into());
        }

        let deserialized_obj: Self = serde_json::from_value(value)
            .map_err(|e| SerializationError::JsonDeserializationError(e.to_string()))?;

        Ok(deserialized_obj)
    }

    fn to_json(&self) -> Result<String, WalletError> {
        serde_json::to_string(&self)
            .map_err(|e| SerializationError::JsonSerializationError(e.to_string()).into())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionInputInfo {
    pub vin: u32,
    pub outpoint: Outpoint,
    pub source_satoshis: u64,
    pub provided_by: ProvidedBy,
    pub unlocking_script_length: usize,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionOutputInfo {
    pub vout: u32,
    pub satoshis: u64,
    pub locking_script: Script,
    pub provided_by: ProvidedBy,
    pub basket: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

/// Outcome of funding: the persisted draft and what still needs a signature
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CreateActionResult {
    pub version: Version,
    pub reference: String,
    pub status: ActionStatus,
    pub inputs: Vec<ActionInputInfo>,
    pub outputs: Vec<ActionOutputInfo>,
    pub metadata: TransactionMetadata,
    /// Net change in wallet balance
    pub satoshis: i64,
    /// Inputs not provided by storage; these need an external or template signature
    pub inputs_requiring_signature: Vec<u32>,
    /// Source transactions and proofs for every input
    pub beef: Beef,
}

impl TransactionResult for CreateActionResult {}

impl HasVersion for CreateActionResult {
    fn get_version(&self) -> &Version {
        &self.version
    }
}

/// How the unlocking script for one input is produced
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum SigningTemplate {
    /// The caller produces a script of at most this length
    CallerSupplied { unlocking_script_length: usize },
    /// P2PKH signature with the wallet key at `derivation`
    P2pkh { derivation: KeyDerivation },
}

/// What a signer needs to produce the unlocking script for one input
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningInstruction {
    pub input_index: u32,
    pub outpoint: Outpoint,
    pub source_satoshis: u64,
    pub source_locking_script: Script,
    pub sighash_type: u32,
    pub template: SigningTemplate,
    /// Signature-hash preimage, hex encoded
    pub preimage: String,
    /// Double SHA256 of the preimage, hex encoded
    pub digest: String,
}

/// Unsigned transaction skeleton plus per-input signing instructions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignableTransaction {
    pub version: Version,
    pub reference: String,
    /// Inputs carry empty unlocking scripts, except for scripts the caller supplied up front
    pub transaction: Transaction,
    pub instructions: Vec<SigningInstruction>,
    pub metadata: TransactionMetadata,
    pub beef: Beef,
}

impl TransactionResult for SignableTransaction {}

impl HasVersion for SignableTransaction {
    fn get_version(&self) -> &Version {
        &self.version
    }
}

/// Final signed transaction ready for the broadcaster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignActionResult {
    pub version: Version,
    pub reference: String,
    pub txid: Txid,
    /// Serialized transaction, hex encoded
    pub raw_tx: String,
    /// Proof bundle including the signed transaction itself
    pub beef: Beef,
}

impl TransactionResult for SignActionResult {}

impl HasVersion for SignActionResult {
    fn get_version(&self) -> &Version {
        &self.version
    }
}
