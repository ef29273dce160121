//! Transaction ids and outpoints

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::errors::SerializationError;

/// Double SHA-256
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// A transaction id.
///
/// Bytes are held in hash order, the order they appear on the wire. The
/// textual form is the conventional reversed-byte hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid([u8; 32]);

impl Txid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash the serialized transaction into its id
    pub fn hash_raw_tx(raw_tx: &[u8]) -> Self {
        Self(double_sha256(raw_tx))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn from_hex(s: &str) -> Result<Self, SerializationError> {
        let mut bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(SerializationError::InvalidTxid(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Display for Txid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Txid {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Txid::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a single output of a prior transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl Display for Outpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.txid, self.vout)
    }
}

impl FromStr for Outpoint {
    type Err = SerializationError;

    /// Accepts both `txid.vout` and `txid:vout`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .rsplit_once(|c| c == '.' || c == ':')
            .ok_or_else(|| SerializationError::InvalidOutpoint(s.to_string()))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|e| SerializationError::InvalidOutpoint(format!("{s}: {e}")))?;
        Ok(Self {
            txid: Txid::from_hex(txid)?,
            vout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID_HEX: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    #[test]
    fn txid_hex_is_reversed_hash_order() {
        let txid = Txid::from_hex(TXID_HEX).unwrap();
        assert_eq!(txid.as_bytes()[0], 0x3b);
        assert_eq!(txid.to_hex(), TXID_HEX);
    }

    #[test]
    fn outpoint_parses_both_separators() {
        let dotted: Outpoint = format!("{TXID_HEX}.3").parse().unwrap();
        let coloned: Outpoint = format!("{TXID_HEX}:3").parse().unwrap();
        assert_eq!(dotted, coloned);
        assert_eq!(dotted.vout, 3);
        assert_eq!(dotted.to_string(), format!("{TXID_HEX}.3"));
    }

    #[test]
    fn outpoint_rejects_garbage() {
        assert!("nothing".parse::<Outpoint>().is_err());
        assert!(format!("{TXID_HEX}.x").parse::<Outpoint>().is_err());
        assert!("abcd.1".parse::<Outpoint>().is_err());
    }

    #[test]
    fn txid_serde_uses_display_hex() {
        let txid = Txid::from_hex(TXID_HEX).unwrap();
        let json = serde_json::to_string(&txid).unwrap();
        assert_eq!(json, format!("\"{TXID_HEX}\""));
        let back: Txid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, txid);
    }
}
