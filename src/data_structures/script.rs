//! Locking and unlocking scripts
//!
//! Scripts are kept as raw bytes. `chunks()` splits them into opcodes and
//! pushes, which is enough to reject truncated scripts and to recognise the
//! standard templates the pipeline signs for.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

use crate::errors::SerializationError;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

/// One parsed element of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChunk {
    pub op: u8,
    /// Pushed bytes for push opcodes, trailing bytes for a top-level OP_RETURN
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, SerializationError> {
        Ok(Self(hex::decode(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split the script into opcodes and pushes.
    ///
    /// Everything after a top-level OP_RETURN is data and is returned
    /// unparsed as part of that chunk.
    pub fn chunks(&self) -> Result<Vec<ScriptChunk>, SerializationError> {
        let bytes = &self.0;
        let mut chunks = Vec::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            let op = bytes[pos];
            pos += 1;

            let push_len = match op {
                0x01..=0x4b => Some(op as usize),
                OP_PUSHDATA1 => Some(read_len(bytes, &mut pos, 1)?),
                OP_PUSHDATA2 => Some(read_len(bytes, &mut pos, 2)?),
                OP_PUSHDATA4 => Some(read_len(bytes, &mut pos, 4)?),
                OP_RETURN => {
                    chunks.push(ScriptChunk {
                        op,
                        data: Some(bytes[pos..].to_vec()),
                    });
                    return Ok(chunks);
                }
                _ => None,
            };

            match push_len {
                Some(len) => {
                    let end = pos.checked_add(len).filter(|end| *end <= bytes.len()).ok_or_else(
                        || {
                            SerializationError::InvalidScript(format!(
                                "push of {len} bytes at offset {pos} runs past end of script"
                            ))
                        },
                    )?;
                    chunks.push(ScriptChunk {
                        op,
                        data: Some(bytes[pos..end].to_vec()),
                    });
                    pos = end;
                }
                None => chunks.push(ScriptChunk { op, data: None }),
            }
        }

        Ok(chunks)
    }

    /// Returns the public key hash if this is a standard P2PKH locking script
    pub fn p2pkh_hash(&self) -> Option<[u8; 20]> {
        let b = &self.0;
        if b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 0x14
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&b[3..23]);
            Some(hash)
        } else {
            None
        }
    }

    /// Append a minimal push of `data`
    pub fn push_data(&mut self, data: &[u8]) {
        let len = data.len();
        if len == 0 {
            self.0.push(OP_0);
        } else if len <= 0x4b {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
    }

    pub fn push_opcode(&mut self, op: u8) {
        self.0.push(op);
    }
}

fn read_len(bytes: &[u8], pos: &mut usize, width: usize) -> Result<usize, SerializationError> {
    let end = *pos + width;
    if end > bytes.len() {
        return Err(SerializationError::InvalidScript(format!(
            "truncated push length at offset {}",
            *pos
        )));
    }
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(&bytes[*pos..end]);
    *pos = end;
    Ok(u32::from_le_bytes(buf) as usize)
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Display for Script {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Script::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
