//! Bitcoin transaction model and its standard wire serialization

use serde::{Deserialize, Serialize};

use crate::{
    data_structures::{outpoint::Outpoint, script::Script, Txid},
    errors::SerializationError,
};

pub const DEFAULT_SEQUENCE: u32 = 0xffff_ffff;
pub const DEFAULT_TX_VERSION: u32 = 1;

/// Encode a u64 as a Bitcoin varint.
pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

/// Number of bytes `write_varint` produces for `n`
pub fn varint_size(n: u64) -> usize {
    if n < 0xfd {
        1
    } else if n <= 0xffff {
        3
    } else if n <= 0xffff_ffff {
        5
    } else {
        9
    }
}

/// Cursor over serialized transaction bytes
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SerializationError> {
        if self.remaining() < n {
            return Err(SerializationError::UnexpectedEof {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, SerializationError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, SerializationError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_varint(&mut self) -> Result<u64, SerializationError> {
        let first = self.read_bytes(1)?[0];
        Ok(match first {
            0xfd => {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(self.read_bytes(2)?);
                u16::from_le_bytes(buf) as u64
            }
            0xfe => self.read_u32_le()? as u64,
            0xff => self.read_u64_le()?,
            n => n as u64,
        })
    }

    fn read_script(&mut self) -> Result<Script, SerializationError> {
        let len = self.read_varint()? as usize;
        Ok(Script::new(self.read_bytes(len)?.to_vec()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: Outpoint,
    pub unlocking_script: Script,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub satoshis: u64,
    pub locking_script: Script,
}

impl TxOutput {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.satoshis.to_le_bytes());
        write_varint(buf, self.locking_script.len() as u64);
        buf.extend_from_slice(self.locking_script.as_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: u32, lock_time: u32) -> Self {
        Self {
            version,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.previous_output.txid.as_bytes());
            buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            write_varint(&mut buf, input.unlocking_script.len() as u64);
            buf.extend_from_slice(input.unlocking_script.as_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_to(&mut buf);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SerializationError> {
        let mut reader = ByteReader::new(data);
        let version = reader.read_u32_le()?;

        let input_count = reader.read_varint()?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            let mut txid = [0u8; 32];
            txid.copy_from_slice(reader.read_bytes(32)?);
            let vout = reader.read_u32_le()?;
            let unlocking_script = reader.read_script()?;
            let sequence = reader.read_u32_le()?;
            inputs.push(TxInput {
                previous_output: Outpoint::new(Txid::from_bytes(txid), vout),
                unlocking_script,
                sequence,
            });
        }

        let output_count = reader.read_varint()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            let satoshis = reader.read_u64_le()?;
            let locking_script = reader.read_script()?;
            outputs.push(TxOutput {
                satoshis,
                locking_script,
            });
        }

        let lock_time = reader.read_u32_le()?;
        if reader.remaining() > 0 {
            return Err(SerializationError::TrailingData(reader.remaining()));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn from_hex(s: &str) -> Result<Self, SerializationError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn txid(&self) -> Txid {
        Txid::hash_raw_tx(&self.to_bytes())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| 40 + varint_size(i.unlocking_script.len() as u64) + i.unlocking_script.len())
            .sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| 8 + varint_size(o.locking_script.len() as u64) + o.locking_script.len())
            .sum();
        8 + varint_size(self.inputs.len() as u64)
            + inputs
            + varint_size(self.outputs.len() as u64)
            + outputs
    }

    pub fn total_output_satoshis(&self) -> u64 {
        self.outputs.iter().map(|o| o.satoshis).sum()
    }
}
