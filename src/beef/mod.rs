//! BEEF bundles: the transactions and proofs a receiver needs to validate a
//! new transaction by SPV
//!
//! A bundle maps transaction ids to either a full serialized transaction
//! (optionally carrying an opaque merkle path) or a txid-only stub for a
//! transaction the receiver already knows. Merging is monotonic: a stub may
//! be promoted to a full entry and a full entry may gain a merkle path, but
//! information is never dropped.
//!
//! No binary layout is defined here. Bundles persist and travel as serde
//! values; the wire encoding belongs to the broadcast collaborator.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::{
    data_structures::{Transaction, Txid},
    errors::{SerializationError, WalletResult},
};

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&hex::encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// One entry of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeefTx {
    Full {
        txid: Txid,
        #[serde(with = "hex_bytes")]
        raw_tx: Vec<u8>,
        #[serde(with = "hex_bytes::option", default)]
        merkle_path: Option<Vec<u8>>,
    },
    TxidOnly { txid: Txid },
}

impl BeefTx {
    pub fn txid(&self) -> Txid {
        match self {
            BeefTx::Full { txid, .. } | BeefTx::TxidOnly { txid } => *txid,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, BeefTx::Full { .. })
    }

    pub fn has_proof(&self) -> bool {
        matches!(
            self,
            BeefTx::Full {
                merkle_path: Some(_),
                ..
            }
        )
    }

    pub fn transaction(&self) -> Option<Result<Transaction, SerializationError>> {
        match self {
            BeefTx::Full { raw_tx, .. } => Some(Transaction::from_bytes(raw_tx)),
            BeefTx::TxidOnly { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beef {
    txs: Vec<BeefTx>,
}

impl Beef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn txs(&self) -> &[BeefTx] {
        &self.txs
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.txs.iter().map(BeefTx::txid).collect()
    }

    pub fn find(&self, txid: &Txid) -> Option<&BeefTx> {
        self.txs.iter().find(|tx| tx.txid() == *txid)
    }

    fn position(&self, txid: &Txid) -> Option<usize> {
        self.txs.iter().position(|tx| tx.txid() == *txid)
    }

    /// Full transaction for `txid`, or `None` when absent or only a stub
    pub fn find_transaction(&self, txid: &Txid) -> WalletResult<Option<Transaction>> {
        match self.find(txid).and_then(BeefTx::transaction) {
            Some(parsed) => Ok(Some(parsed?)),
            None => Ok(None),
        }
    }

    /// Merge a serialized transaction, returning its txid.
    ///
    /// A stub for the same txid is promoted in place. An existing full entry
    /// is kept, only gaining a merkle path if it had none.
    pub fn merge_raw_tx(&mut self, raw_tx: Vec<u8>, merkle_path: Option<Vec<u8>>) -> Txid {
        let txid = Txid::hash_raw_tx(&raw_tx);
        match self.position(&txid) {
            Some(index) => match &mut self.txs[index] {
                BeefTx::Full {
                    merkle_path: existing,
                    ..
                } => {
                    if existing.is_none() && merkle_path.is_some() {
                        *existing = merkle_path;
                    }
                }
                BeefTx::TxidOnly { .. } => {
                    self.txs[index] = BeefTx::Full {
                        txid,
                        raw_tx,
                        merkle_path,
                    };
                }
            },
            None => self.txs.push(BeefTx::Full {
                txid,
                raw_tx,
                merkle_path,
            }),
        }
        txid
    }

    pub fn merge_transaction(&mut self, tx: &Transaction, merkle_path: Option<Vec<u8>>) -> Txid {
        self.merge_raw_tx(tx.to_bytes(), merkle_path)
    }

    /// Add a stub unless the txid is already present in any form
    pub fn merge_txid_only(&mut self, txid: Txid) {
        if self.position(&txid).is_none() {
            self.txs.push(BeefTx::TxidOnly { txid });
        }
    }

    pub fn merge_beef(&mut self, other: &Beef) {
        for tx in &other.txs {
            match tx {
                BeefTx::Full {
                    raw_tx,
                    merkle_path,
                    ..
                } => {
                    self.merge_raw_tx(raw_tx.clone(), merkle_path.clone());
                }
                BeefTx::TxidOnly { txid } => self.merge_txid_only(*txid),
            }
        }
    }

    /// Reorder entries so every transaction follows the bundle entries it spends.
    ///
    /// Stubs come first; full entries keep their relative order apart from
    /// being moved after their parents.
    pub fn sort_txs(&mut self) {
        let index_of: HashMap<Txid, usize> = self
            .txs
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.txid(), i))
            .collect();
        let parents: Vec<Vec<usize>> = self
            .txs
            .iter()
            .map(|tx| match tx.transaction() {
                Some(Ok(parsed)) => parsed
                    .inputs
                    .iter()
                    .filter_map(|input| index_of.get(&input.previous_output.txid).copied())
                    .collect(),
                _ => Vec::new(),
            })
            .collect();

        let mut order = Vec::with_capacity(self.txs.len());
        let mut visited = vec![false; self.txs.len()];
        for (i, tx) in self.txs.iter().enumerate() {
            if !tx.is_full() {
                visited[i] = true;
                order.push(i);
            }
        }
        for i in 0..self.txs.len() {
            visit(i, &parents, &mut visited, &mut order);
        }

        let mut slots: Vec<Option<BeefTx>> = self.txs.drain(..).map(Some).collect();
        self.txs = order.into_iter().filter_map(|i| slots[i].take()).collect();
    }

    /// Check that every full transaction without a proof has each of its
    /// inputs' source transactions in the bundle, after its parent.
    pub fn is_valid(&self, allow_txid_only: bool) -> bool {
        let mut seen: HashSet<Txid> = HashSet::new();
        for tx in &self.txs {
            match tx {
                BeefTx::TxidOnly { txid } => {
                    if !allow_txid_only {
                        return false;
                    }
                    seen.insert(*txid);
                }
                BeefTx::Full {
                    txid, merkle_path, ..
                } => {
                    let parsed = match tx.transaction() {
                        Some(Ok(parsed)) => parsed,
                        _ => return false,
                    };
                    if merkle_path.is_none()
                        && parsed
                            .inputs
                            .iter()
                            .any(|input| !seen.contains(&input.previous_output.txid))
                    {
                        return false;
                    }
                    seen.insert(*txid);
                }
            }
        }
        true
    }
}

fn visit(i: usize, parents: &[Vec<usize>], visited: &mut [bool], order: &mut Vec<usize>) {
    if visited[i] {
        return;
    }
    visited[i] = true;
    for parent in &parents[i] {
        visit(*parent, parents, visited, order);
    }
    order.push(i);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::{Outpoint, Script, TxInput, TxOutput, DEFAULT_SEQUENCE};

    fn tx_spending(parent: Txid, marker: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: Outpoint::new(parent, 0),
                unlocking_script: Script::new(vec![0x51]),
                sequence: DEFAULT_SEQUENCE,
            }],
            outputs: vec![TxOutput {
                satoshis: marker,
                locking_script: Script::new(vec![0x51]),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn merging_the_same_bundle_twice_is_idempotent() {
        let parent = tx_spending(Txid::from_bytes([1; 32]), 10);
        let mut source = Beef::new();
        source.merge_transaction(&parent, Some(vec![0xaa]));
        source.merge_txid_only(Txid::from_bytes([9; 32]));

        let mut once = Beef::new();
        once.merge_beef(&source);
        let mut twice = once.clone();
        twice.merge_beef(&source);
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn stub_after_full_leaves_full_entry() {
        let tx = tx_spending(Txid::from_bytes([1; 32]), 10);
        let mut beef = Beef::new();
        let txid = beef.merge_transaction(&tx, None);
        beef.merge_txid_only(txid);
        assert!(beef.find(&txid).unwrap().is_full());
        assert_eq!(beef.len(), 1);
    }

    #[test]
    fn full_after_stub_promotes_in_place() {
        let tx = tx_spending(Txid::from_bytes([1; 32]), 10);
        let txid = tx.txid();
        let mut beef = Beef::new();
        beef.merge_txid_only(txid);
        beef.merge_txid_only(Txid::from_bytes([5; 32]));
        beef.merge_transaction(&tx, None);
        assert_eq!(beef.txs()[0].txid(), txid);
        assert!(beef.txs()[0].is_full());
        assert_eq!(beef.find_transaction(&txid).unwrap(), Some(tx));
    }

    #[test]
    fn merkle_path_is_attached_but_never_removed() {
        let tx = tx_spending(Txid::from_bytes([1; 32]), 10);
        let mut beef = Beef::new();
        let txid = beef.merge_transaction(&tx, None);
        beef.merge_transaction(&tx, Some(vec![1, 2, 3]));
        assert!(beef.find(&txid).unwrap().has_proof());
        beef.merge_transaction(&tx, None);
        assert!(beef.find(&txid).unwrap().has_proof());
    }

    #[test]
    fn sort_puts_parents_before_children() {
        let grandparent = tx_spending(Txid::from_bytes([1; 32]), 1);
        let parent = tx_spending(grandparent.txid(), 2);
        let child = tx_spending(parent.txid(), 3);

        let mut beef = Beef::new();
        beef.merge_transaction(&child, None);
        beef.merge_transaction(&parent, None);
        beef.merge_transaction(&grandparent, Some(vec![0xbe, 0xef]));
        assert!(!beef.is_valid(false));

        beef.sort_txs();
        assert_eq!(
            beef.txids(),
            vec![grandparent.txid(), parent.txid(), child.txid()]
        );
        assert!(beef.is_valid(false));
    }

    #[test]
    fn stubs_require_permission() {
        let stub_parent = Txid::from_bytes([3; 32]);
        let child = tx_spending(stub_parent, 1);
        let mut beef = Beef::new();
        beef.merge_txid_only(stub_parent);
        beef.merge_transaction(&child, None);
        assert!(beef.is_valid(true));
        assert!(!beef.is_valid(false));
    }

    #[test]
    fn serde_round_trip_preserves_entries() {
        let tx = tx_spending(Txid::from_bytes([1; 32]), 10);
        let mut beef = Beef::new();
        beef.merge_transaction(&tx, Some(vec![0xab]));
        beef.merge_txid_only(Txid::from_bytes([2; 32]));
        let json = serde_json::to_string(&beef).unwrap();
        let back: Beef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, beef);
    }
}
