//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use lightweight_wallet_actions::{
    beef::Beef,
    config::ActionEngineConfig,
    data_structures::{Outpoint, OutputOrigin, Script, Transaction, TxInput, TxOutput, Txid, DEFAULT_SEQUENCE},
    fee_model::FeeModel,
    key_management::{KeyDerivation, RootKeyDeriver, SigningKeyProvider},
    signing::{sighash::SIGHASH_ALL_FORKID, templates::p2pkh, SigningInstruction},
    storage::{InMemoryStorage, StoredBasket, StoredOutput, StoredTransaction, WalletStorage},
    validation::{CreateActionArgs, CreateActionOutput},
    wallet::ActionWallet,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

pub struct Fixture {
    pub storage: Arc<dyn WalletStorage>,
    /// Set when the backend is in memory, for injecting failures
    pub memory: Option<InMemoryStorage>,
    pub keys: Arc<RootKeyDeriver>,
    pub basket_id: u32,
    pub wallet: ActionWallet,
}

pub fn config() -> ActionEngineConfig {
    ActionEngineConfig::new().with_fee_model(FeeModel::sat_per_kb(1000))
}

pub async fn memory_fixture() -> Fixture {
    memory_fixture_with(config()).await
}

pub async fn memory_fixture_with(config: ActionEngineConfig) -> Fixture {
    let memory = InMemoryStorage::new();
    let storage: Arc<dyn WalletStorage> = Arc::new(memory.clone());
    let mut fixture = fixture_with_storage(storage, config).await;
    fixture.memory = Some(memory);
    fixture
}

pub async fn fixture_with_storage(
    storage: Arc<dyn WalletStorage>,
    config: ActionEngineConfig,
) -> Fixture {
    storage.initialize().await.unwrap();
    let basket_id = storage
        .save_basket(&StoredBasket::new(config.change_basket.clone()))
        .await
        .unwrap();
    let keys = Arc::new(RootKeyDeriver::from_bytes([0x42; 32]).unwrap());
    let wallet = ActionWallet::new(storage.clone(), keys.clone(), config);
    Fixture {
        storage,
        memory: None,
        keys,
        basket_id,
        wallet,
    }
}

/// A transaction paying `satoshis` to `locking_script`, spending a made-up parent
pub fn source_transaction(seed: u8, satoshis: u64, locking_script: Script) -> Transaction {
    let mut tx = Transaction::new(1, 0);
    tx.inputs.push(TxInput {
        previous_output: Outpoint::new(Txid::from_bytes([seed; 32]), 0),
        unlocking_script: Script::default(),
        sequence: DEFAULT_SEQUENCE,
    });
    tx.outputs.push(TxOutput {
        satoshis,
        locking_script,
    });
    tx
}

impl Fixture {
    /// Store a confirmed change output of `satoshis` in the change basket
    pub async fn add_change(&self, satoshis: u64, seed: u8) -> Outpoint {
        let derivation = KeyDerivation::new("fixture", seed.to_string());
        let script = p2pkh::lock(&self.keys.public_key(&derivation).await.unwrap());
        let tx = source_transaction(seed, satoshis, script.clone());
        let outpoint = Outpoint::new(tx.txid(), 0);
        self.storage
            .save_source_transaction(&StoredTransaction {
                txid: tx.txid(),
                raw_tx: tx.to_bytes(),
                merkle_path: Some(vec![seed, 0xbe, 0xef]),
            })
            .await
            .unwrap();
        self.storage
            .save_output(&StoredOutput::spendable_in_basket(
                outpoint,
                satoshis,
                script,
                self.basket_id,
                OutputOrigin::Change { derivation },
            ))
            .await
            .unwrap();
        outpoint
    }
}

/// An output the caller controls, outside the wallet, with its proof bundle
pub struct CallerUtxo {
    pub secret: SecretKey,
    pub outpoint: Outpoint,
    pub beef: Beef,
}

pub fn caller_utxo(seed: u8, satoshis: u64) -> CallerUtxo {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
    let public = PublicKey::from_secret_key(&secp, &secret);
    let tx = source_transaction(seed, satoshis, p2pkh::lock(&public));
    let mut beef = Beef::new();
    beef.merge_transaction(&tx, Some(vec![seed]));
    CallerUtxo {
        secret,
        outpoint: Outpoint::new(tx.txid(), 0),
        beef,
    }
}

/// P2PKH unlocking script for a signing instruction, signed with `secret`
pub fn sign_instruction(instruction: &SigningInstruction, secret: &SecretKey) -> Script {
    let secp = Secp256k1::new();
    let digest: [u8; 32] = hex::decode(&instruction.digest)
        .unwrap()
        .try_into()
        .unwrap();
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    p2pkh::unlocking_script(
        &signature,
        SIGHASH_ALL_FORKID,
        &PublicKey::from_secret_key(&secp, secret),
    )
}

pub fn recipient_script() -> Script {
    p2pkh::lock_to_hash(&[0x07; 20])
}

pub fn payment(satoshis: u64) -> CreateActionArgs {
    CreateActionArgs::new("integration payment").with_output(CreateActionOutput::fixed(
        recipient_script(),
        satoshis,
        "pay the recipient",
    ))
}
