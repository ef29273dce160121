//! End-to-end pipeline: create, build signable, complete, finalize, abort

mod common;

use std::collections::BTreeMap;

use common::*;
use lightweight_wallet_actions::{
    data_structures::{ActionStatus, Script, Transaction},
    errors::WalletError,
    signing::{SignActionSpend, SigningTemplate, TransactionResult},
    storage::{MemoryFailureModes, OutputStatus},
    validation::CreateActionInput,
};

#[tokio::test]
async fn test_wallet_funded_action_signs_and_finalizes() {
    let f = memory_fixture().await;
    let funding = f.add_change(2000, 1).await;

    let created = f.wallet.create_action(payment(1000)).await.unwrap();
    let signable = f.wallet.signable_transaction(&created.reference).await.unwrap();
    assert!(signable.instructions.is_empty());
    assert_eq!(signable.transaction.inputs[0].previous_output, funding);
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Signable
    );

    let signed = f
        .wallet
        .sign_action(&created.reference, BTreeMap::new())
        .await
        .unwrap();
    let raw = hex::decode(&signed.raw_tx).unwrap();
    let tx = Transaction::from_bytes(&raw).unwrap();
    assert_eq!(tx.txid(), signed.txid);
    assert!(!tx.inputs[0].unlocking_script.is_empty());
    assert!(signed.beef.find(&signed.txid).is_some());
    assert!(signed.beef.is_valid(false));

    let spent = f.storage.get_output_by_outpoint(&funding).await.unwrap().unwrap();
    assert_eq!(spent.status, OutputStatus::Spent);

    f.wallet.mark_finalized(&created.reference).await.unwrap();
    let action = f.wallet.get_action(&created.reference).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Finalized);

    // The new change output funds the next payment
    let next = f.wallet.create_action(payment(300)).await.unwrap();
    assert_eq!(next.inputs[0].outpoint.txid, signed.txid);

    let events: Vec<String> = f
        .storage
        .get_simple_events(action.id.unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(events, vec!["created", "funded", "signable", "signed", "finalized"]);
}

#[tokio::test]
async fn test_missing_caller_script_keeps_action_signable() {
    let f = memory_fixture().await;
    let utxos: Vec<CallerUtxo> = (1..=3u8).map(|seed| caller_utxo(seed, 1000)).collect();

    let mut args = payment(2000).with_input_beef(merged_beef(&utxos));
    for utxo in &utxos {
        args = args.with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"));
    }
    let created = f.wallet.create_action(args).await.unwrap();
    assert_eq!(created.inputs_requiring_signature, vec![0, 1, 2]);

    let signable = f.wallet.signable_transaction(&created.reference).await.unwrap();
    assert_eq!(signable.instructions.len(), 3);
    for instruction in &signable.instructions {
        assert!(matches!(
            instruction.template,
            SigningTemplate::CallerSupplied { unlocking_script_length: 107 }
        ));
    }

    let scripts: Vec<Script> = signable
        .instructions
        .iter()
        .zip(&utxos)
        .map(|(instruction, utxo)| sign_instruction(instruction, &utxo.secret))
        .collect();

    let partial: BTreeMap<u32, SignActionSpend> = scripts[..2]
        .iter()
        .enumerate()
        .map(|(i, s)| (i as u32, SignActionSpend::new(s.clone())))
        .collect();
    let err = f
        .wallet
        .sign_action(&created.reference, partial)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::IncompleteSignature { input_index: 2 }));
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Signable
    );

    let full: BTreeMap<u32, SignActionSpend> = scripts
        .into_iter()
        .enumerate()
        .map(|(i, s)| (i as u32, SignActionSpend::new(s)))
        .collect();
    let signed = f.wallet.sign_action(&created.reference, full).await.unwrap();
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().txid,
        Some(signed.txid)
    );
}

fn merged_beef(utxos: &[CallerUtxo]) -> lightweight_wallet_actions::beef::Beef {
    let mut beef = lightweight_wallet_actions::beef::Beef::new();
    for utxo in utxos {
        beef.merge_beef(&utxo.beef);
    }
    beef
}

#[tokio::test]
async fn test_wrong_signature_is_rejected() {
    let f = memory_fixture().await;
    let utxo = caller_utxo(5, 4000);
    let stranger = caller_utxo(6, 1);

    let args = payment(1000)
        .with_input_beef(utxo.beef.clone())
        .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"));
    let created = f.wallet.create_action(args).await.unwrap();
    let signable = f.wallet.signable_transaction(&created.reference).await.unwrap();

    let bad = sign_instruction(&signable.instructions[0], &stranger.secret);
    let err = f
        .wallet
        .sign_action(
            &created.reference,
            BTreeMap::from([(0, SignActionSpend::new(bad))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Signable
    );
}

#[tokio::test]
async fn test_signable_transaction_is_stable() {
    let f = memory_fixture().await;
    let utxo = caller_utxo(4, 3000);
    let args = payment(1000)
        .with_input_beef(utxo.beef.clone())
        .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"));
    let created = f.wallet.create_action(args).await.unwrap();

    let first = f.wallet.signable_transaction(&created.reference).await.unwrap();
    let second = f.wallet.signable_transaction(&created.reference).await.unwrap();
    assert_eq!(first.transaction, second.transaction);
    assert_eq!(first.instructions, second.instructions);

    let json = first.to_json().unwrap();
    let decoded = lightweight_wallet_actions::signing::SignableTransaction::from_json(&json).unwrap();
    assert_eq!(decoded.reference, created.reference);
}

#[tokio::test]
async fn test_abort_releases_locked_outputs() {
    let f = memory_fixture().await;
    let funding = f.add_change(2000, 1).await;

    let created = f.wallet.create_action(payment(1000)).await.unwrap();
    let locked = f.storage.get_output_by_outpoint(&funding).await.unwrap().unwrap();
    assert!(locked.locked_by_action.is_some());

    f.wallet.abort_action(&created.reference).await.unwrap();
    let released = f.storage.get_output_by_outpoint(&funding).await.unwrap().unwrap();
    assert!(released.is_selectable());
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Failed
    );

    // Aborting twice is harmless
    f.wallet.abort_action(&created.reference).await.unwrap();
    let err = f.wallet.signable_transaction(&created.reference).await.unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));
}

#[tokio::test]
async fn test_signed_action_cannot_be_aborted() {
    let f = memory_fixture().await;
    f.add_change(2000, 1).await;
    let signed = f.wallet.create_and_sign(payment(1000)).await.unwrap();

    let err = f.wallet.abort_action(&signed.reference).await.unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));
}

#[tokio::test]
async fn test_failed_commit_leaves_action_signable() {
    let f = memory_fixture().await;
    f.add_change(2000, 1).await;
    let created = f.wallet.create_action(payment(1000)).await.unwrap();
    f.wallet.signable_transaction(&created.reference).await.unwrap();

    f.memory
        .as_ref()
        .unwrap()
        .set_failure_modes(MemoryFailureModes {
            fail_complete_signed_action: true,
            ..Default::default()
        })
        .unwrap();
    let err = f
        .wallet
        .sign_action(&created.reference, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::StorageError(_)));
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Signable
    );

    f.wallet
        .sign_action(&created.reference, BTreeMap::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_understated_script_length_is_a_fee_mismatch() {
    let f = memory_fixture().await;
    let utxo = caller_utxo(7, 1000);

    let args = payment(500)
        .with_input_beef(utxo.beef.clone())
        .with_input(CreateActionInput::deferred(utxo.outpoint, 1, "caller coin"));
    let created = f.wallet.create_action(args).await.unwrap();
    assert_eq!(created.metadata.fee, 120);

    let signable = f.wallet.signable_transaction(&created.reference).await.unwrap();
    let script = sign_instruction(&signable.instructions[0], &utxo.secret);
    let err = f
        .wallet
        .sign_action(
            &created.reference,
            BTreeMap::from([(0, SignActionSpend::new(script))]),
        )
        .await
        .unwrap_err();
    match err {
        WalletError::FeeMismatch { required, actual } => {
            assert_eq!(actual, 120);
            assert!(required > 220);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        f.wallet.get_action(&created.reference).await.unwrap().unwrap().status,
        ActionStatus::Signable
    );
}

#[tokio::test]
async fn test_create_and_sign_refuses_caller_signed_inputs() {
    let f = memory_fixture().await;
    let funding = f.add_change(2000, 1).await;
    let utxo = caller_utxo(8, 1000);

    let args = payment(2500)
        .with_input_beef(utxo.beef.clone())
        .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"));
    let err = f.wallet.create_and_sign(args).await.unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));

    let live = f
        .wallet
        .list_actions(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.status != ActionStatus::Failed)
        .count();
    assert_eq!(live, 0);
    let stored = f.storage.get_output_by_outpoint(&funding).await.unwrap().unwrap();
    assert!(stored.is_selectable());

    // The caller coin stays free for the two-step flow
    let created = f
        .wallet
        .create_action(
            payment(500)
                .with_input_beef(utxo.beef.clone())
                .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin")),
        )
        .await
        .unwrap();
    assert_eq!(created.inputs_requiring_signature, vec![0]);
}
