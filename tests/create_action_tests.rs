//! Funding behaviour of `create_action` against the in-memory backend

mod common;

use common::*;
use lightweight_wallet_actions::{
    data_structures::{ActionStatus, Outpoint, ProvidedBy, Txid},
    errors::WalletError,
    storage::OutputFilter,
    validation::{CreateActionInput, CreateActionOptions, CreateActionOutput},
};

#[tokio::test]
async fn test_single_input_pays_with_change() {
    let f = memory_fixture().await;
    let funding = f.add_change(2000, 1).await;

    let result = f.wallet.create_action(payment(1000)).await.unwrap();

    assert_eq!(result.status, ActionStatus::Funded);
    assert_eq!(result.inputs.len(), 1);
    assert_eq!(result.inputs[0].outpoint, funding);
    assert_eq!(result.inputs[0].provided_by, ProvidedBy::Storage);
    assert_eq!(result.outputs.len(), 2);
    assert_eq!(result.outputs[0].satoshis, 1000);
    assert_eq!(result.outputs[1].satoshis, 774);
    assert_eq!(result.outputs[1].provided_by, ProvidedBy::Storage);
    assert_eq!(result.metadata.fee, 226);
    assert_eq!(result.satoshis, 774 - 2000);
    assert!(result.inputs_requiring_signature.is_empty());
}

#[tokio::test]
async fn test_inputs_balance_outputs_plus_fee() {
    let f = memory_fixture().await;
    for (seed, sats) in [(1u8, 700u64), (2, 900), (3, 1500), (4, 40_000)] {
        f.add_change(sats, seed).await;
    }

    let args = payment(2500).with_output(CreateActionOutput::fixed(
        recipient_script(),
        600,
        "second recipient",
    ));
    let result = f.wallet.create_action(args).await.unwrap();

    let total_in: u64 = result.inputs.iter().map(|i| i.source_satoshis).sum();
    let total_out: u64 = result.outputs.iter().map(|o| o.satoshis).sum();
    assert_eq!(total_in, total_out + result.metadata.fee);

    let vouts: Vec<u32> = result.outputs.iter().map(|o| o.vout).collect();
    assert_eq!(vouts, (0..result.outputs.len() as u32).collect::<Vec<_>>());
    let vins: Vec<u32> = result.inputs.iter().map(|i| i.vin).collect();
    assert_eq!(vins, (0..result.inputs.len() as u32).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_insufficient_funds_reports_shortfall() {
    let f = memory_fixture().await;
    let funding = f.add_change(500, 1).await;

    let err = f.wallet.create_action(payment(1000)).await.unwrap_err();
    match err {
        WalletError::InsufficientFunds { shortfall, .. } => assert_eq!(shortfall, 692),
        other => panic!("unexpected error: {other:?}"),
    }

    let actions = f.wallet.list_actions(None).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, ActionStatus::Failed);

    let stored = f.storage.get_output_by_outpoint(&funding).await.unwrap().unwrap();
    assert!(stored.is_selectable());
}

#[tokio::test]
async fn test_unknown_no_send_change_leaves_nothing_behind() {
    let f = memory_fixture().await;
    f.add_change(5000, 1).await;

    let args = payment(1000).with_options(CreateActionOptions {
        no_send_change: vec![Outpoint::new(Txid::from_bytes([0xee; 32]), 3)],
        ..Default::default()
    });
    let err = f.wallet.create_action(args).await.unwrap_err();
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

    let locked = f
        .storage
        .get_outputs(OutputFilter::new().with_basket_id(f.basket_id))
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.locked_by_action.is_some())
        .count();
    assert_eq!(locked, 0);
}

#[tokio::test]
async fn test_caller_inputs_are_flagged_for_signature() {
    let f = memory_fixture().await;
    let utxo = caller_utxo(9, 5000);

    let args = payment(1000)
        .with_input_beef(utxo.beef.clone())
        .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"));
    let result = f.wallet.create_action(args).await.unwrap();

    assert_eq!(result.inputs.len(), 1);
    assert_eq!(result.inputs[0].provided_by, ProvidedBy::You);
    assert_eq!(result.inputs_requiring_signature, vec![0]);
    // The caller's coin covers everything, the surplus comes back as change
    assert_eq!(result.outputs.len(), 2);
    assert!(result.beef.find(&utxo.outpoint.txid).is_some());
}

#[tokio::test]
async fn test_spent_input_is_rejected() {
    let f = memory_fixture().await;
    let funding = f.add_change(3000, 1).await;
    f.wallet.create_and_sign(payment(1000)).await.unwrap();

    let args = payment(500).with_input(CreateActionInput::deferred(funding, 107, "already gone"));
    let err = f.wallet.create_action(args).await.unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));
}

#[tokio::test]
async fn test_max_possible_output_sweeps_basket() {
    let f = memory_fixture().await;
    f.add_change(1000, 1).await;
    f.add_change(2000, 2).await;

    let args = lightweight_wallet_actions::validation::CreateActionArgs::new("sweep the basket")
        .with_output(CreateActionOutput::max_possible(recipient_script(), "everything"));
    let result = f.wallet.create_action(args).await.unwrap();

    assert_eq!(result.inputs.len(), 2);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].satoshis + result.metadata.fee, 3000);
}

#[tokio::test]
async fn test_caller_outpoint_cannot_fund_two_live_actions() {
    let f = memory_fixture().await;
    let utxo = caller_utxo(9, 5000);
    let spend = || {
        payment(1000)
            .with_input_beef(utxo.beef.clone())
            .with_input(CreateActionInput::deferred(utxo.outpoint, 107, "caller coin"))
    };

    let first = f.wallet.create_action(spend()).await.unwrap();
    let err = f.wallet.create_action(spend()).await.unwrap_err();
    assert!(matches!(err, WalletError::ConflictError(_)));
    assert!(err.is_retryable());

    let live = f
        .wallet
        .list_actions(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.status != ActionStatus::Failed)
        .count();
    assert_eq!(live, 1);

    // Once the first action is cancelled the coin is free again
    f.wallet.abort_action(&first.reference).await.unwrap();
    let second = f.wallet.create_action(spend()).await.unwrap();
    assert_eq!(second.inputs[0].outpoint, utxo.outpoint);
}

#[tokio::test]
async fn test_no_send_change_is_reused_by_later_action() {
    let f = memory_fixture().await;
    f.add_change(3000, 1).await;

    let held = payment(1000).with_options(CreateActionOptions {
        no_send: true,
        ..Default::default()
    });
    let signed = f.wallet.create_and_sign(held).await.unwrap();
    let action_id = f
        .wallet
        .get_action(&signed.reference)
        .await
        .unwrap()
        .unwrap()
        .id
        .unwrap();
    let change = f
        .storage
        .get_action_outputs(action_id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.origin.is_change())
        .unwrap();
    let change_outpoint = change.outpoint().unwrap();
    assert_eq!(change_outpoint.txid, signed.txid);
    assert_eq!(change.satoshis, 1774);

    // No-send change is not offered to ordinary funding
    let err = f.wallet.create_action(payment(500)).await.unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }));

    let reuse = payment(500).with_options(CreateActionOptions {
        no_send_change: vec![change_outpoint],
        ..Default::default()
    });
    let result = f.wallet.create_action(reuse).await.unwrap();
    assert_eq!(result.inputs.len(), 1);
    assert_eq!(result.inputs[0].outpoint, change_outpoint);
    assert_eq!(result.inputs[0].provided_by, ProvidedBy::Storage);
    assert!(result.beef.find(&signed.txid).is_some());
}

#[tokio::test]
async fn test_duplicate_no_send_change_is_rejected() {
    let f = memory_fixture().await;
    let funding = f.add_change(3000, 1).await;

    let args = payment(1000).with_options(CreateActionOptions {
        no_send_change: vec![funding, funding],
        ..Default::default()
    });
    let err = f.wallet.create_action(args).await.unwrap_err();
    assert!(matches!(err, WalletError::ValidationError(_)));
    assert!(f.wallet.list_actions(None).await.unwrap().is_empty());
}
