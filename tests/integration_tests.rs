//! Integration tests for Courier delivery flows against a scripted ledger

use std::sync::Arc;

use courier::cell::Cell;
use courier::delivery::{DeliveryError, DeliveryPhase, SequenceWalletDelivery, SEQNO_METHOD};
use courier::gateway::{
    AccountState, AccountStatus, ScriptedGateway, StackValue, TransactionRecord, TxCheckpoint,
};
use courier::idempotency::FixedClock;
use courier::message::{comment, message_body};
use courier::signing::KeyPair;
use courier::status::{ProcessedStatusOracle, PROCESSED_METHOD};
use courier::wallet::{EncodingError, MAX_BATCH_MESSAGES};
use courier::{
    Address, Courier, CourierConfig, CourierError, HighloadWallet, OutboundMessage,
    SequenceWallet, TransferRequest, Wallet,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const NOW: u32 = 1_700_000_000;

fn sequence_wallet() -> Arc<SequenceWallet> {
    Arc::new(
        SequenceWallet::from_code(KeyPair::from_seed([21; 32]), 698_983_191, 0, comment("code").unwrap())
            .unwrap()
            .with_clock(Arc::new(FixedClock(NOW))),
    )
}

fn highload_wallet() -> HighloadWallet {
    HighloadWallet::new(KeyPair::from_seed([22; 32]), Address::new(0, [0x77; 32]))
        .with_clock(Arc::new(FixedClock(NOW)))
        .with_rng(StdRng::seed_from_u64(9))
}

fn payment() -> TransferRequest {
    TransferRequest::new(vec![
        OutboundMessage::new(Address::new(0, [0x10; 32]), 1_500_000_000).with_body(comment("invoice 42").unwrap()),
    ])
}

fn tx(lt: u64, body: Option<Cell>) -> TransactionRecord {
    TransactionRecord {
        lt,
        hash: [lt as u8; 32],
        prev: None,
        in_msg_body: body,
    }
}

fn state(status: AccountStatus, last: &TransactionRecord) -> AccountState {
    AccountState {
        status,
        balance: 5_000_000_000,
        last_tx: Some(last.checkpoint()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_first_transfer_from_uninitialized_wallet() {
    let wallet = sequence_wallet();
    let expected = wallet.build_transfer(&payment().with_sequence(0)).unwrap();
    let funding = tx(100, None);
    let ours = tx(101, Some(expected.body.clone()));

    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([10, 11])
            .with_account(10, state(AccountStatus::Uninit, &funding))
            .with_account(11, state(AccountStatus::Active, &ours))
            .with_method(11, SEQNO_METHOD, vec![StackValue::Int(1)]),
    );
    gw.push_transaction(funding);
    gw.push_transaction(ours.clone());

    let delivery = SequenceWalletDelivery::new(gw.clone(), wallet.clone());
    let mut session = delivery.start(payment()).await.unwrap();
    assert_eq!(session.state().last_sequence, 0);
    assert_eq!(gw.broadcast_count(), 1);

    // deploying transfer carries the StateInit
    let sent = gw.broadcasts().remove(0);
    assert_eq!(sent, expected.to_broadcast(wallet.as_ref(), true).unwrap());
    assert_eq!(message_body(&Cell::from_boc(&sent).unwrap()).unwrap(), expected.body);

    assert_eq!(
        session.step().await.unwrap(),
        DeliveryPhase::Reconciling { block: 11 }
    );
    match session.step().await.unwrap() {
        DeliveryPhase::Done(receipt) => {
            assert_eq!(receipt.sequence, 0);
            assert_eq!(receipt.block, 11);
            assert_eq!(receipt.transaction, ours.checkpoint());
            assert_eq!(receipt.rebroadcasts, 0);
        }
        other => panic!("expected Done, got {:?}", other),
    }
    assert_eq!(gw.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_unchanged_sequence_rebroadcasts_each_poll() {
    let last = tx(50, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([10, 11, 12, 13])
            .with_account(10, state(AccountStatus::Active, &last))
            .with_method(10, SEQNO_METHOD, vec![StackValue::Int(5)]),
    );
    gw.push_transaction(last);

    let delivery = SequenceWalletDelivery::new(gw.clone(), sequence_wallet());
    let mut session = delivery.start(payment()).await.unwrap();

    for block in 11..=13 {
        assert_eq!(session.step().await.unwrap(), DeliveryPhase::Reconciling { block });
        assert_eq!(session.step().await.unwrap(), DeliveryPhase::AwaitingAdvance);
    }
    assert_eq!(session.rebroadcasts(), 3);
    assert_eq!(gw.broadcast_count(), 4);
    assert_eq!(*session.phase(), DeliveryPhase::AwaitingAdvance);

    // identical payload every time
    let sent = gw.broadcasts();
    assert!(sent.windows(2).all(|w| w[0] == w[1]));

    // no newer block, nothing to do
    assert_eq!(session.step().await.unwrap(), DeliveryPhase::AwaitingAdvance);
    assert_eq!(gw.broadcast_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_history_window_exceeded() {
    let checkpoint = tx(50, None);
    let foreign: Vec<_> = (51..=53)
        .map(|lt| tx(lt, Some(comment(&format!("foreign {}", lt)).unwrap())))
        .collect();

    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([10, 11])
            .with_history_window(2)
            .with_account(10, state(AccountStatus::Active, &checkpoint))
            .with_account(11, state(AccountStatus::Active, &foreign[2]))
            .with_method(10, SEQNO_METHOD, vec![StackValue::Int(1)])
            .with_method(11, SEQNO_METHOD, vec![StackValue::Int(4)]),
    );
    gw.push_transaction(checkpoint.clone());
    for t in &foreign {
        gw.push_transaction(t.clone());
    }

    let delivery = SequenceWalletDelivery::new(gw, sequence_wallet());
    let err = delivery.send_and_wait(payment()).await.unwrap_err();
    match &err {
        DeliveryError::ReconciliationGap { checkpoint: cp, window } => {
            assert_eq!(*cp, Some(checkpoint.checkpoint()));
            assert_eq!(*window, 2);
        }
        other => panic!("expected ReconciliationGap, got {:?}", other),
    }
    assert!(err.is_safe_to_resubmit());
    assert!(!err.needs_investigation());
}

/// Deploy from an address with no history: funding, our transfer, then
/// `deposits` more incoming transactions
fn fresh_account_ledger(
    wallet: &SequenceWallet,
    deposits: u64,
    window: Option<usize>,
) -> (Arc<ScriptedGateway>, TransactionRecord) {
    let expected = wallet.build_transfer(&payment().with_sequence(0)).unwrap();
    let funding = tx(100, None);
    let ours = tx(101, Some(expected.body));
    let mut history = vec![funding, ours.clone()];
    history.extend((1..=deposits).map(|i| tx(101 + i, Some(comment(&format!("deposit {}", i)).unwrap()))));

    let head = history.last().cloned().unwrap();
    let mut gw = ScriptedGateway::new()
        .with_heights([10, 11])
        .with_account(11, state(AccountStatus::Active, &head))
        .with_method(11, SEQNO_METHOD, vec![StackValue::Int(1)]);
    if let Some(window) = window {
        gw = gw.with_history_window(window);
    }
    let gw = Arc::new(gw);
    for t in history {
        gw.push_transaction(t);
    }
    (gw, ours)
}

#[tokio::test(start_paused = true)]
async fn test_short_window_without_checkpoint_is_a_gap() {
    let wallet = sequence_wallet();
    let (gw, _) = fresh_account_ledger(&wallet, 2, Some(2));

    let delivery = SequenceWalletDelivery::new(gw.clone(), wallet);
    let mut session = delivery.start(payment()).await.unwrap();
    assert_eq!(session.state().checkpoint, None);
    assert_eq!(session.step().await.unwrap(), DeliveryPhase::Reconciling { block: 11 });

    match session.step().await.unwrap_err() {
        DeliveryError::ReconciliationGap { checkpoint, window } => {
            assert_eq!(checkpoint, None);
            assert_eq!(window, 2);
        }
        other => panic!("expected ReconciliationGap, got {:?}", other),
    }
    // nothing re-signed or re-sent
    assert_eq!(gw.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_window_without_checkpoint_finds_transfer() {
    let wallet = sequence_wallet();
    let (gw, ours) = fresh_account_ledger(&wallet, 2, None);

    let receipt = SequenceWalletDelivery::new(gw.clone(), wallet)
        .send_and_wait(payment())
        .await
        .unwrap();
    assert_eq!(receipt.sequence, 0);
    assert_eq!(receipt.transaction, ours.checkpoint());
    assert_eq!(gw.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_two_unprocessed_answers_then_processed() {
    let wallet = highload_wallet();
    let transfer = wallet.build_transfer(&payment()).unwrap();
    let key = transfer.idempotency_key.unwrap();
    let payload = transfer.to_broadcast(&wallet, false).unwrap();

    let last = tx(7, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([100, 101, 102, 103])
            .with_account(100, state(AccountStatus::Active, &last)),
    );
    for code in [0, 0, -1] {
        gw.push_answer(PROCESSED_METHOD, Ok(vec![StackValue::Int(code)]));
    }

    let oracle = ProcessedStatusOracle::new(gw.clone(), wallet.address());
    let report = oracle.await_terminal(key, &payload).await.unwrap();
    assert_eq!(report.key, key);
    assert_eq!(report.rebroadcasts, 2);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.block, 103);
    assert_eq!(gw.broadcasts(), vec![payload.clone(), payload]);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_send_and_confirm_adds_initial_broadcast() {
    let wallet = highload_wallet();
    let transfer = wallet.build_transfer(&payment()).unwrap();

    let last = tx(7, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([100, 101, 102, 103, 104])
            .with_account(100, state(AccountStatus::Active, &last)),
    );
    for code in [0, 0, -1] {
        gw.push_answer(PROCESSED_METHOD, Ok(vec![StackValue::Int(code)]));
    }

    let oracle = ProcessedStatusOracle::new(gw.clone(), wallet.address());
    let report = oracle.send_and_confirm(&wallet, &transfer).await.unwrap();
    assert_eq!(report.rebroadcasts, 2);
    assert_eq!(gw.broadcast_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_e_batch_capacity_checked_before_network() {
    let wallet = highload_wallet();
    let messages: Vec<_> = (0..=MAX_BATCH_MESSAGES)
        .map(|i| OutboundMessage::new(Address::new(0, [(i % 251) as u8; 32]), 1 + i as u128))
        .collect();

    let full = TransferRequest::new(messages[..MAX_BATCH_MESSAGES].to_vec());
    assert!(wallet.build_transfer(&full).is_ok());

    let gw = Arc::new(ScriptedGateway::new().with_heights([1]));
    let courier = Courier::new(gw.clone(), CourierConfig::default());
    let err = courier
        .send_batch_and_confirm(&wallet, TransferRequest::new(messages))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CourierError::Encoding(EncodingError::TooManyMessages { count: 255, max: 254 })
    ));
    assert_eq!(gw.broadcast_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lookalike_body_is_not_a_confirmation() {
    let wallet = sequence_wallet();
    let impostor = SequenceWallet::new(KeyPair::from_seed([99; 32]), wallet.address())
        .with_clock(Arc::new(FixedClock(NOW)));
    // same sequence and messages, different signature
    let lookalike = impostor.build_transfer(&payment().with_sequence(3)).unwrap();
    let ours_at_4 = wallet.build_transfer(&payment().with_sequence(4)).unwrap();

    let t0 = tx(10, None);
    let t1 = tx(11, Some(lookalike.body));
    let t2 = tx(12, Some(ours_at_4.body.clone()));
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([1, 2, 3])
            .with_account(1, state(AccountStatus::Active, &t0))
            .with_account(2, state(AccountStatus::Active, &t1))
            .with_account(3, state(AccountStatus::Active, &t2))
            .with_method(1, SEQNO_METHOD, vec![StackValue::Int(3)])
            .with_method(2, SEQNO_METHOD, vec![StackValue::Int(4)])
            .with_method(3, SEQNO_METHOD, vec![StackValue::Int(5)]),
    );
    gw.push_transaction(t0);
    gw.push_transaction(t1);
    gw.push_transaction(t2.clone());

    let receipt = SequenceWalletDelivery::new(gw.clone(), wallet)
        .send_and_wait(payment())
        .await
        .unwrap();
    assert_eq!(receipt.sequence, 4);
    assert_eq!(receipt.transaction, t2.checkpoint());
    assert_eq!(gw.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_failures_are_swallowed() {
    let wallet = sequence_wallet();
    let expected = wallet.build_transfer(&payment().with_sequence(2)).unwrap();
    let t0 = tx(1, None);
    let ours = tx(2, Some(expected.body));
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([1, 2, 3])
            .with_account(1, state(AccountStatus::Active, &t0))
            .with_account(3, state(AccountStatus::Active, &ours))
            .with_method(1, SEQNO_METHOD, vec![StackValue::Int(2)])
            .with_method(3, SEQNO_METHOD, vec![StackValue::Int(3)]),
    );
    gw.push_transaction(t0);
    gw.push_transaction(ours.clone());
    gw.fail_broadcasts(2);

    let receipt = SequenceWalletDelivery::new(gw.clone(), wallet)
        .send_and_wait(payment())
        .await
        .unwrap();
    assert_eq!(receipt.transaction, ours.checkpoint());
    assert_eq!(receipt.rebroadcasts, 1);
    assert_eq!(gw.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_courier_reports_indeterminate_on_deadline() {
    let last = tx(1, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([1])
            .with_account(1, state(AccountStatus::Active, &last))
            .with_method(1, SEQNO_METHOD, vec![StackValue::Int(8)]),
    );
    let config = CourierConfig {
        send_timeout_secs: 30,
        ..CourierConfig::default()
    };
    let courier = Courier::new(gw.clone(), config);
    let err = courier
        .send_and_wait(sequence_wallet(), payment())
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Indeterminate { .. }));
    assert!(!err.is_safe_to_resubmit());
    assert_eq!(gw.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_forgotten_transfer_surfaces_through_courier() {
    let wallet = highload_wallet();
    let last = tx(1, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([1, 2])
            .with_account(1, state(AccountStatus::Active, &last))
            .with_method(1, PROCESSED_METHOD, vec![StackValue::Int(1)]),
    );
    let courier = Courier::new(gw, CourierConfig::default());
    let err = courier
        .send_batch_and_confirm(&wallet, payment())
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Status(_)));
    assert!(err.is_safe_to_resubmit());
}

#[tokio::test(start_paused = true)]
async fn test_undocumented_processed_code_is_rejected() {
    let wallet = highload_wallet();
    let last = tx(1, None);
    let gw = Arc::new(
        ScriptedGateway::new()
            .with_heights([1])
            .with_account(1, state(AccountStatus::Active, &last))
            .with_method(1, PROCESSED_METHOD, vec![StackValue::Int(2)]),
    );
    let courier = Courier::new(gw, CourierConfig::default());
    let key = wallet.idempotency_key(None, Some(1));
    assert!(matches!(
        courier.processed_status(wallet.address(), key).await,
        Err(CourierError::Status(courier::status::StatusError::ProtocolViolation(_)))
    ));
}

#[test]
fn test_checkpoint_identity_uses_hash() {
    let a = TxCheckpoint::new(5, [1; 32]);
    let b = TxCheckpoint::new(5, [2; 32]);
    assert_ne!(a, b);
}
