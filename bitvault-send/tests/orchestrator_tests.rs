mod common;

use bitcoin::Network;
use bitvault_send::config::EngineConfig;
use bitvault_send::error::{SecurityErrorKind, SendError, TransactionErrorKind};
use bitvault_send::orchestrator::{FeeChoice, SendOrchestrator};
use bitvault_send::providers::{ProviderError, XpubAddressDeriver};
use bitvault_send::status::{ProgressEvent, TransactionStage};
use bitvault_send::types::AddressType;
use common::{
    address_at, change_address, deriver, init_test_environment, raw_utxo, seed_phrase,
    send_request, source_address, MockFeeProvider, MockKeyProvider, MockUtxoProvider, Mocks,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(mocks: &Mocks) -> SendOrchestrator {
    SendOrchestrator::new(
        EngineConfig::for_network(Network::Testnet),
        mocks.collaborators(),
    )
    .unwrap()
}

/// Provider holding a single UTXO at the first receive address
fn funded(value_sats: u64) -> MockUtxoProvider {
    MockUtxoProvider::with(&address_at(&deriver(), false, 0), vec![raw_utxo(1, value_sats)])
}

#[tokio::test]
async fn test_send_happy_path() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);
    let events = orchestrator.tracker().subscribe();

    let outcome = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap();

    // Normal tier maps to the 3-block estimate
    assert_eq!(outcome.fee_rate, dec!(12));
    assert_eq!(outcome.fee_details.estimated_vsize, 140);
    assert_eq!(outcome.fee_details.fee_sats, 1_680);
    assert_eq!(outcome.fee_details.change_sats, 58_320);
    assert_eq!(outcome.selection.selected_utxos.len(), 1);
    assert!(outcome.security_report.is_secure);
    assert!(outcome.warnings.is_empty());

    assert_eq!(mocks.keys.call_count(), 1);
    assert_eq!(mocks.broadcast.submitted_count(), 1);

    let status = orchestrator.tracker().current();
    assert_eq!(status.stage, TransactionStage::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.txid.as_deref(), Some(outcome.txid.as_str()));
    assert!(!orchestrator.is_in_flight());

    let stages: Vec<TransactionStage> = orchestrator
        .tracker()
        .history()
        .iter()
        .map(|entry| entry.stage)
        .collect();
    assert!(stages.contains(&TransactionStage::SigningTransaction));
    assert!(stages.contains(&TransactionStage::Confirming));

    let completed = events
        .try_iter()
        .any(|event| matches!(event, ProgressEvent::Completed { ref txid } if *txid == outcome.txid));
    assert!(completed);
}

#[tokio::test]
async fn test_wrong_network_recipient_fails_before_io() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);

    let mainnet = XpubAddressDeriver::from_mnemonic(
        &seed_phrase(),
        AddressType::NativeSegwit,
        Network::Bitcoin,
        1,
    )
    .unwrap();
    let mut request = send_request(40_000, vec![source_address(&deriver(), 0)]);
    request.recipient = address_at(&mainnet, false, 0);

    let err = orchestrator.send(request).await.unwrap_err();
    assert_eq!(err.code(), "ADDRESS_VALIDATION/WRONG_NETWORK");

    assert_eq!(mocks.utxos.call_count(), 0);
    assert_eq!(mocks.keys.call_count(), 0);
    assert_eq!(mocks.broadcast.submitted_count(), 0);

    let tracker = orchestrator.tracker();
    assert_eq!(tracker.current().stage, TransactionStage::Failed);
    assert_eq!(tracker.current().error, Some(err));
    assert!(tracker
        .history()
        .iter()
        .all(|entry| entry.stage != TransactionStage::SigningTransaction));
}

#[tokio::test]
async fn test_self_send_rejected() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);

    let mut request = send_request(40_000, vec![source_address(&deriver(), 0)]);
    request.recipient = change_address();

    let err = orchestrator.send(request).await.unwrap_err();
    assert_eq!(err.code(), "ADDRESS_VALIDATION/SELF_SEND");
}

#[tokio::test]
async fn test_insufficient_funds() {
    init_test_environment();

    let mocks = Mocks::new(funded(10_000));
    let orchestrator = orchestrator(&mocks);

    let err = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap_err();

    match &err {
        SendError::InsufficientFunds {
            available,
            shortfall,
            ..
        } => {
            assert_eq!(*available, 10_000);
            assert!(*shortfall > 30_000);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(mocks.keys.call_count(), 0);
    assert_eq!(orchestrator.tracker().current().stage, TransactionStage::Failed);
}

#[tokio::test]
async fn test_locked_wallet() {
    init_test_environment();

    let mocks = Mocks {
        keys: Arc::new(MockKeyProvider::locked()),
        ..Mocks::new(funded(100_000))
    };
    let orchestrator = orchestrator(&mocks);

    let err = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap_err();

    assert_eq!(err, SendError::Security(SecurityErrorKind::WalletLocked));
    assert_eq!(err.code(), "SECURITY/WALLET_LOCKED");
    assert_eq!(mocks.broadcast.submitted_count(), 0);
    assert_eq!(orchestrator.tracker().current().stage, TransactionStage::Failed);
}

#[tokio::test]
async fn test_second_send_while_in_flight_is_rejected() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000).delayed(Duration::from_millis(300)));
    let orchestrator = orchestrator(&mocks);
    let request = send_request(40_000, vec![source_address(&deriver(), 0)]);

    let (first, second) = tokio::join!(orchestrator.send(request.clone()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.is_in_flight());
        orchestrator.send(request.clone()).await
    });

    assert!(first.is_ok());
    assert_eq!(
        second.unwrap_err(),
        SendError::Transaction(TransactionErrorKind::AlreadyInProgress)
    );
    assert_eq!(mocks.broadcast.submitted_count(), 1);
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test]
async fn test_cancel_during_fetch() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000).delayed(Duration::from_millis(300)));
    let orchestrator = orchestrator(&mocks);
    let events = orchestrator.tracker().subscribe();

    let (result, cancelled) = tokio::join!(
        orchestrator.send(send_request(40_000, vec![source_address(&deriver(), 0)])),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.cancel()
        }
    );

    assert!(cancelled);
    assert_eq!(
        result.unwrap_err(),
        SendError::Transaction(TransactionErrorKind::Cancelled)
    );
    assert_eq!(mocks.keys.call_count(), 0);
    assert_eq!(mocks.broadcast.submitted_count(), 0);
    assert!(!orchestrator.is_in_flight());

    // Subscribers saw the cancellation; the tracker is ready for a new attempt
    assert!(events.try_iter().any(|event| matches!(
        event,
        ProgressEvent::Failed {
            error: SendError::Transaction(TransactionErrorKind::Cancelled)
        }
    )));
    assert_eq!(
        orchestrator.tracker().current().stage,
        TransactionStage::Initializing
    );
}

#[tokio::test]
async fn test_cancel_without_send_is_a_no_op() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);

    assert!(!orchestrator.cancel());
    assert_eq!(
        orchestrator.tracker().current().stage,
        TransactionStage::Initializing
    );
}

#[tokio::test]
async fn test_retry_without_previous_attempt() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);

    let err = orchestrator.retry().await.unwrap_err();
    assert_eq!(err.code(), "TRANSACTION/NO_PREVIOUS_ATTEMPT");
}

#[tokio::test]
async fn test_retry_replays_last_request() {
    init_test_environment();

    let source = address_at(&deriver(), false, 0);
    let provider = funded(100_000).failing_first(
        &source,
        vec![ProviderError::Rejected("address index not ready".to_string())],
    );
    let mocks = Mocks::new(provider);
    let orchestrator = orchestrator(&mocks);

    let err = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NETWORK/SERVICE_UNAVAILABLE");
    assert!(err.is_retryable());

    let outcome = orchestrator.retry().await.unwrap();
    assert_eq!(outcome.fee_details.fee_sats, 1_680);
    assert_eq!(
        orchestrator.tracker().current().stage,
        TransactionStage::Completed
    );
    assert_eq!(mocks.utxos.call_count(), 2);
}

#[tokio::test]
async fn test_transient_fetch_failure_is_retried() {
    init_test_environment();

    let source = address_at(&deriver(), false, 0);
    let provider = funded(100_000).failing_first(&source, vec![ProviderError::Timeout]);
    let mocks = Mocks::new(provider);
    let orchestrator = orchestrator(&mocks);

    orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap();
    assert_eq!(mocks.utxos.call_count(), 2);
}

#[tokio::test]
async fn test_fetch_gives_up_after_max_attempts() {
    init_test_environment();

    let source = address_at(&deriver(), false, 0);
    let down = || ProviderError::Unavailable("503".to_string());
    let provider = funded(100_000).failing_first(&source, vec![down(), down(), down()]);
    let mocks = Mocks::new(provider);
    let orchestrator = orchestrator(&mocks);

    let err = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NETWORK/SERVICE_UNAVAILABLE");
    assert_eq!(mocks.utxos.call_count(), 3);
    assert_eq!(mocks.keys.call_count(), 0);
}

#[tokio::test]
async fn test_fetches_every_source_address() {
    init_test_environment();

    let d = deriver();
    let provider = MockUtxoProvider::with(&address_at(&d, false, 0), vec![raw_utxo(1, 40_000)])
        .add(&address_at(&d, false, 1), vec![raw_utxo(2, 40_000), raw_utxo(3, 0)]);
    let mocks = Mocks::new(provider);
    let orchestrator = orchestrator(&mocks);

    let outcome = orchestrator
        .send(send_request(
            50_000,
            vec![source_address(&d, 0), source_address(&d, 1)],
        ))
        .await
        .unwrap();

    assert_eq!(mocks.utxos.call_count(), 2);
    assert_eq!(outcome.selection.selected_utxos.len(), 2);
    assert!(orchestrator
        .tracker()
        .history()
        .iter()
        .any(|entry| entry.detail.as_deref() == Some("2 of 2")));
}

#[tokio::test]
async fn test_large_amount_needs_confirmation() {
    init_test_environment();

    let mocks = Mocks::new(funded(20_000_000));
    let orchestrator = orchestrator(&mocks);
    let mut request = send_request(10_000_000, vec![source_address(&deriver(), 0)]);

    let err = orchestrator.send(request.clone()).await.unwrap_err();
    match &err {
        SendError::Security(SecurityErrorKind::ConfirmationRequired { reasons }) => {
            assert_eq!(reasons.len(), 1)
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(mocks.keys.call_count(), 0);

    request.confirmed = true;
    let outcome = orchestrator.send(request).await.unwrap();
    assert!(!outcome.warnings.is_empty());
    assert_eq!(mocks.keys.call_count(), 1);
}

#[tokio::test]
async fn test_amount_above_safety_ceiling() {
    init_test_environment();

    let mocks = Mocks::new(funded(300_000_000));
    let orchestrator = orchestrator(&mocks);
    let mut request = send_request(200_000_000, vec![source_address(&deriver(), 0)]);
    request.confirmed = true;

    let err = orchestrator.send(request).await.unwrap_err();
    assert_eq!(err.code(), "SECURITY/AMOUNT_EXCEEDS_CEILING");
    assert_eq!(mocks.keys.call_count(), 0);
}

#[tokio::test]
async fn test_fallback_fee_rates_are_flagged() {
    init_test_environment();

    let mocks = Mocks {
        fees: Arc::new(MockFeeProvider::unavailable()),
        ..Mocks::new(funded(100_000))
    };
    let orchestrator = orchestrator(&mocks);

    let outcome = orchestrator
        .send(send_request(40_000, vec![source_address(&deriver(), 0)]))
        .await
        .unwrap();

    // Testnet fallback table
    assert_eq!(outcome.fee_rate, dec!(2));
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w == "Using default fee rates"));
}

#[tokio::test]
async fn test_custom_fee_rate() {
    init_test_environment();

    let mocks = Mocks::new(funded(100_000));
    let orchestrator = orchestrator(&mocks);

    let mut request = send_request(40_000, vec![source_address(&deriver(), 0)]);
    request.fee = FeeChoice::Custom(dec!(1001));
    let err = orchestrator.send(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), "FEE_ESTIMATION/RATE_TOO_HIGH");

    request.fee = FeeChoice::Custom(dec!(3));
    let outcome = orchestrator.send(request).await.unwrap();
    assert_eq!(outcome.fee_rate, dec!(3));
    assert_eq!(outcome.fee_details.fee_sats, 420);
}

#[test]
fn test_invalid_config_is_refused() {
    let mocks = Mocks::new(funded(100_000));
    let mut config = EngineConfig::for_network(Network::Testnet);
    config.network = "moonnet".to_string();

    assert!(SendOrchestrator::new(config, mocks.collaborators()).is_err());
}
