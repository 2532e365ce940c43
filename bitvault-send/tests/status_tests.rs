use bitvault_send::error::{SendError, TransactionErrorKind};
use bitvault_send::status::{ProgressEvent, StatusError, StatusTracker, TransactionStage};

const FORWARD: [TransactionStage; 8] = [
    TransactionStage::ValidatingInputs,
    TransactionStage::FetchingUtxos,
    TransactionStage::SelectingUtxos,
    TransactionStage::EstimatingFees,
    TransactionStage::BuildingTransaction,
    TransactionStage::SigningTransaction,
    TransactionStage::Broadcasting,
    TransactionStage::Confirming,
];

#[test]
fn test_starts_initializing() {
    let tracker = StatusTracker::new();
    let status = tracker.current();

    assert_eq!(status.stage, TransactionStage::Initializing);
    assert_eq!(status.progress, 5);
    assert!(!status.is_complete);
    assert!(!status.is_error);
    assert_eq!(tracker.history().len(), 1);
}

#[test]
fn test_full_forward_run() {
    let tracker = StatusTracker::new();

    let mut last = tracker.current().progress;
    for stage in FORWARD {
        tracker.advance(stage, None).unwrap();
        let status = tracker.current();
        assert_eq!(status.stage, stage);
        assert!(status.progress > last);
        last = status.progress;
    }
    tracker.complete(&"ab".repeat(32)).unwrap();

    let status = tracker.current();
    assert_eq!(status.stage, TransactionStage::Completed);
    assert_eq!(status.progress, 100);
    assert!(status.is_complete);
    assert_eq!(status.txid, Some("ab".repeat(32)));
    assert_eq!(tracker.history().len(), FORWARD.len() + 2);
}

#[test]
fn test_backward_transition_rejected() {
    let tracker = StatusTracker::new();
    tracker.advance(TransactionStage::SelectingUtxos, None).unwrap();

    assert_eq!(
        tracker.advance(TransactionStage::FetchingUtxos, None),
        Err(StatusError::InvalidTransition {
            from: TransactionStage::SelectingUtxos,
            to: TransactionStage::FetchingUtxos,
        })
    );
    assert!(tracker
        .advance(TransactionStage::SelectingUtxos, None)
        .is_err());
    assert!(tracker.advance(TransactionStage::Failed, None).is_err());
    assert!(tracker.advance(TransactionStage::Completed, None).is_err());
}

#[test]
fn test_fail_from_any_stage_is_terminal() {
    let tracker = StatusTracker::new();
    tracker.advance(TransactionStage::BuildingTransaction, None).unwrap();

    let error = SendError::Transaction(TransactionErrorKind::BuildFailed("boom".into()));
    tracker.fail(error.clone()).unwrap();

    let status = tracker.current();
    assert_eq!(status.stage, TransactionStage::Failed);
    assert_eq!(status.progress, 0);
    assert!(status.is_error);
    assert_eq!(status.error, Some(error.clone()));

    assert_eq!(
        tracker.advance(TransactionStage::SigningTransaction, None),
        Err(StatusError::Terminal(TransactionStage::Failed))
    );
    assert!(tracker.fail(error).is_err());
    assert!(tracker.complete("00").is_err());
}

#[test]
fn test_sub_progress_stays_below_next_stage() {
    let tracker = StatusTracker::new();
    tracker.advance(TransactionStage::FetchingUtxos, None).unwrap();

    tracker.update_sub_progress(3, 8, "Fetched address 3 of 8").unwrap();
    let mid = tracker.current().progress;
    assert!(mid > 20 && mid < 35);

    tracker.update_sub_progress(8, 8, "Fetched address 8 of 8").unwrap();
    let end = tracker.current().progress;
    assert_eq!(end, 34);

    // Never moves backwards
    tracker.update_sub_progress(1, 8, "late report").unwrap();
    assert_eq!(tracker.current().progress, end);
    assert_eq!(tracker.current().stage, TransactionStage::FetchingUtxos);

    let last = tracker.history().pop().unwrap();
    assert_eq!(last.detail.as_deref(), Some("1 of 8"));
}

#[test]
fn test_subscribers_receive_events_in_order() {
    let tracker = StatusTracker::new();
    let events = tracker.subscribe();

    tracker.advance(TransactionStage::ValidatingInputs, Some("checking")).unwrap();
    tracker
        .fail(SendError::Transaction(TransactionErrorKind::Cancelled))
        .unwrap();

    match events.try_recv().unwrap() {
        ProgressEvent::Progress(entry) => {
            assert_eq!(entry.stage, TransactionStage::ValidatingInputs);
            assert_eq!(entry.detail.as_deref(), Some("checking"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.try_recv().unwrap() {
        ProgressEvent::Progress(entry) => assert_eq!(entry.stage, TransactionStage::Failed),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
        events.try_recv().unwrap(),
        ProgressEvent::Failed { .. }
    ));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_reset_starts_new_attempt_and_keeps_subscribers() {
    let tracker = StatusTracker::new();
    let events = tracker.subscribe();

    tracker.advance(TransactionStage::SigningTransaction, None).unwrap();
    tracker.reset();

    let status = tracker.current();
    assert_eq!(status.stage, TransactionStage::Initializing);
    assert!(!status.is_error);
    assert_eq!(tracker.history().len(), 1);

    while events.try_recv().is_ok() {}
    tracker.advance(TransactionStage::ValidatingInputs, None).unwrap();
    assert!(events.try_recv().is_ok());
}

#[test]
fn test_dropped_subscriber_does_not_block() {
    let tracker = StatusTracker::new();
    drop(tracker.subscribe());

    tracker.advance(TransactionStage::ValidatingInputs, None).unwrap();
    assert_eq!(tracker.current().stage, TransactionStage::ValidatingInputs);
}

#[test]
fn test_stage_table() {
    assert_eq!(TransactionStage::Initializing.progress(), 5);
    assert_eq!(TransactionStage::Broadcasting.progress(), 90);
    assert_eq!(TransactionStage::Completed.progress(), 100);
    assert_eq!(TransactionStage::Failed.progress(), 0);
    assert!(TransactionStage::Failed.is_terminal());
    assert_eq!(TransactionStage::Confirming.next(), Some(TransactionStage::Completed));
    assert_eq!(TransactionStage::Completed.next(), None);
}
