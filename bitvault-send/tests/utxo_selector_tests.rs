//! Coin selection behavior and properties

mod common;

use bitvault_send::events::{SelectionEvent, SelectionEventBus};
use bitvault_send::types::{AddressType, DUST_THRESHOLD};
use bitvault_send::utxo_selection::{SelectionError, SelectionOptions, UtxoSelector};
use common::{init_test_environment, plain_utxo};
use quickcheck::{Arbitrary, Gen, TestResult};
use quickcheck_macros::quickcheck;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

#[test]
fn test_picks_largest_first_and_adds_until_covered() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(30_000, AddressType::NativeSegwit, 1),
        plain_utxo(50_000, AddressType::NativeSegwit, 2),
    ];
    let result = UtxoSelector::new()
        .select(&utxos, 60_000, dec!(10), &SelectionOptions::default())
        .unwrap();

    // 50k alone needs 60_000 + 1_400; the second input raises the fee to 2_080
    assert_eq!(result.selected_utxos.len(), 2);
    assert_eq!(result.selected_utxos[0].value_sats, 50_000);
    assert_eq!(result.selected_utxos[1].value_sats, 30_000);
    assert_eq!(result.total_fee_sats, 2_080);
    assert_eq!(result.total_selected_value_sats, 80_000);
    assert_eq!(result.change_amount_sats, 80_000 - 60_000 - 2_080);
    assert!(result.has_change());
    assert_eq!(result.target_amount_sats(), 60_000);
}

#[test]
fn test_single_input_when_sufficient() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(30_000, AddressType::NativeSegwit, 1),
        plain_utxo(50_000, AddressType::NativeSegwit, 2),
    ];
    let result = UtxoSelector::new()
        .select(&utxos, 40_000, dec!(10), &SelectionOptions::default())
        .unwrap();

    assert_eq!(result.selected_utxos.len(), 1);
    assert_eq!(result.selected_utxos[0].value_sats, 50_000);
    assert_eq!(result.total_fee_sats, 1_400);
    assert_eq!(result.change_amount_sats, 8_600);
}

#[test]
fn test_sub_dust_change_is_folded_into_fee() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(50_000, AddressType::NativeSegwit, 1),
        plain_utxo(10_500, AddressType::NativeSegwit, 2),
    ];
    let result = UtxoSelector::new()
        .select(&utxos, 58_000, dec!(10), &SelectionOptions::default())
        .unwrap();

    // Remainder of 420 sats is below the dust threshold
    assert_eq!(result.change_amount_sats, 0);
    assert_eq!(result.total_fee_sats, 2_080 + 420);
    assert!(!result.has_change());
    assert_eq!(
        result.total_selected_value_sats,
        58_000 + result.total_fee_sats
    );
}

#[test]
fn test_change_of_exactly_dust_threshold_is_kept() {
    init_test_environment();

    // One native segwit input at 1 sat/vB costs 140 sats
    let utxos = vec![plain_utxo(10_000 + 140 + DUST_THRESHOLD, AddressType::NativeSegwit, 1)];
    let result = UtxoSelector::new()
        .select(&utxos, 10_000, dec!(1), &SelectionOptions::default())
        .unwrap();

    assert_eq!(result.change_amount_sats, DUST_THRESHOLD);
    assert_eq!(result.total_fee_sats, 140);
}

#[test]
fn test_insufficient_funds_reports_required_and_available() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(1_000, AddressType::NativeSegwit, 1),
        plain_utxo(2_000, AddressType::NativeSegwit, 2),
    ];
    let err = UtxoSelector::new()
        .select(&utxos, 5_000, dec!(1), &SelectionOptions::default())
        .unwrap_err();

    assert_eq!(
        err,
        SelectionError::InsufficientFunds {
            required: 5_208,
            available: 3_000,
        }
    );
}

#[test]
fn test_unconfirmed_excluded_by_default() {
    init_test_environment();

    let mut pending = plain_utxo(100_000, AddressType::NativeSegwit, 1);
    pending.confirmed = false;
    let utxos = vec![pending, plain_utxo(20_000, AddressType::NativeSegwit, 2)];

    let result = UtxoSelector::new()
        .select(&utxos, 10_000, dec!(1), &SelectionOptions::default())
        .unwrap();
    assert_eq!(result.selected_utxos[0].value_sats, 20_000);

    let options = SelectionOptions {
        include_unconfirmed: true,
        ..SelectionOptions::default()
    };
    let result = UtxoSelector::new()
        .select(&utxos, 10_000, dec!(1), &options)
        .unwrap();
    assert_eq!(result.selected_utxos[0].value_sats, 100_000);
}

#[test]
fn test_preferred_address_type_sorts_first() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(90_000, AddressType::Legacy, 1),
        plain_utxo(20_000, AddressType::NativeSegwit, 2),
    ];
    let result = UtxoSelector::new()
        .select(&utxos, 10_000, dec!(1), &SelectionOptions::default())
        .unwrap();

    assert_eq!(result.selected_utxos.len(), 1);
    assert_eq!(result.selected_utxos[0].address_type, AddressType::NativeSegwit);
}

#[test]
fn test_smallest_first_when_not_minimizing_inputs() {
    init_test_environment();

    let utxos = vec![
        plain_utxo(50_000, AddressType::NativeSegwit, 1),
        plain_utxo(5_000, AddressType::NativeSegwit, 2),
        plain_utxo(8_000, AddressType::NativeSegwit, 3),
    ];
    let options = SelectionOptions {
        minimize_inputs: false,
        ..SelectionOptions::default()
    };
    let result = UtxoSelector::new()
        .select(&utxos, 10_000, dec!(1), &options)
        .unwrap();

    let values: Vec<u64> = result.selected_utxos.iter().map(|u| u.value_sats).collect();
    assert_eq!(values, vec![5_000, 8_000]);
}

#[test]
fn test_rejects_zero_target_and_rate() {
    init_test_environment();

    let utxos = vec![plain_utxo(50_000, AddressType::NativeSegwit, 1)];
    let selector = UtxoSelector::new();
    let options = SelectionOptions::default();

    assert_eq!(
        selector.select(&utxos, 0, dec!(1), &options).unwrap_err(),
        SelectionError::InvalidTarget(0)
    );
    assert_eq!(
        selector.select(&utxos, 1_000, Decimal::ZERO, &options).unwrap_err(),
        SelectionError::InvalidFeeRate(Decimal::ZERO)
    );
}

#[test]
fn test_selection_events_are_published() {
    init_test_environment();

    let bus = Arc::new(SelectionEventBus::new());
    let events = bus.subscribe_all();
    let selector = UtxoSelector::with_event_bus(bus.clone());
    let utxos = vec![plain_utxo(50_000, AddressType::NativeSegwit, 7)];

    selector
        .select(&utxos, 10_000, dec!(1), &SelectionOptions::default())
        .unwrap();
    match events.try_recv().unwrap() {
        SelectionEvent::Selected {
            utxos,
            target_amount,
            fee_amount,
            ..
        } => {
            assert_eq!(utxos.len(), 1);
            assert_eq!(target_amount, 10_000);
            assert_eq!(fee_amount, 140);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let _ = selector.select(&utxos, 100_000, dec!(1), &SelectionOptions::default());
    match events.try_recv().unwrap() {
        SelectionEvent::Failed { available, .. } => assert_eq!(available, 50_000),
        other => panic!("unexpected event {:?}", other),
    }
}

#[derive(Clone, Debug)]
struct SelectionCase {
    values: Vec<u64>,
    target: u64,
    rate: u32,
}

impl Arbitrary for SelectionCase {
    fn arbitrary(g: &mut Gen) -> Self {
        let count = 1 + usize::arbitrary(g) % 12;
        let values = (0..count)
            .map(|_| 1 + u64::arbitrary(g) % 2_000_000)
            .collect();
        SelectionCase {
            values,
            target: 1 + u64::arbitrary(g) % 3_000_000,
            rate: 1 + u32::arbitrary(g) % 200,
        }
    }
}

#[quickcheck]
fn selection_covers_target_and_fee(case: SelectionCase) -> TestResult {
    let types = [
        AddressType::NativeSegwit,
        AddressType::Segwit,
        AddressType::Legacy,
    ];
    let utxos: Vec<_> = case
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| plain_utxo(*v, types[i % types.len()], i as u8))
        .collect();

    match UtxoSelector::new().select(
        &utxos,
        case.target,
        Decimal::from(case.rate),
        &SelectionOptions::default(),
    ) {
        Ok(result) => {
            let sum: u64 = result.selected_utxos.iter().map(|u| u.value_sats).sum();
            TestResult::from_bool(
                sum == result.total_selected_value_sats
                    && sum >= case.target + result.total_fee_sats
                    && (result.change_amount_sats == 0
                        || result.change_amount_sats >= DUST_THRESHOLD)
                    && sum == case.target + result.total_fee_sats + result.change_amount_sats,
            )
        }
        Err(SelectionError::InsufficientFunds { required, available }) => {
            let total: u64 = case.values.iter().sum();
            TestResult::from_bool(available == total && required > available)
        }
        Err(_) => TestResult::failed(),
    }
}
