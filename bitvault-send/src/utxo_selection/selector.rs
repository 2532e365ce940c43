//! Greedy UTXO selector with a fee feedback loop
//!
//! # Overview
//!
//! The fee depends on the transaction size, the size depends on how many inputs
//! are spent, and the number of inputs depends on the fee. The selector resolves
//! this loop one input at a time:
//!
//! 1. Drop unconfirmed UTXOs unless the caller allows them, and drop zero-value ones
//! 2. Order candidates: preferred address type first, then by value (descending when
//!    minimizing inputs, ascending otherwise). The sort is stable, so equal keys keep
//!    the order the UTXO source returned them in
//! 3. Add candidates one by one, re-estimating size (base + per-type inputs + two
//!    outputs) and fee after each addition
//! 4. Stop as soon as the accumulated value covers target plus fee
//! 5. A remainder of at least the dust threshold becomes change; a smaller positive
//!    remainder is added to the fee
//!
//! # Usage
//!
//! ```
//! use bitvault_send::types::{AddressType, Utxo};
//! use bitvault_send::utxo_selection::{SelectionOptions, UtxoSelector};
//! use rust_decimal_macros::dec;
//!
//! let utxo = Utxo {
//!     txid: "aa".repeat(32),
//!     output_index: 0,
//!     value_sats: 50_000,
//!     confirmed: true,
//!     address: "tb1qexample".to_string(),
//!     derivation_path: Some("m/84'/1'/0'/0/0".to_string()),
//!     address_type: AddressType::NativeSegwit,
//!     address_index: 0,
//!     block_height: None,
//!     public_key: None,
//! };
//!
//! let selector = UtxoSelector::new();
//! let result = selector
//!     .select(&[utxo], 20_000, dec!(10), &SelectionOptions::default())
//!     .unwrap();
//! assert_eq!(result.total_fee_sats, 1_400);
//! assert_eq!(result.change_amount_sats, 28_600);
//! ```
//!
//! # Security Considerations
//!
//! - The selector itself does not handle private keys or signatures
//! - Event data describes wallet state and should be handled accordingly

use crate::events::{OutPointInfo, SelectionEvent, SelectionEventBus};
use crate::logging::{log_core, LogLevel};
use crate::math::{calculate_fee, estimate_vsize, is_dust};
use crate::types::{AddressType, Utxo};
use crate::utxo_selection::types::{SelectionError, SelectionOptions, SelectionResult};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

/// Outputs assumed while selecting: recipient plus potential change
const SELECTION_OUTPUT_COUNT: usize = 2;

/// UTXO selector
#[derive(Default)]
pub struct UtxoSelector {
    event_bus: Option<Arc<SelectionEventBus>>,
}

impl UtxoSelector {
    /// Create a selector that publishes no events
    pub fn new() -> Self {
        Self { event_bus: None }
    }

    /// Create a selector that publishes to the given bus
    pub fn with_event_bus(event_bus: Arc<SelectionEventBus>) -> Self {
        Self {
            event_bus: Some(event_bus),
        }
    }

    /// Choose inputs covering `target_amount_sats` plus fee at `fee_rate` sat/vB
    ///
    /// # Arguments
    ///
    /// * `utxos` - Candidate outputs, in the order the UTXO source returned them
    /// * `target_amount_sats` - Amount to deliver to the recipient
    /// * `fee_rate` - Fee rate in sat/vB
    /// * `options` - Confirmation policy and ordering preferences
    ///
    /// # Returns
    ///
    /// The selection, or `SelectionError::InsufficientFunds` carrying the amount
    /// required for the last input set tried and the total spendable value
    pub fn select(
        &self,
        utxos: &[Utxo],
        target_amount_sats: u64,
        fee_rate: Decimal,
        options: &SelectionOptions,
    ) -> Result<SelectionResult, SelectionError> {
        if target_amount_sats == 0 {
            return Err(SelectionError::InvalidTarget(target_amount_sats));
        }
        if fee_rate <= Decimal::ZERO {
            return Err(SelectionError::InvalidFeeRate(fee_rate));
        }

        let candidates = order_candidates(utxos, options);

        let mut selected: Vec<Utxo> = Vec::new();
        let mut input_types: Vec<AddressType> = Vec::new();
        let mut accumulated: u64 = 0;
        let mut fee = calculate_fee(estimate_vsize(&[], SELECTION_OUTPUT_COUNT), fee_rate);

        for utxo in candidates {
            accumulated = accumulated.saturating_add(utxo.value_sats);
            input_types.push(utxo.address_type);
            selected.push(utxo.clone());

            let size = estimate_vsize(&input_types, SELECTION_OUTPUT_COUNT);
            fee = calculate_fee(size, fee_rate);

            if accumulated >= target_amount_sats.saturating_add(fee) {
                let result = resolve_change(selected, accumulated, target_amount_sats, fee);
                self.publish_selected(&result, target_amount_sats);
                log_core(
                    LogLevel::Debug,
                    "utxo_selection_completed",
                    Some(json!({
                        "inputs": result.selected_utxos.len(),
                        "fee_sats": result.total_fee_sats,
                        "change_sats": result.change_amount_sats,
                    })),
                );
                return Ok(result);
            }
        }

        let required = target_amount_sats.saturating_add(fee);
        if let Some(bus) = &self.event_bus {
            bus.publish(SelectionEvent::Failed {
                required,
                available: accumulated,
            });
        }
        log_core(
            LogLevel::Info,
            "utxo_selection_insufficient_funds",
            Some(json!({ "required_sats": required, "available_sats": accumulated })),
        );

        Err(SelectionError::InsufficientFunds {
            required,
            available: accumulated,
        })
    }

    fn publish_selected(&self, result: &SelectionResult, target_amount_sats: u64) {
        if let Some(bus) = &self.event_bus {
            bus.publish(SelectionEvent::Selected {
                utxos: result
                    .selected_utxos
                    .iter()
                    .map(|u| OutPointInfo {
                        txid: u.txid.clone(),
                        vout: u.output_index,
                    })
                    .collect(),
                target_amount: target_amount_sats,
                fee_amount: result.total_fee_sats,
                change_amount: result.change_amount_sats,
            });
        }
    }
}

/// Filter by confirmation policy and order by preference then value
fn order_candidates<'a>(utxos: &'a [Utxo], options: &SelectionOptions) -> Vec<&'a Utxo> {
    let mut candidates: Vec<&Utxo> = utxos
        .iter()
        .filter(|u| u.value_sats > 0)
        .filter(|u| u.confirmed || options.include_unconfirmed)
        .collect();

    candidates.sort_by(|a, b| {
        let a_other = a.address_type != options.prefer_address_type;
        let b_other = b.address_type != options.prefer_address_type;
        a_other.cmp(&b_other).then_with(|| {
            if options.minimize_inputs {
                b.value_sats.cmp(&a.value_sats)
            } else {
                a.value_sats.cmp(&b.value_sats)
            }
        })
    });

    candidates
}

fn resolve_change(
    selected: Vec<Utxo>,
    accumulated: u64,
    target_amount_sats: u64,
    fee: u64,
) -> SelectionResult {
    let remainder = accumulated - target_amount_sats - fee;
    let (change, total_fee) = if is_dust(remainder) {
        // Sub-dust remainder goes to the miner
        (0, fee + remainder)
    } else {
        (remainder, fee)
    };

    SelectionResult {
        selected_utxos: selected,
        total_fee_sats: total_fee,
        total_selected_value_sats: accumulated,
        change_amount_sats: change,
    }
}
