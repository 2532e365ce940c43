//! Core types for UTXO selection
//!
//! # Key Types
//!
//! - [`SelectionOptions`]: caller preferences (address type, confirmation policy, ordering)
//! - [`SelectionResult`]: the chosen inputs together with fee and change
//! - [`SelectionError`]: why no selection could be made
//!
//! # Security Considerations
//!
//! - Selection works on public UTXO data only and never sees keys
//! - A result always carries the derivation path recorded on each UTXO so the
//!   signer can re-derive the matching key later

use crate::error::{SendError, TransactionErrorKind};
use crate::types::{AddressType, Utxo, DUST_THRESHOLD};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller preferences for coin selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOptions {
    /// UTXOs of this type are tried first
    pub prefer_address_type: AddressType,
    /// Whether unconfirmed UTXOs may be spent
    pub include_unconfirmed: bool,
    /// Largest-first when true, smallest-first (UTXO-set cleanup) when false
    pub minimize_inputs: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            prefer_address_type: AddressType::NativeSegwit,
            include_unconfirmed: false,
            minimize_inputs: true,
        }
    }
}

/// Outcome of a successful selection
///
/// `total_selected_value_sats` always equals the sum of the selected values and
/// covers target plus fee; `change_amount_sats` is either zero or at least the
/// dust threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selected_utxos: Vec<Utxo>,
    /// Fee including any sub-dust remainder folded into it
    pub total_fee_sats: u64,
    pub total_selected_value_sats: u64,
    pub change_amount_sats: u64,
}

impl SelectionResult {
    pub fn has_change(&self) -> bool {
        self.change_amount_sats >= DUST_THRESHOLD
    }

    /// Amount that reaches the recipient
    pub fn target_amount_sats(&self) -> u64 {
        self.total_selected_value_sats - self.total_fee_sats - self.change_amount_sats
    }
}

/// Errors related to UTXO selection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid target amount: {0} sats")]
    InvalidTarget(u64),

    #[error("Invalid fee rate: {0} sat/vB")]
    InvalidFeeRate(Decimal),
}

impl From<SelectionError> for SendError {
    fn from(error: SelectionError) -> Self {
        match error {
            SelectionError::InsufficientFunds {
                required,
                available,
            } => SendError::insufficient_funds(required, available),
            other => SendError::Transaction(TransactionErrorKind::SelectionFailed(
                other.to_string(),
            )),
        }
    }
}
