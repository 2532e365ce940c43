//! Size and fee arithmetic shared by selection and building
//!
//! Selection and building must agree on how a transaction is sized, otherwise
//! the fee paid would drift from the fee the user was shown. Both go through
//! the functions here.
//!
//! Example:
//! ```
//! use bitvault_send::math::{calculate_fee, estimate_vsize};
//! use bitvault_send::types::AddressType;
//! use rust_decimal_macros::dec;
//!
//! // One native segwit input, recipient + change
//! let size = estimate_vsize(&[AddressType::NativeSegwit], 2);
//! assert_eq!(size, 140);
//! assert_eq!(calculate_fee(size, dec!(1.5)), 210);
//! ```

use crate::types::{AddressType, DUST_THRESHOLD};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Fixed transaction overhead (version, locktime, counts, segwit marker)
pub const TX_BASE_VBYTES: u64 = 10;

/// Size of one P2WPKH-style output
pub const OUTPUT_VBYTES: u64 = 31;

/// Determines if an amount is considered "dust" (too small to be economically viable)
///
/// Exactly `DUST_THRESHOLD` sats is spendable; anything below is dust.
pub fn is_dust(amount_sats: u64) -> bool {
    amount_sats < DUST_THRESHOLD
}

/// Estimated virtual size of a transaction spending `inputs` and creating `output_count` outputs
pub fn estimate_vsize(inputs: &[AddressType], output_count: usize) -> u64 {
    let input_vbytes: u64 = inputs.iter().map(AddressType::input_vbytes).sum();
    TX_BASE_VBYTES + input_vbytes + OUTPUT_VBYTES * output_count as u64
}

/// Calculates the fee for a transaction based on size and fee rate
///
/// # Arguments
/// * `size_vbytes` - Estimated transaction size in vbytes
/// * `fee_rate` - Fee rate in satoshis per vbyte
///
/// # Returns
/// * Total fee in satoshis, rounded up
pub fn calculate_fee(size_vbytes: u64, fee_rate: Decimal) -> u64 {
    (fee_rate * Decimal::from(size_vbytes))
        .ceil()
        .to_u64()
        .unwrap_or(u64::MAX)
}

/// Fee expressed as a percentage of the amount being sent
pub fn fee_percentage(fee_sats: u64, amount_sats: u64) -> Decimal {
    if amount_sats == 0 {
        return Decimal::from(100);
    }
    Decimal::from(fee_sats) * Decimal::from(100) / Decimal::from(amount_sats)
}

/// Effective fee rate of a transaction
pub fn effective_fee_rate(fee_sats: u64, size_vbytes: u64) -> Decimal {
    if size_vbytes == 0 {
        return Decimal::ZERO;
    }
    Decimal::from(fee_sats) / Decimal::from(size_vbytes)
}
