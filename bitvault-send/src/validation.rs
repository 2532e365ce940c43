//! Input validation for the send pipeline
//!
//! # Security Model
//!
//! Every address the engine pays to or spends from is re-validated here against
//! the configured network, even when it came from the wallet's own derivation
//! collaborator. Validation happens before any network call is made.
//!
//! ## Security Considerations
//!
//! - All address validation must verify the correct network type
//! - Amount validation enforces bounds to prevent overflow and dust outputs
//! - Validation errors describe the problem without echoing full addresses into logs

use crate::error::AddressValidationError;
use crate::math::is_dust;
use crate::types::{AddressType, DUST_THRESHOLD, MAX_BITCOIN_SUPPLY};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, AddressType as ScriptKind, Network};
use std::str::FromStr;

/// Validate a Bitcoin address string for the given network
///
/// Test networks share address encodings, so a testnet address is accepted by
/// a signet wallet and vice versa.
///
/// # Arguments
/// * `address` - The address string to validate
/// * `network` - The network the wallet operates on
///
/// # Returns
/// * `Ok(Address)` - The parsed, network-checked address
/// * `Err(AddressValidationError)` - If the address is malformed or for another network
pub fn validate_address(address: &str, network: Network) -> Result<Address, AddressValidationError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AddressValidationError::InvalidFormat(
            "address is empty".to_string(),
        ));
    }

    let unchecked = Address::<NetworkUnchecked>::from_str(trimmed)
        .map_err(|e| AddressValidationError::InvalidFormat(e.to_string()))?;

    if !unchecked.is_valid_for_network(network) {
        return Err(AddressValidationError::WrongNetwork {
            expected: network,
            actual: unchecked.network,
        });
    }

    Ok(unchecked.assume_checked())
}

/// Determine which wallet address type an address belongs to
///
/// P2SH is reported as wrapped segwit, which is the only P2SH form this
/// wallet derives. Returns `None` for script types the wallet cannot spend
/// from (P2WSH, taproot).
pub fn detect_address_type(address: &Address) -> Option<AddressType> {
    match address.address_type()? {
        ScriptKind::P2pkh => Some(AddressType::Legacy),
        ScriptKind::P2sh => Some(AddressType::Segwit),
        ScriptKind::P2wpkh => Some(AddressType::NativeSegwit),
        _ => None,
    }
}

/// Validate a payment amount in satoshis
pub fn validate_amount(amount_sats: u64) -> Result<(), AddressValidationError> {
    if amount_sats == 0 {
        return Err(AddressValidationError::InvalidAmount(
            "amount must be greater than zero".to_string(),
        ));
    }

    if is_dust(amount_sats) {
        return Err(AddressValidationError::InvalidAmount(format!(
            "{} sats is below the dust threshold of {} sats",
            amount_sats, DUST_THRESHOLD
        )));
    }

    if amount_sats > MAX_BITCOIN_SUPPLY {
        return Err(AddressValidationError::InvalidAmount(
            "amount exceeds the maximum bitcoin supply".to_string(),
        ));
    }

    Ok(())
}

/// Reject payments to one of the wallet's own addresses
pub fn check_not_self_send(
    recipient: &Address,
    own_addresses: &[String],
) -> Result<(), AddressValidationError> {
    let recipient = recipient.to_string();
    if own_addresses.iter().any(|own| own.trim() == recipient) {
        return Err(AddressValidationError::SelfSend);
    }
    Ok(())
}
