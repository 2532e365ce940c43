//! Common data types for the BitVault send engine
//!
//! These types describe the spendable outputs, payment outputs and secret
//! containers shared by every stage of the send pipeline.
//!
//! # Security Boundaries
//!
//! - `Utxo` and `TransactionOutput` carry only public data (addresses, public keys,
//!   derivation paths) and may be logged after sanitization
//! - Seed phrases and seeds only ever travel inside [`SensitiveString`] and
//!   [`SensitiveBytes`], which zero their memory on drop
//!
//! IMPORTANT: The public data types MUST NOT contain private keys, seeds, or other sensitive material.

use bitcoin::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

// Constants for Bitcoin-specific values

/// Constant for dust threshold (minimum output value)
pub const DUST_THRESHOLD: u64 = 546;

/// Constant for satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Constant for maximum Bitcoin supply in satoshis
pub const MAX_BITCOIN_SUPPLY: u64 = 21_000_000 * SATS_PER_BTC;

/// Highest fee rate (sat/vB) the engine will ever sign for
pub const MAX_FEE_RATE: u64 = 1000;

/// Highest acceptable economy-tier rate reported by a fee source
pub const MAX_ECONOMY_FEE_RATE: u64 = 100;

/// Economy tier is clamped to this rate
pub const ECONOMY_FEE_CAP: u64 = 2;

/// Script family of an address the wallet can spend from or pay to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Pay-to-pubkey-hash (BIP44)
    Legacy,
    /// P2WPKH nested in P2SH (BIP49)
    Segwit,
    /// Native P2WPKH (BIP84)
    NativeSegwit,
}

impl AddressType {
    /// Virtual size one input of this type adds to a transaction
    pub fn input_vbytes(&self) -> u64 {
        match self {
            AddressType::Legacy => 148,
            AddressType::Segwit => 91,
            AddressType::NativeSegwit => 68,
        }
    }

    /// Map a BIP purpose number (44/49/84) to the address type it derives
    pub fn from_purpose(purpose: u32) -> Option<Self> {
        match purpose {
            44 => Some(AddressType::Legacy),
            49 => Some(AddressType::Segwit),
            84 => Some(AddressType::NativeSegwit),
            _ => None,
        }
    }

    /// BIP purpose number for this address type
    pub fn purpose(&self) -> u32 {
        match self {
            AddressType::Legacy => 44,
            AddressType::Segwit => 49,
            AddressType::NativeSegwit => 84,
        }
    }
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::NativeSegwit
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Legacy => write!(f, "legacy"),
            AddressType::Segwit => write!(f, "segwit"),
            AddressType::NativeSegwit => write!(f, "native_segwit"),
        }
    }
}

/// A spendable output owned by the wallet
///
/// Immutable once fetched. `value_sats` is always greater than zero; the
/// fetch stage drops anything else before selection sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Id of the transaction that created this output
    pub txid: String,
    /// Output index within that transaction
    pub output_index: u32,
    /// Value in satoshis
    pub value_sats: u64,
    /// Whether the creating transaction is confirmed
    pub confirmed: bool,
    /// Address the output pays to
    pub address: String,
    /// Full derivation path of the key controlling this output (e.g. `m/84'/1'/0'/0/3`)
    pub derivation_path: Option<String>,
    /// Script family of `address`
    pub address_type: AddressType,
    /// Index of `address` within its chain
    pub address_index: u32,
    /// Height of the confirming block, if known
    #[serde(default)]
    pub block_height: Option<u32>,
    /// Public key for the derivation path, attached before building
    #[serde(default)]
    pub public_key: Option<PublicKey>,
}

impl Utxo {
    /// `txid:vout` form used in logs and error context
    pub fn outpoint_string(&self) -> String {
        format!("{}:{}", self.txid, self.output_index)
    }
}

/// A payment output requested by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: String,
    pub value_sats: u64,
}

impl TransactionOutput {
    pub fn new(address: impl Into<String>, value_sats: u64) -> Self {
        Self {
            address: address.into(),
            value_sats,
        }
    }
}

/// A string that contains sensitive data that should be zeroed when dropped
///
/// # Security
///
/// Seed phrases enter the engine wrapped in this type and never leave it.
/// The content is zeroed when the value is dropped and is never printed by
/// `Debug` or `Display`.
///
/// # Examples
///
/// ```
/// use bitvault_send::types::SensitiveString;
///
/// let phrase = SensitiveString::new("abandon abandon abandon");
/// assert_eq!(format!("{}", phrase), "[REDACTED]");
/// ```
#[derive(Zeroize)]
pub struct SensitiveString {
    inner: String,
}

impl SensitiveString {
    /// Create a new SensitiveString
    pub fn new(s: impl Into<String>) -> Self {
        Self { inner: s.into() }
    }

    /// Get a reference to the inner string
    ///
    /// # Security
    ///
    /// The returned reference must not be persisted or logged.
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    /// Length of the string in bytes; does not expose the content
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SensitiveString([REDACTED], length={})", self.len())
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SensitiveString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// Implement manual Drop for SensitiveString to ensure zeroization
impl Drop for SensitiveString {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// Byte array that contains sensitive data that should be zeroed when dropped
///
/// # Security
///
/// Holds the BIP-39 seed for the duration of the signing stage only.
#[derive(Zeroize)]
pub struct SensitiveBytes {
    inner: Vec<u8>,
}

impl SensitiveBytes {
    /// Create a new SensitiveBytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: bytes.into(),
        }
    }

    /// Get a reference to the inner bytes
    ///
    /// # Security
    ///
    /// The returned reference must not be persisted or logged.
    pub fn expose_secret(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Convert to a sanitized string suitable for logging
    pub fn to_sanitized_string(&self) -> String {
        if self.is_empty() {
            return "[empty]".to_string();
        }
        format!("[{} bytes]", self.len())
    }
}

impl std::fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SensitiveBytes([REDACTED], length={})", self.len())
    }
}

impl From<Vec<u8>> for SensitiveBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SensitiveBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

// Implement manual Drop for SensitiveBytes to ensure zeroization
impl Drop for SensitiveBytes {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}
