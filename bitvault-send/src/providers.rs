//! External collaborators of the send engine
//!
//! The engine never talks to a block explorer, a key store or a UI directly.
//! Each of those sits behind one of the traits below and is injected into the
//! [`SendOrchestrator`](crate::orchestrator::SendOrchestrator).
//!
//! # Security Considerations
//!
//! - [`KeyMaterialProvider`] is the only path by which secrets enter the engine,
//!   and it is only called during the signing stage
//! - [`XpubAddressDeriver`] works from an account-level extended public key, so
//!   public keys can be attached to UTXOs without touching private key material

use crate::error::{NetworkErrorKind, SecurityErrorKind, SendError};
use crate::types::{AddressType, SensitiveString};
use async_trait::async_trait;
use bdk::keys::bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey, ExtendedPubKey};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Errors reported by collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Request timed out")]
    Timeout,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Wallet is locked")]
    WalletLocked,

    #[error("Key material unavailable")]
    KeyMaterialUnavailable,

    #[error("Derivation failed: {0}")]
    Derivation(String),
}

impl ProviderError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Unavailable(_))
    }
}

impl From<ProviderError> for SendError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Timeout => SendError::Network(NetworkErrorKind::Timeout {
                operation: "Provider request".to_string(),
            }),
            ProviderError::Unavailable(msg) | ProviderError::Rejected(msg) => {
                SendError::Network(NetworkErrorKind::ServiceUnavailable(msg))
            }
            ProviderError::WalletLocked => SendError::Security(SecurityErrorKind::WalletLocked),
            ProviderError::KeyMaterialUnavailable | ProviderError::Derivation(_) => {
                SendError::Security(SecurityErrorKind::KeyMaterialUnavailable)
            }
        }
    }
}

/// Confirmation status of a raw UTXO as reported by the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
    #[serde(default)]
    pub block_time: Option<u64>,
}

/// A UTXO exactly as the UTXO source returns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUtxo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    pub status: UtxoStatus,
}

/// Source of unspent outputs per address
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    async fn get_utxos(&self, address: &str) -> Result<Vec<RawUtxo>, ProviderError>;
}

/// Source of raw fee estimates keyed by confirmation target (blocks → sat/vB)
#[async_trait]
pub trait FeeRateProvider: Send + Sync {
    async fn get_fee_estimates(&self) -> Result<HashMap<u32, f64>, ProviderError>;
}

/// Network sink for signed transactions
#[async_trait]
pub trait BroadcastProvider: Send + Sync {
    /// Submit a raw transaction, returning the txid reported by the network
    async fn submit(&self, raw_tx_hex: &str) -> Result<String, ProviderError>;
}

/// Source of the wallet's BIP-39 seed phrase
#[async_trait]
pub trait KeyMaterialProvider: Send + Sync {
    async fn seed_phrase(&self) -> Result<SensitiveString, ProviderError>;
}

/// Maps derivation paths to public keys and addresses
pub trait AddressDeriver: Send + Sync {
    fn public_key_for(&self, derivation_path: &str) -> Result<PublicKey, ProviderError>;

    fn address_for(&self, derivation_path: &str) -> Result<Address, ProviderError>;
}

/// Derives addresses below one BIP44/49/84 account from its extended public key
///
/// Paths handed to this deriver must be full paths starting with the account
/// prefix, e.g. `m/84'/1'/0'/0/5`; the prefix is stripped and the remaining
/// unhardened steps are derived from the xpub.
pub struct XpubAddressDeriver {
    account_xpub: ExtendedPubKey,
    account_path: DerivationPath,
    address_type: AddressType,
    network: Network,
}

impl XpubAddressDeriver {
    pub fn new(
        account_xpub: ExtendedPubKey,
        account_path: DerivationPath,
        network: Network,
    ) -> Result<Self, ProviderError> {
        let address_type = purpose_of(&account_path)
            .and_then(AddressType::from_purpose)
            .ok_or_else(|| {
                ProviderError::Derivation(format!("Unsupported account path {}", account_path))
            })?;

        Ok(Self {
            account_xpub,
            account_path,
            address_type,
            network,
        })
    }

    /// Build a deriver for `m/{purpose}'/{coin}'/{account}'` from a mnemonic
    ///
    /// Only the account xpub is kept; the master private key is dropped before
    /// this returns.
    pub fn from_mnemonic(
        phrase: &SensitiveString,
        address_type: AddressType,
        network: Network,
        account: u32,
    ) -> Result<Self, ProviderError> {
        let mnemonic = Mnemonic::parse(phrase.expose_secret())
            .map_err(|e| ProviderError::Derivation(format!("Invalid mnemonic: {}", e)))?;
        let seed = crate::types::SensitiveBytes::new(mnemonic.to_seed("").to_vec());

        let secp = Secp256k1::new();
        let master = ExtendedPrivKey::new_master(network, seed.expose_secret())
            .map_err(|e| ProviderError::Derivation(e.to_string()))?;

        let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
        let account_path = DerivationPath::from_str(&format!(
            "m/{}'/{}'/{}'",
            address_type.purpose(),
            coin_type,
            account
        ))
        .map_err(|e| ProviderError::Derivation(e.to_string()))?;

        let account_xprv = master
            .derive_priv(&secp, &account_path)
            .map_err(|e| ProviderError::Derivation(e.to_string()))?;
        let account_xpub = ExtendedPubKey::from_priv(&secp, &account_xprv);

        Self::new(account_xpub, account_path, network)
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Full derivation path of the address at `index` on the external or change chain
    pub fn path_for(&self, change: bool, index: u32) -> String {
        format!(
            "{}/{}/{}",
            self.account_path,
            if change { 1 } else { 0 },
            index
        )
    }

    fn relative_steps(&self, derivation_path: &str) -> Result<Vec<ChildNumber>, ProviderError> {
        let full = DerivationPath::from_str(derivation_path)
            .map_err(|e| ProviderError::Derivation(format!("{}: {}", derivation_path, e)))?;
        let prefix: &[ChildNumber] = self.account_path.as_ref();
        let steps: &[ChildNumber] = full.as_ref();

        if !steps.starts_with(prefix) {
            return Err(ProviderError::Derivation(format!(
                "{} is outside account {}",
                derivation_path, self.account_path
            )));
        }
        Ok(steps[prefix.len()..].to_vec())
    }
}

impl AddressDeriver for XpubAddressDeriver {
    fn public_key_for(&self, derivation_path: &str) -> Result<PublicKey, ProviderError> {
        let steps = self.relative_steps(derivation_path)?;
        let secp = Secp256k1::verification_only();
        let child = self
            .account_xpub
            .derive_pub(&secp, &steps)
            .map_err(|e| ProviderError::Derivation(e.to_string()))?;
        Ok(PublicKey::new(child.public_key))
    }

    fn address_for(&self, derivation_path: &str) -> Result<Address, ProviderError> {
        let public_key = self.public_key_for(derivation_path)?;
        address_for_key(&public_key, self.address_type, self.network)
            .map_err(|e| ProviderError::Derivation(e.to_string()))
    }
}

/// Address of the given type paying to `public_key`
pub fn address_for_key(
    public_key: &PublicKey,
    address_type: AddressType,
    network: Network,
) -> Result<Address, bitcoin::address::Error> {
    match address_type {
        AddressType::Legacy => Ok(Address::p2pkh(public_key, network)),
        AddressType::Segwit => Address::p2shwpkh(public_key, network),
        AddressType::NativeSegwit => Address::p2wpkh(public_key, network),
    }
}

/// Purpose number of a path like `m/84'/...`
pub(crate) fn purpose_of(path: &DerivationPath) -> Option<u32> {
    match path.as_ref().first()? {
        ChildNumber::Hardened { index } => Some(*index),
        ChildNumber::Normal { .. } => None,
    }
}
