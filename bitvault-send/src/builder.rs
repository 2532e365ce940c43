//! Unsigned transaction assembly
//!
//! The builder turns selected UTXOs and requested payments into an unsigned
//! transaction template. It does not trust the selection-time fee: the size and
//! fee are recomputed for the exact inputs and outputs being assembled, and the
//! fee reported in [`FeeDetails`] is always the fee the transaction really pays.
//!
//! # Security Considerations
//!
//! - Every address (inputs, recipients, change) is re-validated against the network
//! - Each input must carry the derivation path and public key the signer needs;
//!   the public key must actually control the UTXO's address
//! - No private key material is involved in building

use crate::error::{AddressValidationError, SendError, TransactionErrorKind};
use crate::logging::{log_transaction, LogLevel};
use crate::math::{calculate_fee, effective_fee_rate, estimate_vsize, is_dust};
use crate::providers::address_for_key;
use crate::types::{AddressType, TransactionOutput, Utxo, DUST_THRESHOLD, MAX_FEE_RATE};
use crate::validation::{detect_address_type, validate_address};
use bitcoin::absolute::LockTime;
use bitcoin::{
    Network, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// Transaction version used for every send
pub const TX_VERSION: i32 = 2;

/// Errors raised while assembling a transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("No inputs to spend")]
    NoInputs,

    #[error("No outputs requested")]
    NoOutputs,

    #[error("Invalid fee rate: {0} sat/vB")]
    InvalidFeeRate(Decimal),

    #[error("Input {0} has no derivation path")]
    MissingDerivationPath(String),

    #[error("Input {0} has no public key")]
    MissingPublicKey(String),

    #[error("Public key for input {0} does not control its address")]
    KeyMismatch(String),

    #[error("Invalid txid for input {0}")]
    InvalidTxid(String),

    #[error("Input {0} is spent twice")]
    DuplicateInput(String),

    #[error("Unsupported input address type for {0}")]
    UnsupportedInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressValidationError),

    #[error("Output of {value} sats is below the dust threshold of {threshold} sats")]
    DustOutput { value: u64, threshold: u64 },

    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Amount overflow")]
    Overflow,
}

impl From<BuildError> for SendError {
    fn from(error: BuildError) -> Self {
        match error {
            BuildError::InvalidAddress(e) => SendError::AddressValidation(e),
            BuildError::InsufficientFunds {
                required,
                available,
            } => SendError::insufficient_funds(required, available),
            other => SendError::Transaction(TransactionErrorKind::BuildFailed(other.to_string())),
        }
    }
}

/// How an input's output script locks its funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingScript {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl From<AddressType> for LockingScript {
    fn from(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Legacy => LockingScript::P2pkh,
            AddressType::Segwit => LockingScript::P2shP2wpkh,
            AddressType::NativeSegwit => LockingScript::P2wpkh,
        }
    }
}

impl LockingScript {
    pub fn is_segwit(&self) -> bool {
        !matches!(self, LockingScript::P2pkh)
    }
}

/// An input bound to the UTXO it spends and everything needed to sign it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedInput {
    pub utxo: Utxo,
    pub outpoint: OutPoint,
    pub derivation_path: String,
    pub public_key: PublicKey,
    pub script_pubkey: ScriptBuf,
    pub locking_script: LockingScript,
}

/// An output of the unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedOutput {
    pub address: String,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
    pub is_change: bool,
}

/// Transaction template awaiting signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub inputs: Vec<UnsignedInput>,
    pub outputs: Vec<UnsignedOutput>,
    /// Fee rate the transaction was sized for
    pub fee_rate: Decimal,
    pub network: Network,
    /// Template with empty script sigs and witnesses, in input/output order
    pub tx: Transaction,
}

impl UnsignedTransaction {
    pub fn total_input_sats(&self) -> u64 {
        self.inputs.iter().map(|i| i.utxo.value_sats).sum()
    }

    pub fn total_output_sats(&self) -> u64 {
        self.outputs.iter().map(|o| o.value_sats).sum()
    }

    pub fn fee_sats(&self) -> u64 {
        self.total_input_sats() - self.total_output_sats()
    }

    pub fn change_output(&self) -> Option<&UnsignedOutput> {
        self.outputs.iter().find(|o| o.is_change)
    }
}

/// Fee accounting for a built transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeDetails {
    /// Fee actually paid (inputs minus outputs)
    pub fee_sats: u64,
    /// Fee computed from the size model for the final shape
    pub estimated_fee_sats: u64,
    /// Sub-dust remainder absorbed into the fee
    pub dust_folded_sats: u64,
    pub fee_rate: Decimal,
    pub effective_fee_rate: Decimal,
    pub estimated_vsize: u64,
    pub total_input_sats: u64,
    pub total_output_sats: u64,
    pub change_sats: u64,
}

/// Assembles unsigned transactions
#[derive(Debug, Default, Clone)]
pub struct TransactionBuilder;

impl TransactionBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build an unsigned transaction
    ///
    /// # Arguments
    ///
    /// * `utxos` - Inputs to spend, each with derivation path and public key attached
    /// * `outputs` - Payments, in order
    /// * `fee_rate` - Fee rate in sat/vB
    /// * `change_address` - Where any remainder of at least the dust threshold goes
    /// * `network` - Network every address must belong to
    pub fn build(
        &self,
        utxos: &[Utxo],
        outputs: &[TransactionOutput],
        fee_rate: Decimal,
        change_address: &str,
        network: Network,
    ) -> Result<(UnsignedTransaction, FeeDetails), BuildError> {
        if utxos.is_empty() {
            return Err(BuildError::NoInputs);
        }
        if outputs.is_empty() {
            return Err(BuildError::NoOutputs);
        }
        if fee_rate <= Decimal::ZERO || fee_rate > Decimal::from(MAX_FEE_RATE) {
            return Err(BuildError::InvalidFeeRate(fee_rate));
        }

        let inputs = prepare_inputs(utxos, network)?;
        let mut tx_outputs = prepare_outputs(outputs, network)?;
        let change = validate_address(change_address, network)?;

        let total_input_sats = inputs
            .iter()
            .try_fold(0u64, |acc, i| acc.checked_add(i.utxo.value_sats))
            .ok_or(BuildError::Overflow)?;
        let total_requested_sats = tx_outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value_sats))
            .ok_or(BuildError::Overflow)?;

        let input_types: Vec<AddressType> = inputs.iter().map(|i| i.utxo.address_type).collect();

        let size_without_change = estimate_vsize(&input_types, tx_outputs.len());
        let fee_without_change = calculate_fee(size_without_change, fee_rate);
        let required = total_requested_sats
            .checked_add(fee_without_change)
            .ok_or(BuildError::Overflow)?;
        if total_input_sats < required {
            return Err(BuildError::InsufficientFunds {
                required,
                available: total_input_sats,
            });
        }

        let size_with_change = estimate_vsize(&input_types, tx_outputs.len() + 1);
        let fee_with_change = calculate_fee(size_with_change, fee_rate);
        let change_sats = total_input_sats
            .checked_sub(total_requested_sats)
            .and_then(|rest| rest.checked_sub(fee_with_change))
            .filter(|rest| !is_dust(*rest));

        let (estimated_vsize, estimated_fee_sats) = match change_sats {
            Some(value) => {
                tx_outputs.push(UnsignedOutput {
                    address: change.to_string(),
                    value_sats: value,
                    script_pubkey: change.script_pubkey(),
                    is_change: true,
                });
                (size_with_change, fee_with_change)
            }
            None => (size_without_change, fee_without_change),
        };

        let total_output_sats: u64 = tx_outputs.iter().map(|o| o.value_sats).sum();
        let fee_sats = total_input_sats - total_output_sats;

        let tx = Transaction {
            version: TX_VERSION,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|i| TxIn {
                    previous_output: i.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: tx_outputs
                .iter()
                .map(|o| TxOut {
                    value: o.value_sats,
                    script_pubkey: o.script_pubkey.clone(),
                })
                .collect(),
        };

        let details = FeeDetails {
            fee_sats,
            estimated_fee_sats,
            dust_folded_sats: fee_sats - estimated_fee_sats,
            fee_rate,
            effective_fee_rate: effective_fee_rate(fee_sats, estimated_vsize),
            estimated_vsize,
            total_input_sats,
            total_output_sats,
            change_sats: change_sats.unwrap_or(0),
        };

        log_transaction(
            LogLevel::Info,
            "transaction_built",
            Some(json!({
                "inputs": inputs.len(),
                "outputs": tx_outputs.len(),
                "fee_sats": details.fee_sats,
                "dust_folded_sats": details.dust_folded_sats,
                "vsize": estimated_vsize,
            })),
        );

        Ok((
            UnsignedTransaction {
                inputs,
                outputs: tx_outputs,
                fee_rate,
                network,
                tx,
            },
            details,
        ))
    }
}

fn prepare_inputs(utxos: &[Utxo], network: Network) -> Result<Vec<UnsignedInput>, BuildError> {
    let mut seen = HashSet::new();
    let mut inputs = Vec::with_capacity(utxos.len());

    for utxo in utxos {
        let id = utxo.outpoint_string();

        let txid = Txid::from_str(&utxo.txid).map_err(|_| BuildError::InvalidTxid(id.clone()))?;
        let outpoint = OutPoint::new(txid, utxo.output_index);
        if !seen.insert(outpoint) {
            return Err(BuildError::DuplicateInput(id));
        }

        let derivation_path = utxo
            .derivation_path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| BuildError::MissingDerivationPath(id.clone()))?;
        let public_key = utxo
            .public_key
            .ok_or_else(|| BuildError::MissingPublicKey(id.clone()))?;

        let address = validate_address(&utxo.address, network)?;
        if detect_address_type(&address) != Some(utxo.address_type) {
            return Err(BuildError::UnsupportedInput(id));
        }

        let expected = address_for_key(&public_key, utxo.address_type, network)
            .map_err(|_| BuildError::KeyMismatch(id.clone()))?;
        if expected.script_pubkey() != address.script_pubkey() {
            return Err(BuildError::KeyMismatch(id));
        }

        inputs.push(UnsignedInput {
            utxo: utxo.clone(),
            outpoint,
            derivation_path,
            public_key,
            script_pubkey: address.script_pubkey(),
            locking_script: utxo.address_type.into(),
        });
    }

    Ok(inputs)
}

fn prepare_outputs(
    outputs: &[TransactionOutput],
    network: Network,
) -> Result<Vec<UnsignedOutput>, BuildError> {
    outputs
        .iter()
        .map(|output| {
            let address = validate_address(&output.address, network)?;
            if is_dust(output.value_sats) {
                return Err(BuildError::DustOutput {
                    value: output.value_sats,
                    threshold: DUST_THRESHOLD,
                });
            }
            Ok(UnsignedOutput {
                address: address.to_string(),
                value_sats: output.value_sats,
                script_pubkey: address.script_pubkey(),
                is_change: false,
            })
        })
        .collect()
}
