//! Transaction signing and finalization
//!
//! Signing runs in two passes over the unsigned template:
//!
//! 1. **Sign**: for every input, derive the child key from the seed using the
//!    input's recorded derivation path and sign that input's sighash
//! 2. **Finalize**: for every input, check that the derived key is the key the
//!    input was built for, that the signature verifies, and that the key commits
//!    to the spent script; then assemble the witness or script sig
//!
//! A failure in either pass aborts the whole operation. The serialized
//! transaction and its txid are only produced once every input has been finalized.
//!
//! # Security Considerations
//!
//! - The seed lives in a [`SensitiveBytes`] for the duration of `sign` and is zeroed on return
//! - Derived private keys never leave this module and are dropped before `sign` returns
//! - Nothing derived from key material is logged

use crate::builder::{LockingScript, UnsignedTransaction};
use crate::error::{SecurityErrorKind, SendError, TransactionErrorKind};
use crate::logging::{log_security, log_transaction, LogLevel};
use crate::types::{SensitiveBytes, SensitiveString};
use bdk::keys::bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, ExtendedPrivKey};
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Network, PublicKey, ScriptBuf, Transaction, Witness};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroize;

/// Errors raised while signing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("Seed phrase is not a valid BIP-39 mnemonic")]
    InvalidMnemonic,

    #[error("Transaction was built for {built}, signer asked to sign for {requested}")]
    NetworkMismatch { built: Network, requested: Network },

    #[error("Input {input} has no usable derivation path: {path}")]
    InvalidDerivationPath { input: usize, path: String },

    #[error("Key derivation failed for input {input}: {reason}")]
    KeyDerivation { input: usize, reason: String },

    #[error("Could not compute sighash for input {input}: {reason}")]
    Sighash { input: usize, reason: String },

    #[error("Finalize failed for input {input}: {reason}")]
    FinalizeFailed { input: usize, reason: String },

    #[error("Signed transaction does not match the built transaction: {0}")]
    VerificationFailed(String),
}

impl From<SignError> for SendError {
    fn from(error: SignError) -> Self {
        match error {
            SignError::InvalidMnemonic => {
                SendError::Security(SecurityErrorKind::KeyMaterialUnavailable)
            }
            other => SendError::Transaction(TransactionErrorKind::SigningFailed(other.to_string())),
        }
    }
}

/// A fully signed transaction in canonical serialized form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedTransaction {
    pub hex: String,
    pub txid: String,
    pub vsize: usize,
    pub weight: u64,
}

impl SignedTransaction {
    /// Check that the serialized transaction still matches the template it came from
    ///
    /// Compares input outpoints, output scripts and values, and therefore the
    /// total output value (input value minus fee).
    pub fn verify_against(&self, unsigned: &UnsignedTransaction) -> Result<(), SignError> {
        let bytes = hex::decode(&self.hex)
            .map_err(|e| SignError::VerificationFailed(format!("hex: {}", e)))?;
        let tx: Transaction = deserialize(&bytes)
            .map_err(|e| SignError::VerificationFailed(format!("decode: {}", e)))?;

        if tx.input.len() != unsigned.inputs.len() {
            return Err(SignError::VerificationFailed(format!(
                "{} inputs, expected {}",
                tx.input.len(),
                unsigned.inputs.len()
            )));
        }
        if tx.output.len() != unsigned.outputs.len() {
            return Err(SignError::VerificationFailed(format!(
                "{} outputs, expected {}",
                tx.output.len(),
                unsigned.outputs.len()
            )));
        }
        for (i, (txin, expected)) in tx.input.iter().zip(&unsigned.inputs).enumerate() {
            if txin.previous_output != expected.outpoint {
                return Err(SignError::VerificationFailed(format!(
                    "input {} spends a different outpoint",
                    i
                )));
            }
        }
        for (i, (txout, expected)) in tx.output.iter().zip(&unsigned.outputs).enumerate() {
            if txout.value != expected.value_sats || txout.script_pubkey != expected.script_pubkey {
                return Err(SignError::VerificationFailed(format!("output {} differs", i)));
            }
        }

        let total_out: u64 = tx.output.iter().map(|o| o.value).sum();
        if total_out != unsigned.total_input_sats() - unsigned.fee_sats() {
            return Err(SignError::VerificationFailed(
                "total output value differs".to_string(),
            ));
        }
        if tx.txid().to_string() != self.txid {
            return Err(SignError::VerificationFailed("txid differs".to_string()));
        }
        Ok(())
    }
}

/// Signature produced in the first pass, waiting to be finalized
struct PendingSignature {
    derived_key: PublicKey,
    message: Message,
    signature: EcdsaSignature,
}

/// Signs unsigned transactions with keys derived from a BIP-39 seed
pub struct Signer {
    secp: Secp256k1<All>,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Sign every input and serialize the transaction
    ///
    /// Either every input is signed and finalized, or an error is returned and
    /// no transaction is produced.
    pub fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        seed_phrase: &SensitiveString,
        network: Network,
    ) -> Result<SignedTransaction, SignError> {
        if unsigned.network != network {
            return Err(SignError::NetworkMismatch {
                built: unsigned.network,
                requested: network,
            });
        }

        let seed = seed_from_phrase(seed_phrase)?;
        let master = ExtendedPrivKey::new_master(network, seed.expose_secret()).map_err(|e| {
            SignError::KeyDerivation {
                input: 0,
                reason: e.to_string(),
            }
        })?;

        let pending = self.sign_inputs(unsigned, &master)?;
        drop(master);
        drop(seed);

        let tx = self.finalize_inputs(unsigned, pending)?;

        let signed = SignedTransaction {
            hex: serialize_hex(&tx),
            txid: tx.txid().to_string(),
            vsize: tx.vsize(),
            weight: tx.weight().to_wu(),
        };

        log_transaction(
            LogLevel::Info,
            "transaction_signed",
            Some(json!({
                "txid": signed.txid,
                "inputs": unsigned.inputs.len(),
                "vsize": signed.vsize,
            })),
        );

        Ok(signed)
    }

    fn sign_inputs(
        &self,
        unsigned: &UnsignedTransaction,
        master: &ExtendedPrivKey,
    ) -> Result<Vec<PendingSignature>, SignError> {
        let mut cache = SighashCache::new(&unsigned.tx);
        let mut pending = Vec::with_capacity(unsigned.inputs.len());

        for (index, input) in unsigned.inputs.iter().enumerate() {
            let path = DerivationPath::from_str(&input.derivation_path).map_err(|_| {
                SignError::InvalidDerivationPath {
                    input: index,
                    path: input.derivation_path.clone(),
                }
            })?;

            let private_key = master
                .derive_priv(&self.secp, &path)
                .map_err(|e| SignError::KeyDerivation {
                    input: index,
                    reason: e.to_string(),
                })?
                .to_priv();
            let derived_key = private_key.public_key(&self.secp);

            let message = match input.locking_script {
                LockingScript::P2pkh => {
                    let sighash = cache
                        .legacy_signature_hash(
                            index,
                            &input.script_pubkey,
                            EcdsaSighashType::All.to_u32(),
                        )
                        .map_err(|e| SignError::Sighash {
                            input: index,
                            reason: e.to_string(),
                        })?;
                    Message::from(sighash)
                }
                LockingScript::P2wpkh | LockingScript::P2shP2wpkh => {
                    // BIP143 script code for P2WPKH is the P2PKH script of the key hash
                    let script_code = ScriptBuf::new_p2pkh(&derived_key.pubkey_hash());
                    let sighash = cache
                        .segwit_signature_hash(
                            index,
                            &script_code,
                            input.utxo.value_sats,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| SignError::Sighash {
                            input: index,
                            reason: e.to_string(),
                        })?;
                    Message::from(sighash)
                }
            };

            let signature = EcdsaSignature::sighash_all(
                self.secp.sign_ecdsa(&message, &private_key.inner),
            );

            pending.push(PendingSignature {
                derived_key,
                message,
                signature,
            });
        }

        Ok(pending)
    }

    fn finalize_inputs(
        &self,
        unsigned: &UnsignedTransaction,
        pending: Vec<PendingSignature>,
    ) -> Result<Transaction, SignError> {
        let mut tx = unsigned.tx.clone();

        for (index, (input, signed)) in unsigned.inputs.iter().zip(pending).enumerate() {
            let fail = |reason: &str| SignError::FinalizeFailed {
                input: index,
                reason: reason.to_string(),
            };

            if signed.derived_key != input.public_key {
                log_security(
                    LogLevel::Error,
                    "derived_key_mismatch",
                    Some(json!({ "input": index })),
                );
                return Err(fail("derived key does not match the input's public key"));
            }

            self.secp
                .verify_ecdsa(&signed.message, &signed.signature.sig, &input.public_key.inner)
                .map_err(|_| fail("signature does not verify"))?;

            let committed = match input.locking_script {
                LockingScript::P2pkh => ScriptBuf::new_p2pkh(&input.public_key.pubkey_hash()),
                LockingScript::P2wpkh => ScriptBuf::new_v0_p2wpkh(
                    &input
                        .public_key
                        .wpubkey_hash()
                        .ok_or_else(|| fail("uncompressed key in segwit input"))?,
                ),
                LockingScript::P2shP2wpkh => {
                    let redeem = redeem_script(&input.public_key)
                        .ok_or_else(|| fail("uncompressed key in segwit input"))?;
                    ScriptBuf::new_p2sh(&redeem.script_hash())
                }
            };
            if committed != input.script_pubkey {
                return Err(fail("public key does not commit to the spent script"));
            }

            let signature_bytes = signed.signature.to_vec();
            let txin = &mut tx.input[index];
            match input.locking_script {
                LockingScript::P2pkh => {
                    let sig_push = PushBytesBuf::try_from(signature_bytes)
                        .map_err(|_| fail("signature push too large"))?;
                    txin.script_sig = Builder::new()
                        .push_slice(sig_push)
                        .push_key(&input.public_key)
                        .into_script();
                }
                LockingScript::P2wpkh => {
                    txin.witness = p2wpkh_witness(signature_bytes, &input.public_key);
                }
                LockingScript::P2shP2wpkh => {
                    let redeem = redeem_script(&input.public_key)
                        .ok_or_else(|| fail("uncompressed key in segwit input"))?;
                    let redeem_push = PushBytesBuf::try_from(redeem.to_bytes())
                        .map_err(|_| fail("redeem script push too large"))?;
                    txin.script_sig = Builder::new().push_slice(redeem_push).into_script();
                    txin.witness = p2wpkh_witness(signature_bytes, &input.public_key);
                }
            }
        }

        Ok(tx)
    }
}

fn seed_from_phrase(seed_phrase: &SensitiveString) -> Result<SensitiveBytes, SignError> {
    let mnemonic =
        Mnemonic::parse(seed_phrase.expose_secret()).map_err(|_| SignError::InvalidMnemonic)?;
    let mut raw = mnemonic.to_seed("");
    let seed = SensitiveBytes::new(raw.to_vec());
    raw.zeroize();
    Ok(seed)
}

fn redeem_script(public_key: &PublicKey) -> Option<ScriptBuf> {
    public_key
        .wpubkey_hash()
        .map(|hash| ScriptBuf::new_v0_p2wpkh(&hash))
}

fn p2wpkh_witness(signature_bytes: Vec<u8>, public_key: &PublicKey) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature_bytes);
    witness.push(public_key.to_bytes());
    witness
}
