//! Submits signed transactions to the network
//!
//! The hex is checked locally before anything leaves the process, so a
//! malformed transaction fails fast with a build error instead of a remote
//! rejection. Remote rejections keep the node's message verbatim, since it is
//! usually the only useful diagnostic (`bad-txns-inputs-missingorspent`, ...).

use crate::error::{NetworkErrorKind, SendError, TransactionErrorKind};
use crate::logging::sanitize_for_logging;
use crate::providers::{BroadcastProvider, ProviderError};
use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Number of leading hex characters attached to broadcast diagnostics
pub const HEX_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Transaction hex is empty")]
    EmptyHex,

    #[error("Transaction hex has odd length {0}")]
    OddLength(usize),

    #[error("Transaction hex contains non-hex characters")]
    InvalidHex,

    #[error("Transaction does not decode: {0}")]
    Malformed(String),

    #[error("Transaction has no inputs")]
    NoInputs,

    #[error("Transaction has no outputs")]
    NoOutputs,

    #[error("Broadcast timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broadcast service unavailable: {message}")]
    Unavailable {
        message: String,
        hex_length: usize,
        hex_prefix: String,
    },

    #[error("Transaction rejected: {message}")]
    Rejected {
        message: String,
        hex_length: usize,
        hex_prefix: String,
    },

    #[error("Network returned an invalid txid: {0}")]
    InvalidTxid(String),
}

impl From<BroadcastError> for SendError {
    fn from(error: BroadcastError) -> Self {
        match error {
            BroadcastError::Timeout(_) => SendError::Network(NetworkErrorKind::Timeout {
                operation: "Broadcast".to_string(),
            }),
            BroadcastError::Unavailable { message, .. } => {
                SendError::Network(NetworkErrorKind::ServiceUnavailable(message))
            }
            BroadcastError::Rejected {
                message,
                hex_length,
                hex_prefix,
            } => SendError::Network(NetworkErrorKind::BroadcastFailed {
                message,
                hex_length,
                hex_prefix,
            }),
            BroadcastError::InvalidTxid(txid) => {
                SendError::Network(NetworkErrorKind::BroadcastFailed {
                    message: format!("Network returned an invalid txid: {}", txid),
                    hex_length: 0,
                    hex_prefix: String::new(),
                })
            }
            other => SendError::Transaction(TransactionErrorKind::BuildFailed(other.to_string())),
        }
    }
}

/// Checks and submits raw transactions through a [`BroadcastProvider`]
pub struct Broadcaster {
    provider: Arc<dyn BroadcastProvider>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(provider: Arc<dyn BroadcastProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Decode `raw_tx_hex` and make sure it is a plausible transaction
    pub fn validate(raw_tx_hex: &str) -> Result<Transaction, BroadcastError> {
        if raw_tx_hex.is_empty() {
            return Err(BroadcastError::EmptyHex);
        }
        if raw_tx_hex.len() % 2 != 0 {
            return Err(BroadcastError::OddLength(raw_tx_hex.len()));
        }
        let bytes = hex::decode(raw_tx_hex).map_err(|_| BroadcastError::InvalidHex)?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|e| BroadcastError::Malformed(e.to_string()))?;

        if tx.input.is_empty() {
            return Err(BroadcastError::NoInputs);
        }
        if tx.output.is_empty() {
            return Err(BroadcastError::NoOutputs);
        }
        Ok(tx)
    }

    /// Submit `raw_tx_hex`, returning the txid the network reports
    pub async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, BroadcastError> {
        Self::validate(raw_tx_hex)?;

        let hex_length = raw_tx_hex.len();
        let hex_prefix = hex_prefix(raw_tx_hex);
        log::info!("Broadcasting transaction ({} hex chars)", hex_length);

        let submitted = tokio::time::timeout(self.timeout, self.provider.submit(raw_tx_hex)).await;

        let txid = match submitted {
            Err(_) => {
                log::warn!("Broadcast timed out after {:?}", self.timeout);
                return Err(BroadcastError::Timeout(self.timeout));
            }
            Ok(Err(ProviderError::Timeout)) => return Err(BroadcastError::Timeout(self.timeout)),
            Ok(Err(ProviderError::Rejected(message))) => {
                log::warn!("Broadcast rejected: {}", message);
                return Err(BroadcastError::Rejected {
                    message,
                    hex_length,
                    hex_prefix,
                });
            }
            Ok(Err(other)) => {
                log::warn!("Broadcast failed: {}", other);
                return Err(BroadcastError::Unavailable {
                    message: other.to_string(),
                    hex_length,
                    hex_prefix,
                });
            }
            Ok(Ok(txid)) => txid.trim().to_lowercase(),
        };

        if !is_txid(&txid) {
            return Err(BroadcastError::InvalidTxid(txid));
        }

        log::info!("Transaction accepted: {}", sanitize_for_logging(&txid));
        Ok(txid)
    }
}

fn hex_prefix(raw_tx_hex: &str) -> String {
    raw_tx_hex.chars().take(HEX_PREFIX_LEN).collect()
}

fn is_txid(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
