//! Standardized error handling for the BitVault send engine
//!
//! Every stage of the send pipeline reports failures through its own error type
//! (`SelectionError`, `BuildError`, `SignError`, ...). At the orchestrator boundary
//! those are converted into [`SendError`], a closed taxonomy that drives the
//! user-facing message and the retry policy.
//!
//! # Security Considerations
//!
//! - Error messages never include key material or seed phrases
//! - Security errors carry only the reason, never the secret that caused it
//! - `context()` returns data that is safe to log after sanitization
//!
//! # Usage
//!
//! ```
//! use bitvault_send::error::{SendError, TransactionErrorKind};
//!
//! let err = SendError::Transaction(TransactionErrorKind::SigningFailed("input 0".into()));
//! assert_eq!(err.code(), "TRANSACTION/SIGNING_FAILED");
//! assert!(!err.is_retryable());
//! ```

use bitcoin::Network;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// How serious an error (or a security check failure) is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Why an address was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressValidationError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Address belongs to {actual}, wallet is configured for {expected}")]
    WrongNetwork { expected: Network, actual: Network },

    #[error("Recipient is one of this wallet's own addresses")]
    SelfSend,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

impl AddressValidationError {
    fn code(&self) -> &'static str {
        match self {
            AddressValidationError::InvalidFormat(_) => "INVALID_FORMAT",
            AddressValidationError::WrongNetwork { .. } => "WRONG_NETWORK",
            AddressValidationError::SelfSend => "SELF_SEND",
            AddressValidationError::InvalidAmount(_) => "INVALID_AMOUNT",
        }
    }
}

/// Fee estimation failures and rate rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeErrorKind {
    #[error("Fee estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Fee rate {rate} sat/vB is too high (maximum {max})")]
    RateTooHigh { rate: Decimal, max: Decimal },

    #[error("Fee rate {rate} sat/vB is too low (minimum {min})")]
    RateTooLow { rate: Decimal, min: Decimal },
}

/// Failures talking to external services
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkErrorKind {
    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Broadcast failed: {message}")]
    BroadcastFailed {
        message: String,
        hex_length: usize,
        hex_prefix: String,
    },
}

/// Failures while assembling the transaction itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionErrorKind {
    #[error("UTXO selection failed: {0}")]
    SelectionFailed(String),

    #[error("Transaction build failed: {0}")]
    BuildFailed(String),

    #[error("Transaction signing failed: {0}")]
    SigningFailed(String),

    #[error("A send is already in progress")]
    AlreadyInProgress,

    #[error("Send was cancelled")]
    Cancelled,

    #[error("No previous send to retry")]
    NoPreviousAttempt,
}

/// Failures that need an explicit user decision
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityErrorKind {
    #[error("Key material is unavailable")]
    KeyMaterialUnavailable,

    #[error("Wallet is locked")]
    WalletLocked,

    #[error("Amount {amount} sats exceeds the safety ceiling of {ceiling} sats")]
    AmountExceedsSafetyCeiling { amount: u64, ceiling: u64 },

    #[error("Blocked by security checks: {}", .blockers.join("; "))]
    BlockedByRiskCheck { blockers: Vec<String> },

    #[error("Confirmation required: {}", .reasons.join("; "))]
    ConfirmationRequired { reasons: Vec<String> },
}

/// The error taxonomy surfaced by the send pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Insufficient funds: required {required} sats, available {available} sats")]
    InsufficientFunds {
        required: u64,
        available: u64,
        shortfall: u64,
    },

    #[error("Address validation error: {0}")]
    AddressValidation(#[from] AddressValidationError),

    #[error("Fee estimation error: {0}")]
    FeeEstimation(FeeErrorKind),

    #[error("Network error: {0}")]
    Network(NetworkErrorKind),

    #[error("Transaction error: {0}")]
    Transaction(TransactionErrorKind),

    #[error("Security error: {0}")]
    Security(SecurityErrorKind),
}

impl SendError {
    /// Build an insufficient-funds error, computing the shortfall
    pub fn insufficient_funds(required: u64, available: u64) -> Self {
        SendError::InsufficientFunds {
            required,
            available,
            shortfall: required.saturating_sub(available),
        }
    }

    /// Broad error category
    pub fn category(&self) -> &'static str {
        match self {
            SendError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            SendError::AddressValidation(_) => "ADDRESS_VALIDATION",
            SendError::FeeEstimation(_) => "FEE_ESTIMATION",
            SendError::Network(_) => "NETWORK",
            SendError::Transaction(_) => "TRANSACTION",
            SendError::Security(_) => "SECURITY",
        }
    }

    /// Stable `CATEGORY/KIND` code, e.g. `TRANSACTION/SIGNING_FAILED`
    pub fn code(&self) -> String {
        let kind = match self {
            SendError::InsufficientFunds { .. } => return self.category().to_string(),
            SendError::AddressValidation(e) => e.code(),
            SendError::FeeEstimation(kind) => match kind {
                FeeErrorKind::EstimationFailed(_) => "ESTIMATION_FAILED",
                FeeErrorKind::RateTooHigh { .. } => "RATE_TOO_HIGH",
                FeeErrorKind::RateTooLow { .. } => "RATE_TOO_LOW",
            },
            SendError::Network(kind) => match kind {
                NetworkErrorKind::Timeout { .. } => "TIMEOUT",
                NetworkErrorKind::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
                NetworkErrorKind::BroadcastFailed { .. } => "BROADCAST_FAILED",
            },
            SendError::Transaction(kind) => match kind {
                TransactionErrorKind::SelectionFailed(_) => "SELECTION_FAILED",
                TransactionErrorKind::BuildFailed(_) => "BUILD_FAILED",
                TransactionErrorKind::SigningFailed(_) => "SIGNING_FAILED",
                TransactionErrorKind::AlreadyInProgress => "ALREADY_IN_PROGRESS",
                TransactionErrorKind::Cancelled => "CANCELLED",
                TransactionErrorKind::NoPreviousAttempt => "NO_PREVIOUS_ATTEMPT",
            },
            SendError::Security(kind) => match kind {
                SecurityErrorKind::KeyMaterialUnavailable => "KEY_MATERIAL_UNAVAILABLE",
                SecurityErrorKind::WalletLocked => "WALLET_LOCKED",
                SecurityErrorKind::AmountExceedsSafetyCeiling { .. } => "AMOUNT_EXCEEDS_CEILING",
                SecurityErrorKind::BlockedByRiskCheck { .. } => "BLOCKED_BY_RISK_CHECK",
                SecurityErrorKind::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED",
            },
        };
        format!("{}/{}", self.category(), kind)
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            SendError::InsufficientFunds { shortfall, .. } => format!(
                "Not enough funds to cover the amount and network fee. You need {} more sats.",
                shortfall
            ),
            SendError::AddressValidation(AddressValidationError::WrongNetwork { expected, .. }) => {
                format!("This address is not valid on {}. Please check the recipient.", expected)
            }
            SendError::AddressValidation(AddressValidationError::SelfSend) => {
                "You are sending to your own wallet. Please use a different recipient.".to_string()
            }
            SendError::AddressValidation(AddressValidationError::InvalidAmount(reason)) => {
                format!("The amount is not valid: {}", reason)
            }
            SendError::AddressValidation(_) => {
                "The recipient address is not valid. Please check it and try again.".to_string()
            }
            SendError::FeeEstimation(FeeErrorKind::EstimationFailed(_)) => {
                "Could not estimate network fees. Please try again.".to_string()
            }
            SendError::FeeEstimation(FeeErrorKind::RateTooHigh { max, .. }) => {
                format!("The fee rate is exceptionally high. The maximum is {} sat/vB.", max)
            }
            SendError::FeeEstimation(FeeErrorKind::RateTooLow { min, .. }) => {
                format!("The fee rate is too low. The minimum is {} sat/vB.", min)
            }
            SendError::Network(NetworkErrorKind::Timeout { .. }) => {
                "The network request timed out. Please check your connection and retry.".to_string()
            }
            SendError::Network(NetworkErrorKind::ServiceUnavailable(_)) => {
                "The Bitcoin network service is unavailable. Please retry shortly.".to_string()
            }
            SendError::Network(NetworkErrorKind::BroadcastFailed { message, .. }) => {
                format!("The network rejected the transaction: {}", message)
            }
            SendError::Transaction(TransactionErrorKind::SigningFailed(_)) => {
                "The transaction could not be signed. Please unlock your wallet again.".to_string()
            }
            SendError::Transaction(TransactionErrorKind::AlreadyInProgress) => {
                "A transaction is already being sent. Please wait for it to finish.".to_string()
            }
            SendError::Transaction(TransactionErrorKind::Cancelled) => {
                "The transaction was cancelled.".to_string()
            }
            SendError::Transaction(TransactionErrorKind::NoPreviousAttempt) => {
                "There is no previous transaction to retry.".to_string()
            }
            SendError::Transaction(_) => {
                "The transaction could not be prepared. Please try again.".to_string()
            }
            SendError::Security(SecurityErrorKind::KeyMaterialUnavailable) => {
                "Your wallet keys are not available. Please unlock your wallet.".to_string()
            }
            SendError::Security(SecurityErrorKind::WalletLocked) => {
                "Your wallet is locked. Please unlock it to send.".to_string()
            }
            SendError::Security(SecurityErrorKind::AmountExceedsSafetyCeiling { ceiling, .. }) => {
                format!("This amount exceeds your safety limit of {} sats.", ceiling)
            }
            SendError::Security(SecurityErrorKind::BlockedByRiskCheck { .. }) => {
                "This transaction failed security checks and was not sent.".to_string()
            }
            SendError::Security(SecurityErrorKind::ConfirmationRequired { .. }) => {
                "Please review and confirm this transaction before sending.".to_string()
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SendError::FeeEstimation(FeeErrorKind::RateTooHigh { .. })
            | SendError::FeeEstimation(FeeErrorKind::RateTooLow { .. }) => ErrorSeverity::Warning,
            SendError::Security(SecurityErrorKind::ConfirmationRequired { .. }) => {
                ErrorSeverity::Warning
            }
            SendError::Transaction(TransactionErrorKind::Cancelled) => ErrorSeverity::Info,
            SendError::Transaction(TransactionErrorKind::SigningFailed(_)) => {
                ErrorSeverity::Critical
            }
            SendError::Security(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether the user can get past this error without restarting the wallet
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SendError::Transaction(TransactionErrorKind::SigningFailed(_))
        )
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::FeeEstimation(FeeErrorKind::EstimationFailed(_)) => true,
            SendError::Network(_) => true,
            SendError::Transaction(TransactionErrorKind::BuildFailed(_))
            | SendError::Transaction(TransactionErrorKind::SelectionFailed(_))
            | SendError::Transaction(TransactionErrorKind::Cancelled) => true,
            _ => false,
        }
    }

    /// Structured, log-safe diagnostic context
    pub fn context(&self) -> serde_json::Value {
        let details = match self {
            SendError::InsufficientFunds {
                required,
                available,
                shortfall,
            } => json!({
                "required_sats": required,
                "available_sats": available,
                "shortfall_sats": shortfall,
            }),
            SendError::AddressValidation(AddressValidationError::WrongNetwork {
                expected,
                actual,
            }) => json!({
                "expected_network": expected.to_string(),
                "actual_network": actual.to_string(),
            }),
            SendError::FeeEstimation(FeeErrorKind::RateTooHigh { rate, max }) => json!({
                "fee_rate": rate.to_string(),
                "max_fee_rate": max.to_string(),
            }),
            SendError::FeeEstimation(FeeErrorKind::RateTooLow { rate, min }) => json!({
                "fee_rate": rate.to_string(),
                "min_fee_rate": min.to_string(),
            }),
            SendError::Network(NetworkErrorKind::BroadcastFailed {
                hex_length,
                hex_prefix,
                ..
            }) => json!({
                "hex_length": hex_length,
                "hex_prefix": hex_prefix,
            }),
            SendError::Security(SecurityErrorKind::AmountExceedsSafetyCeiling {
                amount,
                ceiling,
            }) => json!({
                "amount_sats": amount,
                "ceiling_sats": ceiling,
            }),
            SendError::Security(SecurityErrorKind::BlockedByRiskCheck { blockers }) => {
                json!({ "blockers": blockers })
            }
            SendError::Security(SecurityErrorKind::ConfirmationRequired { reasons }) => {
                json!({ "reasons": reasons })
            }
            _ => json!({}),
        };

        json!({
            "code": self.code(),
            "severity": self.severity(),
            "recoverable": self.is_recoverable(),
            "retryable": self.is_retryable(),
            "details": details,
        })
    }
}

/// Result alias used across the send pipeline
pub type SendResult<T> = Result<T, SendError>;
