//! BitVault Send Engine
//!
//! This crate turns a send intent ("pay N sats to address A at fee rate F")
//! into a signed transaction accepted by the Bitcoin network. It is a library;
//! the UI, seed storage and block-explorer HTTP client are injected as
//! collaborators through the traits in [`providers`].
//!
//! # Modules
//!
//! - `types`: Core domain types and constants
//! - `math`: Transaction size and fee arithmetic
//! - `validation`: Address and amount validation
//! - `error`: The send error taxonomy
//! - `logging`: Security-aware logging infrastructure
//! - `config`: Engine configuration
//! - `events`: Selection event delivery
//! - `providers`: External collaborator interfaces
//! - `utxo_selection`: Coin selection
//! - `fee_estimation`: Tiered fee rates with caching and fallbacks
//! - `builder`: Unsigned transaction assembly
//! - `signer`: Per-input key derivation, signing and finalization
//! - `security`: Pre-broadcast risk checks
//! - `broadcaster`: Structural validation and submission
//! - `status`: Stage-based progress tracking
//! - `orchestrator`: The end-to-end pipeline
//!
//! # Security Considerations
//!
//! - Seed phrases travel only inside [`SensitiveString`] and are zeroed on drop
//! - Private keys exist only for the duration of [`Signer::sign`]
//! - Addresses and txids are sanitized before they reach the log

/// Core domain types
pub mod types;

/// Size and fee calculations
pub mod math;

/// Address and amount validation
pub mod validation;

/// Error taxonomy
pub mod error;

/// Secure logging functionality
pub mod logging;

/// Configuration management
pub mod config;

/// Selection event delivery
pub mod events;

/// External collaborators
pub mod providers;

/// UTXO selection
pub mod utxo_selection;

/// Fee estimation
pub mod fee_estimation;

/// Transaction building
pub mod builder;

/// Transaction signing
pub mod signer;

/// Pre-broadcast security analysis
pub mod security;

/// Broadcasting
pub mod broadcaster;

/// Progress tracking
pub mod status;

/// Send pipeline
pub mod orchestrator;

pub use bitcoin::{Address, Network, Transaction, Txid};

pub use types::{
    AddressType, SensitiveBytes, SensitiveString, TransactionOutput, Utxo, DUST_THRESHOLD,
    MAX_BITCOIN_SUPPLY, MAX_FEE_RATE, SATS_PER_BTC,
};

pub use error::{ErrorSeverity, SendError, SendResult};

pub use config::EngineConfig;

pub use utxo_selection::{SelectionError, SelectionOptions, SelectionResult, UtxoSelector};

pub use fee_estimation::{FeeEstimator, FeeOption, FeeRates, FeeSource, FeeTier};

pub use builder::{FeeDetails, TransactionBuilder, UnsignedTransaction};

pub use signer::{SignedTransaction, Signer};

pub use security::{RiskLevel, SecurityAnalyzer, SecurityReport, WalletContext};

pub use broadcaster::Broadcaster;

pub use status::{ProgressEvent, StatusTracker, TransactionStage, TransactionStatus};

pub use orchestrator::{
    Collaborators, FeeChoice, SendOrchestrator, SendOutcome, SendRequest, SourceAddress,
};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
///
/// Installs the default logger. Safe to call repeatedly; only the first call
/// has any effect.
pub fn init() -> Result<(), String> {
    logging::init(&logging::LogConfig::default())
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}
