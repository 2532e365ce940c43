//! Configuration for the send engine.
//!
//! Settings are stored in TOML. Every field has a default, so an empty file (or
//! no file at all) yields a working mainnet configuration.
//!
//! ## Security Considerations
//!
//! - No key material is ever stored in this configuration
//! - Limits (safety ceiling, fee thresholds) are validated before use
//! - A configuration that fails `validate()` must not be used to send

use crate::logging::LogConfig;
use crate::types::AddressType;
use crate::utxo_selection::SelectionOptions;
use anyhow::{anyhow, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Network name: bitcoin, testnet, signet or regtest
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub network_io: NetworkIoConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            fees: FeeConfig::default(),
            network_io: NetworkIoConfig::default(),
            security: SecurityConfig::default(),
            selection: SelectionConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Fee estimation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// How long fetched fee rates stay fresh
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Timeout for a single fee source request
    #[serde(default = "default_fee_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            fetch_timeout_secs: default_fee_timeout(),
        }
    }
}

/// Timeouts and retry bounds for the UTXO source and broadcast sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkIoConfig {
    #[serde(default = "default_utxo_timeout")]
    pub utxo_fetch_timeout_secs: u64,

    #[serde(default = "default_broadcast_timeout")]
    pub broadcast_timeout_secs: u64,

    /// Attempts per address before the fetch stage gives up
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
}

impl Default for NetworkIoConfig {
    fn default() -> Self {
        Self {
            utxo_fetch_timeout_secs: default_utxo_timeout(),
            broadcast_timeout_secs: default_broadcast_timeout(),
            max_fetch_attempts: default_max_fetch_attempts(),
        }
    }
}

/// Thresholds used by the security analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Amounts at or above this value need explicit confirmation
    #[serde(default = "default_large_amount")]
    pub large_amount_sats: u64,

    /// Amounts above this value are refused outright
    #[serde(default = "default_safety_ceiling")]
    pub safety_ceiling_sats: u64,

    #[serde(default = "default_fee_warning_percent")]
    pub fee_warning_percent: u64,

    #[serde(default = "default_fee_error_percent")]
    pub fee_error_percent: u64,

    #[serde(default = "default_max_inputs")]
    pub max_inputs: usize,

    #[serde(default = "default_max_outputs")]
    pub max_outputs: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            large_amount_sats: default_large_amount(),
            safety_ceiling_sats: default_safety_ceiling(),
            fee_warning_percent: default_fee_warning_percent(),
            fee_error_percent: default_fee_error_percent(),
            max_inputs: default_max_inputs(),
            max_outputs: default_max_outputs(),
        }
    }
}

/// Default coin selection preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub prefer_address_type: AddressType,

    #[serde(default)]
    pub include_unconfirmed: bool,

    #[serde(default = "default_true")]
    pub minimize_inputs: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            prefer_address_type: AddressType::default(),
            include_unconfirmed: false,
            minimize_inputs: default_true(),
        }
    }
}

impl SelectionConfig {
    pub fn options(&self) -> SelectionOptions {
        SelectionOptions {
            prefer_address_type: self.prefer_address_type,
            include_unconfirmed: self.include_unconfirmed,
            minimize_inputs: self.minimize_inputs,
        }
    }
}

impl EngineConfig {
    /// Default configuration for the given network
    pub fn for_network(network: Network) -> Self {
        Self {
            network: network.to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;
        fs::write(path.as_ref(), content)
            .map_err(|e| anyhow!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Parsed network
    pub fn network(&self) -> Result<Network> {
        parse_network(&self.network)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.network()?;

        if self.fees.fetch_timeout_secs == 0 {
            return Err(anyhow!("Invalid fee fetch timeout: must be greater than 0"));
        }
        if self.network_io.utxo_fetch_timeout_secs == 0
            || self.network_io.broadcast_timeout_secs == 0
        {
            return Err(anyhow!("Invalid network timeout: must be greater than 0"));
        }
        if self.network_io.max_fetch_attempts == 0 {
            return Err(anyhow!("Invalid max fetch attempts: must be greater than 0"));
        }
        if self.security.fee_warning_percent > self.security.fee_error_percent {
            return Err(anyhow!(
                "Fee warning threshold ({}%) exceeds error threshold ({}%)",
                self.security.fee_warning_percent,
                self.security.fee_error_percent
            ));
        }
        if self.security.large_amount_sats > self.security.safety_ceiling_sats {
            return Err(anyhow!(
                "Large amount threshold exceeds the safety ceiling"
            ));
        }
        if self.security.max_inputs == 0 || self.security.max_outputs == 0 {
            return Err(anyhow!("Input and output limits must be greater than 0"));
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fees.cache_ttl_secs)
    }

    pub fn fee_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fees.fetch_timeout_secs)
    }

    pub fn utxo_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.network_io.utxo_fetch_timeout_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.network_io.broadcast_timeout_secs)
    }
}

/// Parse a network name, accepting the common aliases
pub fn parse_network(name: &str) -> Result<Network> {
    match name.trim().to_lowercase().as_str() {
        "bitcoin" | "mainnet" | "main" => Ok(Network::Bitcoin),
        "testnet" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(anyhow!("Invalid network type: {}", other)),
    }
}

// Default value functions

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_fee_timeout() -> u64 {
    10
}

fn default_utxo_timeout() -> u64 {
    15
}

fn default_broadcast_timeout() -> u64 {
    30
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_large_amount() -> u64 {
    10_000_000 // 0.1 BTC
}

fn default_safety_ceiling() -> u64 {
    100_000_000 // 1 BTC
}

fn default_fee_warning_percent() -> u64 {
    5
}

fn default_fee_error_percent() -> u64 {
    50
}

fn default_max_inputs() -> usize {
    100
}

fn default_max_outputs() -> usize {
    20
}

fn default_true() -> bool {
    true
}
