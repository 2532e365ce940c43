//! Pre-broadcast risk checks
//!
//! The analyzer runs an independent checklist against a proposed transaction and
//! folds the results into a [`SecurityReport`]:
//!
//! - a failed `critical` or `error` check blocks the transaction
//! - a failed `warning` check is reported and raises the risk level to at least medium
//! - a failed `info` check only contributes a recommendation
//!
//! Whether the user must explicitly confirm is decided separately by
//! [`SecurityAnalyzer::requires_confirmation`], which can ask for confirmation
//! even when the report is secure.
//!
//! # Security Considerations
//!
//! - Checks use public transaction data only
//! - Thresholds come from [`SecurityConfig`] and are validated when the config loads

use crate::config::SecurityConfig;
use crate::error::ErrorSeverity;
use crate::math::{effective_fee_rate, fee_percentage, is_dust};
use crate::types::{AddressType, TransactionOutput, Utxo, DUST_THRESHOLD, MAX_FEE_RATE};
use crate::validation::{detect_address_type, validate_address};
use bitcoin::Network;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Overall risk of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityCheck {
    pub name: String,
    pub passed: bool,
    pub severity: ErrorSeverity,
    pub message: String,
}

impl SecurityCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            severity: ErrorSeverity::Info,
            message: message.into(),
        }
    }

    fn fail(name: &str, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            severity,
            message: message.into(),
        }
    }
}

/// Aggregated outcome of all checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub is_secure: bool,
    pub risk_level: RiskLevel,
    pub checks: Vec<SecurityCheck>,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SecurityReport {
    /// Fold individual checks into a report
    pub fn from_checks(checks: Vec<SecurityCheck>, recommendations: Vec<String>) -> Self {
        let mut warnings = Vec::new();
        let mut blockers = Vec::new();
        let mut risk_level = RiskLevel::Low;

        for check in checks.iter().filter(|c| !c.passed) {
            match check.severity {
                ErrorSeverity::Critical => {
                    blockers.push(check.message.clone());
                    risk_level = RiskLevel::Critical;
                }
                ErrorSeverity::Error => {
                    blockers.push(check.message.clone());
                    risk_level = risk_level.max(RiskLevel::High);
                }
                ErrorSeverity::Warning => {
                    warnings.push(check.message.clone());
                    risk_level = risk_level.max(RiskLevel::Medium);
                }
                ErrorSeverity::Info => {}
            }
        }

        Self {
            is_secure: risk_level != RiskLevel::Critical && blockers.is_empty(),
            risk_level,
            checks,
            warnings,
            blockers,
            recommendations,
        }
    }

    /// Whether a failed check with this name is present
    pub fn failed(&self, name: &str) -> bool {
        self.checks.iter().any(|c| c.name == name && !c.passed)
    }
}

/// Wallet state the analyzer needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletContext {
    pub network: Network,
    /// Addresses the wallet controls
    pub own_addresses: Vec<String>,
    /// Change address for this transaction, if one will be used
    pub change_address: Option<String>,
}

/// Whether the user must confirm, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequirement {
    pub required: bool,
    pub reasons: Vec<String>,
}

/// Check names, stable for callers matching on them
pub mod checks {
    pub const INPUT_COUNT: &str = "input_count";
    pub const DUST_INPUTS: &str = "dust_inputs";
    pub const OUTPUT_COUNT: &str = "output_count";
    pub const OUTPUT_VALIDITY: &str = "output_validity";
    pub const FEE_RATE: &str = "fee_rate";
    pub const FEE_PERCENTAGE: &str = "fee_percentage";
    pub const ADDRESS_TYPE_MIXING: &str = "address_type_mixing";
    pub const LARGE_AMOUNT: &str = "large_amount";
    pub const SAFETY_CEILING: &str = "safety_ceiling";
    pub const ADDRESS_REUSE: &str = "address_reuse";
    pub const LEGACY_INPUTS: &str = "legacy_inputs";
}

/// Runs the pre-broadcast checklist
#[derive(Debug, Clone)]
pub struct SecurityAnalyzer {
    config: SecurityConfig,
}

impl SecurityAnalyzer {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Analyze a proposed transaction
    ///
    /// `outputs` are the payments (change excluded); `fee_sats` and `size_vbytes`
    /// describe the transaction as it will be built.
    pub fn analyze(
        &self,
        inputs: &[Utxo],
        outputs: &[TransactionOutput],
        fee_sats: u64,
        size_vbytes: u64,
        wallet: &WalletContext,
    ) -> SecurityReport {
        let mut recommendations = Vec::new();
        let amount: u64 = outputs.iter().map(|o| o.value_sats).sum();

        let mut checks = vec![
            self.check_input_count(inputs),
            check_dust_inputs(inputs),
            self.check_output_count(outputs),
        ];
        checks.extend(check_outputs(outputs, wallet.network));
        checks.push(check_fee_rate(fee_sats, size_vbytes));
        checks.push(self.check_fee_percentage(fee_sats, amount));

        let mixing = check_address_type_mixing(inputs);
        if !mixing.passed {
            recommendations
                .push("Spend outputs of a single address type to avoid linking them".to_string());
        }
        checks.push(mixing);

        checks.push(self.check_large_amount(amount));
        checks.push(self.check_safety_ceiling(amount));
        checks.push(check_address_reuse(inputs, outputs, wallet));

        let legacy = check_legacy_inputs(inputs);
        if !legacy.passed {
            recommendations.push(
                "Move legacy funds to a native segwit address to lower future fees".to_string(),
            );
        }
        checks.push(legacy);

        let report = SecurityReport::from_checks(checks, recommendations);
        log::debug!(
            "Security analysis: risk={:?} blockers={} warnings={}",
            report.risk_level,
            report.blockers.len(),
            report.warnings.len()
        );
        report
    }

    /// Decide whether the user must explicitly confirm this send
    pub fn requires_confirmation(
        &self,
        outputs: &[TransactionOutput],
        fee_sats: u64,
        wallet: &WalletContext,
    ) -> ConfirmationRequirement {
        let amount: u64 = outputs.iter().map(|o| o.value_sats).sum();
        let mut reasons = Vec::new();

        if amount >= self.config.large_amount_sats {
            reasons.push(format!("Large amount: {} sats", amount));
        }

        let percent = fee_percentage(fee_sats, amount);
        if percent > Decimal::from(self.config.fee_warning_percent) {
            reasons.push(format!(
                "Fee is {}% of the amount sent",
                percent.round_dp(2)
            ));
        }

        let legacy_recipient = outputs.iter().any(|o| {
            validate_address(&o.address, wallet.network)
                .ok()
                .and_then(|a| detect_address_type(&a))
                == Some(AddressType::Legacy)
        });
        if legacy_recipient {
            reasons.push("Recipient uses a legacy address".to_string());
        }

        ConfirmationRequirement {
            required: !reasons.is_empty(),
            reasons,
        }
    }

    fn check_input_count(&self, inputs: &[Utxo]) -> SecurityCheck {
        if inputs.is_empty() {
            SecurityCheck::fail(checks::INPUT_COUNT, ErrorSeverity::Error, "Transaction has no inputs")
        } else if inputs.len() > self.config.max_inputs {
            SecurityCheck::fail(
                checks::INPUT_COUNT,
                ErrorSeverity::Warning,
                format!(
                    "Transaction spends {} inputs (more than {})",
                    inputs.len(),
                    self.config.max_inputs
                ),
            )
        } else {
            SecurityCheck::pass(checks::INPUT_COUNT, format!("{} inputs", inputs.len()))
        }
    }

    fn check_output_count(&self, outputs: &[TransactionOutput]) -> SecurityCheck {
        if outputs.is_empty() {
            SecurityCheck::fail(checks::OUTPUT_COUNT, ErrorSeverity::Error, "Transaction has no outputs")
        } else if outputs.len() > self.config.max_outputs {
            SecurityCheck::fail(
                checks::OUTPUT_COUNT,
                ErrorSeverity::Warning,
                format!(
                    "Transaction pays {} outputs (more than {})",
                    outputs.len(),
                    self.config.max_outputs
                ),
            )
        } else {
            SecurityCheck::pass(checks::OUTPUT_COUNT, format!("{} outputs", outputs.len()))
        }
    }

    fn check_fee_percentage(&self, fee_sats: u64, amount: u64) -> SecurityCheck {
        let percent = fee_percentage(fee_sats, amount);
        let shown = percent.round_dp(2);
        if percent > Decimal::from(self.config.fee_error_percent) {
            SecurityCheck::fail(
                checks::FEE_PERCENTAGE,
                ErrorSeverity::Error,
                format!("Fee is {}% of the amount sent", shown),
            )
        } else if percent > Decimal::from(self.config.fee_warning_percent) {
            SecurityCheck::fail(
                checks::FEE_PERCENTAGE,
                ErrorSeverity::Warning,
                format!("Fee is {}% of the amount sent", shown),
            )
        } else {
            SecurityCheck::pass(checks::FEE_PERCENTAGE, format!("Fee is {}% of the amount", shown))
        }
    }

    fn check_large_amount(&self, amount: u64) -> SecurityCheck {
        if amount >= self.config.large_amount_sats {
            SecurityCheck::fail(
                checks::LARGE_AMOUNT,
                ErrorSeverity::Warning,
                format!("Sending a large amount: {} sats", amount),
            )
        } else {
            SecurityCheck::pass(checks::LARGE_AMOUNT, "Amount below large-amount threshold")
        }
    }

    fn check_safety_ceiling(&self, amount: u64) -> SecurityCheck {
        if amount > self.config.safety_ceiling_sats {
            SecurityCheck::fail(
                checks::SAFETY_CEILING,
                ErrorSeverity::Critical,
                format!(
                    "Amount {} sats exceeds the safety ceiling of {} sats",
                    amount, self.config.safety_ceiling_sats
                ),
            )
        } else {
            SecurityCheck::pass(checks::SAFETY_CEILING, "Amount within safety ceiling")
        }
    }
}

fn check_dust_inputs(inputs: &[Utxo]) -> SecurityCheck {
    let dust = inputs.iter().filter(|u| is_dust(u.value_sats)).count();
    if dust > 0 {
        SecurityCheck::fail(
            checks::DUST_INPUTS,
            ErrorSeverity::Warning,
            format!("{} input(s) below {} sats cost more to spend than they are worth", dust, DUST_THRESHOLD),
        )
    } else {
        SecurityCheck::pass(checks::DUST_INPUTS, "No dust inputs")
    }
}

fn check_outputs(outputs: &[TransactionOutput], network: Network) -> Vec<SecurityCheck> {
    outputs
        .iter()
        .enumerate()
        .map(|(i, output)| {
            if let Err(e) = validate_address(&output.address, network) {
                SecurityCheck::fail(
                    checks::OUTPUT_VALIDITY,
                    ErrorSeverity::Critical,
                    format!("Output {} has an invalid address: {}", i, e),
                )
            } else if is_dust(output.value_sats) {
                SecurityCheck::fail(
                    checks::OUTPUT_VALIDITY,
                    ErrorSeverity::Error,
                    format!("Output {} of {} sats is dust", i, output.value_sats),
                )
            } else {
                SecurityCheck::pass(checks::OUTPUT_VALIDITY, format!("Output {} is valid", i))
            }
        })
        .collect()
}

fn check_fee_rate(fee_sats: u64, size_vbytes: u64) -> SecurityCheck {
    let rate = effective_fee_rate(fee_sats, size_vbytes);
    if rate > Decimal::from(MAX_FEE_RATE) {
        SecurityCheck::fail(
            checks::FEE_RATE,
            ErrorSeverity::Critical,
            format!("Fee rate {} sat/vB exceeds {} sat/vB", rate.round_dp(2), MAX_FEE_RATE),
        )
    } else {
        SecurityCheck::pass(checks::FEE_RATE, format!("Fee rate {} sat/vB", rate.round_dp(2)))
    }
}

fn check_address_type_mixing(inputs: &[Utxo]) -> SecurityCheck {
    let types: HashSet<AddressType> = inputs.iter().map(|u| u.address_type).collect();
    if types.len() > 1 {
        SecurityCheck::fail(
            checks::ADDRESS_TYPE_MIXING,
            ErrorSeverity::Info,
            "Inputs mix address types, which links them on-chain",
        )
    } else {
        SecurityCheck::pass(checks::ADDRESS_TYPE_MIXING, "Inputs share one address type")
    }
}

fn check_address_reuse(
    inputs: &[Utxo],
    outputs: &[TransactionOutput],
    wallet: &WalletContext,
) -> SecurityCheck {
    let input_addresses: HashSet<&str> = inputs.iter().map(|u| u.address.as_str()).collect();

    let change_reused = wallet
        .change_address
        .as_deref()
        .map(|c| input_addresses.contains(c))
        .unwrap_or(false);
    let recipient_reused = outputs.iter().any(|o| {
        input_addresses.contains(o.address.as_str())
            || wallet.own_addresses.iter().any(|own| own == &o.address)
    });

    if change_reused || recipient_reused {
        SecurityCheck::fail(
            checks::ADDRESS_REUSE,
            ErrorSeverity::Warning,
            "An address being spent from is also receiving funds",
        )
    } else {
        SecurityCheck::pass(checks::ADDRESS_REUSE, "No address reuse")
    }
}

fn check_legacy_inputs(inputs: &[Utxo]) -> SecurityCheck {
    let legacy = inputs
        .iter()
        .filter(|u| u.address_type == AddressType::Legacy)
        .count();
    if legacy > 0 {
        let extra_vbytes =
            legacy as u64 * (AddressType::Legacy.input_vbytes() - AddressType::NativeSegwit.input_vbytes());
        SecurityCheck::fail(
            checks::LEGACY_INPUTS,
            ErrorSeverity::Info,
            format!(
                "{} legacy input(s) add {} vB compared to native segwit",
                legacy, extra_vbytes
            ),
        )
    } else {
        SecurityCheck::pass(checks::LEGACY_INPUTS, "No legacy inputs")
    }
}
