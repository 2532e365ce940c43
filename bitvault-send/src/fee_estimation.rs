//! Fee Estimation for Bitcoin Transactions
//!
//! Produces four fee tiers (economy, slow, normal, fast) from the fee source,
//! caches them per network, and falls back to static tables whenever the source
//! is slow, unreachable or returns nonsense.
//!
//! # Security Considerations
//!
//! - Accurate fee estimation is crucial for transaction confirmation
//! - Rates from the fee source are untrusted input and are validated before use
//! - This module does not handle keys or signatures
//!
//! # Caching
//!
//! A [`FeeRateCache`] is keyed by network. Readers get a clone of the last valid
//! snapshot and writers replace it under a write lock, so no reader ever sees a
//! partially updated set of rates. Static fallback tables are never cached.
//!
//! # Fee Estimation Strategy
//!
//! - Raw estimates are keyed by confirmation target in blocks
//! - Each tier takes the estimate whose target is closest to the tier's target
//! - The economy tier is clamped to at most 2 sat/vB
//! - Custom rates are bounded to 1..=1000 sat/vB

use crate::error::{FeeErrorKind, SendError};
use crate::logging::{log_network, LogLevel};
use crate::math::calculate_fee;
use crate::providers::FeeRateProvider;
use crate::types::{ECONOMY_FEE_CAP, MAX_ECONOMY_FEE_RATE, MAX_FEE_RATE};
use bitcoin::Network;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lowest fee rate nodes relay by default (sat/vB)
pub const MIN_RELAY_FEE_RATE: Decimal = dec!(1);

/// Errors related to fee estimation operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeEstimationError {
    #[error("Fee source timed out")]
    Timeout,

    #[error("Fee source unavailable: {0}")]
    Unavailable(String),

    #[error("Fee source returned no estimates")]
    NoEstimates,

    #[error("Fee source returned invalid rates: {0}")]
    InvalidRates(String),
}

impl From<FeeEstimationError> for SendError {
    fn from(error: FeeEstimationError) -> Self {
        SendError::FeeEstimation(FeeErrorKind::EstimationFailed(error.to_string()))
    }
}

/// Why a user-supplied fee rate was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeRateRejection {
    #[error("Fee rate must be greater than zero")]
    NonPositive,

    #[error("Fee rate {rate} sat/vB is below the minimum of {min} sat/vB")]
    BelowMinimum { rate: Decimal, min: Decimal },

    #[error("Fee rate {rate} sat/vB exceeds {max} sat/vB (current fast rate is {fast_rate})")]
    ExceedsMaximum {
        rate: Decimal,
        max: Decimal,
        fast_rate: Decimal,
    },
}

impl From<FeeRateRejection> for SendError {
    fn from(rejection: FeeRateRejection) -> Self {
        match rejection {
            FeeRateRejection::NonPositive => SendError::FeeEstimation(FeeErrorKind::RateTooLow {
                rate: Decimal::ZERO,
                min: MIN_RELAY_FEE_RATE,
            }),
            FeeRateRejection::BelowMinimum { rate, min } => {
                SendError::FeeEstimation(FeeErrorKind::RateTooLow { rate, min })
            }
            FeeRateRejection::ExceedsMaximum { rate, max, .. } => {
                SendError::FeeEstimation(FeeErrorKind::RateTooHigh { rate, max })
            }
        }
    }
}

/// Where a set of fee rates came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSource {
    Network,
    Fallback,
    Cached,
}

/// Fee priority tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier {
    Economy,
    Slow,
    Normal,
    Fast,
}

impl FeeTier {
    pub const ALL: [FeeTier; 4] = [FeeTier::Economy, FeeTier::Slow, FeeTier::Normal, FeeTier::Fast];
}

impl fmt::Display for FeeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeTier::Economy => write!(f, "economy"),
            FeeTier::Slow => write!(f, "slow"),
            FeeTier::Normal => write!(f, "normal"),
            FeeTier::Fast => write!(f, "fast"),
        }
    }
}

/// Target confirmation time of each tier, in blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationTargets {
    pub economy: u32,
    pub slow: u32,
    pub normal: u32,
    pub fast: u32,
}

impl Default for ConfirmationTargets {
    fn default() -> Self {
        Self {
            economy: 144,
            slow: 6,
            normal: 3,
            fast: 1,
        }
    }
}

impl ConfirmationTargets {
    pub fn for_tier(&self, tier: FeeTier) -> u32 {
        match tier {
            FeeTier::Economy => self.economy,
            FeeTier::Slow => self.slow,
            FeeTier::Normal => self.normal,
            FeeTier::Fast => self.fast,
        }
    }
}

/// Tiered fee rates in sat/vB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub economy: Decimal,
    pub slow: Decimal,
    pub normal: Decimal,
    pub fast: Decimal,
    pub source: FeeSource,
    pub last_updated: DateTime<Utc>,
    pub confirmation_targets: ConfirmationTargets,
}

impl FeeRates {
    pub fn rate_for(&self, tier: FeeTier) -> Decimal {
        match tier {
            FeeTier::Economy => self.economy,
            FeeTier::Slow => self.slow,
            FeeTier::Normal => self.normal,
            FeeTier::Fast => self.fast,
        }
    }

    /// Check positivity, tier ordering and upper bounds
    pub fn validate(&self) -> Result<(), FeeEstimationError> {
        let tiers = [self.economy, self.slow, self.normal, self.fast];

        if tiers.iter().any(|rate| *rate <= Decimal::ZERO) {
            return Err(FeeEstimationError::InvalidRates(
                "rates must be positive".to_string(),
            ));
        }
        if tiers.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(FeeEstimationError::InvalidRates(format!(
                "rates not ascending: {}/{}/{}/{}",
                self.economy, self.slow, self.normal, self.fast
            )));
        }
        if self.fast > Decimal::from(MAX_FEE_RATE) {
            return Err(FeeEstimationError::InvalidRates(format!(
                "fast rate {} exceeds {}",
                self.fast, MAX_FEE_RATE
            )));
        }
        if self.economy > Decimal::from(MAX_ECONOMY_FEE_RATE) {
            return Err(FeeEstimationError::InvalidRates(format!(
                "economy rate {} exceeds {}",
                self.economy, MAX_ECONOMY_FEE_RATE
            )));
        }
        Ok(())
    }
}

/// One selectable fee choice for a transaction of known size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeOption {
    pub name: FeeTier,
    pub fee_rate: Decimal,
    pub total_fee: u64,
    pub confirmation_blocks: u32,
    pub human_time: String,
}

/// Static per-network fee tables used when the fee source cannot be trusted
pub mod defaults {
    use super::*;

    /// Fallback rates for a network, tagged [`FeeSource::Fallback`]
    pub fn fallback_rates(network: Network) -> FeeRates {
        let (economy, slow, normal, fast) = match network {
            Network::Bitcoin => (dec!(1), dec!(5), dec!(10), dec!(20)),
            // Test networks rarely see fee pressure
            _ => (dec!(1), dec!(1), dec!(2), dec!(3)),
        };

        FeeRates {
            economy,
            slow,
            normal,
            fast,
            source: FeeSource::Fallback,
            last_updated: Utc::now(),
            confirmation_targets: ConfirmationTargets::default(),
        }
    }
}

/// Human-readable confirmation time for a block target (~10 minutes per block)
pub fn human_time(blocks: u32) -> String {
    let minutes = u64::from(blocks.max(1)) * 10;
    if minutes < 60 {
        format!("~{} minutes", minutes)
    } else if minutes < 24 * 60 {
        let hours = minutes / 60;
        if hours == 1 {
            "~1 hour".to_string()
        } else {
            format!("~{} hours", hours)
        }
    } else {
        let days = minutes / (24 * 60);
        if days == 1 {
            "~1 day".to_string()
        } else {
            format!("~{} days", days)
        }
    }
}

/// Fee options for a transaction of `size_vbytes`, cheapest first
pub fn calculate_options(size_vbytes: u64, rates: &FeeRates) -> Vec<FeeOption> {
    FeeTier::ALL
        .iter()
        .map(|tier| {
            let fee_rate = rates.rate_for(*tier);
            let blocks = rates.confirmation_targets.for_tier(*tier);
            FeeOption {
                name: *tier,
                fee_rate,
                total_fee: calculate_fee(size_vbytes, fee_rate),
                confirmation_blocks: blocks,
                human_time: human_time(blocks),
            }
        })
        .collect()
}

/// Validate a user-supplied fee rate
///
/// Exactly 1000 sat/vB is accepted; anything above is refused as exceptionally high.
pub fn validate_custom_rate(rate: Decimal, rates: &FeeRates) -> Result<(), FeeRateRejection> {
    if rate <= Decimal::ZERO {
        return Err(FeeRateRejection::NonPositive);
    }
    if rate < MIN_RELAY_FEE_RATE {
        return Err(FeeRateRejection::BelowMinimum {
            rate,
            min: MIN_RELAY_FEE_RATE,
        });
    }
    let max = Decimal::from(MAX_FEE_RATE);
    if rate > max {
        return Err(FeeRateRejection::ExceedsMaximum {
            rate,
            max,
            fast_rate: rates.fast,
        });
    }
    Ok(())
}

/// Non-blocking observations about an accepted custom rate
pub fn custom_rate_warnings(rate: Decimal, rates: &FeeRates) -> Vec<String> {
    let mut warnings = Vec::new();
    if rate < rates.economy {
        warnings.push(format!(
            "Fee rate {} sat/vB is below the economy rate of {} sat/vB and may take a long time to confirm",
            rate, rates.economy
        ));
    }
    if rate > rates.fast * dec!(2) {
        warnings.push(format!(
            "Fee rate {} sat/vB is more than twice the fast rate of {} sat/vB",
            rate, rates.fast
        ));
    }
    warnings
}

/// Map raw per-target estimates onto the four tiers
pub fn rates_from_estimates(
    estimates: &HashMap<u32, f64>,
    targets: ConfirmationTargets,
) -> Result<FeeRates, FeeEstimationError> {
    if estimates.is_empty() {
        return Err(FeeEstimationError::NoEstimates);
    }

    let mut sorted: Vec<(u32, f64)> = estimates.iter().map(|(k, v)| (*k, *v)).collect();
    sorted.sort_by_key(|(target, _)| *target);

    let closest = |wanted: u32| -> Result<Decimal, FeeEstimationError> {
        let mut best: Option<(u32, f64)> = None;
        for (target, rate) in &sorted {
            let diff = target.abs_diff(wanted);
            // Strict comparison keeps the lower target on ties
            if best.map(|(t, _)| diff < t.abs_diff(wanted)).unwrap_or(true) {
                best = Some((*target, *rate));
            }
        }
        let (target, rate) = best.ok_or(FeeEstimationError::NoEstimates)?;
        Decimal::from_f64(rate)
            .map(|d| d.round_dp(3))
            .ok_or_else(|| {
                FeeEstimationError::InvalidRates(format!("non-numeric rate for target {}", target))
            })
    };

    let rates = FeeRates {
        economy: closest(targets.economy)?,
        slow: closest(targets.slow)?,
        normal: closest(targets.normal)?,
        fast: closest(targets.fast)?,
        source: FeeSource::Network,
        last_updated: Utc::now(),
        confirmation_targets: targets,
    };
    rates.validate()?;

    let cap = Decimal::from(ECONOMY_FEE_CAP);
    Ok(FeeRates {
        economy: rates.economy.min(cap),
        ..rates
    })
}

struct CachedRates {
    rates: FeeRates,
    fetched_at: Instant,
}

/// Process-wide fee rate cache keyed by network
#[derive(Default)]
pub struct FeeRateCache {
    entries: RwLock<HashMap<Network, CachedRates>>,
}

impl FeeRateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, network: Network) -> Option<(FeeRates, Duration)> {
        let entries = self.entries.read().ok()?;
        entries
            .get(&network)
            .map(|c| (c.rates.clone(), c.fetched_at.elapsed()))
    }

    fn store(&self, network: Network, rates: FeeRates) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                network,
                CachedRates {
                    rates,
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Drop the snapshot for one network
    pub fn invalidate(&self, network: Network) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&network);
        }
    }
}

/// Tiered fee estimator for one network
pub struct FeeEstimator {
    provider: Arc<dyn FeeRateProvider>,
    network: Network,
    cache: Arc<FeeRateCache>,
    ttl: Duration,
    fetch_timeout: Duration,
    targets: ConfirmationTargets,
}

impl FeeEstimator {
    pub fn new(
        provider: Arc<dyn FeeRateProvider>,
        network: Network,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self::with_cache(provider, network, ttl, fetch_timeout, Arc::new(FeeRateCache::new()))
    }

    /// Share a cache with estimators for other networks
    pub fn with_cache(
        provider: Arc<dyn FeeRateProvider>,
        network: Network,
        ttl: Duration,
        fetch_timeout: Duration,
        cache: Arc<FeeRateCache>,
    ) -> Self {
        Self {
            provider,
            network,
            cache,
            ttl,
            fetch_timeout,
            targets: ConfirmationTargets::default(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Current fee rates; never fails
    ///
    /// Within the TTL the cached snapshot is returned unchanged without calling
    /// the fee source. On a failed refresh the stale snapshot is served tagged
    /// [`FeeSource::Cached`], or the network's fallback table when nothing was
    /// ever fetched.
    pub async fn get_rates(&self) -> FeeRates {
        if let Some((rates, age)) = self.cache.get(self.network) {
            if age < self.ttl {
                return rates;
            }
        }

        match self.fetch().await {
            Ok(rates) => rates,
            Err(e) => self.degrade(e),
        }
    }

    /// Bypass the cache and query the fee source
    ///
    /// With `strict` the fetch error is returned instead of falling back.
    pub async fn refresh_rates(&self, strict: bool) -> Result<FeeRates, FeeEstimationError> {
        self.cache.invalidate(self.network);
        match self.fetch().await {
            Ok(rates) => Ok(rates),
            Err(e) if strict => Err(e),
            Err(e) => Ok(self.degrade(e)),
        }
    }

    /// Forget the cached snapshot for this estimator's network
    pub fn invalidate(&self) {
        self.cache.invalidate(self.network);
    }

    async fn fetch(&self) -> Result<FeeRates, FeeEstimationError> {
        let estimates = tokio::time::timeout(self.fetch_timeout, self.provider.get_fee_estimates())
            .await
            .map_err(|_| FeeEstimationError::Timeout)?
            .map_err(|e| FeeEstimationError::Unavailable(e.to_string()))?;

        let rates = rates_from_estimates(&estimates, self.targets)?;
        self.cache.store(self.network, rates.clone());

        log_network(
            LogLevel::Debug,
            "fee_rates_fetched",
            Some(json!({
                "network": self.network.to_string(),
                "economy": rates.economy.to_string(),
                "fast": rates.fast.to_string(),
            })),
        );
        Ok(rates)
    }

    fn degrade(&self, error: FeeEstimationError) -> FeeRates {
        log::warn!("Fee estimation failed for {}: {}", self.network, error);

        if let Some((stale, _)) = self.cache.get(self.network) {
            return FeeRates {
                source: FeeSource::Cached,
                ..stale
            };
        }

        log_network(
            LogLevel::Warn,
            "fee_rates_fallback",
            Some(json!({ "network": self.network.to_string() })),
        );
        defaults::fallback_rates(self.network)
    }
}
