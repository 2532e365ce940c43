//! End-to-end send pipeline
//!
//! [`SendOrchestrator`] sequences validation, UTXO fetch, selection, security
//! analysis, building, signing and broadcast, recording every step on a
//! [`StatusTracker`]. Only one send runs at a time; a second call while one is
//! in flight is rejected with `Transaction/ALREADY_IN_PROGRESS`.
//!
//! Cancellation is cooperative and checked before every stage. Broadcast is the
//! commit point: once the network has accepted the transaction the outcome is
//! returned even if a cancel arrived meanwhile.
//!
//! # Security Considerations
//!
//! - The seed phrase is requested only on entering the signing stage and is
//!   dropped as soon as the signer returns
//! - Public keys for selected inputs come from the [`AddressDeriver`], which
//!   works from public key material only

use crate::broadcaster::Broadcaster;
use crate::builder::{FeeDetails, TransactionBuilder};
use crate::config::EngineConfig;
use crate::error::{SecurityErrorKind, SendError, SendResult, TransactionErrorKind};
use crate::fee_estimation::{
    custom_rate_warnings, validate_custom_rate, FeeEstimator, FeeSource, FeeTier,
};
use crate::logging::{log_transaction, sanitize_for_logging, LogLevel};
use crate::math::estimate_vsize;
use crate::providers::{
    AddressDeriver, BroadcastProvider, FeeRateProvider, KeyMaterialProvider, ProviderError,
    RawUtxo, UtxoProvider,
};
use crate::security::{checks, SecurityAnalyzer, SecurityReport, WalletContext};
use crate::signer::Signer;
use crate::status::{StatusTracker, TransactionStage};
use crate::types::{AddressType, TransactionOutput, Utxo};
use crate::utxo_selection::{SelectionResult, UtxoSelector};
use crate::validation::{check_not_self_send, validate_address, validate_amount};
use crate::events::SelectionEventBus;
use anyhow::Result;
use bitcoin::Network;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Fee rate requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeChoice {
    Tier(FeeTier),
    /// Explicit rate in sat/vB
    Custom(Decimal),
}

/// A wallet address to spend from, with the path of the key controlling it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAddress {
    pub address: String,
    pub derivation_path: String,
    pub address_type: AddressType,
    pub address_index: u32,
}

/// Parameters of one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub amount_sats: u64,
    pub fee: FeeChoice,
    pub source_addresses: Vec<SourceAddress>,
    pub change_address: String,
    /// The user has reviewed the confirmation reasons for this send
    #[serde(default)]
    pub confirmed: bool,
}

/// Result of a broadcast send
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub txid: String,
    pub fee_rate: Decimal,
    pub fee_details: FeeDetails,
    pub selection: SelectionResult,
    pub security_report: SecurityReport,
    /// Non-blocking observations collected along the way
    pub warnings: Vec<String>,
}

/// External collaborators the orchestrator is wired to
pub struct Collaborators {
    pub utxos: Arc<dyn UtxoProvider>,
    pub fees: Arc<dyn FeeRateProvider>,
    pub broadcast: Arc<dyn BroadcastProvider>,
    pub keys: Arc<dyn KeyMaterialProvider>,
    pub deriver: Arc<dyn AddressDeriver>,
}

/// Runs sends end to end
pub struct SendOrchestrator {
    config: EngineConfig,
    network: Network,
    utxo_provider: Arc<dyn UtxoProvider>,
    key_provider: Arc<dyn KeyMaterialProvider>,
    deriver: Arc<dyn AddressDeriver>,
    fee_estimator: FeeEstimator,
    selector: UtxoSelector,
    builder: TransactionBuilder,
    signer: Signer,
    analyzer: SecurityAnalyzer,
    broadcaster: Broadcaster,
    tracker: Arc<StatusTracker>,
    in_flight: Mutex<Option<u64>>,
    attempts: AtomicU64,
    last_request: Mutex<Option<SendRequest>>,
}

/// Clears the in-flight slot when the attempt ends, including when the send
/// future is dropped mid-stage
struct InFlight<'a> {
    slot: &'a Mutex<Option<u64>>,
    attempt: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if *slot == Some(self.attempt) {
            *slot = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SendOrchestrator {
    /// Wire an orchestrator from a validated configuration
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let network = config.network()?;

        let fee_estimator = FeeEstimator::new(
            collaborators.fees,
            network,
            config.cache_ttl(),
            config.fee_fetch_timeout(),
        );
        let broadcaster = Broadcaster::new(collaborators.broadcast, config.broadcast_timeout());
        let analyzer = SecurityAnalyzer::new(config.security.clone());

        Ok(Self {
            network,
            utxo_provider: collaborators.utxos,
            key_provider: collaborators.keys,
            deriver: collaborators.deriver,
            fee_estimator,
            selector: UtxoSelector::new(),
            builder: TransactionBuilder::new(),
            signer: Signer::new(),
            analyzer,
            broadcaster,
            tracker: Arc::new(StatusTracker::new()),
            in_flight: Mutex::new(None),
            attempts: AtomicU64::new(0),
            last_request: Mutex::new(None),
            config,
        })
    }

    /// Publish selection outcomes to `event_bus`
    pub fn with_event_bus(mut self, event_bus: Arc<SelectionEventBus>) -> Self {
        self.selector = UtxoSelector::with_event_bus(event_bus);
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tracker(&self) -> Arc<StatusTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn fee_estimator(&self) -> &FeeEstimator {
        &self.fee_estimator
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Run a send from the beginning
    pub async fn send(&self, request: SendRequest) -> SendResult<SendOutcome> {
        let guard = self.begin()?;
        let attempt = guard.attempt;

        *lock(&self.last_request) = Some(request.clone());
        self.tracker.reset();

        log_transaction(
            LogLevel::Info,
            "send_started",
            Some(json!({
                "attempt": attempt,
                "recipient": request.recipient,
                "amount_sats": request.amount_sats,
                "sources": request.source_addresses.len(),
            })),
        );

        let result = self.run(attempt, &request).await;

        match &result {
            Ok(outcome) => log_transaction(
                LogLevel::Info,
                "send_completed",
                Some(json!({ "attempt": attempt, "txid": outcome.txid })),
            ),
            Err(error) => {
                if self.is_current(attempt) {
                    if let Err(e) = self.tracker.fail(error.clone()) {
                        log::debug!("Tracker already terminal: {}", e);
                    }
                }
                log_transaction(
                    LogLevel::Warn,
                    "send_failed",
                    Some(json!({ "attempt": attempt, "error": error.context() })),
                );
            }
        }

        drop(guard);
        result
    }

    /// Replay the last request from the beginning
    pub async fn retry(&self) -> SendResult<SendOutcome> {
        let request = lock(&self.last_request)
            .clone()
            .ok_or(SendError::Transaction(TransactionErrorKind::NoPreviousAttempt))?;
        log::info!("Retrying last send");
        self.send(request).await
    }

    /// Abandon the in-flight send, if any
    ///
    /// The tracker reports the cancellation to subscribers and is then reset.
    /// A transaction the network already accepted stays accepted.
    pub fn cancel(&self) -> bool {
        let cancelled = lock(&self.in_flight).take();
        if let Some(attempt) = cancelled {
            log::info!("Cancelling send attempt {}", attempt);
            if let Err(e) = self
                .tracker
                .fail(SendError::Transaction(TransactionErrorKind::Cancelled))
            {
                log::debug!("Tracker already terminal: {}", e);
            }
        }
        self.tracker.reset();
        cancelled.is_some()
    }

    fn begin(&self) -> SendResult<InFlight<'_>> {
        let mut slot = lock(&self.in_flight);
        if slot.is_some() {
            return Err(SendError::Transaction(TransactionErrorKind::AlreadyInProgress));
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(attempt);
        Ok(InFlight {
            slot: &self.in_flight,
            attempt,
        })
    }

    fn is_current(&self, attempt: u64) -> bool {
        *lock(&self.in_flight) == Some(attempt)
    }

    fn ensure_current(&self, attempt: u64) -> SendResult<()> {
        if self.is_current(attempt) {
            Ok(())
        } else {
            Err(SendError::Transaction(TransactionErrorKind::Cancelled))
        }
    }

    fn enter(&self, attempt: u64, stage: TransactionStage, detail: Option<&str>) -> SendResult<()> {
        self.ensure_current(attempt)?;
        self.tracker.advance(stage, detail).map_err(|e| {
            log::debug!("Stage {:?} rejected by tracker: {}", stage, e);
            SendError::Transaction(TransactionErrorKind::Cancelled)
        })
    }

    async fn run(&self, attempt: u64, request: &SendRequest) -> SendResult<SendOutcome> {
        let mut warnings = Vec::new();

        self.enter(attempt, TransactionStage::ValidatingInputs, None)?;
        let own_addresses = self.validate_request(request)?;
        let fee_rate = self.resolve_fee_rate(request.fee, &mut warnings).await?;

        let detail = format!("{} address(es)", request.source_addresses.len());
        self.enter(attempt, TransactionStage::FetchingUtxos, Some(&detail))?;
        let utxos = self.fetch_utxos(attempt, &request.source_addresses).await?;

        self.enter(attempt, TransactionStage::SelectingUtxos, None)?;
        let selection = self.selector.select(
            &utxos,
            request.amount_sats,
            fee_rate,
            &self.config.selection.options(),
        )?;

        self.enter(attempt, TransactionStage::EstimatingFees, None)?;
        let inputs = self.attach_public_keys(&selection.selected_utxos)?;
        let payments = vec![TransactionOutput::new(
            request.recipient.trim(),
            request.amount_sats,
        )];
        let wallet = WalletContext {
            network: self.network,
            own_addresses,
            change_address: selection
                .has_change()
                .then(|| request.change_address.trim().to_string()),
        };
        let security_report = self.check_security(&inputs, &payments, &selection, &wallet, request)?;
        warnings.extend(security_report.warnings.iter().cloned());

        self.enter(attempt, TransactionStage::BuildingTransaction, None)?;
        let (unsigned, fee_details) = self.builder.build(
            &inputs,
            &payments,
            fee_rate,
            request.change_address.trim(),
            self.network,
        )?;
        if fee_details.fee_sats != selection.total_fee_sats {
            log::warn!(
                "Build fee {} differs from selection estimate {}",
                fee_details.fee_sats,
                selection.total_fee_sats
            );
            warnings.push(format!(
                "Fee recalculated to {} sats (estimated {} sats during coin selection)",
                fee_details.fee_sats, selection.total_fee_sats
            ));
        }

        self.enter(attempt, TransactionStage::SigningTransaction, None)?;
        let seed_phrase = self.key_provider.seed_phrase().await?;
        self.ensure_current(attempt)?;
        let signed = self.signer.sign(&unsigned, &seed_phrase, self.network);
        drop(seed_phrase);
        let signed = signed?;
        signed.verify_against(&unsigned)?;

        self.enter(attempt, TransactionStage::Broadcasting, None)?;
        let txid = self.broadcaster.broadcast(&signed.hex).await?;
        if txid != signed.txid {
            log::warn!(
                "Network reported txid {} for {}",
                sanitize_for_logging(&txid),
                sanitize_for_logging(&signed.txid)
            );
            warnings.push(format!(
                "Network reported txid {} but the signed transaction hashes to {}",
                txid, signed.txid
            ));
        }

        // Accepted by the network: the outcome stands from here on
        if self.is_current(attempt) {
            let recorded = self
                .tracker
                .advance(TransactionStage::Confirming, Some(&txid))
                .and_then(|_| self.tracker.complete(&txid));
            if let Err(e) = recorded {
                log::debug!("Could not record completion: {}", e);
            }
        } else {
            log::warn!(
                "Send was cancelled after broadcast; {} is on the network",
                sanitize_for_logging(&txid)
            );
        }

        Ok(SendOutcome {
            txid,
            fee_rate,
            fee_details,
            selection,
            security_report,
            warnings,
        })
    }

    /// Check recipient, amount and addresses; returns the wallet's own addresses
    fn validate_request(&self, request: &SendRequest) -> SendResult<Vec<String>> {
        let recipient = validate_address(&request.recipient, self.network)?;
        validate_amount(request.amount_sats)?;
        validate_address(&request.change_address, self.network)?;

        if request.source_addresses.is_empty() {
            return Err(SendError::Transaction(TransactionErrorKind::SelectionFailed(
                "No source addresses to spend from".to_string(),
            )));
        }
        for source in &request.source_addresses {
            validate_address(&source.address, self.network)?;
        }

        let own_addresses: Vec<String> = request
            .source_addresses
            .iter()
            .map(|s| s.address.trim().to_string())
            .chain(std::iter::once(request.change_address.trim().to_string()))
            .collect();
        check_not_self_send(&recipient, &own_addresses)?;

        Ok(own_addresses)
    }

    async fn resolve_fee_rate(
        &self,
        choice: FeeChoice,
        warnings: &mut Vec<String>,
    ) -> SendResult<Decimal> {
        let rates = self.fee_estimator.get_rates().await;
        match rates.source {
            FeeSource::Network => {}
            FeeSource::Cached => warnings.push("Using previously fetched fee rates".to_string()),
            FeeSource::Fallback => warnings.push("Using default fee rates".to_string()),
        }

        match choice {
            FeeChoice::Tier(tier) => Ok(rates.rate_for(tier)),
            FeeChoice::Custom(rate) => {
                validate_custom_rate(rate, &rates)?;
                warnings.extend(custom_rate_warnings(rate, &rates));
                Ok(rate)
            }
        }
    }

    /// Fetch all source addresses concurrently and merge the results
    async fn fetch_utxos(&self, attempt: u64, sources: &[SourceAddress]) -> SendResult<Vec<Utxo>> {
        let total = sources.len();
        let done = AtomicUsize::new(0);

        let fetches = sources.iter().map(|source| {
            let done = &done;
            async move {
                let result = self.fetch_address(source).await;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if self.is_current(attempt) {
                    let message = format!("Fetched address {} of {}", finished, total);
                    if let Err(e) = self.tracker.update_sub_progress(finished, total, &message) {
                        log::debug!("Sub-progress dropped: {}", e);
                    }
                }
                result
            }
        });

        let mut utxos = Vec::new();
        for result in join_all(fetches).await {
            utxos.extend(result?);
        }

        log::debug!("Fetched {} UTXOs from {} address(es)", utxos.len(), total);
        Ok(utxos)
    }

    async fn fetch_address(&self, source: &SourceAddress) -> SendResult<Vec<Utxo>> {
        let max_attempts = self.config.network_io.max_fetch_attempts.max(1);
        let mut tries = 0;

        loop {
            tries += 1;
            let fetched = tokio::time::timeout(
                self.config.utxo_fetch_timeout(),
                self.utxo_provider.get_utxos(&source.address),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout));

            match fetched {
                Ok(raw) => {
                    return Ok(raw
                        .into_iter()
                        .filter(|r| r.value_sats > 0)
                        .map(|r| utxo_from_raw(r, source))
                        .collect())
                }
                Err(e) if e.is_transient() && tries < max_attempts => {
                    log::warn!(
                        "UTXO fetch for {} failed ({}), attempt {} of {}",
                        sanitize_for_logging(&source.address),
                        e,
                        tries,
                        max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn attach_public_keys(&self, selected: &[Utxo]) -> SendResult<Vec<Utxo>> {
        selected
            .iter()
            .map(|utxo| -> SendResult<Utxo> {
                let path = utxo.derivation_path.as_deref().ok_or_else(|| {
                    SendError::Transaction(TransactionErrorKind::BuildFailed(format!(
                        "{} has no derivation path",
                        utxo.outpoint_string()
                    )))
                })?;
                let public_key = self.deriver.public_key_for(path)?;
                Ok(Utxo {
                    public_key: Some(public_key),
                    ..utxo.clone()
                })
            })
            .collect()
    }

    fn check_security(
        &self,
        inputs: &[Utxo],
        payments: &[TransactionOutput],
        selection: &SelectionResult,
        wallet: &WalletContext,
        request: &SendRequest,
    ) -> SendResult<SecurityReport> {
        let input_types: Vec<AddressType> = inputs.iter().map(|u| u.address_type).collect();
        let output_count = if selection.has_change() { 2 } else { 1 };
        let size = estimate_vsize(&input_types, output_count);

        let report = self
            .analyzer
            .analyze(inputs, payments, selection.total_fee_sats, size, wallet);

        if !report.is_secure {
            if report.failed(checks::SAFETY_CEILING) {
                return Err(SendError::Security(
                    SecurityErrorKind::AmountExceedsSafetyCeiling {
                        amount: request.amount_sats,
                        ceiling: self.config.security.safety_ceiling_sats,
                    },
                ));
            }
            return Err(SendError::Security(SecurityErrorKind::BlockedByRiskCheck {
                blockers: report.blockers.clone(),
            }));
        }

        let confirmation =
            self.analyzer
                .requires_confirmation(payments, selection.total_fee_sats, wallet);
        if confirmation.required && !request.confirmed {
            return Err(SendError::Security(SecurityErrorKind::ConfirmationRequired {
                reasons: confirmation.reasons,
            }));
        }

        Ok(report)
    }
}

fn utxo_from_raw(raw: RawUtxo, source: &SourceAddress) -> Utxo {
    Utxo {
        txid: raw.txid,
        output_index: raw.vout,
        value_sats: raw.value_sats,
        confirmed: raw.status.confirmed,
        address: source.address.trim().to_string(),
        derivation_path: Some(source.derivation_path.clone()),
        address_type: source.address_type,
        address_index: source.address_index,
        block_height: raw.status.block_height,
        public_key: None,
    }
}
