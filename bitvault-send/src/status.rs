//! Stage-based progress tracking for one send attempt
//!
//! Stages only move forward. `Failed` can be entered from any non-terminal
//! stage; `Completed` and `Failed` are terminal until [`StatusTracker::reset`]
//! starts a new attempt. Subscribers receive every progress entry and the
//! terminal event over a channel.

use crate::error::SendError;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStage {
    Initializing,
    ValidatingInputs,
    FetchingUtxos,
    SelectingUtxos,
    EstimatingFees,
    BuildingTransaction,
    SigningTransaction,
    Broadcasting,
    Confirming,
    Completed,
    Failed,
}

impl TransactionStage {
    /// Fixed progress percentage reported on entering the stage
    pub fn progress(&self) -> u8 {
        match self {
            TransactionStage::Initializing => 5,
            TransactionStage::ValidatingInputs => 10,
            TransactionStage::FetchingUtxos => 20,
            TransactionStage::SelectingUtxos => 35,
            TransactionStage::EstimatingFees => 45,
            TransactionStage::BuildingTransaction => 60,
            TransactionStage::SigningTransaction => 75,
            TransactionStage::Broadcasting => 90,
            TransactionStage::Confirming => 95,
            TransactionStage::Completed => 100,
            TransactionStage::Failed => 0,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            TransactionStage::Initializing => "Preparing transaction",
            TransactionStage::ValidatingInputs => "Validating recipient and amount",
            TransactionStage::FetchingUtxos => "Fetching spendable coins",
            TransactionStage::SelectingUtxos => "Selecting coins",
            TransactionStage::EstimatingFees => "Checking fees and security",
            TransactionStage::BuildingTransaction => "Building transaction",
            TransactionStage::SigningTransaction => "Signing transaction",
            TransactionStage::Broadcasting => "Broadcasting to the network",
            TransactionStage::Confirming => "Waiting for network acceptance",
            TransactionStage::Completed => "Transaction sent",
            TransactionStage::Failed => "Transaction failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStage::Completed | TransactionStage::Failed)
    }

    /// Position in the forward order; `Failed` sits outside it
    fn order(&self) -> Option<u8> {
        let position = match self {
            TransactionStage::Initializing => 0,
            TransactionStage::ValidatingInputs => 1,
            TransactionStage::FetchingUtxos => 2,
            TransactionStage::SelectingUtxos => 3,
            TransactionStage::EstimatingFees => 4,
            TransactionStage::BuildingTransaction => 5,
            TransactionStage::SigningTransaction => 6,
            TransactionStage::Broadcasting => 7,
            TransactionStage::Confirming => 8,
            TransactionStage::Completed => 9,
            TransactionStage::Failed => return None,
        };
        Some(position)
    }

    /// The stage that follows in the forward order
    pub fn next(&self) -> Option<TransactionStage> {
        match self {
            TransactionStage::Initializing => Some(TransactionStage::ValidatingInputs),
            TransactionStage::ValidatingInputs => Some(TransactionStage::FetchingUtxos),
            TransactionStage::FetchingUtxos => Some(TransactionStage::SelectingUtxos),
            TransactionStage::SelectingUtxos => Some(TransactionStage::EstimatingFees),
            TransactionStage::EstimatingFees => Some(TransactionStage::BuildingTransaction),
            TransactionStage::BuildingTransaction => Some(TransactionStage::SigningTransaction),
            TransactionStage::SigningTransaction => Some(TransactionStage::Broadcasting),
            TransactionStage::Broadcasting => Some(TransactionStage::Confirming),
            TransactionStage::Confirming => Some(TransactionStage::Completed),
            TransactionStage::Completed | TransactionStage::Failed => None,
        }
    }
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("Cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionStage,
        to: TransactionStage,
    },

    #[error("Attempt already ended in {0:?}")]
    Terminal(TransactionStage),
}

/// One entry of the append-only history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    pub stage: TransactionStage,
    pub progress: u8,
    pub message: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Current projection of the attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatus {
    pub stage: TransactionStage,
    pub progress: u8,
    pub is_complete: bool,
    pub is_error: bool,
    pub txid: Option<String>,
    pub error: Option<SendError>,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress(ProgressEntry),
    Completed { txid: String },
    Failed { error: SendError },
}

struct TrackerState {
    status: TransactionStatus,
    history: Vec<ProgressEntry>,
    subscribers: Vec<Sender<ProgressEvent>>,
}

impl TrackerState {
    fn fresh(subscribers: Vec<Sender<ProgressEvent>>) -> Self {
        let mut state = Self {
            status: TransactionStatus {
                stage: TransactionStage::Initializing,
                progress: TransactionStage::Initializing.progress(),
                is_complete: false,
                is_error: false,
                txid: None,
                error: None,
            },
            history: Vec::new(),
            subscribers,
        };
        state.record(TransactionStage::Initializing.message().to_string(), None);
        state
    }

    fn record(&mut self, message: String, detail: Option<String>) {
        let entry = ProgressEntry {
            stage: self.status.stage,
            progress: self.status.progress,
            message,
            detail,
            timestamp: Utc::now(),
        };
        self.history.push(entry.clone());
        self.emit(ProgressEvent::Progress(entry));
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    fn ensure_open(&self) -> Result<(), StatusError> {
        if self.status.stage.is_terminal() {
            Err(StatusError::Terminal(self.status.stage))
        } else {
            Ok(())
        }
    }
}

/// State machine for one send attempt
pub struct StatusTracker {
    state: Mutex<TrackerState>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::fresh(Vec::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // A panicking subscriber cannot leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move forward to `stage`
    ///
    /// `Completed` and `Failed` are entered through [`complete`](Self::complete)
    /// and [`fail`](Self::fail).
    pub fn advance(&self, stage: TransactionStage, detail: Option<&str>) -> Result<(), StatusError> {
        let mut state = self.lock();
        state.ensure_open()?;

        let from = state.status.stage;
        let forward = match (from.order(), stage.order()) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        };
        if !forward || stage.is_terminal() {
            return Err(StatusError::InvalidTransition { from, to: stage });
        }

        state.status.stage = stage;
        state.status.progress = stage.progress();
        state.record(stage.message().to_string(), detail.map(str::to_string));
        log::debug!("Send progress: {:?} ({}%)", stage, stage.progress());
        Ok(())
    }

    /// Report progress within the current stage, e.g. "address 3 of 8"
    ///
    /// The interpolated value stays strictly below the next stage's progress
    /// and never decreases.
    pub fn update_sub_progress(
        &self,
        current: usize,
        total: usize,
        message: &str,
    ) -> Result<(), StatusError> {
        let mut state = self.lock();
        state.ensure_open()?;

        let stage = state.status.stage;
        let floor = stage.progress();
        let ceiling = stage.next().map(|s| s.progress()).unwrap_or(floor);

        if total > 0 && ceiling > floor + 1 {
            let span = (ceiling - floor - 1) as usize;
            let step = (span * current.min(total) / total) as u8;
            state.status.progress = state.status.progress.max(floor + step);
        }

        state.record(message.to_string(), Some(format!("{} of {}", current, total)));
        Ok(())
    }

    /// Enter `Completed` with the accepted txid
    pub fn complete(&self, txid: &str) -> Result<(), StatusError> {
        let mut state = self.lock();
        state.ensure_open()?;

        state.status.stage = TransactionStage::Completed;
        state.status.progress = TransactionStage::Completed.progress();
        state.status.is_complete = true;
        state.status.txid = Some(txid.to_string());
        state.record(
            TransactionStage::Completed.message().to_string(),
            Some(txid.to_string()),
        );
        state.emit(ProgressEvent::Completed {
            txid: txid.to_string(),
        });
        Ok(())
    }

    /// Abort the attempt with `error`
    pub fn fail(&self, error: SendError) -> Result<(), StatusError> {
        let mut state = self.lock();
        state.ensure_open()?;

        let failed_in = state.status.stage;
        state.status.stage = TransactionStage::Failed;
        state.status.progress = TransactionStage::Failed.progress();
        state.status.is_error = true;
        state.status.error = Some(error.clone());
        state.record(error.user_message(), Some(error.code()));
        state.emit(ProgressEvent::Failed { error: error.clone() });

        log::warn!("Send failed during {:?}: {}", failed_in, error.code());
        Ok(())
    }

    /// Start a new attempt, keeping subscribers
    pub fn reset(&self) {
        let mut state = self.lock();
        let subscribers = std::mem::take(&mut state.subscribers);
        *state = TrackerState::fresh(subscribers);
    }

    pub fn current(&self) -> TransactionStatus {
        self.lock().status.clone()
    }

    pub fn history(&self) -> Vec<ProgressEntry> {
        self.lock().history.clone()
    }

    /// Receive progress and terminal events from now on
    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = unbounded();
        self.lock().subscribers.push(tx);
        rx
    }
}
