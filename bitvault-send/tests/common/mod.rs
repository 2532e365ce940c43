//! Shared fixtures and mock collaborators for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::{Network, Transaction};
use bitvault_send::logging::{self, LogConfig, LogLevel};
use bitvault_send::orchestrator::{Collaborators, FeeChoice, SendRequest, SourceAddress};
use bitvault_send::providers::{
    AddressDeriver, BroadcastProvider, FeeRateProvider, KeyMaterialProvider, ProviderError,
    RawUtxo, UtxoProvider, UtxoStatus, XpubAddressDeriver,
};
use bitvault_send::types::{AddressType, SensitiveString, Utxo};
use bitvault_send::FeeTier;
use lazy_static::lazy_static;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

/// Standard BIP-39 test mnemonic
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

static GLOBAL_TEST_INIT: Once = Once::new();

// Derived once per test binary
lazy_static! {
    static ref RECIPIENT: String = address_at(&deriver_for(AddressType::NativeSegwit, 1), false, 0);
    static ref CHANGE_ADDRESS: String = address_at(&deriver(), true, 0);
}

/// Initialize logging once for the whole test binary
pub fn init_test_environment() {
    GLOBAL_TEST_INIT.call_once(|| {
        let config = LogConfig {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            json_format: false,
        };
        // Tests must run even if another logger got there first
        let _ = logging::init(&config);
    });
}

pub fn seed_phrase() -> SensitiveString {
    SensitiveString::new(TEST_MNEMONIC)
}

/// Native segwit testnet deriver for account 0
pub fn deriver() -> XpubAddressDeriver {
    deriver_for(AddressType::NativeSegwit, 0)
}

pub fn deriver_for(address_type: AddressType, account: u32) -> XpubAddressDeriver {
    XpubAddressDeriver::from_mnemonic(&seed_phrase(), address_type, Network::Testnet, account)
        .expect("test mnemonic derives")
}

pub fn address_at(deriver: &XpubAddressDeriver, change: bool, index: u32) -> String {
    deriver
        .address_for(&deriver.path_for(change, index))
        .expect("address derives")
        .to_string()
}

/// A testnet address the wallet does not own
pub fn recipient() -> String {
    RECIPIENT.clone()
}

pub fn change_address() -> String {
    CHANGE_ADDRESS.clone()
}

pub fn fake_txid(n: u8) -> String {
    format!("{:02x}", n).repeat(32)
}

/// A confirmed UTXO on the external chain at `index`, public key attached
pub fn wallet_utxo(deriver: &XpubAddressDeriver, index: u32, value_sats: u64, n: u8) -> Utxo {
    let path = deriver.path_for(false, index);
    Utxo {
        txid: fake_txid(n),
        output_index: 0,
        value_sats,
        confirmed: true,
        address: address_at(deriver, false, index),
        derivation_path: Some(path.clone()),
        address_type: deriver.address_type(),
        address_index: index,
        block_height: Some(2_500_000),
        public_key: Some(deriver.public_key_for(&path).expect("public key derives")),
    }
}

/// A UTXO without derivation metadata, for selection-only tests
pub fn plain_utxo(value_sats: u64, address_type: AddressType, n: u8) -> Utxo {
    Utxo {
        txid: fake_txid(n),
        output_index: 0,
        value_sats,
        confirmed: true,
        address: format!("addr-{}", n),
        derivation_path: None,
        address_type,
        address_index: 0,
        block_height: None,
        public_key: None,
    }
}

pub fn raw_utxo(n: u8, value_sats: u64) -> RawUtxo {
    RawUtxo {
        txid: fake_txid(n),
        vout: 0,
        value_sats,
        status: UtxoStatus {
            confirmed: true,
            block_height: Some(2_500_000),
            block_time: Some(1_700_000_000),
        },
    }
}

pub fn source_address(deriver: &XpubAddressDeriver, index: u32) -> SourceAddress {
    SourceAddress {
        address: address_at(deriver, false, index),
        derivation_path: deriver.path_for(false, index),
        address_type: deriver.address_type(),
        address_index: index,
    }
}

pub fn send_request(amount_sats: u64, sources: Vec<SourceAddress>) -> SendRequest {
    SendRequest {
        recipient: recipient(),
        amount_sats,
        fee: FeeChoice::Tier(FeeTier::Normal),
        source_addresses: sources,
        change_address: change_address(),
        confirmed: false,
    }
}

pub fn network_estimates() -> HashMap<u32, f64> {
    let mut estimates = HashMap::new();
    estimates.insert(1, 25.0);
    estimates.insert(3, 12.0);
    estimates.insert(6, 6.0);
    estimates.insert(144, 1.5);
    estimates
}

/// UTXO source backed by a map, with optional scripted failures and delay
#[derive(Default)]
pub struct MockUtxoProvider {
    pub utxos: HashMap<String, Vec<RawUtxo>>,
    pub failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockUtxoProvider {
    pub fn with(address: &str, utxos: Vec<RawUtxo>) -> Self {
        let mut map = HashMap::new();
        map.insert(address.to_string(), utxos);
        Self {
            utxos: map,
            ..Default::default()
        }
    }

    pub fn add(mut self, address: &str, utxos: Vec<RawUtxo>) -> Self {
        self.utxos.insert(address.to_string(), utxos);
        self
    }

    pub fn failing_first(self, address: &str, errors: Vec<ProviderError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(address.to_string(), errors.into());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UtxoProvider for MockUtxoProvider {
    async fn get_utxos(&self, address: &str) -> Result<Vec<RawUtxo>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }
        Ok(self.utxos.get(address).cloned().unwrap_or_default())
    }
}

/// Fee source returning fixed estimates, or failing
pub struct MockFeeProvider {
    pub estimates: Option<HashMap<u32, f64>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockFeeProvider {
    pub fn new(estimates: HashMap<u32, f64>) -> Self {
        Self {
            estimates: Some(estimates),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            estimates: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            estimates: Some(network_estimates()),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeRateProvider for MockFeeProvider {
    async fn get_fee_estimates(&self) -> Result<HashMap<u32, f64>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.estimates
            .clone()
            .ok_or_else(|| ProviderError::Unavailable("fee service down".to_string()))
    }
}

enum BroadcastMode {
    Echo,
    Fixed(Result<String, ProviderError>),
}

/// Broadcast sink that records what it was given
pub struct MockBroadcastProvider {
    mode: BroadcastMode,
    pub submitted: Mutex<Vec<String>>,
}

impl MockBroadcastProvider {
    /// Accept everything, answering with the transaction's real txid
    pub fn echo() -> Self {
        Self {
            mode: BroadcastMode::Echo,
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(response: Result<String, ProviderError>) -> Self {
        Self {
            mode: BroadcastMode::Fixed(response),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl BroadcastProvider for MockBroadcastProvider {
    async fn submit(&self, raw_tx_hex: &str) -> Result<String, ProviderError> {
        self.submitted.lock().unwrap().push(raw_tx_hex.to_string());
        match &self.mode {
            BroadcastMode::Echo => {
                let bytes = hex::decode(raw_tx_hex).map_err(|e| ProviderError::Rejected(e.to_string()))?;
                let tx: Transaction =
                    deserialize(&bytes).map_err(|e| ProviderError::Rejected(e.to_string()))?;
                Ok(tx.txid().to_string())
            }
            BroadcastMode::Fixed(response) => response.clone(),
        }
    }
}

/// Key material source that counts how often the seed was requested
pub struct MockKeyProvider {
    phrase: Option<String>,
    pub calls: AtomicUsize,
}

impl MockKeyProvider {
    pub fn new() -> Self {
        Self {
            phrase: Some(TEST_MNEMONIC.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn locked() -> Self {
        Self {
            phrase: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyMaterialProvider for MockKeyProvider {
    async fn seed_phrase(&self) -> Result<SensitiveString, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.phrase
            .as_deref()
            .map(SensitiveString::new)
            .ok_or(ProviderError::WalletLocked)
    }
}

/// Handles to the mocks behind a set of collaborators
pub struct Mocks {
    pub utxos: Arc<MockUtxoProvider>,
    pub fees: Arc<MockFeeProvider>,
    pub broadcast: Arc<MockBroadcastProvider>,
    pub keys: Arc<MockKeyProvider>,
}

impl Mocks {
    pub fn new(utxos: MockUtxoProvider) -> Self {
        Self {
            utxos: Arc::new(utxos),
            fees: Arc::new(MockFeeProvider::new(network_estimates())),
            broadcast: Arc::new(MockBroadcastProvider::echo()),
            keys: Arc::new(MockKeyProvider::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            utxos: self.utxos.clone(),
            fees: self.fees.clone(),
            broadcast: self.broadcast.clone(),
            keys: self.keys.clone(),
            deriver: Arc::new(deriver()),
        }
    }
}
