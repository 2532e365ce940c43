//! UTXO selection module
//!
//! Chooses which unspent outputs fund a send. The selection determines the
//! transaction fee, whether a change output is created, and how the wallet's
//! UTXO set evolves over time.
//!
//! # Module Structure
//!
//! - `types.rs` - Options, result and error types
//! - `selector.rs` - The greedy selector and its fee feedback loop
//!
//! Selection outcomes are published on an optional
//! [`SelectionEventBus`](crate::events::SelectionEventBus).

pub mod selector;
pub mod types;

pub use selector::UtxoSelector;
pub use types::{SelectionError, SelectionOptions, SelectionResult};
