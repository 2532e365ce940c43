//! Domain events published by coin selection
//!
//! Subscribers register for one event kind (`"selected"`, `"failed"`) or for
//! `"all"` and receive events on a `crossbeam_channel` receiver. Subscribers
//! whose receiver has been dropped are pruned on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Reference to a spent output, safe to hand to UI code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPointInfo {
    pub txid: String,
    pub vout: u32,
}

/// Events emitted by the UTXO selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionEvent {
    /// Inputs were chosen for a transaction
    Selected {
        utxos: Vec<OutPointInfo>,
        target_amount: u64,
        fee_amount: u64,
        change_amount: u64,
    },
    /// No combination of inputs could cover the target
    Failed { required: u64, available: u64 },
}

impl SelectionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SelectionEvent::Selected { .. } => "selected",
            SelectionEvent::Failed { .. } => "failed",
        }
    }
}

/// Channel-based bus for [`SelectionEvent`]s
#[derive(Default)]
pub struct SelectionEventBus {
    subscribers: Mutex<HashMap<String, Vec<Sender<SelectionEvent>>>>,
}

impl SelectionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all selection events
    pub fn subscribe_all(&self) -> Receiver<SelectionEvent> {
        self.subscribe("all")
    }

    /// Subscribe to one kind of event (`"selected"` or `"failed"`), or `"all"`
    pub fn subscribe(&self, event_kind: &str) -> Receiver<SelectionEvent> {
        let (sender, receiver) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(event_kind.to_string())
                .or_insert_with(Vec::new)
                .push(sender);
        }
        receiver
    }

    /// Deliver an event to its kind's subscribers and to `"all"` subscribers
    pub fn publish(&self, event: SelectionEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!("Selection event bus lock poisoned, dropping event");
                return;
            }
        };

        for key in [event.kind(), "all"] {
            if let Some(senders) = subscribers.get_mut(key) {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint() -> OutPointInfo {
        OutPointInfo {
            txid: "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            vout: 0,
        }
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = SelectionEventBus::new();
        let receiver = bus.subscribe("selected");

        let event = SelectionEvent::Selected {
            utxos: vec![outpoint()],
            target_amount: 10000,
            fee_amount: 1000,
            change_amount: 2000,
        };

        bus.publish(event.clone());

        assert_eq!(receiver.recv().unwrap(), event);
    }

    #[test]
    fn test_subscribe_all_receives_every_kind() {
        let bus = SelectionEventBus::new();
        let receiver = bus.subscribe_all();
        let selected_only = bus.subscribe("selected");

        let failed = SelectionEvent::Failed {
            required: 5000,
            available: 1000,
        };
        bus.publish(failed.clone());

        assert_eq!(receiver.try_recv().unwrap(), failed);
        assert!(selected_only.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = SelectionEventBus::new();
        drop(bus.subscribe("failed"));

        bus.publish(SelectionEvent::Failed {
            required: 1,
            available: 0,
        });

        let subscribers = bus.subscribers.lock().unwrap();
        assert!(subscribers.get("failed").map(|s| s.is_empty()).unwrap_or(true));
    }
}
