//! Local events bus carrying committed event batches to the network.
//!
//! Single producer (the commit path), multiple subscribers (the network
//! connector, plus anything else that wants the raw outbound payloads).
//! Delivery is lossless and in commit order: each subscriber has its own
//! unbounded queue, and batches are never coalesced. `discard` ends all
//! subscriptions and rejects further sends.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::network::{ThreadId, Token};

/// A committed event batch as published to the thread network.
#[derive(Debug, Clone)]
pub struct LocalEvent {
    /// Thread the batch belongs to.
    pub thread_id: ThreadId,
    /// Auth token of the committing transaction, for the network append.
    pub token: Option<Token>,
    /// Codec-encoded event payload; appended verbatim to the local log.
    pub payload: Vec<u8>,
}

struct BusState {
    subscribers: Vec<mpsc::UnboundedSender<LocalEvent>>,
    discarded: bool,
}

/// Multi-subscriber channel for locally committed event batches.
pub(crate) struct LocalEventsBus {
    state: Mutex<BusState>,
}

impl LocalEventsBus {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                discarded: false,
            }),
        }
    }

    /// Register a new subscriber receiving every batch from now on.
    pub(crate) fn subscribe(&self) -> Result<LocalEventsSubscription> {
        let mut state = self.state.lock();
        if state.discarded {
            return Err(Error::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        Ok(LocalEventsSubscription { rx })
    }

    /// Deliver `event` to every live subscriber, pruning dead ones.
    pub(crate) fn publish(&self, event: LocalEvent) -> Result<()> {
        let mut state = self.state.lock();
        if state.discarded {
            return Err(Error::Closed);
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    /// Terminate all subscriptions and reject further sends.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        state.discarded = true;
        state.subscribers.clear();
    }
}

/// Receiving side of the local events bus.
pub struct LocalEventsSubscription {
    rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl LocalEventsSubscription {
    /// Next committed batch, or `None` once the bus is discarded.
    pub async fn recv(&mut self) -> Option<LocalEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(payload: &[u8]) -> LocalEvent {
        LocalEvent {
            thread_id: ThreadId::random(),
            token: None,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_batches_in_commit_order() {
        let bus = LocalEventsBus::new();
        let mut sub = bus.subscribe().expect("subscribe should succeed");

        bus.publish(event(b"one")).expect("publish should succeed");
        bus.publish(event(b"two")).expect("publish should succeed");

        assert_eq!(sub.recv().await.expect("batch expected").payload, b"one");
        assert_eq!(sub.recv().await.expect("batch expected").payload, b"two");
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_batch() {
        let bus = LocalEventsBus::new();
        let mut first = bus.subscribe().expect("subscribe should succeed");
        let mut second = bus.subscribe().expect("subscribe should succeed");

        bus.publish(event(b"batch")).expect("publish should succeed");

        assert_eq!(first.recv().await.expect("batch expected").payload, b"batch");
        assert_eq!(
            second.recv().await.expect("batch expected").payload,
            b"batch"
        );
    }

    #[tokio::test]
    async fn discard_ends_subscriptions_and_rejects_sends() {
        let bus = LocalEventsBus::new();
        let mut sub = bus.subscribe().expect("subscribe should succeed");

        bus.discard();
        assert!(sub.recv().await.is_none(), "subscription must terminate");
        assert!(matches!(bus.publish(event(b"late")), Err(Error::Closed)));
        assert!(matches!(bus.subscribe(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = LocalEventsBus::new();
        let sub = bus.subscribe().expect("subscribe should succeed");
        drop(sub);
        bus.publish(event(b"batch"))
            .expect("publishing past a dropped subscriber should succeed");
    }
}
