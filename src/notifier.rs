//! Post-commit state-change notifications.
//!
//! After a successful reduction the database fans out a batch of
//! [`Action`] summaries to every listener. Fan-out is non-blocking by
//! contract: a listener that does not drain its channel promptly loses
//! batches rather than stalling committers.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What a reduced event did, as observed by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// A new instance was inserted.
    Create,
    /// An existing instance was replaced.
    Save,
    /// An existing instance was removed.
    Delete,
}

/// Post-reduction summary of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Collection the instance belongs to.
    pub collection: String,
    /// What happened.
    pub kind: ActionType,
    /// Instance that was touched.
    pub instance_id: String,
}

/// Per-listener queue depth. A listener more than this many batches
/// behind starts losing the oldest unread ones.
const LISTENER_BUFFER: usize = 16;

struct NotifierState {
    listeners: Vec<mpsc::Sender<Vec<Action>>>,
    closed: bool,
}

/// Subscription manager for post-commit action batches.
pub(crate) struct StateChangeNotifier {
    state: Mutex<NotifierState>,
}

impl StateChangeNotifier {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState {
                listeners: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a listener. Returns `None` after the notifier closed.
    pub(crate) fn listen(&self) -> Option<Subscription> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        state.listeners.push(tx);
        Some(Subscription { rx })
    }

    /// Fan `actions` out to all listeners without blocking.
    ///
    /// Slow listeners lose this batch; dropped listeners are pruned.
    pub(crate) fn notify(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.listeners.retain(|tx| {
            match tx.try_send(actions.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("slow state-change listener dropped a batch");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Unregister all listeners; their channels terminate.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }
}

/// A registered state-change listener.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<Action>>,
}

impl Subscription {
    /// Next action batch, or `None` once the notifier closed.
    pub async fn recv(&mut self) -> Option<Vec<Action>> {
        self.rx.recv().await
    }

    /// Unregister this listener.
    pub fn close(self) {}
}
