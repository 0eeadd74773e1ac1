use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    pending: HashSet<String>,
}

/// Coalescing FIFO of symbols awaiting evaluation
///
/// At most one pending entry per symbol: a candle close for a symbol that is
/// already queued is absorbed, so a slow decision worker never builds a
/// backlog of stale evaluations.
#[derive(Default)]
pub struct EvaluationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl EvaluationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Critical sections never panic; recover the data if one ever did
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an evaluation; returns false when one was already pending
    pub fn request(&self, symbol: &str) -> bool {
        let queued = {
            let mut state = self.lock();
            if state.pending.insert(symbol.to_string()) {
                state.order.push_back(symbol.to_string());
                true
            } else {
                false
            }
        };
        if queued {
            self.notify.notify_one();
        } else {
            tracing::debug!(symbol = %symbol, "Evaluation already pending, coalesced");
        }
        queued
    }

    pub fn try_next(&self) -> Option<String> {
        let mut state = self.lock();
        let symbol = state.order.pop_front()?;
        state.pending.remove(&symbol);
        Some(symbol)
    }

    /// Wait for the next symbol to evaluate
    pub async fn next(&self) -> String {
        loop {
            if let Some(symbol) = self.try_next() {
                return symbol;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
