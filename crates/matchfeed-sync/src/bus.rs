//! Refresh broadcast: "refresh requested" and "refresh completed" signals.
//!
//! The bus is an ordinary value handed to every subscription; cloning it
//! shares the same channels. There is no deduplication: each mounted
//! subscription reacts to each request on its own.

use matchfeed_core::SubscriptionId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Completion report of one subscription's snapshot fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub subscription: SubscriptionId,
    pub label: String,
    pub success: bool,
    pub error: Option<String>,
    /// Entities held after the fetch resolved.
    pub matches: usize,
}

#[derive(Debug, Clone)]
pub struct RefreshBus {
    requests: broadcast::Sender<()>,
    completions: broadcast::Sender<RefreshOutcome>,
}

impl RefreshBus {
    pub fn new(capacity: usize) -> Self {
        let (requests, _) = broadcast::channel(capacity.max(1));
        let (completions, _) = broadcast::channel(capacity.max(1));
        Self {
            requests,
            completions,
        }
    }

    /// Ask every listening subscription to re-run its snapshot fetch.
    /// Returns the number of listeners reached.
    pub fn request_refresh(&self) -> usize {
        self.requests.send(()).unwrap_or(0)
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<()> {
        self.requests.subscribe()
    }

    pub fn report_completion(&self, outcome: RefreshOutcome) -> usize {
        self.completions.send(outcome).unwrap_or(0)
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.completions.subscribe()
    }
}

impl Default for RefreshBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
