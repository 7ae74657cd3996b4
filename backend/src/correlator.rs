//! Request/response correlation for the client.
//!
//! Every outgoing request carries a fresh random sequence token; the server
//! echoes it on the reply. The correlator maps tokens to one-shot waiters so
//! replies can be matched no matter how they interleave with pushed events.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::auth::generate_sequence;
use crate::protocol::{Action, Response};

/// How long a caller waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Entries older than this are swept on the next registration.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PendingEntry {
    action: Action,
    waiter: oneshot::Sender<Response>,
    created_at: Instant,
}

/// Outstanding requests keyed by sequence token.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a token and a waiter for it. Stale entries are dropped first.
    pub fn register(&self, action: Action) -> (String, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries();

        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.created_at) < STALE_AFTER);
        if entries.len() != before {
            debug!(swept = before - entries.len(), "Swept stale requests");
        }

        let mut sequence = generate_sequence();
        while entries.contains_key(&sequence) {
            sequence = generate_sequence();
        }
        entries.insert(
            sequence.clone(),
            PendingEntry {
                action,
                waiter: tx,
                created_at: now,
            },
        );
        (sequence, rx)
    }

    /// Hand a reply to its waiter. Returns false when nobody is waiting.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(entry) = self.entries().remove(&response.sequence) else {
            warn!(sequence = %response.sequence, "Reply for unknown request");
            return false;
        };
        debug!(action = %entry.action, sequence = %response.sequence, "Reply matched");
        entry.waiter.send(response).is_ok()
    }

    /// Forget a request whose caller gave up.
    pub fn abandon(&self, sequence: &str) {
        self.entries().remove(sequence);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
