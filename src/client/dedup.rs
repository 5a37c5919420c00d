use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::debug;

/// How seen identifiers are forgotten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Keep everything until the consumer has been idle, then forget it
    /// all at once.
    #[default]
    ClearOnIdle,
    /// Forget each identifier on its own once it is older than the given
    /// age. Idle periods leave the history alone.
    Expiring(Duration),
}

/// Remembers the identifiers (correlation ids, or whole bodies) a consumer
/// has already seen.
pub struct DedupFilter {
    policy: DedupPolicy,
    /// Identifier to the instant it stops counting.
    seen: HashMap<Vec<u8>, Option<Instant>>,
    expiries: BinaryHeap<(Reverse<Instant>, Vec<u8>)>,
}

impl DedupFilter {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            seen: HashMap::new(),
            expiries: BinaryHeap::new(),
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Returns true if `id` was seen before. Otherwise remembers it and
    /// returns false.
    pub fn is_duplicate(&mut self, id: &[u8]) -> bool {
        self.remove_expired();
        if self.seen.contains_key(id) {
            return true;
        }
        self.remember(id);
        false
    }

    pub fn remember(&mut self, id: &[u8]) {
        let expiry = match self.policy {
            DedupPolicy::ClearOnIdle => None,
            DedupPolicy::Expiring(ttl) => {
                let expiry = Instant::now() + ttl;
                self.expiries.push((Reverse(expiry), id.to_vec()));
                Some(expiry)
            }
        };
        self.seen.insert(id.to_vec(), expiry);
    }

    /// Called when a message arrives after an idle gap. Only the
    /// clear-on-idle policy forgets anything here.
    pub fn on_idle(&mut self) -> bool {
        match self.policy {
            DedupPolicy::ClearOnIdle if !self.seen.is_empty() => {
                debug!("forgetting {} seen ids after idle gap", self.seen.len());
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Forgets everything.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.expiries.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn remove_expired(&mut self) {
        let now = Instant::now();
        while self
            .expiries
            .peek()
            .map_or(false, |(expiry, _)| expiry.0 <= now)
        {
            let Some((Reverse(expiry), id)) = self.expiries.pop() else {
                break;
            };
            // a later remember() of the same id pushed a newer expiry
            if self.seen.get(&id) == Some(&Some(expiry)) {
                self.seen.remove(&id);
            }
        }
    }
}
