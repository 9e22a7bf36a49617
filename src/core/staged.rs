//! Pending/confirmed staging for optimistic writes.
//!
//! A [`StagedList`] holds the last snapshot delivered by a live subscription
//! plus locally staged items the backend has not echoed yet. Staged items stay
//! `Pending` until a snapshot containing their key arrives; a failed write is
//! dropped from the pending set instead of lingering as a phantom entry.

use serde::Serialize;

/// Anything with a stable identity that survives the round trip to the store.
pub trait Keyed {
    /// Stable id
    fn key(&self) -> &str;
}

impl Keyed for crate::entities::message::Model {
    fn key(&self) -> &str {
        &self.id
    }
}

/// One visible row of a staged list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "item", rename_all = "snake_case")]
pub enum Entry<T> {
    /// Written locally, not yet confirmed by a snapshot
    Pending(T),
    /// Present in the latest snapshot
    Confirmed(T),
}

impl<T> Entry<T> {
    /// The wrapped item.
    pub const fn item(&self) -> &T {
        match self {
            Self::Pending(item) | Self::Confirmed(item) => item,
        }
    }

    /// Whether the entry still waits for confirmation.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Confirmed snapshot plus pending local writes.
#[derive(Debug, Clone)]
pub struct StagedList<T> {
    confirmed: Vec<T>,
    pending: Vec<T>,
}

impl<T> Default for StagedList<T> {
    fn default() -> Self {
        Self {
            confirmed: Vec::new(),
            pending: Vec::new(),
        }
    }
}

impl<T: Keyed + Clone> StagedList<T> {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a local write. A key that is already confirmed is ignored.
    pub fn stage(&mut self, item: T) {
        let key = item.key();
        if self.confirmed.iter().any(|c| c.key() == key) {
            return;
        }
        self.pending.retain(|p| p.key() != key);
        self.pending.push(item);
    }

    /// Replaces the confirmed set and promotes every pending item it contains.
    pub fn reconcile(&mut self, snapshot: Vec<T>) {
        self.pending
            .retain(|p| !snapshot.iter().any(|c| c.key() == p.key()));
        self.confirmed = snapshot;
    }

    /// Drops a pending write that the store rejected. Returns false if it was not pending.
    pub fn fail(&mut self, key: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.key() != key);
        self.pending.len() != before
    }

    /// Confirmed entries in snapshot order followed by pending ones in staging order.
    pub fn entries(&self) -> Vec<Entry<T>> {
        self.confirmed
            .iter()
            .cloned()
            .map(Entry::Confirmed)
            .chain(self.pending.iter().cloned().map(Entry::Pending))
            .collect()
    }

    /// Number of writes still waiting for confirmation.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether `key` is staged and unconfirmed.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.iter().any(|p| p.key() == key)
    }
}
