//! Priority queue of deployments awaiting resources
//!
//! Ordered by priority (highest first), then enqueue time, then insertion
//! sequence, so equal-priority entries are served FIFO.

use berth_core::{DeploymentId, Priority, QueueEntry};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

type QueueKey = (Reverse<Priority>, DateTime<Utc>, u64);

fn key_of(entry: &QueueEntry) -> QueueKey {
    (Reverse(entry.priority), entry.enqueued_at, entry.seq)
}

/// Ordered holding area for pending deployments
#[derive(Debug, Default)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<DeploymentId, QueueKey>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deployment; an already-queued deployment keeps its position
    pub fn enqueue(
        &mut self,
        deployment_id: DeploymentId,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
    ) -> QueueEntry {
        if let Some(existing) = self.index.get(&deployment_id).and_then(|k| self.entries.get(k)) {
            return existing.clone();
        }

        self.next_seq += 1;
        let entry = QueueEntry {
            deployment_id,
            priority,
            enqueued_at,
            seq: self.next_seq,
        };
        self.insert(entry.clone());
        entry
    }

    /// Re-insert a persisted entry, keeping its original sequence number
    pub fn restore(&mut self, entry: QueueEntry) {
        if self.index.contains_key(&entry.deployment_id) {
            return;
        }
        self.next_seq = self.next_seq.max(entry.seq);
        self.insert(entry);
    }

    fn insert(&mut self, entry: QueueEntry) {
        let key = key_of(&entry);
        self.index.insert(entry.deployment_id, key);
        self.entries.insert(key, entry);
    }

    pub fn peek_highest(&self) -> Option<&QueueEntry> {
        self.entries.values().next()
    }

    /// Remove an admitted, withdrawn or abandoned deployment
    pub fn remove(&mut self, deployment_id: DeploymentId) -> Option<QueueEntry> {
        let key = self.index.remove(&deployment_id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, deployment_id: DeploymentId) -> bool {
        self.index.contains_key(&deployment_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in admission order
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.values().cloned().collect()
    }

    /// Point-in-time snapshot for a re-evaluation pass
    ///
    /// The queue itself is left untouched; later mutations do not affect the
    /// snapshot.
    pub fn drain(&self) -> QueueSnapshot {
        QueueSnapshot {
            entries: self.entries(),
            position: 0,
        }
    }
}

/// Lazy, restartable iteration over a queue snapshot
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    entries: Vec<QueueEntry>,
    position: usize,
}

impl QueueSnapshot {
    /// Rewind to the highest-priority entry
    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for QueueSnapshot {
    type Item = QueueEntry;

    fn next(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.get(self.position).cloned()?;
        self.position += 1;
        Some(entry)
    }
}
