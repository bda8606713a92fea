//! Snapshot Cache
//!
//! Process-wide map from experiment identity to its most recent snapshot.
//! Entries live until explicitly invalidated; an optional TTL drops entries
//! that are older than the configured age on read.

use crate::controller::snapshot::{ExperimentId, Snapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Thread-safe via Mutex; the lock is held only for the map operation,
/// never across an await.
#[derive(Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<ExperimentId, (Arc<Snapshot>, Instant)>>,
    ttl: Option<Duration>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached snapshot for `id`, if present and not expired
    pub fn get(&self, id: &ExperimentId) -> Option<Arc<Snapshot>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, stored) = entries.get(id)?;
        if !self.is_expired(*stored) {
            return Some(Arc::clone(snapshot));
        }
        entries.remove(id);
        None
    }

    /// Store a snapshot, replacing any previous entry for `id`
    pub fn put(&self, id: ExperimentId, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (Arc::clone(&snapshot), Instant::now()));
        snapshot
    }

    pub fn invalidate(&self, id: &ExperimentId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, stored: Instant) -> bool {
        self.ttl.is_some_and(|ttl| stored.elapsed() >= ttl)
    }
}
