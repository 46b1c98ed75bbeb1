//! Per-student serialization.
//!
//! At most one reconciliation or credit application runs per student at a
//! time; the lock map is the serialization point, not the caller.
//!
//! Entries are never evicted, so the map grows to one mutex per student
//! that has ever been billed on this node. A slot is a `Uuid` key plus an
//! `Arc<Mutex<()>>`, well under 100 bytes, so even a million students stay
//! within tens of megabytes of a single process.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct StudentLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StudentLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Take the lock for one student, creating it on first use. The guard
    /// must be held across the whole read-compute-commit sequence.
    pub async fn acquire(&self, student_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(student_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
