//! Live allocation registry
//!
//! Tracks every allocation currently held by a supervised experiment in this
//! process. The reconciler treats this set as ground truth: any allocation
//! the store still has open but that is missing here is closed.

use dashmap::DashSet;

use cm_core::AllocationId;

/// Process-wide set of live allocations
pub struct AllocationRegistry {
    live: DashSet<AllocationId>,
}

impl AllocationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            live: DashSet::new(),
        }
    }

    /// Mark an allocation as held by this process
    ///
    /// Returns false if it was already registered.
    pub fn register(&self, id: AllocationId) -> bool {
        let inserted = self.live.insert(id.clone());
        if inserted {
            tracing::debug!("Registered allocation {}", id);
        }
        inserted
    }

    /// Drop an allocation
    ///
    /// Returns false if it was not registered.
    pub fn deregister(&self, id: &AllocationId) -> bool {
        let removed = self.live.remove(id).is_some();
        if removed {
            tracing::debug!("Deregistered allocation {}", id);
        }
        removed
    }

    /// Whether an allocation is registered
    pub fn contains(&self, id: &AllocationId) -> bool {
        self.live.contains(id)
    }

    /// Snapshot of the live set, sorted for stable output
    pub fn list(&self) -> Vec<AllocationId> {
        let mut ids: Vec<_> = self.live.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Check if no allocations are live
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Forget every allocation, used when the master shuts down
    pub fn teardown(&self) {
        let count = self.live.len();
        self.live.clear();
        if count > 0 {
            tracing::info!("Released {} live allocations", count);
        }
    }
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
