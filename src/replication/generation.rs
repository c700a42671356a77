//! Identifiers that scope every ordering guarantee of the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a search or vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId(Uuid);

impl IndexId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for IndexId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One logical lifetime of an index build. Batches are ordered and mutually
/// excluded per generation, never across generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationId {
    pub index_id: IndexId,
    pub generation: u64,
}

impl GenerationId {
    pub fn new(index_id: IndexId, generation: u64) -> Self {
        Self {
            index_id,
            generation,
        }
    }

    /// Generation `0` of a freshly created index.
    pub fn first(index_id: IndexId) -> Self {
        Self::new(index_id, 0)
    }

    pub fn next(&self) -> Self {
        Self::new(self.index_id, self.generation + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/g{}", self.index_id, self.generation)
    }
}

/// Fencing token of one replication attempt against a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Scheduling class of a batch.
///
/// Declaration order is urgency order: a smaller value is dispatched first.
/// Priority only arbitrates between generations; inside one generation the
/// queue is strictly FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    InitialSyncChangeStream,
    SteadyStateChangeStream,
    InitialSyncCollectionScan,
}

impl Priority {
    pub const ALL: [Priority; 3] = [
        Priority::InitialSyncChangeStream,
        Priority::SteadyStateChangeStream,
        Priority::InitialSyncCollectionScan,
    ];

    pub fn is_initial_sync(self) -> bool {
        matches!(
            self,
            Priority::InitialSyncChangeStream | Priority::InitialSyncCollectionScan
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::InitialSyncChangeStream => "initial_sync_change_stream",
            Priority::SteadyStateChangeStream => "steady_state_change_stream",
            Priority::InitialSyncCollectionScan => "initial_sync_collection_scan",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::InitialSyncChangeStream < Priority::SteadyStateChangeStream);
        assert!(Priority::SteadyStateChangeStream < Priority::InitialSyncCollectionScan);
    }

    #[test]
    fn test_initial_sync_classes() {
        assert!(Priority::InitialSyncChangeStream.is_initial_sync());
        assert!(Priority::InitialSyncCollectionScan.is_initial_sync());
        assert!(!Priority::SteadyStateChangeStream.is_initial_sync());
    }

    #[test]
    fn test_next_generation_keeps_index() {
        let gen = GenerationId::first(IndexId::new());
        let next = gen.next();
        assert_eq!(next.index_id, gen.index_id);
        assert_eq!(next.generation, 1);
        assert_ne!(gen, next);
    }
}
