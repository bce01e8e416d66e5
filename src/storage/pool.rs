//! Shared pool of open index-file handles
//!
//! Handles are keyed by `(julian, node)` and shared by every request that
//! touches the same partition. Opening happens outside the pool lock, so two
//! requests may race to open the same file; the loser drops its handle and
//! takes the one already published.

use crate::storage::error::StorageResult;
use crate::storage::index_file::{IndexFile, IndexFileOpener};
use crate::storage::types::FileDescriptor;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type PoolKey = (i32, String);

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open_handles: usize,
    pub opened: u64,
    pub races: u64,
    pub evicted: u64,
}

/// Process-wide handle cache
pub struct IndexFilePool {
    opener: Box<dyn IndexFileOpener>,
    handles: Mutex<HashMap<PoolKey, Arc<dyn IndexFile>>>,
    stats: Mutex<PoolStats>,
}

impl IndexFilePool {
    pub fn new(opener: impl IndexFileOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            handles: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Handle for the partition named by `desc`, opening it if needed
    pub fn get_or_open(&self, desc: &FileDescriptor) -> StorageResult<Arc<dyn IndexFile>> {
        let key = (desc.julian, desc.node.clone());
        if let Some(handle) = self.lock_handles().get(&key) {
            handle.touch();
            return Ok(Arc::clone(handle));
        }

        let opened = self.opener.open(desc)?;

        let mut handles = self.lock_handles();
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match handles.entry(key) {
            Entry::Occupied(existing) => {
                stats.races += 1;
                tracing::debug!(
                    file = ?desc.path,
                    "Index file opened concurrently, using existing handle"
                );
                existing.get().touch();
                Ok(Arc::clone(existing.get()))
            }
            Entry::Vacant(slot) => {
                stats.opened += 1;
                tracing::debug!(file = ?desc.path, "Opened index file");
                Ok(Arc::clone(slot.insert(opened)))
            }
        }
    }

    /// Drop a handle whose file vanished
    pub fn remove(&self, julian: i32, node: &str) {
        self.lock_handles().remove(&(julian, node.to_string()));
    }

    /// Close handles idle for longer than `max_idle` that no request holds
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut handles = self.lock_handles();
        let before = handles.len();
        handles.retain(|_, handle| {
            Arc::strong_count(handle) > 1 || handle.last_used().elapsed() < max_idle
        });
        let evicted = before - handles.len();

        if evicted > 0 {
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .evicted += evicted as u64;
            tracing::debug!(evicted, remaining = handles.len(), "Evicted idle index files");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.open_handles = self.len();
        stats
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, Arc<dyn IndexFile>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index_file::{DiskOpener, IndexFileWriter};
    use crate::storage::mseed::RecordBuilder;
    use crate::storage::types::{julian_from_year_doy, SeedName};
    use tempfile::tempdir;

    fn make_file(dir: &std::path::Path) -> FileDescriptor {
        let julian = julian_from_year_doy(2014, 20).unwrap();
        let mut writer = IndexFileWriter::create(dir, julian, "CI").unwrap();
        let rec = RecordBuilder::new(SeedName::new("USDUG  BHZ00"), 1_390_219_200_000_000, 40.0)
            .build(&[1, 2, 3])
            .unwrap();
        writer.append(&rec).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_handles_are_shared() {
        let dir = tempdir().unwrap();
        let desc = make_file(dir.path());
        let pool = IndexFilePool::new(DiskOpener);

        let a = pool.get_or_open(&desc).unwrap();
        let b = pool.get_or_open(&desc).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().opened, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_concurrent_open_converges() {
        let dir = tempdir().unwrap();
        let desc = make_file(dir.path());
        let pool = Arc::new(IndexFilePool::new(DiskOpener));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let desc = desc.clone();
                std::thread::spawn(move || pool.get_or_open(&desc).unwrap())
            })
            .collect();
        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(pool.len(), 1);
        for h in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], h));
        }
        let stats = pool.stats();
        assert_eq!(stats.opened, 1);
    }

    #[test]
    fn test_evict_skips_held_handles() {
        let dir = tempdir().unwrap();
        let desc = make_file(dir.path());
        let pool = IndexFilePool::new(DiskOpener);

        let held = pool.get_or_open(&desc).unwrap();
        assert_eq!(pool.evict_idle(Duration::ZERO), 0);
        drop(held);
        assert_eq!(pool.evict_idle(Duration::ZERO), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let desc = FileDescriptor::from_path(dir.path().join("2014_020_XX.idx")).unwrap();
        let pool = IndexFilePool::new(DiskOpener);
        let err = pool.get_or_open(&desc).err().unwrap();
        assert!(err.is_not_found());
    }
}
