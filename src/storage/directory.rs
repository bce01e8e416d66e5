//! Day → index file directory cache
//!
//! A full scan of every storage root builds a fresh `julian → files` map,
//! which is then published under the state lock in one swap. Queries read
//! the map instead of listing directories themselves.
//!
//! ```text
//! roots/                      by_day
//!   2014_019_CI.idx    ──►    2456677 → [2014_019_CI.idx]
//!   2014_020_CI.idx           2456678 → [2014_020_CI.idx, 2014_020_AK.idx]
//!   node2/2014_020_AK.idx
//! ```
//!
//! Scans run every `scan_interval`, dropping to `midnight_interval` from
//! 23:40 to 00:02 UTC so files for the new day show up quickly.

use crate::storage::types::FileDescriptor;
use chrono::{NaiveTime, Timelike, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Minute of day (UTC) at which the fast scan window opens
const MIDNIGHT_WINDOW_START: u32 = 23 * 60 + 40;

/// Minute of day (UTC) at which the fast scan window closes
const MIDNIGHT_WINDOW_END: u32 = 2;

/// A miss only forces a synchronous rescan when the last scan is older than this
const RECHECK_AGE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct DirectoryState {
    by_day: BTreeMap<i32, Vec<FileDescriptor>>,
    last_refresh: Option<Instant>,
    scans: u64,
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    pub days: usize,
    pub duplicates: usize,
    /// Files naming a `(julian, node)` partition already claimed by an earlier root
    pub collisions: usize,
    pub ignored: usize,
}

pub struct FileDirectoryCache {
    roots: Vec<PathBuf>,
    scan_interval: Duration,
    midnight_interval: Duration,
    state: Mutex<DirectoryState>,
    shutdown: RwLock<bool>,
}

impl FileDirectoryCache {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            scan_interval: Duration::from_secs(300),
            midnight_interval: Duration::from_secs(15),
            state: Mutex::new(DirectoryState::default()),
            shutdown: RwLock::new(false),
        }
    }

    /// Builder: normal and near-midnight refresh intervals
    pub fn with_intervals(mut self, normal: Duration, midnight: Duration) -> Self {
        self.scan_interval = normal;
        self.midnight_interval = midnight;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Rescan all roots and publish the result
    pub fn refresh(&self) -> ScanStats {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let mut claimed = HashMap::new();
        let mut by_day: BTreeMap<i32, Vec<FileDescriptor>> = BTreeMap::new();
        let mut stats = ScanStats::default();

        for root in &self.roots {
            let mut dirs = vec![root.clone()];
            match std::fs::read_dir(root) {
                Ok(entries) => {
                    dirs.extend(
                        entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.path())
                            .filter(|p| p.is_dir()),
                    );
                }
                Err(e) => {
                    tracing::warn!(root = ?root, error = %e, "Cannot list storage root");
                    continue;
                }
            }

            for dir in dirs {
                scan_dir(&dir, &mut seen, &mut claimed, &mut by_day, &mut stats);
            }
        }

        for files in by_day.values_mut() {
            files.sort_by(|a, b| a.path.cmp(&b.path));
        }
        stats.days = by_day.len();

        {
            let mut state = self.lock_state();
            state.by_day = by_day;
            state.last_refresh = Some(Instant::now());
            state.scans += 1;
        }

        tracing::debug!(
            files = stats.files,
            days = stats.days,
            duplicates = stats.duplicates,
            collisions = stats.collisions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Directory scan complete"
        );
        stats
    }

    /// Files for a julian day
    ///
    /// An unknown day triggers at most one synchronous rescan, and only when
    /// the published map is more than a second old.
    pub fn files_for_day(&self, julian: i32) -> Vec<FileDescriptor> {
        let stale = {
            let state = self.lock_state();
            if let Some(files) = state.by_day.get(&julian) {
                return files.clone();
            }
            state
                .last_refresh
                .map(|at| at.elapsed() > RECHECK_AGE)
                .unwrap_or(true)
        };

        if !stale {
            return Vec::new();
        }

        tracing::debug!(julian, "Day not in directory cache, rescanning");
        self.refresh();
        self.lock_state()
            .by_day
            .get(&julian)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget a file that was found to be missing
    pub fn delete(&self, julian: i32, path: &Path) -> bool {
        let mut state = self.lock_state();
        let Some(files) = state.by_day.get_mut(&julian) else {
            return false;
        };
        let before = files.len();
        files.retain(|f| f.path != path);
        let removed = files.len() != before;
        if files.is_empty() {
            state.by_day.remove(&julian);
        }
        if removed {
            tracing::info!(julian, file = ?path, "Removed vanished file from directory cache");
        }
        removed
    }

    /// Snapshot of every known file, ordered by day then path
    pub fn all_files(&self) -> Vec<FileDescriptor> {
        self.lock_state().by_day.values().flatten().cloned().collect()
    }

    pub fn scans(&self) -> u64 {
        self.lock_state().scans
    }

    /// Refresh interval appropriate for the given UTC time of day
    pub fn refresh_interval_at(&self, time: NaiveTime) -> Duration {
        let minute = time.hour() * 60 + time.minute();
        if minute >= MIDNIGHT_WINDOW_START || minute < MIDNIGHT_WINDOW_END {
            self.midnight_interval
        } else {
            self.scan_interval
        }
    }

    /// Start the periodic rescan task
    pub fn start_background_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let wait = cache.refresh_interval_at(Utc::now().time());
                tokio::time::sleep(wait).await;

                if *cache.shutdown.read().await {
                    break;
                }

                let worker = Arc::clone(&cache);
                match tokio::task::spawn_blocking(move || worker.refresh()).await {
                    Ok(stats) => {
                        tracing::trace!(files = stats.files, "Background directory scan")
                    }
                    Err(e) => tracing::error!("Directory scan task failed: {}", e),
                }
            }
            tracing::debug!("Directory refresh task stopped");
        })
    }

    /// Stop the background task at its next wake-up
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
    }

    fn lock_state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scans see roots in configuration order, so the first root holding a
/// partition keeps it.
fn scan_dir(
    dir: &Path,
    seen: &mut HashSet<PathBuf>,
    claimed: &mut HashMap<(i32, String), PathBuf>,
    by_day: &mut BTreeMap<i32, Vec<FileDescriptor>>,
    stats: &mut ScanStats,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = ?dir, error = %e, "Cannot list directory");
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("idx") {
            continue;
        }
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(file = ?path, error = %e, "File vanished during scan");
                continue;
            }
        };
        match FileDescriptor::from_path(&canonical) {
            Ok(desc) => {
                if !seen.insert(canonical.clone()) {
                    stats.duplicates += 1;
                    continue;
                }
                let key = (desc.julian, desc.node.clone());
                if let Some(kept) = claimed.get(&key) {
                    stats.collisions += 1;
                    tracing::warn!(
                        kept = ?kept,
                        ignored = ?canonical,
                        julian = desc.julian,
                        node = %desc.node,
                        "Partition present in more than one storage root, ignoring later copy"
                    );
                    continue;
                }
                claimed.insert(key, canonical);
                stats.files += 1;
                by_day.entry(desc.julian).or_default().push(desc);
            }
            Err(_) => {
                stats.ignored += 1;
                tracing::trace!(file = ?path, "Ignoring non-conforming index file name");
            }
        }
    }
}
