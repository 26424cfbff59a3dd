//! Mtime-keyed resource cache with a debounced json snapshot.
//!
//! Maps a file path to the last computed value for that file. An entry is
//! valid while the file's modification time is earlier than the recorded
//! compute time; otherwise the compute closure runs again.
//!
//! The in-memory store is authoritative. A json snapshot
//! (`path -> { data, getTime }`) is written on a 2-second trailing debounce
//! after any mutation: each write replaces the pending delayed task, so
//! bursts of writes collapse into a single disk write. Persist failures are
//! silent best-effort.

use crate::utils::{mtime_ms, now_ms};
use anyhow::Result;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

/// Delay between the last cache write and the snapshot persist.
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(2);

/// One cached computation, tagged with its compute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    data: String,
    get_time: i64,
}

struct Inner {
    /// Snapshot file; `None` disables persistence entirely.
    file: Option<PathBuf>,
    store: Mutex<FxHashMap<String, CacheEntry>>,
    /// Bumped on every mutation; the delayed persist task only fires when
    /// the generation is still the one it was scheduled with.
    generation: AtomicU64,
}

/// Shared file-backed compute cache. Cheap to clone.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Inner>,
}

impl FileCache {
    /// Create a cache, loading the snapshot file when present.
    ///
    /// Entries whose backing file no longer exists are purged at load.
    pub fn load(file: Option<PathBuf>) -> Self {
        let mut store: FxHashMap<String, CacheEntry> = file
            .as_deref()
            .filter(|path| path.exists())
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        store.retain(|path, _| Path::new(path).exists());

        Self {
            inner: Arc::new(Inner {
                file,
                store: Mutex::new(store),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached value for `path` if still valid, otherwise run
    /// `compute`, store its result and return it.
    ///
    /// A missing backing file propagates the stat failure to the caller.
    pub fn wrap<F>(&self, path: &Path, compute: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        let key = path.to_string_lossy().into_owned();
        let mtime = mtime_ms(path)?;

        if let Some(entry) = self.inner.store.lock().get(&key)
            && mtime < entry.get_time
        {
            return Ok(entry.data.clone());
        }

        let data = compute()?;
        self.inner.store.lock().insert(
            key,
            CacheEntry {
                data: data.clone(),
                get_time: now_ms(),
            },
        );
        self.schedule_persist();

        Ok(data)
    }

    /// Write the snapshot immediately (used on shutdown).
    pub fn flush(&self) {
        persist(&self.inner);
    }

    /// Schedule-or-replace the single pending delayed persist task.
    fn schedule_persist(&self) {
        if self.inner.file.is_none() {
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(PERSIST_DEBOUNCE);
            // A later write superseded this task.
            if inner.generation.load(Ordering::SeqCst) == generation {
                persist(&inner);
            }
        });
    }

    /// Force the entry for `path` to look outdated (test helper).
    #[cfg(test)]
    fn backdate(&self, path: &Path) {
        let key = path.to_string_lossy().into_owned();
        if let Some(entry) = self.inner.store.lock().get_mut(&key) {
            entry.get_time = 0;
        }
    }
}

/// Best-effort snapshot write; failures are ignored, the in-memory store
/// stays authoritative for the running process.
fn persist(inner: &Inner) {
    let Some(file) = inner.file.as_deref() else {
        return;
    };
    let json = match serde_json::to_string(&*inner.store.lock()) {
        Ok(json) => json,
        Err(_) => return,
    };
    if let Some(parent) = file.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::write(file, json);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_wrap_computes_once_while_fresh() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", "hello");
        let cache = FileCache::load(None);

        let calls = Cell::new(0);
        let mut compute = || {
            calls.set(calls.get() + 1);
            Ok("computed".to_string())
        };

        let first = cache.wrap(&path, &mut compute).unwrap();
        let second = cache.wrap(&path, &mut compute).unwrap();

        assert_eq!(first, "computed");
        assert_eq!(second, "computed");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_wrap_recomputes_when_outdated() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", "hello");
        let cache = FileCache::load(None);

        cache.wrap(&path, || Ok("one".to_string())).unwrap();
        cache.backdate(&path);

        let value = cache.wrap(&path, || Ok("two".to_string())).unwrap();
        assert_eq!(value, "two");
    }

    #[test]
    fn test_wrap_recomputes_after_mtime_advance() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", "hello");
        let cache = FileCache::load(None);

        cache.wrap(&path, || Ok("one".to_string())).unwrap();

        // Push the file's mtime past the recorded compute time.
        let future = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_times(fs::FileTimes::new().set_modified(future)).unwrap();

        let value = cache.wrap(&path, || Ok("two".to_string())).unwrap();
        assert_eq!(value, "two");
    }

    #[test]
    fn test_wrap_missing_file_propagates_error() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::load(None);

        let result = cache.wrap(&dir.path().join("gone.txt"), || Ok(String::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_and_purge() {
        let dir = TempDir::new().unwrap();
        let kept = write_file(&dir, "kept.txt", "x");
        let gone = write_file(&dir, "gone.txt", "y");
        let snapshot = dir.path().join("cache.json");

        let cache = FileCache::load(Some(snapshot.clone()));
        cache.wrap(&kept, || Ok("kept-data".to_string())).unwrap();
        cache.wrap(&gone, || Ok("gone-data".to_string())).unwrap();
        cache.flush();
        assert!(snapshot.exists());

        fs::remove_file(&gone).unwrap();

        // Entries for deleted files are dropped at load time.
        let reloaded = FileCache::load(Some(snapshot));
        let value = reloaded
            .wrap(&kept, || Ok("recomputed".to_string()))
            .unwrap();
        assert_eq!(value, "kept-data");
    }

    #[test]
    fn test_compute_error_propagates() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.txt", "hello");
        let cache = FileCache::load(None);

        let result = cache.wrap(&path, || anyhow::bail!("boom"));
        assert!(result.is_err());
    }
}
