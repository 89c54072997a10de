use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    cache::meta::{DatasetKey, days_in_range},
    error::{CacheError, IoError, TickforgeResult},
};

const INDEX_FILE_NAME: &str = "cache_index.json";
const INDEX_VERSION: u32 = 1;

/// In-memory directory of which `(symbol, dataset, day)` shards exist.
///
/// Persisted as `<cache_root>/cache_index.json`. Mutations are serialized by
/// an internal lock and flushed with a temp-then-rename write; readers get a
/// snapshot and never block behind a writer.
#[derive(Debug)]
pub struct CacheIndex {
    root: PathBuf,
    inner: Mutex<IndexFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    symbols: BTreeMap<String, BTreeMap<String, DatasetEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetEntry {
    cached_days: BTreeSet<NaiveDate>,
    last_updated: DateTime<Utc>,
}

/// Snapshot answer to a coverage query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub cached: BTreeSet<NaiveDate>,
    pub missing: Vec<NaiveDate>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            symbols: BTreeMap::new(),
        }
    }
}

impl CacheIndex {
    /// Load the persisted index, falling back to a filesystem scan when the
    /// file is absent or unreadable (a corrupt index is never fatal).
    pub fn load_or_rebuild(root: impl Into<PathBuf>) -> TickforgeResult<Self> {
        let root = root.into();
        let path = root.join(INDEX_FILE_NAME);

        let inner = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<IndexFile>(&raw) {
                Ok(file) if file.version == INDEX_VERSION => file,
                Ok(file) => {
                    warn!(
                        found = file.version,
                        expected = INDEX_VERSION,
                        "cache index version mismatch, rebuilding from filesystem"
                    );
                    scan_filesystem(&root)?
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "cache index corrupt, rebuilding");
                    scan_filesystem(&root)?
                }
            },
            Err(_) => scan_filesystem(&root)?,
        };

        Ok(Self {
            root,
            inner: Mutex::new(inner),
        })
    }

    pub fn add(
        &self,
        symbol: &str,
        dataset: DatasetKey,
        day: NaiveDate,
    ) -> TickforgeResult<()> {
        let mut inner = self.lock()?;
        let entry = inner
            .symbols
            .entry(symbol.to_string())
            .or_default()
            .entry(dataset.to_string())
            .or_insert_with(|| DatasetEntry {
                cached_days: BTreeSet::new(),
                last_updated: Utc::now(),
            });
        entry.cached_days.insert(day);
        entry.last_updated = Utc::now();
        let snapshot = inner.clone();
        drop(inner);
        self.persist(&snapshot)
    }

    pub fn contains(&self, symbol: &str, dataset: DatasetKey, day: NaiveDate) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .symbols
                    .get(symbol)
                    .and_then(|datasets| datasets.get(&dataset.to_string()))
                    .is_some_and(|entry| entry.cached_days.contains(&day))
            })
            .unwrap_or(false)
    }

    /// Which days of the inclusive range are cached and which must be
    /// fetched. The answer is a snapshot; concurrent writers may have moved
    /// on by the time it is used.
    pub fn coverage(
        &self,
        symbol: &str,
        dataset: DatasetKey,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Coverage {
        let cached_days = self
            .inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .symbols
                    .get(symbol)
                    .and_then(|datasets| datasets.get(&dataset.to_string()))
                    .map(|entry| entry.cached_days.clone())
            })
            .unwrap_or_default();

        let mut cached = BTreeSet::new();
        let mut missing = Vec::new();
        for day in days_in_range(start, end) {
            if cached_days.contains(&day) {
                cached.insert(day);
            } else {
                missing.push(day);
            }
        }
        Coverage { cached, missing }
    }

    /// Drop one day from the index (e.g. after a corrupt shard read).
    pub fn invalidate(
        &self,
        symbol: &str,
        dataset: DatasetKey,
        day: NaiveDate,
    ) -> TickforgeResult<()> {
        let mut inner = self.lock()?;
        if let Some(entry) = inner
            .symbols
            .get_mut(symbol)
            .and_then(|datasets| datasets.get_mut(&dataset.to_string()))
        {
            entry.cached_days.remove(&day);
            entry.last_updated = Utc::now();
        }
        let snapshot = inner.clone();
        drop(inner);
        self.persist(&snapshot)
    }

    /// Re-derive the index from the directory tree, replacing the in-memory
    /// state and the persisted file.
    pub fn rebuild_from_filesystem(&self) -> TickforgeResult<()> {
        let fresh = scan_filesystem(&self.root)?;
        let mut inner = self.lock()?;
        *inner = fresh.clone();
        drop(inner);
        self.persist(&fresh)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> TickforgeResult<std::sync::MutexGuard<'_, IndexFile>> {
        self.inner
            .lock()
            .map_err(|e| CacheError::IndexCorrupt(format!("index lock poisoned: {e}")).into())
    }

    fn persist(&self, snapshot: &IndexFile) -> TickforgeResult<()> {
        fs::create_dir_all(&self.root).map_err(IoError::Io)?;
        let _lock = IndexLock::acquire(&self.root)?;
        let path = self.root.join(INDEX_FILE_NAME);
        let tmp = self.root.join(format!("{INDEX_FILE_NAME}.tmp"));

        let json = serde_json::to_string_pretty(snapshot).map_err(IoError::Json)?;
        fs::write(&tmp, json).map_err(IoError::Io)?;
        fs::rename(&tmp, &path).map_err(IoError::Io)?;
        Ok(())
    }
}

/// Advisory lock serializing index writes across processes sharing one
/// cache root. Readers stay lock-free; the temp-then-rename write means
/// they always see a complete file.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(root: &Path) -> TickforgeResult<Self> {
        let path = root.join(format!("{INDEX_FILE_NAME}.lock"));
        for _ in 0..100 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => return Err(IoError::Io(e).into()),
            }
        }
        // A crashed writer left the lock behind; steal it rather than wedge
        // every future run.
        warn!(path = %path.display(), "stealing abandoned index lock");
        Ok(Self { path })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Walk `<root>/<YYYY>/<MM>/<DD>/<dataset>/<SYMBOL>.parquet` and rebuild the
/// directory map. Unparseable path segments are skipped with a warning.
fn scan_filesystem(root: &Path) -> TickforgeResult<IndexFile> {
    let mut file = IndexFile::default();
    if !root.exists() {
        return Ok(file);
    }

    for year in read_dirs(root)? {
        for month in read_dirs(&year)? {
            for day_dir in read_dirs(&month)? {
                let Some(day) = parse_day(&year, &month, &day_dir) else {
                    continue;
                };
                for dataset_dir in read_dirs(&day_dir)? {
                    let Some(name) = dataset_dir.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name == "symbol_info" {
                        continue;
                    }
                    let Ok(dataset) = DatasetKey::from_str(name) else {
                        warn!(dir = name, "skipping unrecognized dataset directory");
                        continue;
                    };
                    for shard in read_files_with_ext(&dataset_dir, "parquet")? {
                        if let Some(symbol) = shard.file_stem().and_then(|s| s.to_str()) {
                            file.symbols
                                .entry(symbol.to_string())
                                .or_default()
                                .entry(dataset.to_string())
                                .or_insert_with(|| DatasetEntry {
                                    cached_days: BTreeSet::new(),
                                    last_updated: Utc::now(),
                                })
                                .cached_days
                                .insert(day);
                        }
                    }
                }
            }
        }
    }
    Ok(file)
}

fn parse_day(year: &Path, month: &Path, day: &Path) -> Option<NaiveDate> {
    let y: i32 = year.file_name()?.to_str()?.parse().ok()?;
    let m: u32 = month.file_name()?.to_str()?.parse().ok()?;
    let d: u32 = day.file_name()?.to_str()?.parse().ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

fn read_dirs(path: &Path) -> TickforgeResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).map_err(IoError::Io)? {
        let entry = entry.map_err(IoError::Io)?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_files_with_ext(path: &Path, ext: &str) -> TickforgeResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(IoError::Io)? {
        let entry = entry.map_err(IoError::Io)?;
        let p = entry.path();
        if p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(ext) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}
