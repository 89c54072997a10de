use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{NaiveDate, Utc};
use polars::prelude::{
    DataFrame, IntoLazy, LazyFrame, ParquetCompression, ParquetWriteOptions, PlPath,
    ScanArgsParquet, SinkOptions, SinkTarget, SortMultipleOptions, UnionArgs, concat,
};
use tracing::{debug, warn};

use crate::{
    cache::{
        index::CacheIndex,
        meta::{CACHE_VERSION, CacheSource, DatasetKey, ShardMeta, days_in_range},
    },
    data::{columns::Col, domain::SymbolInfo, frames::time_bounds},
    error::{CacheError, DataError, IoError, TickforgeResult},
};

/// Day-sharded parquet store under
/// `<root>/<YYYY>/<MM>/<DD>/<dataset>/<SYMBOL>.parquet`, with per-shard
/// metadata in a `<SYMBOL>.meta.json` sidecar and symbol metadata under
/// `<YYYY>/<MM>/<DD>/symbol_info/<SYMBOL>.json`.
///
/// Writes are atomic (temp file then rename). The [`CacheIndex`] mirrors
/// which shards exist so coverage queries never touch the directory tree.
#[derive(Debug)]
pub struct DataCache {
    root: PathBuf,
    ttl_days: u32,
    gap_threshold_days: u32,
    index: CacheIndex,
}

/// Outcome of [`DataCache::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: String,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Result of [`DataCache::load_partial`]: whatever cached days exist, the
/// days that still need fetching, and the symbol info if any cached day
/// carries it.
#[derive(Debug)]
pub struct PartialLoad {
    pub frame: Option<DataFrame>,
    pub missing: Vec<NaiveDate>,
    pub symbol_info: Option<SymbolInfo>,
}

impl DataCache {
    pub fn open(
        root: impl Into<PathBuf>,
        ttl_days: u32,
        gap_threshold_days: u32,
    ) -> TickforgeResult<Self> {
        let root = root.into();
        let index = CacheIndex::load_or_rebuild(&root)?;
        Ok(Self {
            root,
            ttl_days,
            gap_threshold_days,
            index,
        })
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ============================================================================================
    // Writing
    // ============================================================================================

    /// Persist one day shard atomically, stamp fresh metadata, and record it
    /// in the index. The frame must already follow the dataset's canonical
    /// schema and be sorted by time.
    #[tracing::instrument(skip(self, frame, symbol_info), fields(rows = frame.height()))]
    pub fn save_day(
        &self,
        symbol: &str,
        day: NaiveDate,
        dataset: DatasetKey,
        frame: &DataFrame,
        source: CacheSource,
        symbol_info: Option<&SymbolInfo>,
    ) -> TickforgeResult<()> {
        let (first, last) = match time_bounds(frame)? {
            Some(bounds) => bounds,
            None => {
                let midnight = day.and_hms_opt(0, 0, 0).unwrap().and_utc();
                (midnight, midnight)
            }
        };
        let meta = ShardMeta {
            cached_at: Utc::now(),
            source,
            first_data_time: first,
            last_data_time: last,
            row_count: frame.height() as u64,
            cache_version: CACHE_VERSION,
        };
        self.write_shard(symbol, day, dataset, frame, &meta)?;
        if let Some(info) = symbol_info {
            self.save_symbol_info(symbol, day, info)?;
        }
        Ok(())
    }

    /// Low-level shard write with caller-supplied metadata. `save_day` is
    /// the normal entry point; this exists so staleness handling can be
    /// exercised deterministically.
    pub fn write_shard(
        &self,
        symbol: &str,
        day: NaiveDate,
        dataset: DatasetKey,
        frame: &DataFrame,
        meta: &ShardMeta,
    ) -> TickforgeResult<()> {
        let path = self.shard_path(symbol, day, dataset);
        let dir = path.parent().expect("shard path has a parent");
        fs::create_dir_all(dir).map_err(IoError::Io)?;

        let tmp = path.with_extension("parquet.tmp");
        write_parquet(frame.clone(), &tmp)?;
        fs::rename(&tmp, &path).map_err(IoError::Io)?;

        let meta_json = serde_json::to_string_pretty(meta).map_err(IoError::Json)?;
        fs::write(self.meta_path(symbol, day, dataset), meta_json).map_err(IoError::Io)?;

        self.index.add(symbol, dataset, day)?;
        debug!(%symbol, %day, %dataset, rows = frame.height(), "cached day shard");
        Ok(())
    }

    pub fn save_symbol_info(
        &self,
        symbol: &str,
        day: NaiveDate,
        info: &SymbolInfo,
    ) -> TickforgeResult<()> {
        let path = self.symbol_info_path(symbol, day);
        fs::create_dir_all(path.parent().unwrap()).map_err(IoError::Io)?;
        let json = serde_json::to_string_pretty(info).map_err(IoError::Json)?;
        fs::write(path, json).map_err(IoError::Io)?;
        Ok(())
    }

    // ============================================================================================
    // Reading
    // ============================================================================================

    /// Read one day shard. A shard that cannot be read is invalidated in the
    /// index and surfaced as [`CacheError::Corrupt`] so the loader refetches
    /// it.
    pub fn load_day(
        &self,
        symbol: &str,
        day: NaiveDate,
        dataset: DatasetKey,
    ) -> TickforgeResult<DataFrame> {
        let path = self.shard_path(symbol, day, dataset);
        match scan_parquet(&path).and_then(|lf| {
            lf.collect()
                .map_err(|e| DataError::DataFrame(e.to_string()).into())
        }) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(%symbol, %day, %dataset, error = %e, "corrupt shard, invalidating");
                self.index.invalidate(symbol, dataset, day)?;
                Err(CacheError::Corrupt {
                    path: path.display().to_string(),
                    msg: e.to_string(),
                }
                .into())
            }
        }
    }

    pub fn load_meta(
        &self,
        symbol: &str,
        day: NaiveDate,
        dataset: DatasetKey,
    ) -> Option<ShardMeta> {
        let raw = fs::read_to_string(self.meta_path(symbol, day, dataset)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn symbol_info(&self, symbol: &str, day: NaiveDate) -> Option<SymbolInfo> {
        let raw = fs::read_to_string(self.symbol_info_path(symbol, day)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Merge every cached day of the inclusive range; report the rest as
    /// missing. Corrupt shards are demoted to missing days so the caller
    /// refetches them. An empty range yields `(None, [], None)`.
    #[tracing::instrument(skip(self))]
    pub fn load_partial(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        dataset: DatasetKey,
    ) -> TickforgeResult<PartialLoad> {
        if start > end {
            return Ok(PartialLoad {
                frame: None,
                missing: Vec::new(),
                symbol_info: None,
            });
        }

        let coverage = self.index.coverage(symbol, dataset, start, end);
        let mut missing = coverage.missing;
        let mut lazy_days: Vec<LazyFrame> = Vec::new();
        let mut symbol_info = None;

        for day in &coverage.cached {
            match self.load_day(symbol, *day, dataset) {
                Ok(frame) => {
                    if symbol_info.is_none() {
                        symbol_info = self.symbol_info(symbol, *day);
                    }
                    lazy_days.push(frame.lazy());
                }
                Err(e) => {
                    warn!(%symbol, day = %day, error = %e, "cached day unreadable, marking missing");
                    missing.push(*day);
                }
            }
        }
        missing.sort();

        let frame = if lazy_days.is_empty() {
            None
        } else {
            Some(
                concat(lazy_days, UnionArgs::default())
                    .and_then(|lf| {
                        lf.sort([Col::Time.as_str()], SortMultipleOptions::default())
                            .collect()
                    })
                    .map_err(|e| DataError::DataFrame(e.to_string()))?,
            )
        };

        Ok(PartialLoad {
            frame,
            missing,
            symbol_info,
        })
    }

    // ============================================================================================
    // Validation
    // ============================================================================================

    /// Coverage validation per the loading contract: the first day must be
    /// cached, fresh, and start close enough to the requested start; every
    /// other day must simply be present.
    pub fn validate(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        dataset: DatasetKey,
    ) -> Validation {
        let days = days_in_range(start, end);
        let Some(first_day) = days.first().copied() else {
            return Validation::fail("no days in range");
        };

        if !self.index.contains(symbol, dataset, first_day) {
            return Validation::fail("first day uncached");
        }

        let Some(meta) = self.load_meta(symbol, first_day, dataset) else {
            // No readable metadata means we cannot prove freshness.
            return Validation::fail("stale");
        };
        if meta.is_stale(Utc::now(), self.ttl_days) {
            return Validation::fail("stale");
        }

        let requested_start = start.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let max_gap = chrono::Duration::days(self.gap_threshold_days as i64);
        if meta.first_data_time - requested_start > max_gap {
            return Validation::fail("gap at start");
        }

        for day in &days[1..] {
            if !self.index.contains(symbol, dataset, *day) {
                return Validation::fail(format!("missing day {day}"));
            }
        }

        Validation::ok()
    }

    // ============================================================================================
    // Paths
    // ============================================================================================

    fn day_dir(&self, day: NaiveDate) -> PathBuf {
        self.root
            .join(format!("{}", day.format("%Y")))
            .join(format!("{}", day.format("%m")))
            .join(format!("{}", day.format("%d")))
    }

    pub fn shard_path(&self, symbol: &str, day: NaiveDate, dataset: DatasetKey) -> PathBuf {
        self.day_dir(day)
            .join(dataset.to_string())
            .join(format!("{symbol}.parquet"))
    }

    fn meta_path(&self, symbol: &str, day: NaiveDate, dataset: DatasetKey) -> PathBuf {
        self.day_dir(day)
            .join(dataset.to_string())
            .join(format!("{symbol}.meta.json"))
    }

    fn symbol_info_path(&self, symbol: &str, day: NaiveDate) -> PathBuf {
        self.day_dir(day)
            .join("symbol_info")
            .join(format!("{symbol}.json"))
    }
}

fn write_parquet(frame: DataFrame, path: &Path) -> TickforgeResult<()> {
    let uri = path
        .to_str()
        .ok_or_else(|| IoError::FileSystem(format!("non-UTF-8 path: {}", path.display())))?;
    let target = SinkTarget::Path(PlPath::new(uri));
    let options = ParquetWriteOptions {
        compression: ParquetCompression::Snappy,
        ..Default::default()
    };

    let sink_plan = frame
        .lazy()
        .sink_parquet(target, options, None, SinkOptions::default())
        .map_err(|e| DataError::DataFrame(format!("Failed to build parquet sink plan: {e}")))?;
    let _ = sink_plan.collect().map_err(|e| {
        DataError::DataFrame(format!("Failed to write parquet to '{}': {e}", path.display()))
    })?;
    Ok(())
}

fn scan_parquet(path: &Path) -> TickforgeResult<LazyFrame> {
    let uri = path
        .to_str()
        .ok_or_else(|| IoError::FileSystem(format!("non-UTF-8 path: {}", path.display())))?;
    LazyFrame::scan_parquet(PlPath::new(uri), ScanArgsParquet::default())
        .map_err(|e| IoError::ReaderCreation(e.to_string()).into())
}
