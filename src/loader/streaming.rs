use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    path::PathBuf,
    sync::Arc,
};

use chrono::NaiveDate;
use polars::prelude::{LazyFrame, PlPath, ScanArgsParquet};
use tracing::{debug, warn};

use crate::{
    cache::{day_store::DataCache, meta::{DatasetKey, days_in_range}},
    data::{
        domain::{GlobalTick, Tick},
        frames::frame_to_ticks,
    },
    error::{IoError, TickforgeResult},
};

/// Rough on-disk bytes per tick row after snappy compression; only feeds
/// the advisory progress estimate.
const EST_BYTES_PER_ROW: u64 = 40;

/// A chronological, merged, multi-symbol tick stream.
pub trait TickStream {
    fn next_tick(&mut self) -> TickforgeResult<Option<GlobalTick>>;

    /// Advisory total count for progress reporting; not exact.
    fn estimate_count(&self) -> Option<u64> {
        None
    }

    /// Quotes dropped so far for violating `ask >= bid > 0`.
    fn filtered_count(&self) -> u64 {
        0
    }
}

// ================================================================================================
// Disk-backed streaming merge
// ================================================================================================

/// Merge-streams ticks from many daily parquet shards in chronological
/// order with a min-heap keyed on `(time, symbol insertion order)`.
///
/// Rows are pulled `chunk_size` at a time from each shard, so peak memory is
/// bounded by `chunk_size x num_symbols`, independent of corpus size.
pub struct StreamingTickLoader {
    streams: Vec<SymbolStream>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    chunk_size: usize,
    primed: bool,
    filtered: u64,
    estimated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    time_us: i64,
    ord: u32,
}

struct SymbolStream {
    symbol: Arc<str>,
    ord: u32,
    pending_files: VecDeque<PathBuf>,
    cursor: Option<FileCursor>,
    buffer: VecDeque<Tick>,
}

struct FileCursor {
    path: PathBuf,
    offset: i64,
}

impl StreamingTickLoader {
    /// `files_per_symbol` carries, per symbol in configured order, the
    /// chronologically ordered day shard paths.
    pub fn new(files_per_symbol: Vec<(Arc<str>, Vec<PathBuf>)>, chunk_size: usize) -> Self {
        let estimated = files_per_symbol
            .iter()
            .flat_map(|(_, files)| files.iter())
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len() / EST_BYTES_PER_ROW)
            .sum();

        let streams = files_per_symbol
            .into_iter()
            .enumerate()
            .map(|(ord, (symbol, files))| SymbolStream {
                symbol,
                ord: ord as u32,
                pending_files: files.into(),
                cursor: None,
                buffer: VecDeque::new(),
            })
            .collect();

        Self {
            streams,
            heap: BinaryHeap::new(),
            chunk_size: chunk_size.max(1),
            primed: false,
            filtered: 0,
            estimated,
        }
    }

    /// Resolve shard paths for the requested symbols and day range from the
    /// cache. Days without a shard are skipped; the loader is expected to
    /// have fetched everything fetchable already.
    pub fn from_cache(
        cache: &DataCache,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        chunk_size: usize,
    ) -> Self {
        let files_per_symbol = symbols
            .iter()
            .map(|symbol| {
                let files: Vec<PathBuf> = days_in_range(start, end)
                    .into_iter()
                    .filter(|day| cache.index().contains(symbol, DatasetKey::Ticks, *day))
                    .map(|day| cache.shard_path(symbol, day, DatasetKey::Ticks))
                    .collect();
                (Arc::<str>::from(symbol.as_str()), files)
            })
            .collect();
        Self::new(files_per_symbol, chunk_size)
    }

    fn prime(&mut self) -> TickforgeResult<()> {
        for i in 0..self.streams.len() {
            self.refill(i)?;
            if let Some(tick) = self.streams[i].buffer.front() {
                self.heap.push(Reverse(HeapKey {
                    time_us: tick.time.timestamp_micros(),
                    ord: self.streams[i].ord,
                }));
            }
        }
        self.primed = true;
        Ok(())
    }

    /// Top up one symbol's buffer from its current shard, advancing to the
    /// next shard when the current one is exhausted. Leaves the buffer empty
    /// only when the symbol has no data left.
    fn refill(&mut self, idx: usize) -> TickforgeResult<()> {
        let chunk_size = self.chunk_size;
        let mut newly_filtered = 0u64;
        let stream = &mut self.streams[idx];

        loop {
            if !stream.buffer.is_empty() {
                break;
            }
            match &mut stream.cursor {
                Some(cursor) => {
                    let frame = scan_slice(&cursor.path, cursor.offset, chunk_size)?;
                    if frame.height() == 0 {
                        stream.cursor = None;
                        continue;
                    }
                    cursor.offset += frame.height() as i64;
                    for tick in frame_to_ticks(&frame)? {
                        if tick.is_valid() {
                            stream.buffer.push_back(tick);
                        } else {
                            newly_filtered += 1;
                        }
                    }
                }
                None => match stream.pending_files.pop_front() {
                    Some(path) => {
                        debug!(symbol = %stream.symbol, path = %path.display(), "opening shard");
                        stream.cursor = Some(FileCursor { path, offset: 0 });
                    }
                    None => break,
                },
            }
        }
        self.filtered += newly_filtered;
        Ok(())
    }
}

impl TickStream for StreamingTickLoader {
    fn next_tick(&mut self) -> TickforgeResult<Option<GlobalTick>> {
        if !self.primed {
            self.prime()?;
        }

        let Some(Reverse(key)) = self.heap.pop() else {
            return Ok(None);
        };
        let idx = self
            .streams
            .iter()
            .position(|s| s.ord == key.ord)
            .expect("heap key refers to a known stream");

        let tick = self.streams[idx]
            .buffer
            .pop_front()
            .expect("heap key implies a buffered tick");

        self.refill(idx)?;
        if let Some(next) = self.streams[idx].buffer.front() {
            self.heap.push(Reverse(HeapKey {
                time_us: next.time.timestamp_micros(),
                ord: self.streams[idx].ord,
            }));
        }

        Ok(Some(GlobalTick {
            symbol: self.streams[idx].symbol.clone(),
            symbol_ord: self.streams[idx].ord,
            tick,
        }))
    }

    fn estimate_count(&self) -> Option<u64> {
        Some(self.estimated)
    }

    fn filtered_count(&self) -> u64 {
        self.filtered
    }
}

fn scan_slice(path: &std::path::Path, offset: i64, len: usize) -> TickforgeResult<polars::prelude::DataFrame> {
    let uri = path
        .to_str()
        .ok_or_else(|| IoError::FileSystem(format!("non-UTF-8 path: {}", path.display())))?;
    LazyFrame::scan_parquet(PlPath::new(uri), ScanArgsParquet::default())
        .and_then(|lf| lf.slice(offset, len as u32).collect())
        .map_err(|e| {
            warn!(path = %uri, error = %e, "shard read failed");
            IoError::ReadFailed(format!("{uri}: {e}")).into()
        })
}

// ================================================================================================
// In-memory merge
// ================================================================================================

/// Pre-merged in-memory stream, used for candle-driven replay and tests.
/// Applies the same `(time, symbol order)` tie-break as the disk loader.
pub struct VecTickStream {
    ticks: std::vec::IntoIter<GlobalTick>,
    total: u64,
    filtered: u64,
}

impl VecTickStream {
    pub fn new(per_symbol: Vec<(Arc<str>, Vec<Tick>)>) -> Self {
        let mut filtered = 0u64;
        let mut merged: Vec<GlobalTick> = Vec::new();
        for (ord, (symbol, ticks)) in per_symbol.into_iter().enumerate() {
            for tick in ticks {
                if tick.is_valid() {
                    merged.push(GlobalTick {
                        symbol: symbol.clone(),
                        symbol_ord: ord as u32,
                        tick,
                    });
                } else {
                    filtered += 1;
                }
            }
        }
        merged.sort_by_key(|gt| (gt.tick.time, gt.symbol_ord));
        let total = merged.len() as u64;
        Self {
            ticks: merged.into_iter(),
            total,
            filtered,
        }
    }
}

impl TickStream for VecTickStream {
    fn next_tick(&mut self) -> TickforgeResult<Option<GlobalTick>> {
        Ok(self.ticks.next())
    }

    fn estimate_count(&self) -> Option<u64> {
        Some(self.total)
    }

    fn filtered_count(&self) -> u64 {
        self.filtered
    }
}
