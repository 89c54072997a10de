use std::sync::Arc;

use chrono::NaiveDate;
use polars::prelude::{
    DataFrame, DataType, IntoLazy, SortMultipleOptions, UnionArgs, UniqueKeepStrategy, col,
    concat, lit,
};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    cache::{
        day_store::DataCache,
        meta::{CacheSource, DatasetKey},
    },
    data::{
        columns::Col,
        domain::{Candle, SymbolInfo, Tick},
        frames::{candles_to_frame, frame_to_ticks, ticks_to_frame},
    },
    error::{DataError, TickforgeResult},
    loader::{
        resample::resample_days,
        source::{ArchiveFetcher, CandleSource, TickSource},
    },
};

/// Orchestrates the three-tier fetch pipeline per `(symbol, dataset)`:
/// cache, then live source, then archive, then local candle synthesis from
/// cached ticks. Freshly fetched days are written back to the cache, so the
/// next run is a pure cache hit.
pub struct DataLoader {
    cache: Arc<DataCache>,
    tick_source: Option<Arc<dyn TickSource>>,
    candle_source: Option<Arc<dyn CandleSource>>,
    archive: Option<Arc<dyn ArchiveFetcher>>,
    parallel_fetch_days: usize,
}

/// Result of [`DataLoader::load_range`]. `days_absent` lists days no tier
/// could provide; the run continues without them, and the summary reports
/// the count.
#[derive(Debug)]
pub struct LoadedRange {
    pub frame: Option<DataFrame>,
    pub symbol_info: Option<SymbolInfo>,
    pub days_refetched: usize,
    pub days_absent: Vec<NaiveDate>,
}

enum DayPayload {
    Ticks(Vec<Tick>),
    Candles(Vec<Candle>),
}

impl DataLoader {
    pub fn new(cache: Arc<DataCache>) -> Self {
        Self {
            cache,
            tick_source: None,
            candle_source: None,
            archive: None,
            parallel_fetch_days: 10,
        }
    }

    pub fn with_tick_source(mut self, source: Arc<dyn TickSource>) -> Self {
        self.tick_source = Some(source);
        self
    }

    pub fn with_candle_source(mut self, source: Arc<dyn CandleSource>) -> Self {
        self.candle_source = Some(source);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveFetcher>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_parallel_fetch_days(mut self, n: usize) -> Self {
        self.parallel_fetch_days = n.max(1);
        self
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    /// Load one `(symbol, dataset)` over the inclusive day range.
    #[tracing::instrument(skip(self))]
    pub async fn load_range(
        &self,
        symbol: &str,
        dataset: DatasetKey,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TickforgeResult<LoadedRange> {
        // 1. Validation. A stale or gapped first day is demoted to missing
        //    so the normal fetch path refreshes exactly that day.
        let validation = self.cache.validate(symbol, start, end, dataset);
        if !validation.valid {
            warn!(%symbol, %dataset, reason = %validation.reason, "cache validation failed");
            if validation.reason == "stale" || validation.reason == "gap at start" {
                self.cache.index().invalidate(symbol, dataset, start)?;
            }
        }

        // 2. Partial cache hit.
        let partial = self.cache.load_partial(symbol, start, end, dataset)?;
        let mut symbol_info = partial.symbol_info.clone();
        if symbol_info.is_none()
            && let Some(source) = &self.tick_source
        {
            symbol_info = source.symbol_info(symbol).await.ok();
        }

        // 3. Fetch missing days from source/archive, bounded fan-out.
        let mut fetched = self
            .fetch_missing_days(symbol, dataset, &partial.missing)
            .await;

        // 4. Synthesize candles from cached ticks for days no tier carried.
        if let DatasetKey::Candles(timeframe) = dataset {
            let absent: Vec<NaiveDate> = partial
                .missing
                .iter()
                .copied()
                .filter(|day| !fetched.iter().any(|(d, _, _)| d == day))
                .collect();
            let mut tick_days = Vec::new();
            for day in absent {
                if self.cache.index().contains(symbol, DatasetKey::Ticks, day)
                    && let Ok(frame) = self.cache.load_day(symbol, day, DatasetKey::Ticks)
                {
                    tick_days.push((day, frame_to_ticks(&frame)?));
                }
            }
            for (day, candles) in resample_days(tick_days, timeframe) {
                if !candles.is_empty() {
                    debug!(%symbol, %day, %timeframe, "synthesized candles from cached ticks");
                    fetched.push((day, DayPayload::Candles(candles), CacheSource::Synthesized));
                }
            }
        }

        // 5. Write-back and merge.
        let days_refetched = fetched.len();
        let mut lazy_frames = Vec::new();
        if let Some(frame) = partial.frame {
            lazy_frames.push(frame.lazy());
        }
        for (day, payload, source) in &fetched {
            let frame = match payload {
                DayPayload::Ticks(ticks) => ticks_to_frame(ticks)?,
                DayPayload::Candles(candles) => candles_to_frame(candles)?,
            };
            self.cache
                .save_day(symbol, *day, dataset, &frame, *source, symbol_info.as_ref())?;
            lazy_frames.push(frame.lazy());
        }

        let days_absent: Vec<NaiveDate> = partial
            .missing
            .iter()
            .copied()
            .filter(|day| !fetched.iter().any(|(d, _, _)| d == day))
            .collect();
        for day in &days_absent {
            warn!(%symbol, %day, %dataset, "no data from any tier, day absent");
        }

        let frame = if lazy_frames.is_empty() {
            None
        } else {
            Some(merge_range(lazy_frames, start, end)?)
        };

        Ok(LoadedRange {
            frame,
            symbol_info,
            days_refetched,
            days_absent,
        })
    }

    /// Fetch each missing day over the live source, falling back to the
    /// archive. At most `parallel_fetch_days` requests are in flight; the
    /// output is re-ordered by day before use.
    async fn fetch_missing_days(
        &self,
        symbol: &str,
        dataset: DatasetKey,
        missing: &[NaiveDate],
    ) -> Vec<(NaiveDate, DayPayload, CacheSource)> {
        let mut set: JoinSet<Option<(NaiveDate, DayPayload, CacheSource)>> = JoinSet::new();
        let mut results = Vec::new();

        for &day in missing {
            while set.len() >= self.parallel_fetch_days {
                if let Some(Ok(Some(hit))) = set.join_next().await {
                    results.push(hit);
                }
            }

            let symbol = symbol.to_string();
            let tick_source = self.tick_source.clone();
            let candle_source = self.candle_source.clone();
            let archive = self.archive.clone();
            set.spawn(async move {
                fetch_one_day(&symbol, dataset, day, tick_source, candle_source, archive).await
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(hit)) = joined {
                results.push(hit);
            }
        }

        results.sort_by_key(|(day, _, _)| *day);
        results
    }
}

async fn fetch_one_day(
    symbol: &str,
    dataset: DatasetKey,
    day: NaiveDate,
    tick_source: Option<Arc<dyn TickSource>>,
    candle_source: Option<Arc<dyn CandleSource>>,
    archive: Option<Arc<dyn ArchiveFetcher>>,
) -> Option<(NaiveDate, DayPayload, CacheSource)> {
    match dataset {
        DatasetKey::Ticks => {
            if let Some(source) = &tick_source {
                match source.fetch_ticks(symbol, day).await {
                    Ok(ticks) if !ticks.is_empty() => {
                        return Some((day, DayPayload::Ticks(ticks), CacheSource::LiveFeed));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%symbol, %day, error = %e, "tick source failed"),
                }
            }
            if let Some(archive) = &archive {
                match archive.fetch_ticks(symbol, day).await {
                    Ok(Some(ticks)) if !ticks.is_empty() => {
                        return Some((day, DayPayload::Ticks(ticks), CacheSource::Archive));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%symbol, %day, error = %e, "archive fetch failed"),
                }
            }
        }
        DatasetKey::Candles(timeframe) => {
            if let Some(source) = &candle_source {
                match source.fetch_candles(symbol, timeframe, day).await {
                    Ok(candles) if !candles.is_empty() => {
                        return Some((day, DayPayload::Candles(candles), CacheSource::LiveFeed));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%symbol, %day, error = %e, "candle source failed"),
                }
            }
            if let Some(archive) = &archive {
                match archive.fetch_candles(symbol, timeframe, day).await {
                    Ok(Some(candles)) if !candles.is_empty() => {
                        return Some((day, DayPayload::Candles(candles), CacheSource::Archive));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%symbol, %day, error = %e, "archive fetch failed"),
                }
            }
        }
    }
    None
}

/// Concatenate chronologically, clamp to the exact requested range, and
/// drop duplicate rows. The result is sorted by time, so chronology holds
/// by construction.
fn merge_range(
    lazy_frames: Vec<polars::prelude::LazyFrame>,
    start: NaiveDate,
    end: NaiveDate,
) -> TickforgeResult<DataFrame> {
    let start_us = start.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_micros();
    let end_excl_us = (end + chrono::Days::new(1))
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_micros();

    concat(lazy_frames, UnionArgs::default())
        .and_then(|lf| {
            lf.filter(
                col(Col::Time.as_str())
                    .cast(DataType::Int64)
                    .gt_eq(lit(start_us))
                    .and(col(Col::Time.as_str()).cast(DataType::Int64).lt(lit(end_excl_us))),
            )
            .sort([Col::Time.as_str()], SortMultipleOptions::default())
            .unique_stable(None, UniqueKeepStrategy::First)
            .collect()
        })
        .map_err(|e| DataError::DataFrame(e.to_string()).into())
}
