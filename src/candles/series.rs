use polars::{
    df,
    prelude::{DataFrame, IntoLazy, col},
};

use crate::{
    data::{columns::Col, domain::Candle},
    error::{DataError, TickforgeResult},
};

/// Completed candles for one `(symbol, timeframe)` pair, plus a cached
/// columnar materialization.
///
/// Storage is a plain contiguous `Vec<Candle>`; strategies read slices of it
/// directly. The polars frame is only built on demand and memoized under the
/// key `(completed_count, requested_count)`, so repeated snapshot queries
/// between candle closes are free.
#[derive(Debug, Default, Clone)]
pub struct CandleSeries {
    completed: Vec<Candle>,
    cache: Option<SnapshotCache>,
}

#[derive(Debug, Clone)]
struct SnapshotCache {
    completed_count: usize,
    requested_count: usize,
    frame: DataFrame,
}

impl CandleSeries {
    pub fn push(&mut self, candle: Candle) {
        self.completed.push(candle);
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn all(&self) -> &[Candle] {
        &self.completed
    }

    /// Last `count` completed candles; the full history when fewer exist.
    pub fn last_n(&self, count: usize) -> &[Candle] {
        let start = self.completed.len().saturating_sub(count);
        &self.completed[start..]
    }

    /// Columnar view of [`CandleSeries::last_n`], memoized until the next
    /// candle closes or a different count is requested.
    pub fn snapshot(&mut self, count: usize) -> TickforgeResult<DataFrame> {
        let completed_count = self.completed.len();
        if let Some(cache) = &self.cache
            && cache.completed_count == completed_count
            && cache.requested_count == count
        {
            return Ok(cache.frame.clone());
        }

        let frame = materialize(self.last_n(count))?;
        self.cache = Some(SnapshotCache {
            completed_count,
            requested_count: count,
            frame: frame.clone(),
        });
        Ok(frame)
    }
}

fn materialize(candles: &[Candle]) -> TickforgeResult<DataFrame> {
    let time: Vec<i64> = candles.iter().map(|c| c.open_time.timestamp_micros()).collect();
    let open: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let tick_volume: Vec<i64> = candles.iter().map(|c| c.volume as i64).collect();

    let frame = df![
        Col::Time.as_str()       => time,
        Col::Open.as_str()       => open,
        Col::High.as_str()       => high,
        Col::Low.as_str()        => low,
        Col::Close.as_str()      => close,
        Col::TickVolume.as_str() => tick_volume,
    ]
    .map_err(|e| DataError::DataFrame(e.to_string()))?;

    frame
        .lazy()
        .with_column(col(Col::Time.as_str()).cast(Col::Time.dtype()))
        .collect()
        .map_err(|e| DataError::DataFrame(e.to_string()).into())
}
