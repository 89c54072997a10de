use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    data::domain::{Candle, SymbolInfo, Tick},
    error::TickforgeResult,
    timeframe::Timeframe,
};

/// Live-feed tick provider contract. Implementations fetch exactly one UTC
/// day per call; `Ok(vec![])` means the source has no data for that day
/// (weekend, holiday), which is different from an `Err` transport failure.
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn fetch_ticks(&self, symbol: &str, day: NaiveDate) -> TickforgeResult<Vec<Tick>>;

    async fn symbol_info(&self, symbol: &str) -> TickforgeResult<SymbolInfo>;
}

/// Live-feed candle provider contract, day-granular like [`TickSource`].
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        day: NaiveDate,
    ) -> TickforgeResult<Vec<Candle>>;
}

/// Optional fallback archive (e.g. a broker's historical dump). The URL
/// shape and decompression are the implementation's business; the loader
/// only sees day-granular results. `Ok(None)` means the archive does not
/// carry that day.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch_ticks(
        &self,
        symbol: &str,
        day: NaiveDate,
    ) -> TickforgeResult<Option<Vec<Tick>>>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        day: NaiveDate,
    ) -> TickforgeResult<Option<Vec<Candle>>>;
}
