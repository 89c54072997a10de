use chrono::{DateTime, Utc};
use polars::{
    df,
    prelude::{DataFrame, IntoLazy, SortMultipleOptions, col},
};

use crate::{
    data::{columns::Col, domain::{Candle, Tick}},
    error::{DataError, TickforgeResult},
};

// ================================================================================================
// Ticks
// ================================================================================================

/// Column-oriented materialization of a tick slice in the on-disk schema
/// (`time, bid, ask, last, volume`), sorted by time.
pub fn ticks_to_frame(ticks: &[Tick]) -> TickforgeResult<DataFrame> {
    let time: Vec<i64> = ticks.iter().map(|t| t.time.timestamp_micros()).collect();
    let bid: Vec<f64> = ticks.iter().map(|t| t.bid).collect();
    let ask: Vec<f64> = ticks.iter().map(|t| t.ask).collect();
    let last: Vec<f64> = ticks.iter().map(|t| t.last).collect();
    let volume: Vec<i64> = ticks.iter().map(|t| t.volume as i64).collect();

    let frame = df![
        Col::Time.as_str()   => time,
        Col::Bid.as_str()    => bid,
        Col::Ask.as_str()    => ask,
        Col::Last.as_str()   => last,
        Col::Volume.as_str() => volume,
    ]
    .map_err(to_data_err)?;

    frame
        .lazy()
        .with_column(col(Col::Time.as_str()).cast(Col::Time.dtype()))
        .sort([Col::Time.as_str()], SortMultipleOptions::default())
        .collect()
        .map_err(|e| to_data_err(e).into())
}

/// Row-oriented view of a tick frame. The frame must follow the on-disk tick
/// schema.
pub fn frame_to_ticks(frame: &DataFrame) -> TickforgeResult<Vec<Tick>> {
    let time = frame
        .column(Col::Time.as_str())
        .map_err(to_data_err)?
        .datetime()
        .map_err(to_data_err)?;
    let bid = frame.column(Col::Bid.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let ask = frame.column(Col::Ask.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let last = frame.column(Col::Last.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let volume = frame
        .column(Col::Volume.as_str())
        .map_err(to_data_err)?
        .i64()
        .map_err(to_data_err)?;

    let mut ticks = Vec::with_capacity(frame.height());
    for (i, maybe_ts) in time.as_datetime_iter().enumerate() {
        let ts = maybe_ts
            .ok_or_else(|| DataError::TimestampConversion(format!("null time at row {i}")))?;
        ticks.push(Tick {
            time: ts.and_utc(),
            bid: bid.get(i).unwrap_or(0.0),
            ask: ask.get(i).unwrap_or(0.0),
            last: last.get(i).unwrap_or(0.0),
            volume: volume.get(i).unwrap_or(0) as f64,
        });
    }
    Ok(ticks)
}

// ================================================================================================
// Candles
// ================================================================================================

/// Column-oriented materialization of a candle slice in the on-disk schema
/// (`time, open, high, low, close, tick_volume`), sorted by time.
pub fn candles_to_frame(candles: &[Candle]) -> TickforgeResult<DataFrame> {
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
    .map_err(to_data_err)?;

    frame
        .lazy()
        .with_column(col(Col::Time.as_str()).cast(Col::Time.dtype()))
        .sort([Col::Time.as_str()], SortMultipleOptions::default())
        .collect()
        .map_err(|e| to_data_err(e).into())
}

/// Row-oriented view of a candle frame in the on-disk candle schema.
pub fn frame_to_candles(frame: &DataFrame) -> TickforgeResult<Vec<Candle>> {
    let time = frame
        .column(Col::Time.as_str())
        .map_err(to_data_err)?
        .datetime()
        .map_err(to_data_err)?;
    let open = frame.column(Col::Open.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let high = frame.column(Col::High.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let low = frame.column(Col::Low.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let close =
        frame.column(Col::Close.as_str()).map_err(to_data_err)?.f64().map_err(to_data_err)?;
    let tick_volume = frame
        .column(Col::TickVolume.as_str())
        .map_err(to_data_err)?
        .i64()
        .map_err(to_data_err)?;

    let mut candles = Vec::with_capacity(frame.height());
    for (i, maybe_ts) in time.as_datetime_iter().enumerate() {
        let ts = maybe_ts
            .ok_or_else(|| DataError::TimestampConversion(format!("null time at row {i}")))?;
        candles.push(Candle {
            open_time: ts.and_utc(),
            open: open.get(i).unwrap_or(f64::NAN),
            high: high.get(i).unwrap_or(f64::NAN),
            low: low.get(i).unwrap_or(f64::NAN),
            close: close.get(i).unwrap_or(f64::NAN),
            volume: tick_volume.get(i).unwrap_or(0) as f64,
        });
    }
    Ok(candles)
}

/// First and last `time` values of a frame, or `None` for an empty frame.
pub fn time_bounds(frame: &DataFrame) -> TickforgeResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    if frame.height() == 0 {
        return Ok(None);
    }
    let time = frame
        .column(Col::Time.as_str())
        .map_err(to_data_err)?
        .datetime()
        .map_err(to_data_err)?;
    let first = time
        .as_datetime_iter()
        .next()
        .flatten()
        .ok_or_else(|| DataError::TimestampConversion("null first time".to_string()))?;
    let last = time
        .as_datetime_iter()
        .last()
        .flatten()
        .ok_or_else(|| DataError::TimestampConversion("null last time".to_string()))?;
    Ok(Some((first.and_utc(), last.and_utc())))
}

fn to_data_err(e: polars::error::PolarsError) -> DataError {
    DataError::DataFrame(e.to_string())
}
