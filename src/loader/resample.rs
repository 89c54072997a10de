use chrono::NaiveDate;
use rayon::prelude::*;

use crate::{
    data::domain::{Candle, Tick},
    timeframe::Timeframe,
};

/// Aggregate a chronological tick sequence into candles of one timeframe.
///
/// Candles open from the bid side, boundaries are left-closed: a tick
/// sitting exactly on an aligned boundary opens the new candle. Gaps
/// produce no empty filler candles.
pub fn resample_ticks(ticks: &[Tick], timeframe: Timeframe) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();
    let mut current: Option<Candle> = None;

    for tick in ticks {
        if !tick.is_valid() {
            continue;
        }
        let boundary = timeframe.align_down(tick.time);
        match &mut current {
            Some(candle) if candle.open_time == boundary => {
                candle.absorb(tick.bid, tick.volume);
            }
            Some(candle) => {
                candles.push(*candle);
                current = Some(Candle::opening(boundary, tick.bid, tick.volume));
            }
            None => {
                current = Some(Candle::opening(boundary, tick.bid, tick.volume));
            }
        }
    }
    if let Some(candle) = current {
        candles.push(candle);
    }
    candles
}

/// Resample many days at once. Day payloads are independent, so this fans
/// out across the rayon pool and stitches results back in input order.
pub fn resample_days(
    days: Vec<(NaiveDate, Vec<Tick>)>,
    timeframe: Timeframe,
) -> Vec<(NaiveDate, Vec<Candle>)> {
    days.into_par_iter()
        .map(|(day, ticks)| (day, resample_ticks(&ticks, timeframe)))
        .collect()
}

/// Expand completed candles into one pseudo-tick per candle close, for
/// replay runs driven from M1 data instead of raw ticks. The half-spread is
/// applied symmetrically around the close.
pub fn candles_to_ticks(candles: &[Candle], half_spread: f64) -> Vec<Tick> {
    candles
        .iter()
        .map(|c| Tick {
            time: c.open_time,
            bid: c.close - half_spread,
            ask: c.close + half_spread,
            last: c.close,
            volume: c.volume,
        })
        .collect()
}
