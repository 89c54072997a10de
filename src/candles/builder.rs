use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use smallvec::SmallVec;

use crate::{
    candles::series::CandleSeries,
    data::domain::Candle,
    error::TickforgeResult,
    timeframe::Timeframe,
};

/// Set of timeframes whose candle closed on a given tick. Sized for the
/// common case of a handful of configured frames per symbol.
pub type Transitions = SmallVec<[Timeframe; 4]>;

/// Per-symbol, multi-timeframe, tick-driven OHLCV aggregator.
///
/// Only maintains state for the timeframes requested at construction (the
/// union of the symbol's strategies' required frames). Everything else costs
/// nothing per tick, which is the single highest-impact optimization in the
/// replay loop.
#[derive(Debug)]
pub struct CandleBuilder {
    symbol: Arc<str>,
    lanes: Vec<Lane>,
}

#[derive(Debug)]
struct Lane {
    tf: Timeframe,
    duration_secs: i64,
    /// The currently open candle; `None` before the first tick.
    current: Option<Candle>,
    /// Aligned open boundary of `current`. Meaningless while `current` is
    /// `None`.
    last_boundary: DateTime<Utc>,
    series: CandleSeries,
}

impl CandleBuilder {
    pub fn new(symbol: Arc<str>, timeframes: &BTreeSet<Timeframe>) -> Self {
        let lanes = timeframes
            .iter()
            .map(|&tf| Lane {
                tf,
                duration_secs: tf.duration_seconds(),
                current: None,
                last_boundary: DateTime::<Utc>::MIN_UTC,
                series: CandleSeries::default(),
            })
            .collect();
        Self { symbol, lanes }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.lanes.iter().map(|lane| lane.tf)
    }

    /// Fold one tick into every configured timeframe.
    ///
    /// Returns the timeframes that produced a newly completed candle; the
    /// controller uses that set to drive event-based strategy dispatch. The
    /// first tick of a lane opens its first candle and transitions nothing.
    pub fn ingest_tick(&mut self, price: f64, volume: f64, ts: DateTime<Utc>) -> Transitions {
        let mut closed = Transitions::new();

        for lane in &mut self.lanes {
            match &mut lane.current {
                Some(current) => {
                    // Cheap path: still strictly inside the current window.
                    // Sub-second remainders truncate toward zero, which only
                    // ever keeps us on the cheap path one tick longer.
                    let elapsed = (ts - lane.last_boundary).num_seconds();
                    if elapsed < lane.duration_secs {
                        current.absorb(price, volume);
                        continue;
                    }

                    let boundary = lane.tf.align_down(ts);
                    if boundary == lane.last_boundary {
                        // Nominal duration elapsed but the calendar window
                        // (W1/MN1) has not rolled over yet.
                        current.absorb(price, volume);
                        continue;
                    }

                    lane.series.push(*current);
                    *current = Candle::opening(boundary, price, volume);
                    lane.last_boundary = boundary;
                    closed.push(lane.tf);
                }
                None => {
                    let boundary = lane.tf.align_down(ts);
                    lane.current = Some(Candle::opening(boundary, price, volume));
                    lane.last_boundary = boundary;
                }
            }
        }

        closed
    }

    /// All completed candles for `tf`; `None` when the timeframe was not
    /// configured.
    pub fn completed(&self, tf: Timeframe) -> Option<&[Candle]> {
        self.lane(tf).map(|lane| lane.series.all())
    }

    /// Last `count` completed candles for `tf`.
    pub fn last_n(&self, tf: Timeframe, count: usize) -> Option<&[Candle]> {
        self.lane(tf).map(|lane| lane.series.last_n(count))
    }

    /// The currently forming (not yet closed) candle.
    pub fn open_candle(&self, tf: Timeframe) -> Option<&Candle> {
        self.lane(tf).and_then(|lane| lane.current.as_ref())
    }

    /// Memoized columnar snapshot of the last `count` completed candles.
    pub fn snapshot(&mut self, tf: Timeframe, count: usize) -> Option<TickforgeResult<DataFrame>> {
        self.lanes
            .iter_mut()
            .find(|lane| lane.tf == tf)
            .map(|lane| lane.series.snapshot(count))
    }

    fn lane(&self, tf: Timeframe) -> Option<&Lane> {
        self.lanes.iter().find(|lane| lane.tf == tf)
    }
}
