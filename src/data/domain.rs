use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::error::{DataError, TickforgeResult};

// ================================================================================================
// Market events
// ================================================================================================

/// A single quote update. Owned by the source; read-only everywhere else.
///
/// Invariants: `ask >= bid > 0`; timestamps are monotone non-decreasing
/// within one symbol's sequence. Quotes violating the price invariant are
/// filtered at load time and never reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64,
}

impl Tick {
    /// Mid-price, used for end-of-run force closes.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// True when the quote is usable (`ask >= bid > 0`).
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask >= self.bid
    }
}

/// A tick tagged with its symbol for the merged cross-symbol timeline.
///
/// Ordered strictly by `(time, symbol_ord)`, where `symbol_ord` is the
/// insertion order of the symbol into the configured symbol list. This makes
/// equal-timestamp ties deterministic across runs.
#[derive(Debug, Clone)]
pub struct GlobalTick {
    pub symbol: Arc<str>,
    pub symbol_ord: u32,
    pub tick: Tick,
}

impl GlobalTick {
    pub fn time(&self) -> DateTime<Utc> {
        self.tick.time
    }
}

/// One OHLCV aggregation over a fixed timeframe window.
///
/// Invariants: `low <= open, close <= high`, `volume >= 0`, `open_time`
/// aligned to the timeframe boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Seed a fresh candle from the first tick of its window.
    pub fn opening(open_time: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Fold one more tick into the candle.
    pub fn absorb(&mut self, price: f64, volume: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }

    /// True Range against the previous close.
    pub fn true_range(&self, prev_close: f64) -> f64 {
        (self.high - self.low)
            .max((self.high - prev_close).abs())
            .max((self.low - prev_close).abs())
    }
}

// ================================================================================================
// Trade direction
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for long, -1 for short. Multiplies price deltas into signed P&L.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

// ================================================================================================
// Symbol metadata
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
    Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    Disabled,
    LongOnly,
    ShortOnly,
    #[default]
    Full,
}

/// Broker-independent symbol metadata, loaded once per symbol and immutable
/// during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Minimum price increment.
    pub point: f64,
    pub digits: u32,
    pub tick_size: f64,
    /// Account-currency value of one tick for one lot.
    pub tick_value: f64,
    pub contract_size: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    /// Minimum SL/TP distance from entry, in points.
    pub stops_level: f64,
    pub trade_mode: TradeMode,
}

impl SymbolInfo {
    /// Reasonable FX-major defaults, handy for tests and demos.
    pub fn fx_major() -> Self {
        Self {
            point: 0.00001,
            digits: 5,
            tick_size: 0.00001,
            tick_value: 1.0,
            contract_size: 100_000.0,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            stops_level: 0.0,
            trade_mode: TradeMode::Full,
        }
    }
}

// ================================================================================================
// Signals
// ================================================================================================

/// How the strategy wants the order sized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sizing {
    /// Fixed lot count, still clamped to the symbol's volume limits.
    Lots(f64),
    /// Percent of current equity risked between entry and stop.
    RiskPct(f64),
}

/// Output of a strategy invocation. The engine, not the strategy, performs
/// the order.
///
/// `sl` and `tp` use `0.0` for "none", matching the position lifecycle the
/// broker keeps (a zero side is never checked).
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub symbol: Arc<str>,
    pub side: Side,
    /// Price the strategy observed when deciding; fills still happen at the
    /// broker's current quote plus slippage.
    pub entry_hint: f64,
    pub sl: f64,
    pub tp: f64,
    pub strategy_id: String,
    pub range_id: Option<String>,
    pub confirmations: Confirmations,
    pub sizing: Sizing,
    pub comment: String,
}

impl TradeSignal {
    /// Position comment in the canonical parseable format.
    pub fn position_comment(&self) -> PositionComment {
        PositionComment {
            strategy_id: self.strategy_id.clone(),
            range_id: self.range_id.clone(),
            confirmations: self.confirmations,
        }
    }
}

/// Confirmation tally carried through signal comments, formatted `met/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Confirmations {
    pub met: u8,
    pub total: u8,
}

impl Confirmations {
    pub fn new(met: u8, total: u8) -> Self {
        Self { met, total }
    }

    /// The "all confirmations met" exception the duplicate check honors.
    pub fn all_met(&self) -> bool {
        self.total > 0 && self.met >= self.total
    }
}

impl fmt::Display for Confirmations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.met, self.total)
    }
}

impl std::str::FromStr for Confirmations {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (met, total) = s
            .split_once('/')
            .ok_or_else(|| DataError::InvalidComment(format!("confirmations '{s}'")))?;
        Ok(Self {
            met: met.trim().parse()?,
            total: total.trim().parse()?,
        })
    }
}

// ================================================================================================
// Position comments
// ================================================================================================

/// Structured position comment: `STRATEGY|RANGE_ID|CONFIRMATIONS` with the
/// range segment omitted when absent (`STRATEGY|CONFIRMATIONS`).
///
/// The risk manager parses these back out of open positions for its
/// duplicate check, so formatting and parsing must stay inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionComment {
    pub strategy_id: String,
    pub range_id: Option<String>,
    pub confirmations: Confirmations,
}

impl fmt::Display for PositionComment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range_id {
            Some(range) => write!(f, "{}|{}|{}", self.strategy_id, range, self.confirmations),
            None => write!(f, "{}|{}", self.strategy_id, self.confirmations),
        }
    }
}

impl PositionComment {
    pub fn parse(s: &str) -> TickforgeResult<Self> {
        let parts: Vec<&str> = s.split('|').collect();
        match parts.as_slice() {
            [strategy, range, conf] => Ok(Self {
                strategy_id: (*strategy).to_string(),
                range_id: Some((*range).to_string()),
                confirmations: conf.parse()?,
            }),
            [strategy, conf] => Ok(Self {
                strategy_id: (*strategy).to_string(),
                range_id: None,
                confirmations: conf.parse()?,
            }),
            _ => Err(DataError::InvalidComment(s.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    // ============================================================================
    // Part 1: Tick invariants
    // ============================================================================

    #[test]
    fn test_tick_validity() {
        let good = Tick {
            time: ts("2024-01-02T00:00:00Z"),
            bid: 1.1000,
            ask: 1.1002,
            last: 1.1001,
            volume: 1.0,
        };
        assert!(good.is_valid());
        assert!((good.mid() - 1.1001).abs() < 1e-12);

        let zero = Tick { bid: 0.0, ask: 0.0, ..good };
        assert!(!zero.is_valid());

        let crossed = Tick { bid: 1.2, ask: 1.1, ..good };
        assert!(!crossed.is_valid());
    }

    // ============================================================================
    // Part 2: Candle aggregation
    // ============================================================================

    #[test]
    fn test_candle_opening_and_absorb() {
        let mut c = Candle::opening(ts("2024-01-02T00:05:00Z"), 1.10, 2.0);
        assert_eq!(c.open, 1.10);
        assert_eq!(c.high, 1.10);
        assert_eq!(c.low, 1.10);
        assert_eq!(c.close, 1.10);

        c.absorb(1.12, 1.0);
        c.absorb(1.09, 3.0);
        c.absorb(1.11, 0.5);

        assert_eq!(c.open, 1.10);
        assert_eq!(c.high, 1.12);
        assert_eq!(c.low, 1.09);
        assert_eq!(c.close, 1.11);
        assert_eq!(c.volume, 6.5);
        assert!(c.low <= c.open && c.open <= c.high);
        assert!(c.low <= c.close && c.close <= c.high);
    }

    #[test]
    fn test_true_range_covers_gap() {
        let c = Candle {
            open_time: ts("2024-01-02T00:05:00Z"),
            open: 1.10,
            high: 1.11,
            low: 1.095,
            close: 1.105,
            volume: 1.0,
        };
        // Gap up from a previous close far below the low.
        assert!((c.true_range(1.05) - 0.06).abs() < 1e-12);
        // Plain range when the previous close sits inside.
        assert!((c.true_range(1.10) - 0.015).abs() < 1e-12);
    }

    // ============================================================================
    // Part 3: Comment format round trip
    // ============================================================================

    #[test]
    fn test_comment_with_range_round_trip() {
        let c = PositionComment {
            strategy_id: "fakeout".to_string(),
            range_id: Some("asia_session".to_string()),
            confirmations: Confirmations::new(3, 5),
        };
        let s = c.to_string();
        assert_eq!(s, "fakeout|asia_session|3/5");
        assert_eq!(PositionComment::parse(&s).unwrap(), c);
    }

    #[test]
    fn test_comment_without_range_round_trip() {
        let c = PositionComment {
            strategy_id: "hft_momentum".to_string(),
            range_id: None,
            confirmations: Confirmations::new(2, 2),
        };
        let s = c.to_string();
        assert_eq!(s, "hft_momentum|2/2");
        assert_eq!(PositionComment::parse(&s).unwrap(), c);
    }

    #[test]
    fn test_comment_parse_rejects_garbage() {
        assert!(PositionComment::parse("no pipes here").is_err());
        assert!(PositionComment::parse("a|b|c|d").is_err());
        assert!(PositionComment::parse("strat|not_a_tally").is_err());
    }

    #[test]
    fn test_confirmations_all_met() {
        assert!(Confirmations::new(3, 3).all_met());
        assert!(!Confirmations::new(2, 3).all_met());
        // Zero-of-zero is not "all met"; it means no confirmations exist.
        assert!(!Confirmations::new(0, 0).all_met());
    }

    // ============================================================================
    // Part 4: Side arithmetic
    // ============================================================================

    #[test]
    fn test_side_direction_and_labels() {
        assert_eq!(Side::Buy.direction(), 1.0);
        assert_eq!(Side::Sell.direction(), -1.0);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
    }
}
