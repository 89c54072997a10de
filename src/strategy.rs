use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    broker::{position::Position, sim::SimulatedBroker},
    candles::builder::CandleBuilder,
    data::domain::{Candle, Side, Tick, TradeSignal},
    timeframe::Timeframe,
};

/// A trading strategy as the engine sees it: a fixed capability set invoked
/// polymorphically from the replay loop.
///
/// The engine, not the strategy, performs orders: `on_tick` only returns a
/// signal. An empty [`Strategy::required_timeframes`] set marks a tick-only
/// strategy that is dispatched on every tick of its symbol; otherwise the
/// strategy runs only when one of its required timeframes closes a candle.
pub trait Strategy: Send {
    /// Stable identifier used in position comments and the trade log.
    fn id(&self) -> &str;

    /// Magic number stamped on every position this strategy opens.
    fn magic(&self) -> u64;

    fn required_timeframes(&self) -> BTreeSet<Timeframe>;

    fn on_tick(&mut self, ctx: &StrategyContext<'_>) -> Option<TradeSignal>;

    /// Minimum completed bars on the slowest required timeframe before the
    /// symbol is worth running at all. Symbols below this are excluded.
    fn min_bars(&self) -> usize {
        0
    }
}

/// Read-only view handed to [`Strategy::on_tick`].
///
/// Candle lookups go through the per-series memoized snapshot cache, so
/// repeated `(timeframe, count)` queries within one invocation (and between
/// candle closes) cost a slice borrow, not a rebuild.
pub struct StrategyContext<'a> {
    broker: &'a SimulatedBroker,
    builders: &'a HashMap<Arc<str>, CandleBuilder>,
    symbol: &'a str,
    tick: &'a Tick,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        broker: &'a SimulatedBroker,
        builders: &'a HashMap<Arc<str>, CandleBuilder>,
        symbol: &'a str,
        tick: &'a Tick,
    ) -> Self {
        Self {
            broker,
            builders,
            symbol,
            tick,
        }
    }

    /// Symbol of the tick that triggered this invocation.
    pub fn symbol(&self) -> &str {
        self.symbol
    }

    pub fn tick(&self) -> &Tick {
        self.tick
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.broker.current_time()
    }

    /// Current fill-side price for this symbol: ask for buys, bid for
    /// sells.
    pub fn price(&self, side: Side) -> Option<f64> {
        self.broker.current_price(self.symbol, side)
    }

    /// Last `count` completed candles of this symbol. `None` when the
    /// timeframe is not maintained for it.
    pub fn candles(&self, timeframe: Timeframe, count: usize) -> Option<&[Candle]> {
        self.candles_for(self.symbol, timeframe, count)
    }

    /// Candle access across symbols, for strategies watching correlated
    /// markets.
    pub fn candles_for(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Option<&[Candle]> {
        self.builders.get(symbol)?.last_n(timeframe, count)
    }

    /// Open positions on this symbol, optionally filtered by magic number.
    pub fn open_positions(&self, magic: Option<u64>) -> Vec<&Position> {
        self.broker.open_positions(Some(self.symbol), magic)
    }

    /// Read-only broker handle for anything not covered by the shortcuts.
    pub fn broker(&self) -> &SimulatedBroker {
        self.broker
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use crate::{
        broker::policy::{SlippagePolicy, SpreadPolicy},
        data::domain::{Confirmations, GlobalTick, Sizing, SymbolInfo},
    };

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Buys once the M1 close rises twice in a row. Exists to exercise the
    /// contract, not to make money.
    struct TwoUpCloses {
        armed: bool,
    }

    impl Strategy for TwoUpCloses {
        fn id(&self) -> &str {
            "two_up_closes"
        }

        fn magic(&self) -> u64 {
            99
        }

        fn required_timeframes(&self) -> BTreeSet<Timeframe> {
            [Timeframe::M1].into_iter().collect()
        }

        fn on_tick(&mut self, ctx: &StrategyContext<'_>) -> Option<TradeSignal> {
            if !self.armed {
                return None;
            }
            let candles = ctx.candles(Timeframe::M1, 2)?;
            if candles.len() < 2 || candles[1].close <= candles[0].close {
                return None;
            }
            let entry = ctx.price(Side::Buy)?;
            self.armed = false;
            Some(TradeSignal {
                symbol: Arc::from(ctx.symbol()),
                side: Side::Buy,
                entry_hint: entry,
                sl: entry - 0.0010,
                tp: entry + 0.0015,
                strategy_id: self.id().to_string(),
                range_id: None,
                confirmations: Confirmations::new(1, 1),
                sizing: Sizing::Lots(0.1),
                comment: String::new(),
            })
        }
    }

    fn setup() -> (SimulatedBroker, HashMap<Arc<str>, CandleBuilder>) {
        let mut broker = SimulatedBroker::new(
            10_000.0,
            100.0,
            SpreadPolicy::FromTick,
            SlippagePolicy::default(),
        );
        broker.set_symbol_info("EURUSD", SymbolInfo::fx_major());

        let symbol: Arc<str> = Arc::from("EURUSD");
        let mut builders = HashMap::new();
        builders.insert(
            symbol.clone(),
            CandleBuilder::new(symbol, &[Timeframe::M1].into_iter().collect()),
        );
        (broker, builders)
    }

    fn feed(
        broker: &mut SimulatedBroker,
        builders: &mut HashMap<Arc<str>, CandleBuilder>,
        time: &str,
        bid: f64,
    ) -> Tick {
        let tick = Tick {
            time: ts(time),
            bid,
            ask: bid + 0.0002,
            last: bid + 0.0001,
            volume: 1.0,
        };
        let gt = GlobalTick {
            symbol: Arc::from("EURUSD"),
            symbol_ord: 0,
            tick,
        };
        broker.on_tick(&gt);
        builders
            .get_mut("EURUSD")
            .unwrap()
            .ingest_tick(tick.bid, tick.volume, tick.time);
        tick
    }

    #[test]
    fn test_context_exposes_candles_and_price() {
        let (mut broker, mut builders) = setup();
        feed(&mut broker, &mut builders, "2024-01-02T00:00:30Z", 1.1000);
        feed(&mut broker, &mut builders, "2024-01-02T00:01:30Z", 1.1005);
        let tick = feed(&mut broker, &mut builders, "2024-01-02T00:02:30Z", 1.1010);

        let ctx = StrategyContext::new(&broker, &builders, "EURUSD", &tick);
        let candles = ctx.candles(Timeframe::M1, 10).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(ctx.price(Side::Buy), Some(1.1012));
        assert_eq!(ctx.time(), ts("2024-01-02T00:02:30Z"));
        assert!(ctx.candles(Timeframe::H4, 1).is_none());
    }

    #[test]
    fn test_strategy_emits_signal_from_candle_pattern() {
        let (mut broker, mut builders) = setup();
        let mut strategy = TwoUpCloses { armed: true };

        feed(&mut broker, &mut builders, "2024-01-02T00:00:30Z", 1.1000);
        feed(&mut broker, &mut builders, "2024-01-02T00:01:30Z", 1.1005);
        let tick = feed(&mut broker, &mut builders, "2024-01-02T00:02:30Z", 1.1010);

        let ctx = StrategyContext::new(&broker, &builders, "EURUSD", &tick);
        let signal = strategy.on_tick(&ctx).expect("two rising closes");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(&*signal.symbol, "EURUSD");
        assert!(signal.sl < signal.entry_hint);
        assert!(signal.tp > signal.entry_hint);

        // Disarmed after the first emission.
        assert!(strategy.on_tick(&ctx).is_none());
    }
}
