#![allow(dead_code)]

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tickforge::{
    EngineConfig, Strategy, StrategyContext, Tick, Timeframe, TradeSignal,
    config::CacheConfig,
    data::domain::{Confirmations, Side, Sizing, SymbolInfo},
    error::TickforgeResult,
    loader::source::TickSource,
};

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

pub fn tick(time: &str, bid: f64) -> Tick {
    Tick {
        time: ts(time),
        bid,
        ask: bid + 0.0002,
        last: bid + 0.0001,
        volume: 1.0,
    }
}

/// One tick per second walking linearly from `from` to `to` over `secs`
/// seconds, starting at `start`.
pub fn ramp(start: &str, secs: i64, from: f64, to: f64) -> Vec<Tick> {
    let t0 = ts(start);
    (0..secs)
        .map(|i| {
            let frac = i as f64 / (secs - 1).max(1) as f64;
            let bid = from + (to - from) * frac;
            Tick {
                time: t0 + chrono::Duration::seconds(i),
                bid,
                ask: bid + 0.0002,
                last: bid + 0.0001,
                volume: 1.0,
            }
        })
        .collect()
}

/// In-memory tick source with a request counter, for cache-hit assertions.
pub struct ScriptedTickSource {
    days: HashMap<(String, NaiveDate), Vec<Tick>>,
    info: SymbolInfo,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTickSource {
    pub fn new() -> Self {
        Self {
            days: HashMap::new(),
            info: SymbolInfo::fx_major(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_day(mut self, symbol: &str, day: &str, ticks: Vec<Tick>) -> Self {
        self.days.insert((symbol.to_string(), date(day)), ticks);
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl TickSource for ScriptedTickSource {
    async fn fetch_ticks(&self, symbol: &str, day: NaiveDate) -> TickforgeResult<Vec<Tick>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .days
            .get(&(symbol.to_string(), day))
            .cloned()
            .unwrap_or_default())
    }

    async fn symbol_info(&self, _symbol: &str) -> TickforgeResult<SymbolInfo> {
        Ok(self.info.clone())
    }
}

/// Tick-only strategy that emits one pre-scripted signal per trigger time.
pub struct ScriptedStrategy {
    id: String,
    triggers: Vec<(DateTime<Utc>, SignalSpec)>,
    next: usize,
}

#[derive(Clone)]
pub struct SignalSpec {
    pub side: Side,
    pub sl: f64,
    pub tp: f64,
    pub confirmations: Confirmations,
    pub range_id: Option<String>,
    pub lots: f64,
}

impl ScriptedStrategy {
    pub fn new(id: &str, triggers: Vec<(DateTime<Utc>, SignalSpec)>) -> Self {
        Self {
            id: id.to_string(),
            triggers,
            next: 0,
        }
    }
}

impl Strategy for ScriptedStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn magic(&self) -> u64 {
        4242
    }

    fn required_timeframes(&self) -> BTreeSet<Timeframe> {
        BTreeSet::new()
    }

    fn on_tick(&mut self, ctx: &StrategyContext<'_>) -> Option<TradeSignal> {
        let (fire_at, spec) = self.triggers.get(self.next)?.clone();
        if ctx.time() < fire_at {
            return None;
        }
        self.next += 1;
        let entry = ctx.price(spec.side)?;
        Some(TradeSignal {
            symbol: Arc::from(ctx.symbol()),
            side: spec.side,
            entry_hint: entry,
            sl: spec.sl,
            tp: spec.tp,
            strategy_id: self.id.clone(),
            range_id: spec.range_id.clone(),
            confirmations: spec.confirmations,
            sizing: Sizing::Lots(spec.lots),
            comment: String::new(),
        })
    }
}

/// Engine config over a scratch cache root covering one replay day.
pub fn single_day_config(cache_root: &std::path::Path, day: &str) -> EngineConfig {
    EngineConfig {
        start_date: date(day),
        end_date: date(day),
        symbols: vec!["EURUSD".to_string()],
        cache: CacheConfig {
            root: cache_root.to_path_buf(),
            ..Default::default()
        },
        equity_snapshot_interval: 10,
        ..Default::default()
    }
}

pub fn buy_signal(sl: f64, tp: f64) -> SignalSpec {
    SignalSpec {
        side: Side::Buy,
        sl,
        tp,
        confirmations: Confirmations::new(1, 2),
        range_id: None,
        lots: 0.1,
    }
}
