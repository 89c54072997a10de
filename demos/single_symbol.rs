use std::{collections::BTreeSet, path::Path, sync::Arc, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use tickforge::{
    BacktestRunner, EngineConfig, Strategy, StrategyContext, Tick, Timeframe, TradeSignal,
    config::CacheConfig,
    data::domain::{Confirmations, Side, Sizing, SymbolInfo},
    error::TickforgeResult,
    loader::source::TickSource,
    math::volume_cache::VolumeCache,
    report::{equity_writer::write_equity_csv, trade_log::TradeLog},
};

/// Deterministic synthetic feed: a slow sine walk with second-level ticks.
struct SyntheticFeed;

#[async_trait]
impl TickSource for SyntheticFeed {
    async fn fetch_ticks(&self, _symbol: &str, day: NaiveDate) -> TickforgeResult<Vec<Tick>> {
        let open = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
        let ticks = (0..8 * 3600)
            .map(|i| {
                let phase = i as f64 / 900.0;
                let bid = 1.1000 + 0.0030 * phase.sin() + 0.0004 * (phase * 7.3).cos();
                Tick {
                    time: open + chrono::Duration::seconds(i),
                    bid,
                    ask: bid + 0.0002,
                    last: bid + 0.0001,
                    volume: 1.0,
                }
            })
            .collect();
        Ok(ticks)
    }

    async fn symbol_info(&self, _symbol: &str) -> TickforgeResult<SymbolInfo> {
        Ok(SymbolInfo::fx_major())
    }
}

/// Long when the last two M5 closes rise on above-average volume, stop
/// under the previous low.
struct MomentumDemo {
    volumes: VolumeCache,
}

impl MomentumDemo {
    fn new() -> Self {
        Self {
            volumes: VolumeCache::new(20),
        }
    }
}

impl Strategy for MomentumDemo {
    fn id(&self) -> &str {
        "m5_momentum"
    }

    fn magic(&self) -> u64 {
        20240102
    }

    fn required_timeframes(&self) -> BTreeSet<Timeframe> {
        [Timeframe::M5].into_iter().collect()
    }

    fn on_tick(&mut self, ctx: &StrategyContext<'_>) -> Option<TradeSignal> {
        let candles = ctx.candles(Timeframe::M5, 3)?;
        if candles.len() < 3 {
            return None;
        }
        let last = candles[2];
        let average = self.volumes.average();
        let quiet = self.volumes.full() && last.volume <= average;
        self.volumes.update(last.volume);
        if quiet {
            return None;
        }
        let rising = last.close > candles[1].close && candles[1].close > candles[0].close;
        if !rising {
            return None;
        }
        let entry = ctx.price(Side::Buy)?;
        let sl = candles[1].low.min(entry - 0.0005);
        Some(TradeSignal {
            symbol: Arc::from(ctx.symbol()),
            side: Side::Buy,
            entry_hint: entry,
            sl,
            tp: entry + 2.0 * (entry - sl),
            strategy_id: self.id().to_string(),
            range_id: None,
            confirmations: Confirmations::new(2, 2),
            sizing: Sizing::RiskPct(0.5),
            comment: String::new(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig {
        start_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        symbols: vec!["EURUSD".to_string()],
        cache: CacheConfig {
            root: "demos/reports/cache".into(),
            ..Default::default()
        },
        ..Default::default()
    };

    let start = Instant::now();
    let run = BacktestRunner::new(config)?
        .with_tick_source(Arc::new(SyntheticFeed))
        .run(vec![("EURUSD".to_string(), Box::new(MomentumDemo::new()))])
        .await?;
    let elapsed = start.elapsed();

    let out = Path::new("demos/reports");
    std::fs::create_dir_all(out)?;
    let mut log = TradeLog::create(out.join("trades.csv"))?;
    log.append_all(run.controller.broker().closed_trades())?;
    write_equity_csv(run.controller.equity_curve(), out.join("equity.csv"))?;

    println!("{}", run.summary);
    println!("\nreplay time: {elapsed:?}");
    Ok(())
}
