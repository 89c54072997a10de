use std::{collections::HashMap, sync::Arc};

use tracing::{info, warn};

use crate::{
    broker::policy::SpreadPolicy,
    cache::{day_store::DataCache, meta::DatasetKey},
    config::EngineConfig,
    data::{
        domain::Tick,
        frames::frame_to_candles,
    },
    engine::{
        controller::BacktestController,
        summary::RunSummary,
    },
    error::TickforgeResult,
    loader::{
        fetch::DataLoader,
        resample::candles_to_ticks,
        source::{ArchiveFetcher, CandleSource, TickSource},
        streaming::{StreamingTickLoader, VecTickStream},
    },
    orders::{NullPositionSink, PositionSink},
    strategy::Strategy,
    timeframe::Timeframe,
};

/// A finished backtest: the summary plus the controller for report
/// extraction (closed trades, equity curve, open-position snapshot).
pub struct CompletedRun {
    pub summary: RunSummary,
    pub controller: BacktestController,
}

/// Glue between the data tier and the replay loop: loads every symbol's
/// range through the tiered cache, applies the insufficient-data exclusion,
/// builds the merged stream, and runs the controller over it.
pub struct BacktestRunner {
    config: EngineConfig,
    loader: DataLoader,
    position_sink: Option<Box<dyn PositionSink>>,
}

impl BacktestRunner {
    pub fn new(config: EngineConfig) -> TickforgeResult<Self> {
        config.validate()?;
        let cache = Arc::new(DataCache::open(
            &config.cache.root,
            config.cache.ttl_days,
            config.cache.gap_threshold_days,
        )?);
        let loader = DataLoader::new(cache)
            .with_parallel_fetch_days(config.cache.parallel_fetch_days as usize);
        Ok(Self {
            config,
            loader,
            position_sink: None,
        })
    }

    pub fn with_tick_source(mut self, source: Arc<dyn TickSource>) -> Self {
        self.loader = self.loader.with_tick_source(source);
        self
    }

    pub fn with_candle_source(mut self, source: Arc<dyn CandleSource>) -> Self {
        self.loader = self.loader.with_candle_source(source);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveFetcher>) -> Self {
        self.loader = self.loader.with_archive(archive);
        self
    }

    pub fn with_position_sink(mut self, sink: Box<dyn PositionSink>) -> Self {
        self.position_sink = Some(sink);
        self
    }

    /// Load data, exclude symbols that cannot run, replay, and summarize.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        mut self,
        strategies: Vec<(String, Box<dyn Strategy>)>,
    ) -> TickforgeResult<CompletedRun> {
        let config = self.config.clone();
        let min_bars: HashMap<String, usize> = strategies
            .iter()
            .map(|(symbol, strategy)| (symbol.clone(), strategy.min_bars()))
            .collect();

        let sink = self.position_sink.take().unwrap_or(Box::new(NullPositionSink));
        let mut controller = BacktestController::new(config.clone(), strategies, sink)?;

        let dataset = if config.use_ticks {
            DatasetKey::Ticks
        } else {
            DatasetKey::Candles(Timeframe::M1)
        };

        let mut days_refetched = 0u64;
        let mut days_absent = 0u64;
        let mut included: Vec<String> = Vec::new();
        let mut candle_ticks: Vec<(Arc<str>, Vec<Tick>)> = Vec::new();

        for symbol in &config.symbols {
            let loaded = self
                .loader
                .load_range(symbol, dataset, config.start_date, config.end_date)
                .await?;
            days_refetched += loaded.days_refetched as u64;
            days_absent += loaded.days_absent.len() as u64;

            let Some(info) = loaded.symbol_info else {
                controller.exclude_symbol(symbol, "no symbol info available");
                continue;
            };

            let rows = loaded.frame.as_ref().map(|f| f.height()).unwrap_or(0);
            if rows == 0 {
                controller.exclude_symbol(symbol, "no data in range");
                continue;
            }

            // Insufficient-data check against the strategy's bar minimum.
            let need = min_bars.get(symbol).copied().unwrap_or(0);
            if need > 0 {
                let bars = match dataset {
                    DatasetKey::Candles(_) => rows,
                    DatasetKey::Ticks => {
                        let candles = self
                            .loader
                            .load_range(
                                symbol,
                                DatasetKey::Candles(Timeframe::M1),
                                config.start_date,
                                config.end_date,
                            )
                            .await?;
                        days_refetched += candles.days_refetched as u64;
                        candles.frame.map(|f| f.height()).unwrap_or(0)
                    }
                };
                if bars < need {
                    warn!(%symbol, bars, need, "insufficient bars");
                    controller.exclude_symbol(symbol, "insufficient data");
                    continue;
                }
            }

            controller.set_symbol_info(symbol, info.clone());
            if !config.use_ticks {
                let candles = frame_to_candles(loaded.frame.as_ref().expect("rows > 0"))?;
                let half_spread = match config.spread_policy {
                    SpreadPolicy::FixedPoints(points) => points * info.point / 2.0,
                    SpreadPolicy::FromTick => 0.0,
                };
                candle_ticks.push((Arc::from(symbol.as_str()), candles_to_ticks(&candles, half_spread)));
            }
            included.push(symbol.clone());
        }

        info!(
            symbols = included.len(),
            days_refetched,
            days_absent,
            "data loading complete"
        );

        let mut summary = if config.use_ticks {
            let mut stream = StreamingTickLoader::from_cache(
                self.loader.cache(),
                &included,
                config.start_date,
                config.end_date,
                config.stream_chunk_size,
            );
            controller.run(&mut stream)?
        } else {
            let mut stream = VecTickStream::new(candle_ticks);
            controller.run(&mut stream)?
        };

        summary.cache_days_refetched = days_refetched;
        summary.days_absent = days_absent;
        Ok(CompletedRun {
            summary,
            controller,
        })
    }
}
