use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    broker::{position::CloseReason, sim::SimulatedBroker},
    candles::builder::CandleBuilder,
    config::{EngineConfig, TrailingStop},
    data::domain::SymbolInfo,
    engine::{equity::EquityCurve, summary::RunSummary},
    error::{EngineError, TickforgeResult},
    loader::streaming::TickStream,
    orders::{OrderManager, PositionSink},
    risk::RiskManager,
    strategy::{Strategy, StrategyContext},
    timeframe::Timeframe,
    trade_manager::TradeManager,
};

/// Progress callback: `(ticks_processed, estimated_total)`. Rendering is
/// the caller's business.
pub type ProgressFn = Box<dyn FnMut(u64, Option<u64>) + Send>;

struct SymbolBinding {
    strategy: Box<dyn Strategy>,
    required: BTreeSet<Timeframe>,
    magic: u64,
}

/// The replay loop. Pulls the merged tick stream, drives the broker and the
/// candle builders, dispatches strategies event-style, routes signals
/// through the order pipeline, and walks open positions on a minute
/// cadence.
///
/// Single-threaded by design: the merged stream defines a total order, so
/// position state and P&L are deterministic without any locking.
pub struct BacktestController {
    config: EngineConfig,
    broker: SimulatedBroker,
    builders: HashMap<Arc<str>, CandleBuilder>,
    bindings: HashMap<Arc<str>, SymbolBinding>,
    order_manager: OrderManager,
    trade_manager: TradeManager,
    equity: EquityCurve,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
    excluded: Vec<String>,
}

impl BacktestController {
    pub fn new(
        config: EngineConfig,
        strategies: Vec<(String, Box<dyn Strategy>)>,
        position_sink: Box<dyn PositionSink>,
    ) -> TickforgeResult<Self> {
        config.validate()?;

        let broker = SimulatedBroker::new(
            config.initial_balance,
            config.leverage,
            config.spread_policy,
            config.slippage_policy,
        );

        // The ATR trailing stop consumes candles too; its timeframes must
        // be maintained even when no strategy asks for them.
        let mut ambient_timeframes = config.timeframes.clone();
        if let TrailingStop::Atr { .. } = config.risk.trailing_stop {
            ambient_timeframes.insert(config.risk.trailing_timeframe);
            ambient_timeframes.extend(config.risk.atr_timeframe_by_range.values().copied());
        }

        let mut builders = HashMap::new();
        let mut bindings = HashMap::new();
        for (symbol, strategy) in strategies {
            if !config.symbols.contains(&symbol) {
                return Err(EngineError::InvalidConfig(format!(
                    "strategy '{}' bound to unconfigured symbol '{symbol}'",
                    strategy.id()
                ))
                .into());
            }
            let symbol: Arc<str> = Arc::from(symbol.as_str());
            let required = strategy.required_timeframes();
            let mut maintained = required.clone();
            maintained.extend(ambient_timeframes.iter().copied());
            builders.insert(symbol.clone(), CandleBuilder::new(symbol.clone(), &maintained));
            bindings.insert(
                symbol.clone(),
                SymbolBinding {
                    magic: strategy.magic(),
                    required,
                    strategy,
                },
            );
        }

        let order_manager = OrderManager::new(
            RiskManager::new(config.risk.clone()),
            config.cooldown_secs,
            position_sink,
        );
        let trade_manager = TradeManager::new(config.risk.clone());

        Ok(Self {
            config,
            broker,
            builders,
            bindings,
            order_manager,
            trade_manager,
            equity: EquityCurve::default(),
            cancel: CancellationToken::new(),
            progress: None,
            excluded: Vec::new(),
        })
    }

    pub fn set_symbol_info(&mut self, symbol: &str, info: SymbolInfo) {
        self.broker.set_symbol_info(symbol, info);
    }

    pub fn set_progress(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    /// Token the embedding application cancels to stop the run; the
    /// end-of-run path (force-close, summary) still executes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drop a symbol from the run (e.g. after an insufficient-data check).
    pub fn exclude_symbol(&mut self, symbol: &str, reason: &str) {
        warn!(%symbol, reason, "symbol excluded from run");
        self.bindings.remove(symbol);
        self.builders.remove(symbol);
        self.excluded.push(symbol.to_string());
    }

    pub fn broker(&self) -> &SimulatedBroker {
        &self.broker
    }

    pub fn equity_curve(&self) -> &EquityCurve {
        &self.equity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replay the merged stream to completion (or cancellation) and return
    /// the summary. Orders placed in response to tick T become visible to
    /// stop checks from tick T+1, because the broker processes each tick
    /// before the strategy sees it.
    #[tracing::instrument(skip_all)]
    pub fn run(&mut self, stream: &mut dyn TickStream) -> TickforgeResult<RunSummary> {
        let estimate = stream.estimate_count();
        let mut tick_index: u64 = 0;
        let mut candles_closed: u64 = 0;
        let mut signals_emitted: u64 = 0;
        let mut cancelled = false;
        let mut last_managed_minute: Option<DateTime<Utc>> = None;

        while let Some(gt) = stream.next_tick()? {
            if gt.time() < self.broker.current_time() {
                return Err(EngineError::InvariantViolation(format!(
                    "stream went backwards: {} after {}",
                    gt.time(),
                    self.broker.current_time()
                ))
                .into());
            }
            tick_index += 1;

            self.broker.on_tick(&gt);

            let symbol: &str = &gt.symbol;
            if let Some(binding) = self.bindings.get_mut(symbol) {
                let builder = self
                    .builders
                    .get_mut(symbol)
                    .expect("every bound symbol has a builder");
                let tick = &gt.tick;
                let transitions = builder.ingest_tick(tick.bid, tick.volume, tick.time);
                candles_closed += transitions.len() as u64;

                let dispatch = binding.required.is_empty()
                    || transitions.iter().any(|tf| binding.required.contains(tf));
                if dispatch {
                    let ctx = StrategyContext::new(&self.broker, &self.builders, symbol, tick);
                    if let Some(signal) = binding.strategy.on_tick(&ctx) {
                        signals_emitted += 1;
                        self.order_manager
                            .execute(&mut self.broker, &signal, binding.magic);
                    }
                }
            }

            // Position management on minute boundaries only; per-tick stop
            // checks already happened inside the broker.
            let minute = Timeframe::M1.align_down(gt.time());
            if last_managed_minute != Some(minute) {
                if last_managed_minute.is_some() {
                    self.trade_manager
                        .manage_open_positions(&mut self.broker, &self.builders);
                }
                last_managed_minute = Some(minute);
            }

            if tick_index % self.config.equity_snapshot_interval == 0 {
                self.record_equity_point();
            }
            if tick_index % self.config.progress_update_interval == 0
                && let Some(progress) = &mut self.progress
            {
                progress(tick_index, estimate);
            }
            if tick_index % self.config.cancel_check_interval == 0 {
                self.broker.assert_consistent()?;
                if self.cancel.is_cancelled() {
                    info!(tick_index, "cancellation requested, ending run");
                    cancelled = true;
                    break;
                }
            }
        }

        // End-of-run path, shared with cancellation: force-close at the
        // last known mid and take a final equity point.
        self.broker.close_all_at_mid(CloseReason::EndOfRun);
        self.record_equity_point();
        self.broker.assert_consistent()?;

        let summary = RunSummary {
            ticks_processed: tick_index,
            ticks_filtered: stream.filtered_count(),
            candles_closed,
            signals_emitted,
            signals_executed: self.order_manager.executed(),
            signals_dropped: self.order_manager.drops(),
            symbols_excluded: self.excluded.clone(),
            cache_days_refetched: 0,
            days_absent: 0,
            closed_trades: self.broker.closed_trades().len(),
            initial_balance: self.broker.initial_balance(),
            final_balance: self.broker.balance(),
            final_equity: self.broker.equity(),
            max_drawdown: self.equity.max_drawdown(),
            cancelled,
        };
        info!(
            ticks = summary.ticks_processed,
            trades = summary.closed_trades,
            net = summary.net_profit(),
            "run finished"
        );
        Ok(summary)
    }

    fn record_equity_point(&mut self) {
        self.equity.push(
            self.broker.current_time(),
            self.broker.balance(),
            self.broker.equity(),
            self.broker.open_position_count(),
            self.broker.floating_pnl_total(),
        );
    }
}
