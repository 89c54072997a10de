use std::fmt;

use crate::{engine::equity::Drawdown, orders::SignalDropCounts};

/// Everything the run did, in numbers. Emitted at end-of-run and on
/// cancellation; every dropped signal, excluded symbol, and cache refetch
/// shows up here rather than disappearing silently.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub ticks_processed: u64,
    pub ticks_filtered: u64,
    pub candles_closed: u64,
    pub signals_emitted: u64,
    pub signals_executed: u64,
    pub signals_dropped: SignalDropCounts,
    pub symbols_excluded: Vec<String>,
    pub cache_days_refetched: u64,
    pub days_absent: u64,
    pub closed_trades: usize,
    pub initial_balance: f64,
    pub final_balance: f64,
    pub final_equity: f64,
    pub max_drawdown: Drawdown,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn net_profit(&self) -> f64 {
        self.final_balance - self.initial_balance
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== backtest summary ===")?;
        if self.cancelled {
            writeln!(f, "run cancelled by user; positions force-closed")?;
        }
        writeln!(f, "ticks processed:    {}", self.ticks_processed)?;
        writeln!(f, "ticks filtered:     {}", self.ticks_filtered)?;
        writeln!(f, "candles closed:     {}", self.candles_closed)?;
        writeln!(
            f,
            "signals:            {} emitted / {} executed",
            self.signals_emitted, self.signals_executed
        )?;
        writeln!(
            f,
            "signals dropped:    {} (cooldown {}, risk {}, sizing {}, broker {})",
            self.signals_dropped.total(),
            self.signals_dropped.cooldown,
            self.signals_dropped.risk,
            self.signals_dropped.zero_lots,
            self.signals_dropped.broker_rejected
        )?;
        if !self.symbols_excluded.is_empty() {
            writeln!(f, "symbols excluded:   {}", self.symbols_excluded.join(", "))?;
        }
        writeln!(
            f,
            "cache:              {} days refetched, {} days absent",
            self.cache_days_refetched, self.days_absent
        )?;
        writeln!(f, "closed trades:      {}", self.closed_trades)?;
        writeln!(
            f,
            "balance:            {:.2} -> {:.2} (net {:+.2})",
            self.initial_balance,
            self.final_balance,
            self.net_profit()
        )?;
        writeln!(f, "final equity:       {:.2}", self.final_equity)?;
        write!(
            f,
            "max drawdown:       {:.2} ({:.2}%)",
            self.max_drawdown.absolute,
            self.max_drawdown.relative * 100.0
        )
    }
}
