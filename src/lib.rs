// === Public Modules (The Canonical Paths) ===
pub mod broker;
pub mod cache;
pub mod candles;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod loader;
pub mod math;
pub mod orders;
pub mod report;
pub mod risk;
pub mod strategy;
pub mod timeframe;
pub mod trade_manager;

// === Facades (Re-exporting the everyday surface) ===
pub use crate::config::EngineConfig;
pub use crate::data::domain::{Candle, GlobalTick, Side, SymbolInfo, Tick, TradeSignal};
pub use crate::engine::{
    controller::BacktestController,
    runner::{BacktestRunner, CompletedRun},
    summary::RunSummary,
};
pub use crate::error::{TickforgeError, TickforgeResult};
pub use crate::strategy::{Strategy, StrategyContext};
pub use crate::timeframe::Timeframe;
