use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    broker::policy::{SlippagePolicy, SpreadPolicy},
    error::{EngineError, IoError, TickforgeResult},
    timeframe::Timeframe,
};

/// Which tick parquet variant drives the replay.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
    Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TickType {
    #[default]
    All,
    Info,
    Trade,
}

/// Tiered-cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub ttl_days: u32,
    pub gap_threshold_days: u32,
    pub parallel_fetch_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data_cache"),
            ttl_days: 7,
            gap_threshold_days: 1,
            parallel_fetch_days: 10,
        }
    }
}

/// Trailing-stop flavor applied by the trade manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrailingStop {
    #[default]
    Off,
    /// Keep the stop a fixed distance in points behind the price.
    FixedPoints(f64),
    /// Scale the trailing distance by ATR over the trailing timeframe.
    Atr { period: usize, multiplier: f64 },
}

/// Risk and position-management settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_positions: usize,
    pub max_per_trade_risk_pct: f64,
    pub max_portfolio_risk_pct: f64,
    pub use_breakeven: bool,
    /// R-multiple at which the stop moves to entry.
    pub breakeven_trigger_rr: f64,
    /// Offset past entry (in points) when shifting to breakeven, so the
    /// exit covers costs.
    pub breakeven_offset_points: f64,
    pub trailing_stop: TrailingStop,
    /// Timeframe the ATR trailing stop samples when a position's range id
    /// has no dedicated entry below.
    pub trailing_timeframe: Timeframe,
    /// Per-range override of the ATR timeframe.
    pub atr_timeframe_by_range: HashMap<String, Timeframe>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_positions: 10,
            max_per_trade_risk_pct: 1.0,
            max_portfolio_risk_pct: 5.0,
            use_breakeven: false,
            breakeven_trigger_rr: 1.0,
            breakeven_offset_points: 0.0,
            trailing_stop: TrailingStop::Off,
            trailing_timeframe: Timeframe::M15,
            atr_timeframe_by_range: HashMap::new(),
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inclusive UTC replay range.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Ordered symbol list; the order defines the equal-timestamp
    /// tie-break of the merged stream.
    pub symbols: Vec<String>,
    /// Timeframes requested in addition to whatever the strategies require.
    pub timeframes: BTreeSet<Timeframe>,
    /// Drive replay from tick shards (`true`) or M1 candles (`false`).
    pub use_ticks: bool,
    pub tick_type: TickType,
    pub initial_balance: f64,
    /// Margin-estimation leverage.
    pub leverage: f64,
    pub spread_policy: SpreadPolicy,
    pub slippage_policy: SlippagePolicy,
    pub cache: CacheConfig,
    pub risk: RiskConfig,
    /// Seconds a `(symbol, strategy)` pair must wait between submissions.
    /// Zero disables the cooldown.
    pub cooldown_secs: i64,
    /// Record an equity point every N ticks.
    pub equity_snapshot_interval: u64,
    /// Emit a progress callback every N ticks.
    pub progress_update_interval: u64,
    /// Poll the cancellation token every N ticks.
    pub cancel_check_interval: u64,
    /// Rows pulled per streaming read of a tick shard.
    pub stream_chunk_size: usize,
    pub log_level: String,
    pub async_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            symbols: Vec::new(),
            timeframes: BTreeSet::new(),
            use_ticks: true,
            tick_type: TickType::default(),
            initial_balance: 10_000.0,
            leverage: 100.0,
            spread_policy: SpreadPolicy::default(),
            slippage_policy: SlippagePolicy::default(),
            cache: CacheConfig::default(),
            risk: RiskConfig::default(),
            cooldown_secs: 0,
            equity_snapshot_interval: 1_000,
            progress_update_interval: 100_000,
            cancel_check_interval: 1_024,
            stream_chunk_size: 100_000,
            log_level: "info".to_string(),
            async_logging: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> TickforgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(IoError::Io)?;
        let config: Self = serde_json::from_str(&raw).map_err(IoError::Json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TickforgeResult<()> {
        if self.start_date > self.end_date {
            return Err(EngineError::EmptyRange {
                start: self.start_date.to_string(),
                end: self.end_date.to_string(),
            }
            .into());
        }
        if self.symbols.is_empty() {
            return Err(EngineError::InvalidConfig("symbols list is empty".to_string()).into());
        }
        if self.initial_balance <= 0.0 {
            return Err(
                EngineError::InvalidConfig("initial_balance must be positive".to_string()).into(),
            );
        }
        if self.risk.max_positions == 0 {
            return Err(
                EngineError::InvalidConfig("max_positions must be at least 1".to_string()).into(),
            );
        }
        if self.equity_snapshot_interval == 0
            || self.progress_update_interval == 0
            || self.cancel_check_interval == 0
            || self.stream_chunk_size == 0
        {
            return Err(
                EngineError::InvalidConfig("intervals must be at least 1".to_string()).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            symbols: vec!["EURUSD".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.ttl_days, 7);
        assert_eq!(config.cache.gap_threshold_days, 1);
        assert_eq!(config.cache.parallel_fetch_days, 10);
        assert_eq!(config.cancel_check_interval, 1_024);
        assert_eq!(config.stream_chunk_size, 100_000);
        assert!(config.use_ticks);
    }

    #[test]
    fn test_validation_catches_inverted_range() {
        let config = EngineConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_symbols() {
        let config = EngineConfig::default();
        assert!(config.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = valid_config();
        config.risk.trailing_stop = TrailingStop::Atr {
            period: 14,
            multiplier: 2.0,
        };
        config
            .risk
            .atr_timeframe_by_range
            .insert("asia".to_string(), Timeframe::H1);

        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["EURUSD", "GBPUSD"], "initial_balance": 50000.0 }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.initial_balance, 50_000.0);
        assert_eq!(config.cache.ttl_days, 7);
    }
}
