use std::num::ParseIntError;

use thiserror::Error;

pub type TickforgeResult<T> = Result<T, TickforgeError>;

#[derive(Debug, Error)]
pub enum TickforgeError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// Errors related to market data loading, parsing, and availability.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Invalid symbol string: '{0}'")]
    InvalidSymbol(String),

    #[error("Invalid timeframe string: '{0}'")]
    InvalidTimeframe(String),

    #[error("Invalid position comment: '{0}'")]
    InvalidComment(String),

    #[error("No data available for '{symbol}' on {day}: {msg}")]
    SourceUnavailable {
        symbol: String,
        day: String,
        msg: String,
    },

    #[error("Insufficient data for '{symbol}': have {have} bars, strategy requires {need}")]
    InsufficientData {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("Chronology violation in '{stream}': {prev} followed by {next}")]
    ChronologyViolation {
        stream: String,
        prev: String,
        next: String,
    },

    #[error("Data frame error: {0}")]
    DataFrame(String),

    #[error("Failed timestamp conversion: {0}")]
    TimestampConversion(String),

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

/// Errors raised by the tiered parquet cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache validation failed for '{symbol}' ({dataset}): {reason}")]
    ValidationFailed {
        symbol: String,
        dataset: String,
        reason: String,
    },

    #[error("Corrupt cache file {path}: {msg}")]
    Corrupt { path: String, msg: String },

    #[error("Cache index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Missing symbol info for '{0}'")]
    MissingSymbolInfo(String),
}

/// Order and position errors reported by the simulated broker.
///
/// Rejections are recoverable: the caller drops the signal and the run
/// continues. They are never fatal.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid volume {volume} for '{symbol}': {msg}")]
    InvalidVolume {
        symbol: String,
        volume: f64,
        msg: String,
    },

    #[error("Invalid stops for '{symbol}': {msg}")]
    InvalidStops { symbol: String, msg: String },

    #[error("Not enough money: required margin {required:.2}, free {free:.2}")]
    NoMoney { required: f64, free: f64 },

    #[error("Unknown symbol: '{0}'")]
    UnknownSymbol(String),

    #[error("No quote yet for '{0}'")]
    NoQuote(String),

    #[error("Unknown ticket: {0}")]
    UnknownTicket(u64),

    #[error("Market closed for '{0}'")]
    MarketClosed(String),
}

/// Pre-trade risk check failures. Like broker rejections, these drop the
/// signal and the run continues.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Position limit reached for {key}: {msg}")]
    PositionLimit { key: String, msg: String },

    #[error("Portfolio risk cap exceeded: {current:.2}% + {incoming:.2}% > {cap:.2}%")]
    PortfolioRiskCap {
        current: f64,
        incoming: f64,
        cap: f64,
    },

    #[error("Computed lot size is zero for '{symbol}': {msg}")]
    ZeroLots { symbol: String, msg: String },

    #[error("Cooldown active for {key}: {remaining_secs}s remaining")]
    CooldownActive { key: String, remaining_secs: i64 },
}

/// Errors related to the replay engine configuration and execution loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Empty replay range (start: {start}, end: {end})")]
    EmptyRange { start: String, end: String },

    #[error("No symbols survived data validation")]
    NoSymbols,

    #[error("Run cancelled by user")]
    Cancelled,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Errors related to file I/O and serialization.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Failed to create writer: {0}")]
    WriterCreation(String),

    #[error("Failed to create reader: {0}")]
    ReaderCreation(String),

    #[error("Failed to write data: {0}")]
    WriteFailed(String),

    #[error("Failed to read data: {0}")]
    ReadFailed(String),
}

impl TickforgeError {
    /// True for errors that drop a single signal or day without ending the
    /// run (order rejections, risk rejections, per-day source failures).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Broker(_) | Self::Risk(_) => true,
            Self::Data(DataError::SourceUnavailable { .. }) => true,
            Self::Cache(CacheError::ValidationFailed { .. }) => true,
            Self::Cache(CacheError::Corrupt { .. }) => true,
            _ => false,
        }
    }
}
