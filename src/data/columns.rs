use polars::prelude::{DataType, Field, PlSmallStr, Schema, SchemaRef, TimeUnit, TimeZone};
use strum::{Display, EnumString, IntoStaticStr};

/// The standardized column vocabulary for all on-disk and in-memory frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Col {
    /// Primary index timestamp (`timestamp[us, UTC]`).
    /// - Ticks: quote time.
    /// - Candles: open time.
    /// - Equity curve: snapshot time.
    Time,

    // === Tick data ===
    Bid,
    Ask,
    Last,
    /// Tick volume as stored on disk (i64).
    Volume,

    // === Candle data ===
    Open,
    High,
    Low,
    Close,
    TickVolume,

    // === Equity curve ===
    Balance,
    Equity,
    OpenPositions,
    FloatingPnl,
}

impl From<Col> for PlSmallStr {
    fn from(value: Col) -> Self {
        value.as_str().into()
    }
}

impl Col {
    pub fn name(&self) -> PlSmallStr {
        (*self).into()
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::Time => DataType::Datetime(TimeUnit::Microseconds, Some(TimeZone::UTC)),
            Self::Volume | Self::TickVolume | Self::OpenPositions => DataType::Int64,
            _ => DataType::Float64,
        }
    }
}

/// Schema of a tick day shard: `time, bid, ask, last, volume`.
pub fn tick_schema() -> SchemaRef {
    schema_of(&[Col::Time, Col::Bid, Col::Ask, Col::Last, Col::Volume])
}

/// Schema of a candle day shard: `time, open, high, low, close, tick_volume`.
pub fn candle_schema() -> SchemaRef {
    schema_of(&[
        Col::Time,
        Col::Open,
        Col::High,
        Col::Low,
        Col::Close,
        Col::TickVolume,
    ])
}

/// Schema of the equity curve: `time, balance, equity, open_positions,
/// floating_pnl`.
pub fn equity_schema() -> SchemaRef {
    schema_of(&[
        Col::Time,
        Col::Balance,
        Col::Equity,
        Col::OpenPositions,
        Col::FloatingPnl,
    ])
}

fn schema_of(cols: &[Col]) -> SchemaRef {
    Schema::from_iter(cols.iter().map(|c| Field::new(c.name(), c.dtype()))).into()
}
