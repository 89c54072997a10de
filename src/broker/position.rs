use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::data::domain::{Side, SymbolInfo};

/// Why a position left the book.
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
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Sl,
    Tp,
    Manual,
    EndOfRun,
}

/// An open trade. Created by the broker on an accepted order; the stop
/// fields are the only part mutated afterwards (by the trade manager through
/// the broker).
///
/// `sl == 0.0` / `tp == 0.0` mean "no stop on that side"; a zero side is
/// never checked against the market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    pub sl: f64,
    pub tp: f64,
    pub magic: u64,
    pub comment: String,
    pub strategy_id: String,
    pub range_id: Option<String>,
}

impl Position {
    /// Floating P&L at `current_price`, in account currency.
    pub fn floating_pnl(&self, current_price: f64, info: &SymbolInfo) -> f64 {
        (current_price - self.open_price) * self.side.direction() * self.volume * info.tick_value
            / info.tick_size
    }

    /// Signed profit distance in R-multiples of the initial stop distance.
    /// `None` when no stop is set (risk is unbounded).
    pub fn r_multiple(&self, current_price: f64) -> Option<f64> {
        if self.sl == 0.0 {
            return None;
        }
        let risk = (self.open_price - self.sl) * self.side.direction();
        if risk <= 0.0 {
            return None;
        }
        Some((current_price - self.open_price) * self.side.direction() / risk)
    }
}

/// Record appended when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub close_time: DateTime<Utc>,
    pub close_price: f64,
    pub reason: CloseReason,
    pub profit: f64,
}

/// Market order request, produced by the order manager from a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub sl: f64,
    pub tp: f64,
    pub magic: u64,
    pub comment: String,
    pub strategy_id: String,
    pub range_id: Option<String>,
}
