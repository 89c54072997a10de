use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use crate::{
    broker::sim::SimulatedBroker,
    candles::builder::CandleBuilder,
    config::{RiskConfig, TrailingStop},
    data::domain::Side,
    math::atr::average_true_range,
    timeframe::Timeframe,
};

/// Walks open positions on the controller's cadence and tightens stops:
/// breakeven shift once the trade is far enough in profit, then a fixed or
/// ATR trailing stop.
///
/// Stateless per invocation; every modification goes through
/// `SimulatedBroker::modify_position`, which re-validates stop distances.
pub struct TradeManager {
    config: RiskConfig,
}

impl TradeManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn manage_open_positions(
        &self,
        broker: &mut SimulatedBroker,
        builders: &HashMap<Arc<str>, CandleBuilder>,
    ) {
        for ticket in broker.open_tickets() {
            let Some(pos) = broker.position(ticket) else {
                continue;
            };
            let Some((bid, ask)) = broker.quote(&pos.symbol) else {
                continue;
            };
            let Some(info) = broker.symbol_info(&pos.symbol) else {
                continue;
            };
            let point = info.point;
            let direction = pos.side.direction();
            let market = match pos.side {
                Side::Buy => bid,
                Side::Sell => ask,
            };

            let mut candidate: Option<f64> = None;

            // Breakeven: once the trade has run `breakeven_trigger_rr` times
            // its initial risk, park the stop at entry plus a small offset.
            // Skipped when the stop already sits at or beyond entry.
            if self.config.use_breakeven
                && let Some(r) = pos.r_multiple(market)
                && r >= self.config.breakeven_trigger_rr
                && (pos.sl - pos.open_price) * direction < 0.0
            {
                let be = pos.open_price + self.config.breakeven_offset_points * point * direction;
                candidate = Some(be);
            }

            // Trailing stop: keep the stop a fixed or ATR-scaled distance
            // behind the closing-side price.
            let trail_distance = match self.config.trailing_stop {
                TrailingStop::Off => None,
                TrailingStop::FixedPoints(points) => Some(points * point),
                TrailingStop::Atr { period, multiplier } => {
                    let timeframe = self.atr_timeframe(pos.range_id.as_deref());
                    builders
                        .get(pos.symbol.as_str())
                        .and_then(|builder| builder.completed(timeframe))
                        .and_then(|candles| average_true_range(candles, period))
                        .map(|atr| atr * multiplier)
                }
            };
            if let Some(distance) = trail_distance
                && distance > 0.0
            {
                let trail = market - distance * direction;
                candidate = Some(match candidate {
                    // Tightest wins: the stop furthest along the profit
                    // direction.
                    Some(existing) if (existing - trail) * direction >= 0.0 => existing,
                    _ => trail,
                });
            }

            let Some(new_sl) = candidate else {
                continue;
            };
            // Only move stops toward profit, never loosen.
            let improves = pos.sl == 0.0 || (new_sl - pos.sl) * direction > 0.0;
            if !improves {
                continue;
            }

            let tp = pos.tp;
            match broker.modify_position(ticket, new_sl, tp) {
                Ok(()) => debug!(ticket, new_sl, "stop tightened"),
                Err(e) => warn!(ticket, new_sl, reason = %e, "stop modification rejected"),
            }
        }
    }

    /// ATR timeframe for a position's range, falling back to the configured
    /// trailing timeframe when the range has no dedicated entry.
    fn atr_timeframe(&self, range_id: Option<&str>) -> Timeframe {
        range_id
            .and_then(|range| self.config.atr_timeframe_by_range.get(range))
            .copied()
            .unwrap_or(self.config.trailing_timeframe)
    }
}
