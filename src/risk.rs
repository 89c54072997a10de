use tracing::debug;

use crate::{
    broker::{position::Position, sim::SimulatedBroker},
    config::RiskConfig,
    data::domain::{PositionComment, Sizing, TradeSignal},
    error::{RiskError, TickforgeResult},
};

/// Pre-trade risk gate: duplicate-position check, global position cap,
/// portfolio-risk cap, and lot sizing.
///
/// All rejections are typed [`RiskError`]s; the order manager drops the
/// signal and counts the reason.
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// May a position keyed `(symbol, side, strategy, range)` be opened now?
    pub fn can_open(&self, broker: &SimulatedBroker, signal: &TradeSignal) -> TickforgeResult<()> {
        if broker.open_position_count() >= self.config.max_positions {
            return Err(RiskError::PositionLimit {
                key: format!("{}", signal.symbol),
                msg: format!("position limit {} reached", self.config.max_positions),
            }
            .into());
        }

        // Duplicate check: one position per (symbol, side, strategy, range),
        // unless every confirmation on the incoming signal is met.
        let duplicate = broker
            .open_positions(Some(&signal.symbol), None)
            .into_iter()
            .any(|pos| is_duplicate(pos, signal));
        if duplicate && !signal.confirmations.all_met() {
            return Err(RiskError::PositionLimit {
                key: duplicate_key(signal),
                msg: "position limit: duplicate for strategy/range".to_string(),
            }
            .into());
        }

        let current = self.portfolio_risk_pct(broker);
        let incoming = self.signal_risk_pct(broker, signal);
        if current + incoming > self.config.max_portfolio_risk_pct {
            return Err(RiskError::PortfolioRiskCap {
                current,
                incoming,
                cap: self.config.max_portfolio_risk_pct,
            }
            .into());
        }

        Ok(())
    }

    /// Convert the signal's sizing request into broker-valid lots: clamp to
    /// the symbol's volume limits and round down to the volume step.
    pub fn size_lot(&self, broker: &SimulatedBroker, signal: &TradeSignal) -> TickforgeResult<f64> {
        let info = broker.symbol_info(&signal.symbol).ok_or_else(|| RiskError::ZeroLots {
            symbol: signal.symbol.to_string(),
            msg: "unknown symbol".to_string(),
        })?;

        let raw = match signal.sizing {
            Sizing::Lots(lots) => lots,
            Sizing::RiskPct(pct) => {
                let pct = pct.min(self.config.max_per_trade_risk_pct);
                let stop_distance = (signal.entry_hint - signal.sl).abs();
                if signal.sl == 0.0 || stop_distance <= 0.0 {
                    return Err(RiskError::ZeroLots {
                        symbol: signal.symbol.to_string(),
                        msg: "risk-percent sizing requires a stop".to_string(),
                    }
                    .into());
                }
                let risk_amount = broker.equity() * pct / 100.0;
                risk_amount * info.tick_size / (stop_distance * info.tick_value)
            }
        };

        let clamped = raw.min(info.volume_max);
        // Nudge before flooring so e.g. 0.1 / 0.01 = 9.999... still steps
        // to 10 and not 9.
        let stepped = ((clamped / info.volume_step) + 1e-9).floor() * info.volume_step;
        if stepped < info.volume_min {
            return Err(RiskError::ZeroLots {
                symbol: signal.symbol.to_string(),
                msg: format!("computed {stepped} lots below minimum {}", info.volume_min),
            }
            .into());
        }
        debug!(symbol = %signal.symbol, raw, stepped, "sized order");
        Ok(stepped)
    }

    /// Sum of open-position risk as a percentage of equity. Positions
    /// without a stop cannot be quantified and are excluded.
    fn portfolio_risk_pct(&self, broker: &SimulatedBroker) -> f64 {
        let equity = broker.equity();
        if equity <= 0.0 {
            return f64::INFINITY;
        }
        broker
            .positions()
            .filter(|pos| pos.sl > 0.0)
            .filter_map(|pos| {
                let info = broker.symbol_info(&pos.symbol)?;
                let risk =
                    (pos.open_price - pos.sl).abs() / info.tick_size * info.tick_value * pos.volume;
                Some(risk / equity * 100.0)
            })
            .sum()
    }

    fn signal_risk_pct(&self, broker: &SimulatedBroker, signal: &TradeSignal) -> f64 {
        match signal.sizing {
            Sizing::RiskPct(pct) => pct.min(self.config.max_per_trade_risk_pct),
            Sizing::Lots(lots) => {
                let equity = broker.equity();
                if equity <= 0.0 || signal.sl == 0.0 {
                    return 0.0;
                }
                broker
                    .symbol_info(&signal.symbol)
                    .map(|info| {
                        (signal.entry_hint - signal.sl).abs() / info.tick_size * info.tick_value
                            * lots
                            / equity
                            * 100.0
                    })
                    .unwrap_or(0.0)
            }
        }
    }
}

fn is_duplicate(pos: &Position, signal: &TradeSignal) -> bool {
    if pos.side != signal.side || pos.symbol != *signal.symbol {
        return false;
    }
    // Prefer the structured fields; fall back to parsing the comment the
    // way an externally restored position would be keyed.
    let (strategy_id, range_id) = match PositionComment::parse(&pos.comment) {
        Ok(comment) => (comment.strategy_id, comment.range_id),
        Err(_) => (pos.strategy_id.clone(), pos.range_id.clone()),
    };
    strategy_id == signal.strategy_id && range_id == signal.range_id
}

fn duplicate_key(signal: &TradeSignal) -> String {
    format!(
        "{}/{}/{}/{}",
        signal.symbol,
        signal.side,
        signal.strategy_id,
        signal.range_id.as_deref().unwrap_or("-")
    )
}
