use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    broker::{
        position::{OrderRequest, Position},
        sim::SimulatedBroker,
    },
    data::domain::TradeSignal,
    error::{TickforgeError, TickforgeResult},
    risk::RiskManager,
};

/// Receives an opened position for durable bookkeeping (the append-only
/// position log). The engine never reads it back.
pub trait PositionSink: Send {
    fn record_open(&mut self, position: &Position) -> TickforgeResult<()>;
}

/// No-op sink for runs that do not persist open tickets.
pub struct NullPositionSink;

impl PositionSink for NullPositionSink {
    fn record_open(&mut self, _position: &Position) -> TickforgeResult<()> {
        Ok(())
    }
}

/// Why signals were dropped, tallied for the run summary. A run that traded
/// less than the data suggests is always explainable from these counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalDropCounts {
    pub cooldown: u64,
    pub risk: u64,
    pub zero_lots: u64,
    pub broker_rejected: u64,
}

impl SignalDropCounts {
    pub fn total(&self) -> u64 {
        self.cooldown + self.risk + self.zero_lots + self.broker_rejected
    }
}

/// Thin signal-to-order pipeline: cooldown gate, risk checks, lot sizing,
/// broker submission, ticket persistence.
pub struct OrderManager {
    risk: RiskManager,
    cooldown_secs: i64,
    last_submission: HashMap<(String, String), DateTime<Utc>>,
    sink: Box<dyn PositionSink>,
    drops: SignalDropCounts,
    executed: u64,
}

impl OrderManager {
    pub fn new(risk: RiskManager, cooldown_secs: i64, sink: Box<dyn PositionSink>) -> Self {
        Self {
            risk,
            cooldown_secs,
            last_submission: HashMap::new(),
            sink,
            drops: SignalDropCounts::default(),
            executed: 0,
        }
    }

    /// Run one signal through the pipeline. Returns the ticket on success;
    /// `None` means the signal was dropped and counted, never an abort.
    pub fn execute(
        &mut self,
        broker: &mut SimulatedBroker,
        signal: &TradeSignal,
        magic: u64,
    ) -> Option<u64> {
        let key = (signal.symbol.to_string(), signal.strategy_id.clone());
        if self.cooldown_secs > 0
            && let Some(last) = self.last_submission.get(&key)
        {
            let elapsed = (broker.current_time() - *last).num_seconds();
            if elapsed < self.cooldown_secs {
                warn!(
                    symbol = %signal.symbol,
                    strategy = %signal.strategy_id,
                    remaining = self.cooldown_secs - elapsed,
                    "signal dropped: cooldown active"
                );
                self.drops.cooldown += 1;
                return None;
            }
        }

        if let Err(e) = self.risk.can_open(broker, signal) {
            warn!(symbol = %signal.symbol, strategy = %signal.strategy_id, reason = %e, "signal dropped: risk check");
            self.drops.risk += 1;
            return None;
        }

        let volume = match self.risk.size_lot(broker, signal) {
            Ok(volume) => volume,
            Err(e) => {
                warn!(symbol = %signal.symbol, reason = %e, "signal dropped: sizing");
                self.drops.zero_lots += 1;
                return None;
            }
        };

        let request = OrderRequest {
            symbol: signal.symbol.to_string(),
            side: signal.side,
            volume,
            sl: signal.sl,
            tp: signal.tp,
            magic,
            comment: signal.position_comment().to_string(),
            strategy_id: signal.strategy_id.clone(),
            range_id: signal.range_id.clone(),
        };
        match broker.place_market_order(&request) {
            Ok(ticket) => {
                self.last_submission.insert(key, broker.current_time());
                self.executed += 1;
                if let Some(position) = broker.position(ticket) {
                    let position = position.clone();
                    if let Err(e) = self.sink.record_open(&position) {
                        warn!(ticket, error = %e, "position log write failed");
                    }
                }
                debug!(ticket, symbol = %signal.symbol, "signal executed");
                Some(ticket)
            }
            Err(e @ TickforgeError::Broker(_)) => {
                warn!(symbol = %signal.symbol, reason = %e, "signal dropped: broker rejection");
                self.drops.broker_rejected += 1;
                None
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "signal dropped: unexpected error");
                self.drops.broker_rejected += 1;
                None
            }
        }
    }

    pub fn drops(&self) -> SignalDropCounts {
        self.drops
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }
}
