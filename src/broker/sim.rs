use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    broker::{
        policy::{SlippagePolicy, SpreadPolicy},
        position::{CloseReason, ClosedTrade, OrderRequest, Position},
    },
    data::domain::{GlobalTick, Side, SymbolInfo, Tick, TradeMode},
    error::{BrokerError, EngineError, TickforgeResult},
};

/// The simulated broker: exclusive owner of all positions and the balance.
///
/// Every tick of the merged timeline passes through [`SimulatedBroker::on_tick`]
/// before anything else sees it, so stop checks always run against the
/// freshest quote. Floating P&L is never updated tick-by-tick; it is
/// computed lazily on `equity()` and position queries.
#[derive(Debug)]
pub struct SimulatedBroker {
    balance: f64,
    initial_balance: f64,
    leverage: f64,
    positions: BTreeMap<u64, Position>,
    positions_by_symbol: HashMap<String, BTreeSet<u64>>,
    closed_trades: Vec<ClosedTrade>,
    next_ticket: u64,
    current_time: DateTime<Utc>,
    current_tick_by_symbol: HashMap<String, Tick>,
    current_tick_symbol: Option<String>,
    symbol_info: HashMap<String, SymbolInfo>,
    spread_policy: SpreadPolicy,
    slippage_policy: SlippagePolicy,
}

impl SimulatedBroker {
    pub fn new(
        initial_balance: f64,
        leverage: f64,
        spread_policy: SpreadPolicy,
        slippage_policy: SlippagePolicy,
    ) -> Self {
        Self {
            balance: initial_balance,
            initial_balance,
            leverage: leverage.max(1.0),
            positions: BTreeMap::new(),
            positions_by_symbol: HashMap::new(),
            closed_trades: Vec::new(),
            next_ticket: 1,
            current_time: DateTime::<Utc>::MIN_UTC,
            current_tick_by_symbol: HashMap::new(),
            current_tick_symbol: None,
            symbol_info: HashMap::new(),
            spread_policy,
            slippage_policy,
        }
    }

    pub fn set_symbol_info(&mut self, symbol: impl Into<String>, info: SymbolInfo) {
        self.symbol_info.insert(symbol.into(), info);
    }

    // ============================================================================================
    // Tick application
    // ============================================================================================

    /// Advance the clock to this tick and run stop checks for the tick's
    /// symbol only. Positions on other symbols are untouched.
    pub fn on_tick(&mut self, gt: &GlobalTick) {
        self.current_time = gt.time();
        let symbol: &str = &gt.symbol;
        self.current_tick_symbol = Some(symbol.to_string());
        self.current_tick_by_symbol
            .insert(symbol.to_string(), gt.tick);

        let Some((bid, ask)) = self.quote(symbol) else {
            return;
        };
        let Some(tickets) = self.positions_by_symbol.get(symbol) else {
            return;
        };

        // Stops are evaluated against the closing side of the book: bid for
        // longs, ask for shorts. SL wins over TP when both are touchable on
        // the same tick; at most one close fires per position per tick.
        let tickets: Vec<u64> = tickets.iter().copied().collect();
        for ticket in tickets {
            let Some(pos) = self.positions.get(&ticket) else {
                continue;
            };
            match pos.side {
                Side::Buy => {
                    if pos.sl > 0.0 && bid <= pos.sl {
                        self.close_internal(ticket, bid, CloseReason::Sl);
                    } else if pos.tp > 0.0 && bid >= pos.tp {
                        self.close_internal(ticket, bid, CloseReason::Tp);
                    }
                }
                Side::Sell => {
                    if pos.sl > 0.0 && ask >= pos.sl {
                        self.close_internal(ticket, ask, CloseReason::Sl);
                    } else if pos.tp > 0.0 && ask <= pos.tp {
                        self.close_internal(ticket, ask, CloseReason::Tp);
                    }
                }
            }
        }
    }

    // ============================================================================================
    // Orders
    // ============================================================================================

    /// Validate and fill a market order. Rejections are typed errors the
    /// caller drops; they never abort the run.
    pub fn place_market_order(&mut self, req: &OrderRequest) -> TickforgeResult<u64> {
        let info = self
            .symbol_info
            .get(&req.symbol)
            .ok_or_else(|| BrokerError::UnknownSymbol(req.symbol.clone()))?
            .clone();

        match (info.trade_mode, req.side) {
            (TradeMode::Disabled, _) => {
                return Err(BrokerError::MarketClosed(req.symbol.clone()).into());
            }
            (TradeMode::LongOnly, Side::Sell) | (TradeMode::ShortOnly, Side::Buy) => {
                return Err(BrokerError::MarketClosed(req.symbol.clone()).into());
            }
            _ => {}
        }

        if req.volume < info.volume_min || req.volume > info.volume_max {
            return Err(BrokerError::InvalidVolume {
                symbol: req.symbol.clone(),
                volume: req.volume,
                msg: format!(
                    "outside [{}, {}]",
                    info.volume_min, info.volume_max
                ),
            }
            .into());
        }
        let steps = req.volume / info.volume_step;
        if (steps - steps.round()).abs() > 1e-7 {
            return Err(BrokerError::InvalidVolume {
                symbol: req.symbol.clone(),
                volume: req.volume,
                msg: format!("not a multiple of volume_step {}", info.volume_step),
            }
            .into());
        }

        let (bid, ask) = self
            .quote(&req.symbol)
            .ok_or_else(|| BrokerError::NoQuote(req.symbol.clone()))?;
        let slippage = self.slippage_policy.slippage_points(req.volume) * info.point;
        let fill = match req.side {
            Side::Buy => ask + slippage,
            Side::Sell => bid - slippage,
        };

        validate_stop_distance(&req.symbol, req.side, fill, req.sl, req.tp, &info)?;

        let required_margin = req.volume * info.contract_size * fill / self.leverage;
        let free = self.free_margin();
        if required_margin > free {
            return Err(BrokerError::NoMoney {
                required: required_margin,
                free,
            }
            .into());
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let position = Position {
            ticket,
            symbol: req.symbol.clone(),
            side: req.side,
            volume: req.volume,
            open_price: fill,
            open_time: self.current_time,
            sl: req.sl,
            tp: req.tp,
            magic: req.magic,
            comment: req.comment.clone(),
            strategy_id: req.strategy_id.clone(),
            range_id: req.range_id.clone(),
        };
        debug!(
            ticket,
            symbol = %position.symbol,
            side = %position.side,
            volume = position.volume,
            fill,
            "order filled"
        );
        self.positions_by_symbol
            .entry(req.symbol.clone())
            .or_default()
            .insert(ticket);
        self.positions.insert(ticket, position);
        Ok(ticket)
    }

    /// Adjust stops on an open position. Distances are validated against
    /// the current closing-side quote.
    pub fn modify_position(&mut self, ticket: u64, sl: f64, tp: f64) -> TickforgeResult<()> {
        let pos = self
            .positions
            .get(&ticket)
            .ok_or(BrokerError::UnknownTicket(ticket))?;
        let info = self
            .symbol_info
            .get(&pos.symbol)
            .ok_or_else(|| BrokerError::UnknownSymbol(pos.symbol.clone()))?;
        let (bid, ask) = self
            .quote(&pos.symbol)
            .ok_or_else(|| BrokerError::NoQuote(pos.symbol.clone()))?;
        let market = match pos.side {
            Side::Buy => bid,
            Side::Sell => ask,
        };
        validate_stop_distance(&pos.symbol, pos.side, market, sl, tp, info)?;

        let pos = self.positions.get_mut(&ticket).expect("checked above");
        pos.sl = sl;
        pos.tp = tp;
        Ok(())
    }

    /// Manually close one position at the current quote. Closing a ticket
    /// that does not exist is a warned no-op.
    pub fn close_position(&mut self, ticket: u64, reason: CloseReason) {
        let Some(pos) = self.positions.get(&ticket) else {
            warn!(ticket, "close requested for unknown ticket, ignoring");
            return;
        };
        let Some((bid, ask)) = self.quote(&pos.symbol) else {
            warn!(ticket, symbol = %pos.symbol, "no quote to close against, ignoring");
            return;
        };
        let price = match pos.side {
            Side::Buy => bid,
            Side::Sell => ask,
        };
        self.close_internal(ticket, price, reason);
    }

    /// Force-close everything at the last known mid-price (end of run or
    /// cancellation).
    pub fn close_all_at_mid(&mut self, reason: CloseReason) {
        let tickets: Vec<u64> = self.positions.keys().copied().collect();
        for ticket in tickets {
            let Some(pos) = self.positions.get(&ticket) else {
                continue;
            };
            match self.current_tick_by_symbol.get(&pos.symbol) {
                Some(tick) => {
                    let mid = tick.mid();
                    self.close_internal(ticket, mid, reason);
                }
                None => {
                    // Never saw a quote; fall back to the open price so the
                    // trade closes flat instead of lingering.
                    let price = pos.open_price;
                    self.close_internal(ticket, price, reason);
                }
            }
        }
    }

    fn close_internal(&mut self, ticket: u64, price: f64, reason: CloseReason) {
        let Some(position) = self.positions.remove(&ticket) else {
            warn!(ticket, "internal close for unknown ticket, ignoring");
            return;
        };
        if let Some(tickets) = self.positions_by_symbol.get_mut(&position.symbol) {
            tickets.remove(&ticket);
        }

        let info = self
            .symbol_info
            .get(&position.symbol)
            .expect("open position implies known symbol");
        let profit = position.floating_pnl(price, info);
        self.balance += profit;
        debug!(
            ticket,
            symbol = %position.symbol,
            %reason,
            price,
            profit,
            "position closed"
        );
        self.closed_trades.push(ClosedTrade {
            position,
            close_time: self.current_time,
            close_price: price,
            reason,
            profit,
        });
    }

    // ============================================================================================
    // Queries
    // ============================================================================================

    /// Effective `(bid, ask)` for a symbol under the configured spread
    /// policy. `None` before the first tick of that symbol.
    pub fn quote(&self, symbol: &str) -> Option<(f64, f64)> {
        let tick = self.current_tick_by_symbol.get(symbol)?;
        let point = self
            .symbol_info
            .get(symbol)
            .map(|info| info.point)
            .unwrap_or(0.0);
        Some(self.spread_policy.apply(tick.bid, tick.ask, point))
    }

    /// Price a new order of `side` would currently fill at (before
    /// slippage): ask for buys, bid for sells.
    pub fn current_price(&self, symbol: &str, side: Side) -> Option<f64> {
        self.quote(symbol).map(|(bid, ask)| match side {
            Side::Buy => ask,
            Side::Sell => bid,
        })
    }

    pub fn current_tick(&self, symbol: &str) -> Option<&Tick> {
        self.current_tick_by_symbol.get(symbol)
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    /// Symbol that produced the most recent global tick.
    pub fn current_tick_symbol(&self) -> Option<&str> {
        self.current_tick_symbol.as_deref()
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    /// Balance plus lazily computed floating P&L of all open positions.
    pub fn equity(&self) -> f64 {
        self.balance + self.floating_pnl_total()
    }

    pub fn floating_pnl_total(&self) -> f64 {
        self.positions
            .values()
            .filter_map(|pos| self.position_floating_pnl(pos))
            .sum()
    }

    fn position_floating_pnl(&self, pos: &Position) -> Option<f64> {
        let (bid, ask) = self.quote(&pos.symbol)?;
        let info = self.symbol_info.get(&pos.symbol)?;
        let price = match pos.side {
            Side::Buy => bid,
            Side::Sell => ask,
        };
        Some(pos.floating_pnl(price, info))
    }

    fn used_margin(&self) -> f64 {
        self.positions
            .values()
            .filter_map(|pos| {
                let info = self.symbol_info.get(&pos.symbol)?;
                Some(pos.volume * info.contract_size * pos.open_price / self.leverage)
            })
            .sum()
    }

    pub fn free_margin(&self) -> f64 {
        self.equity() - self.used_margin()
    }

    pub fn position(&self, ticket: u64) -> Option<&Position> {
        self.positions.get(&ticket)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Open positions filtered by symbol and/or magic tag.
    pub fn open_positions(&self, symbol: Option<&str>, magic: Option<u64>) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|pos| symbol.is_none_or(|s| pos.symbol == s))
            .filter(|pos| magic.is_none_or(|m| pos.magic == m))
            .collect()
    }

    pub fn open_tickets(&self) -> Vec<u64> {
        self.positions.keys().copied().collect()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn symbol_info(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbol_info.get(symbol)
    }

    /// Secondary-index consistency check; a violation here means broker
    /// state is unrecoverable and the run must abort.
    pub fn assert_consistent(&self) -> TickforgeResult<()> {
        for (ticket, pos) in &self.positions {
            let indexed = self
                .positions_by_symbol
                .get(&pos.symbol)
                .is_some_and(|set| set.contains(ticket));
            if !indexed {
                return Err(EngineError::InvariantViolation(format!(
                    "ticket {ticket} missing from symbol index '{}'",
                    pos.symbol
                ))
                .into());
            }
        }
        for (symbol, tickets) in &self.positions_by_symbol {
            for ticket in tickets {
                let matches = self
                    .positions
                    .get(ticket)
                    .is_some_and(|pos| pos.symbol == *symbol);
                if !matches {
                    return Err(EngineError::InvariantViolation(format!(
                        "symbol index '{symbol}' holds stale ticket {ticket}"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Stops must sit on the profit-protecting side of the reference price and
/// at least `stops_level` points away. A stop exactly at the reference price
/// always fails, even with `stops_level == 0`.
fn validate_stop_distance(
    symbol: &str,
    side: Side,
    reference: f64,
    sl: f64,
    tp: f64,
    info: &SymbolInfo,
) -> TickforgeResult<()> {
    // The epsilon absorbs representation noise so a stop at exactly
    // `stops_level` points passes.
    if sl > 0.0 {
        let distance = (reference - sl) * side.direction();
        if distance <= 0.0 || distance / info.point + 1e-6 < info.stops_level {
            return Err(BrokerError::InvalidStops {
                symbol: symbol.to_string(),
                msg: format!(
                    "sl {sl} too close to price {reference} (stops_level {})",
                    info.stops_level
                ),
            }
            .into());
        }
    }
    if tp > 0.0 {
        let distance = (tp - reference) * side.direction();
        if distance <= 0.0 || distance / info.point + 1e-6 < info.stops_level {
            return Err(BrokerError::InvalidStops {
                symbol: symbol.to_string(),
                msg: format!(
                    "tp {tp} too close to price {reference} (stops_level {})",
                    info.stops_level
                ),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn gt(symbol: &str, time: &str, bid: f64, ask: f64) -> GlobalTick {
        GlobalTick {
            symbol: Arc::from(symbol),
            symbol_ord: 0,
            tick: Tick {
                time: ts(time),
                bid,
                ask,
                last: (bid + ask) / 2.0,
                volume: 1.0,
            },
        }
    }

    fn broker() -> SimulatedBroker {
        let mut broker = SimulatedBroker::new(
            10_000.0,
            100.0,
            SpreadPolicy::FromTick,
            SlippagePolicy::default(),
        );
        broker.set_symbol_info("EURUSD", SymbolInfo::fx_major());
        broker
    }

    fn order(side: Side, volume: f64, sl: f64, tp: f64) -> OrderRequest {
        OrderRequest {
            symbol: "EURUSD".to_string(),
            side,
            volume,
            sl,
            tp,
            magic: 7,
            comment: "fakeout|2/2".to_string(),
            strategy_id: "fakeout".to_string(),
            range_id: None,
        }
    }

    // ============================================================================
    // Part 1: Order validation
    // ============================================================================

    #[test]
    fn test_order_without_quote_is_rejected() {
        let mut broker = broker();
        let err = broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0));
        assert!(matches!(
            err,
            Err(crate::error::TickforgeError::Broker(BrokerError::NoQuote(_)))
        ));
    }

    #[test]
    fn test_unknown_symbol_is_rejected() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        let mut req = order(Side::Buy, 0.1, 0.0, 0.0);
        req.symbol = "XAUUSD".to_string();
        assert!(matches!(
            broker.place_market_order(&req),
            Err(crate::error::TickforgeError::Broker(BrokerError::UnknownSymbol(_)))
        ));
    }

    #[test]
    fn test_volume_limits_and_step() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        for bad in [0.005, 200.0, 0.017] {
            assert!(
                matches!(
                    broker.place_market_order(&order(Side::Buy, bad, 0.0, 0.0)),
                    Err(crate::error::TickforgeError::Broker(BrokerError::InvalidVolume { .. }))
                ),
                "volume {bad} should be rejected"
            );
        }
        assert!(broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).is_ok());
    }

    #[test]
    fn test_stop_at_entry_fails_even_with_zero_stops_level() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        // Fill will be at ask 1.1002; sl exactly there must fail.
        let err = broker.place_market_order(&order(Side::Buy, 0.1, 1.1002, 0.0));
        assert!(matches!(
            err,
            Err(crate::error::TickforgeError::Broker(BrokerError::InvalidStops { .. }))
        ));
    }

    #[test]
    fn test_stop_on_wrong_side_fails() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        // Long with sl above entry.
        assert!(broker.place_market_order(&order(Side::Buy, 0.1, 1.1050, 0.0)).is_err());
        // Long with tp below entry.
        assert!(broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 1.0950)).is_err());
    }

    #[test]
    fn test_stops_level_enforced() {
        let mut broker = broker();
        let mut info = SymbolInfo::fx_major();
        info.stops_level = 50.0;
        broker.set_symbol_info("EURUSD", info);
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        // 30 points away: too close.
        assert!(
            broker
                .place_market_order(&order(Side::Buy, 0.1, 1.1002 - 0.00030, 0.0))
                .is_err()
        );
        // 50 points away: allowed (inclusive).
        assert!(
            broker
                .place_market_order(&order(Side::Buy, 0.1, 1.1002 - 0.00050, 0.0))
                .is_ok()
        );
    }

    #[test]
    fn test_margin_rejection() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        // 100 lots x 100k x 1.1 / 100 leverage = 110k margin >> 10k equity.
        let err = broker.place_market_order(&order(Side::Buy, 100.0, 0.0, 0.0));
        assert!(matches!(
            err,
            Err(crate::error::TickforgeError::Broker(BrokerError::NoMoney { .. }))
        ));
    }

    #[test]
    fn test_trade_mode_restrictions() {
        let mut broker = broker();
        let mut info = SymbolInfo::fx_major();
        info.trade_mode = TradeMode::LongOnly;
        broker.set_symbol_info("EURUSD", info);
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        assert!(broker.place_market_order(&order(Side::Sell, 0.1, 0.0, 0.0)).is_err());
        assert!(broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).is_ok());
    }

    #[test]
    fn test_slippage_moves_fill_against_the_trader() {
        let mut broker = SimulatedBroker::new(
            10_000.0,
            100.0,
            SpreadPolicy::FromTick,
            SlippagePolicy {
                enabled: true,
                base_points: 2.0,
                volume_factor: 0.0,
            },
        );
        broker.set_symbol_info("EURUSD", SymbolInfo::fx_major());
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        let ticket = broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();
        let fill = broker.position(ticket).unwrap().open_price;
        assert!((fill - (1.1002 + 0.00002)).abs() < 1e-12);

        let ticket = broker.place_market_order(&order(Side::Sell, 0.1, 0.0, 0.0)).unwrap();
        let fill = broker.position(ticket).unwrap().open_price;
        assert!((fill - (1.1000 - 0.00002)).abs() < 1e-12);
    }

    // ============================================================================
    // Part 2: Stop checks on tick
    // ============================================================================

    #[test]
    fn test_long_sl_closes_at_bid() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker
            .place_market_order(&order(Side::Buy, 0.1, 1.0990, 1.1050))
            .unwrap();

        // Bid dips through the stop intra-candle.
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:05:23Z", 1.0988, 1.0990));

        assert_eq!(broker.open_position_count(), 0);
        let trade = &broker.closed_trades()[0];
        assert_eq!(trade.reason, CloseReason::Sl);
        assert_eq!(trade.close_price, 1.0988);
        assert_eq!(trade.close_time, ts("2024-01-02T00:05:23Z"));
        assert!(trade.profit < 0.0);
    }

    #[test]
    fn test_long_tp_closes_at_bid() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker
            .place_market_order(&order(Side::Buy, 0.1, 1.0990, 1.1015))
            .unwrap();

        broker.on_tick(&gt("EURUSD", "2024-01-02T00:03:00Z", 1.1020, 1.1022));

        let trade = &broker.closed_trades()[0];
        assert_eq!(trade.reason, CloseReason::Tp);
        assert_eq!(trade.close_price, 1.1020);
        assert!(trade.profit > 0.0);
    }

    #[test]
    fn test_short_stops_use_ask() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker
            .place_market_order(&order(Side::Sell, 0.1, 1.1010, 1.0980))
            .unwrap();

        // Ask spikes through the short's stop.
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:01:00Z", 1.1009, 1.1012));

        let trade = &broker.closed_trades()[0];
        assert_eq!(trade.reason, CloseReason::Sl);
        assert_eq!(trade.close_price, 1.1012);
    }

    #[test]
    fn test_zero_stop_sides_never_close() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();

        broker.on_tick(&gt("EURUSD", "2024-01-02T00:01:00Z", 0.9000, 0.9002));
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:02:00Z", 1.5000, 1.5002));

        assert_eq!(broker.open_position_count(), 1);
        assert!(broker.closed_trades().is_empty());
    }

    #[test]
    fn test_at_most_one_close_per_position_per_tick() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker
            .place_market_order(&order(Side::Buy, 0.1, 1.0990, 1.1015))
            .unwrap();

        // The stop fires; the take profit on the same position must not
        // produce a second closed-trade record, now or on later ticks.
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:01:00Z", 1.0985, 1.0987));
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:02:00Z", 1.1050, 1.1052));

        assert_eq!(broker.closed_trades().len(), 1);
        assert_eq!(broker.closed_trades()[0].reason, CloseReason::Sl);
    }

    // ============================================================================
    // Part 3: Accounting identities
    // ============================================================================

    #[test]
    fn test_equity_identity() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();
        broker.place_market_order(&order(Side::Sell, 0.2, 0.0, 0.0)).unwrap();

        broker.on_tick(&gt("EURUSD", "2024-01-02T00:01:00Z", 1.1010, 1.1012));

        let expected = broker.balance() + broker.floating_pnl_total();
        assert!((broker.equity() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_mass_conservation_over_many_trades() {
        let mut broker = broker();
        let mut price = 1.1000;
        for i in 0..50 {
            let t = format!("2024-01-02T01:{:02}:00Z", i % 60);
            broker.on_tick(&gt("EURUSD", &t, price, price + 0.0002));
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            if let Ok(ticket) = broker.place_market_order(&order(side, 0.1, 0.0, 0.0)) {
                price += if i % 3 == 0 { 0.0005 } else { -0.0003 };
                let t2 = format!("2024-01-02T02:{:02}:00Z", i % 60);
                broker.on_tick(&gt("EURUSD", &t2, price, price + 0.0002));
                broker.close_position(ticket, CloseReason::Manual);
            }
        }
        assert_eq!(broker.open_position_count(), 0);

        let total_profit: f64 = broker.closed_trades().iter().map(|t| t.profit).sum();
        assert!(
            (broker.balance() - broker.initial_balance() - total_profit).abs() < 1e-6,
            "balance delta {} != closed profit sum {}",
            broker.balance() - broker.initial_balance(),
            total_profit
        );
    }

    #[test]
    fn test_position_index_stays_consistent() {
        let mut broker = broker();
        broker.set_symbol_info("GBPUSD", SymbolInfo::fx_major());
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker.on_tick(&gt("GBPUSD", "2024-01-02T00:00:00Z", 1.2700, 1.2702));

        let mut req = order(Side::Buy, 0.1, 0.0, 0.0);
        broker.place_market_order(&req).unwrap();
        req.symbol = "GBPUSD".to_string();
        let t2 = broker.place_market_order(&req).unwrap();

        broker.assert_consistent().unwrap();
        broker.close_position(t2, CloseReason::Manual);
        broker.assert_consistent().unwrap();
        broker.close_all_at_mid(CloseReason::EndOfRun);
        broker.assert_consistent().unwrap();
        assert_eq!(broker.open_position_count(), 0);
    }

    #[test]
    fn test_on_tick_only_touches_its_symbol() {
        let mut broker = broker();
        broker.set_symbol_info("GBPUSD", SymbolInfo::fx_major());
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));

        assert!(broker.current_tick("GBPUSD").is_none());
        assert_eq!(broker.current_tick_symbol(), Some("EURUSD"));

        broker.on_tick(&gt("GBPUSD", "2024-01-02T00:00:01Z", 1.2700, 1.2702));
        assert_eq!(broker.current_tick("EURUSD").unwrap().bid, 1.1000);
        assert_eq!(broker.current_tick_symbol(), Some("GBPUSD"));
    }

    // ============================================================================
    // Part 4: Lifecycle odds and ends
    // ============================================================================

    #[test]
    fn test_tickets_are_monotonic() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        let a = broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();
        let b = broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();
        broker.close_position(a, CloseReason::Manual);
        let c = broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();
        assert!(a < b && b < c, "tickets must never be reused");
    }

    #[test]
    fn test_close_unknown_ticket_is_noop() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker.close_position(999, CloseReason::Manual);
        assert!(broker.closed_trades().is_empty());
    }

    #[test]
    fn test_end_of_run_closes_at_mid() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        broker.place_market_order(&order(Side::Buy, 0.1, 0.0, 0.0)).unwrap();

        broker.on_tick(&gt("EURUSD", "2024-01-02T12:00:00Z", 1.1050, 1.1052));
        broker.close_all_at_mid(CloseReason::EndOfRun);

        let trade = &broker.closed_trades()[0];
        assert_eq!(trade.reason, CloseReason::EndOfRun);
        assert!((trade.close_price - 1.1051).abs() < 1e-9);
    }

    #[test]
    fn test_modify_position_validates_distance() {
        let mut broker = broker();
        broker.on_tick(&gt("EURUSD", "2024-01-02T00:00:00Z", 1.1000, 1.1002));
        let ticket = broker
            .place_market_order(&order(Side::Buy, 0.1, 1.0990, 0.0))
            .unwrap();

        // Valid tighten below the current bid.
        broker.modify_position(ticket, 1.0995, 0.0).unwrap();
        assert_eq!(broker.position(ticket).unwrap().sl, 1.0995);

        // Stop above the current bid is rejected for a long.
        assert!(broker.modify_position(ticket, 1.1005, 0.0).is_err());
        // Unknown ticket is a typed error, not a panic.
        assert!(broker.modify_position(424242, 1.0995, 0.0).is_err());
    }
}
