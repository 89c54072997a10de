pub mod equity_writer;
pub mod trade_log;
