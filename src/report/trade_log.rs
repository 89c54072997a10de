use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    broker::position::{ClosedTrade, Position},
    data::domain::PositionComment,
    error::{IoError, TickforgeResult},
    orders::PositionSink,
};

const TRADE_LOG_HEADER: &str = "open_time,close_time,ticket,symbol,side,volume,open_price,\
close_price,sl,tp,profit,reason,magic,strategy_id,range_id,confirmations";

/// Append-only CSV log of closed trades, one record per close, flushed per
/// append. Written by a single owner in the main thread.
pub struct TradeLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl TradeLog {
    /// Create (or truncate) the log and write the header.
    pub fn create(path: impl Into<PathBuf>) -> TickforgeResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(IoError::Io)?;
        }
        let file = File::create(&path).map_err(|e| IoError::WriterCreation(e.to_string()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{TRADE_LOG_HEADER}").map_err(IoError::Io)?;
        writer.flush().map_err(IoError::Io)?;
        Ok(Self { writer, path })
    }

    /// Reopen an existing log for appending (no header rewrite).
    pub fn open_append(path: impl Into<PathBuf>) -> TickforgeResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| IoError::WriterCreation(e.to_string()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, trade: &ClosedTrade) -> TickforgeResult<()> {
        let pos = &trade.position;
        let confirmations = PositionComment::parse(&pos.comment)
            .map(|c| c.confirmations.to_string())
            .unwrap_or_default();
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            pos.open_time.to_rfc3339(),
            trade.close_time.to_rfc3339(),
            pos.ticket,
            pos.symbol,
            pos.side,
            pos.volume,
            pos.open_price,
            trade.close_price,
            pos.sl,
            pos.tp,
            trade.profit,
            trade.reason,
            pos.magic,
            pos.strategy_id,
            pos.range_id.as_deref().unwrap_or(""),
            confirmations,
        )
        .map_err(IoError::Io)?;
        self.writer.flush().map_err(IoError::Io)?;
        Ok(())
    }

    pub fn append_all<'a>(
        &mut self,
        trades: impl IntoIterator<Item = &'a ClosedTrade>,
    ) -> TickforgeResult<()> {
        for trade in trades {
            self.append(trade)?;
        }
        Ok(())
    }
}

/// End-of-run JSON snapshot of positions that were still open (and thus
/// force-closed), for post-run inspection.
pub fn write_position_snapshot<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    path: impl AsRef<Path>,
) -> TickforgeResult<()> {
    let positions: Vec<&Position> = positions.into_iter().collect();
    let json = serde_json::to_string_pretty(&positions).map_err(IoError::Json)?;
    fs::write(path, json).map_err(IoError::Io)?;
    Ok(())
}

/// Durable append-only record of opened positions, one JSON line per
/// ticket.
pub struct JsonlPositionSink {
    writer: BufWriter<File>,
}

impl JsonlPositionSink {
    pub fn create(path: impl AsRef<Path>) -> TickforgeResult<Self> {
        let file =
            File::create(path.as_ref()).map_err(|e| IoError::WriterCreation(e.to_string()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl PositionSink for JsonlPositionSink {
    fn record_open(&mut self, position: &Position) -> TickforgeResult<()> {
        let line = serde_json::to_string(position).map_err(IoError::Json)?;
        writeln!(self.writer, "{line}").map_err(IoError::Io)?;
        self.writer.flush().map_err(IoError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, Utc};

    use crate::{
        broker::position::CloseReason,
        data::domain::Side,
    };

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn closed_trade() -> ClosedTrade {
        ClosedTrade {
            position: Position {
                ticket: 42,
                symbol: "EURUSD".to_string(),
                side: Side::Buy,
                volume: 0.1,
                open_price: 1.1002,
                open_time: ts("2024-01-02T00:01:00Z"),
                sl: 1.0992,
                tp: 1.1015,
                magic: 7,
                comment: "fakeout|asia|2/3".to_string(),
                strategy_id: "fakeout".to_string(),
                range_id: Some("asia".to_string()),
            },
            close_time: ts("2024-01-02T00:03:00Z"),
            close_price: 1.1015,
            reason: CloseReason::Tp,
            profit: 13.0,
        }
    }

    #[test]
    fn test_trade_log_rows_are_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");

        let mut log = TradeLog::create(&path).unwrap();
        log.append(&closed_trade()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), TRADE_LOG_HEADER);

        let row = lines.next().unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 16);
        assert_eq!(fields[2], "42");
        assert_eq!(fields[3], "EURUSD");
        assert_eq!(fields[4], "buy");
        assert_eq!(fields[11], "tp");
        assert_eq!(fields[14], "asia");
        assert_eq!(fields[15], "2/3");
    }

    #[test]
    fn test_open_append_extends_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");

        TradeLog::create(&path).unwrap().append(&closed_trade()).unwrap();
        TradeLog::open_append(&path).unwrap().append(&closed_trade()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3, "header + two records");
    }

    #[test]
    fn test_position_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let trade = closed_trade();
        write_position_snapshot([&trade.position], &path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let back: Vec<Position> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, vec![trade.position]);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opened.jsonl");

        let mut sink = JsonlPositionSink::create(&path).unwrap();
        let trade = closed_trade();
        sink.record_open(&trade.position).unwrap();
        sink.record_open(&trade.position).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: Position = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.ticket, 42);
    }
}
