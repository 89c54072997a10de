use chrono::{DateTime, Utc};
use polars::{
    df,
    prelude::{DataFrame, IntoLazy, col},
};

use crate::{
    data::columns::Col,
    error::{DataError, TickforgeResult},
};

/// The equity curve as a struct of arrays, appended to on the snapshot
/// cadence and materialized once at the end of the run.
#[derive(Debug, Default, Clone)]
pub struct EquityCurve {
    time_us: Vec<i64>,
    balance: Vec<f64>,
    equity: Vec<f64>,
    open_positions: Vec<i64>,
    floating_pnl: Vec<f64>,
}

/// Peak-to-trough drawdown over the recorded curve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Drawdown {
    pub absolute: f64,
    /// Fraction of the peak equity, in [0, 1].
    pub relative: f64,
}

impl EquityCurve {
    pub fn push(
        &mut self,
        time: DateTime<Utc>,
        balance: f64,
        equity: f64,
        open_positions: usize,
        floating_pnl: f64,
    ) {
        self.time_us.push(time.timestamp_micros());
        self.balance.push(balance);
        self.equity.push(equity);
        self.open_positions.push(open_positions as i64);
        self.floating_pnl.push(floating_pnl);
    }

    pub fn len(&self) -> usize {
        self.time_us.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_us.is_empty()
    }

    pub fn last_equity(&self) -> Option<f64> {
        self.equity.last().copied()
    }

    /// Worst peak-to-trough decline of the equity series.
    pub fn max_drawdown(&self) -> Drawdown {
        let mut peak = f64::MIN;
        let mut worst = Drawdown::default();
        for &value in &self.equity {
            if value > peak {
                peak = value;
            }
            let absolute = peak - value;
            if absolute > worst.absolute {
                worst = Drawdown {
                    absolute,
                    relative: if peak > 0.0 { absolute / peak } else { 0.0 },
                };
            }
        }
        worst
    }

    pub fn as_frame(&self) -> TickforgeResult<DataFrame> {
        let frame = df![
            Col::Time.as_str()          => self.time_us.clone(),
            Col::Balance.as_str()       => self.balance.clone(),
            Col::Equity.as_str()        => self.equity.clone(),
            Col::OpenPositions.as_str() => self.open_positions.clone(),
            Col::FloatingPnl.as_str()   => self.floating_pnl.clone(),
        ]
        .map_err(|e| DataError::DataFrame(e.to_string()))?;

        frame
            .lazy()
            .with_column(col(Col::Time.as_str()).cast(Col::Time.dtype()))
            .collect()
            .map_err(|e| DataError::DataFrame(e.to_string()).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn curve(values: &[f64]) -> EquityCurve {
        let mut curve = EquityCurve::default();
        for (i, &equity) in values.iter().enumerate() {
            curve.push(
                ts("2024-01-02T00:00:00Z") + chrono::Duration::minutes(i as i64),
                equity,
                equity,
                0,
                0.0,
            );
        }
        curve
    }

    #[test]
    fn test_monotone_curve_has_zero_drawdown() {
        let dd = curve(&[100.0, 110.0, 125.0]).max_drawdown();
        assert_eq!(dd.absolute, 0.0);
        assert_eq!(dd.relative, 0.0);
    }

    #[test]
    fn test_drawdown_measures_worst_trough() {
        // Peak 120, trough 90: 30 absolute, 25% relative. The later dip to
        // 110 from peak 130 (15.4%) is not worse.
        let dd = curve(&[100.0, 120.0, 90.0, 130.0, 110.0]).max_drawdown();
        assert_eq!(dd.absolute, 30.0);
        assert!((dd.relative - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_empty_curve() {
        let curve = EquityCurve::default();
        assert!(curve.is_empty());
        assert_eq!(curve.max_drawdown(), Drawdown::default());
        assert!(curve.last_equity().is_none());
    }

    #[test]
    fn test_frame_shape() {
        let frame = curve(&[100.0, 101.0]).as_frame().unwrap();
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.width(), 5);
        assert!(frame.column(Col::Equity.as_str()).is_ok());
    }
}
