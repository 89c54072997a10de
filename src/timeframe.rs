use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Closed set of supported candle timeframes.
///
/// Labels follow the broker convention (`M` = minutes, `H` = hours, `D1` =
/// one day, `W1` = one week, `MN1` = one calendar month). All alignment is
/// UTC and DST-agnostic.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    /// Duration of one candle in seconds.
    ///
    /// For `MN1` this is the 28-day lower bound of a calendar month. It is
    /// only used for the cheap "still inside the current candle" test; the
    /// authoritative boundary always comes from [`Timeframe::align_down`].
    pub fn duration_seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
            Self::MN1 => 28 * 86_400,
        }
    }

    /// Largest candle boundary at or before `ts`.
    ///
    /// Intraday frames and `D1` align on the UTC epoch grid. `W1` aligns to
    /// Monday 00:00 UTC, `MN1` to the first day of the month 00:00 UTC.
    pub fn align_down(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::W1 => {
                let date = ts.date_naive();
                let monday =
                    date - chrono::Days::new(date.weekday().num_days_from_monday() as u64);
                midnight(monday)
            }
            Self::MN1 => {
                let date = ts.date_naive();
                // First of the month always exists.
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap();
                midnight(first)
            }
            _ => {
                let dur = self.duration_seconds();
                let secs = ts.timestamp();
                let aligned = secs - secs.rem_euclid(dur);
                Utc.timestamp_opt(aligned, 0).unwrap()
            }
        }
    }

    /// True when `ts` sits exactly on a candle boundary for this timeframe.
    pub fn is_boundary(self, ts: DateTime<Utc>) -> bool {
        self.align_down(ts) == ts
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_duration_bijection() {
        // Every timeframe maps to a distinct positive duration.
        let mut seen = std::collections::HashSet::new();
        for tf in Timeframe::iter() {
            let dur = tf.duration_seconds();
            assert!(dur > 0);
            assert!(seen.insert(dur), "duplicate duration for {tf}");
        }
    }

    #[test]
    fn test_label_round_trip() {
        for tf in Timeframe::iter() {
            let label = tf.to_string();
            assert_eq!(Timeframe::from_str(&label).unwrap(), tf);
        }
        assert!(Timeframe::from_str("M2").is_err());
    }

    #[test]
    fn test_align_down_intraday() {
        let t = ts("2024-03-15T13:47:23.500Z");

        assert_eq!(Timeframe::M1.align_down(t), ts("2024-03-15T13:47:00Z"));
        assert_eq!(Timeframe::M5.align_down(t), ts("2024-03-15T13:45:00Z"));
        assert_eq!(Timeframe::M15.align_down(t), ts("2024-03-15T13:45:00Z"));
        assert_eq!(Timeframe::M30.align_down(t), ts("2024-03-15T13:30:00Z"));
        assert_eq!(Timeframe::H1.align_down(t), ts("2024-03-15T13:00:00Z"));
        assert_eq!(Timeframe::H4.align_down(t), ts("2024-03-15T12:00:00Z"));
        assert_eq!(Timeframe::D1.align_down(t), ts("2024-03-15T00:00:00Z"));
    }

    #[test]
    fn test_align_down_exact_boundary_is_identity() {
        // A timestamp exactly on a boundary belongs to the candle it opens.
        let t = ts("2024-03-15T13:45:00Z");
        assert_eq!(Timeframe::M5.align_down(t), t);
        assert!(Timeframe::M5.is_boundary(t));
        assert!(!Timeframe::M5.is_boundary(ts("2024-03-15T13:45:01Z")));
    }

    #[test]
    fn test_align_down_week_is_monday() {
        // 2024-03-15 is a Friday; the week opened Monday 2024-03-11.
        let t = ts("2024-03-15T13:47:23Z");
        assert_eq!(Timeframe::W1.align_down(t), ts("2024-03-11T00:00:00Z"));

        // A Monday aligns to itself at midnight.
        let monday = ts("2024-03-11T00:00:00Z");
        assert_eq!(Timeframe::W1.align_down(monday), monday);

        // Sunday still belongs to the week opened the previous Monday.
        let sunday = ts("2024-03-17T23:59:59Z");
        assert_eq!(Timeframe::W1.align_down(sunday), ts("2024-03-11T00:00:00Z"));
    }

    #[test]
    fn test_align_down_month_first_day() {
        assert_eq!(
            Timeframe::MN1.align_down(ts("2024-02-29T18:00:00Z")),
            ts("2024-02-01T00:00:00Z")
        );
        assert_eq!(
            Timeframe::MN1.align_down(ts("2024-12-31T23:59:59Z")),
            ts("2024-12-01T00:00:00Z")
        );
    }

    #[test]
    fn test_align_down_is_deterministic_and_idempotent() {
        let t = ts("2024-06-02T07:13:08Z");
        for tf in Timeframe::iter() {
            let a = tf.align_down(t);
            assert_eq!(a, tf.align_down(t));
            assert_eq!(tf.align_down(a), a, "align_down not idempotent for {tf}");
            assert!(a <= t);
        }
    }
}
