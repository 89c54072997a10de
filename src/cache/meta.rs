use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{TimestampMicroSeconds, serde_as};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{error::DataError, timeframe::Timeframe};

/// Current shard layout version. Shards written under an older version are
/// treated as stale and rebuilt.
pub const CACHE_VERSION: u32 = 1;

/// Which dataset a day shard belongs to: raw ticks or candles of one
/// timeframe. Renders as the directory name (`ticks`, `M1`, `M5`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetKey {
    Ticks,
    Candles(Timeframe),
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticks => write!(f, "ticks"),
            Self::Candles(tf) => write!(f, "{tf}"),
        }
    }
}

impl FromStr for DatasetKey {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ticks" {
            return Ok(Self::Ticks);
        }
        Timeframe::from_str(s)
            .map(Self::Candles)
            .map_err(|_| DataError::InvalidTimeframe(s.to_string()))
    }
}

/// Where a cached day originally came from.
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
pub enum CacheSource {
    LiveFeed,
    Archive,
    /// Candles resampled locally from cached ticks.
    Synthesized,
}

/// Metadata stored beside every day shard (`<SYMBOL>.meta.json`).
///
/// A shard without readable metadata is treated as stale and rebuilt, so
/// older cache layouts age out without a migration step.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub cached_at: DateTime<Utc>,
    pub source: CacheSource,
    #[serde_as(as = "TimestampMicroSeconds<i64>")]
    pub first_data_time: DateTime<Utc>,
    #[serde_as(as = "TimestampMicroSeconds<i64>")]
    pub last_data_time: DateTime<Utc>,
    pub row_count: u64,
    pub cache_version: u32,
}

impl ShardMeta {
    pub fn is_stale(&self, now: DateTime<Utc>, ttl_days: u32) -> bool {
        self.cache_version != CACHE_VERSION
            || now - self.cached_at > chrono::Duration::days(ttl_days as i64)
    }
}

/// Inclusive day range helper used throughout the cache and loader.
pub fn days_in_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        days.push(day);
        day = day.succ_opt().expect("date overflow");
    }
    days
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_dataset_key_round_trip() {
        assert_eq!(DatasetKey::Ticks.to_string(), "ticks");
        assert_eq!(DatasetKey::Candles(Timeframe::M5).to_string(), "M5");

        assert_eq!("ticks".parse::<DatasetKey>().unwrap(), DatasetKey::Ticks);
        assert_eq!(
            "H4".parse::<DatasetKey>().unwrap(),
            DatasetKey::Candles(Timeframe::H4)
        );
        assert!("candles".parse::<DatasetKey>().is_err());
    }

    #[test]
    fn test_staleness_by_age_and_version() {
        let meta = ShardMeta {
            cached_at: ts("2024-06-01T12:00:00Z"),
            source: CacheSource::LiveFeed,
            first_data_time: ts("2024-06-01T00:00:01Z"),
            last_data_time: ts("2024-06-01T23:59:58Z"),
            row_count: 86_000,
            cache_version: CACHE_VERSION,
        };

        assert!(!meta.is_stale(ts("2024-06-05T12:00:00Z"), 7));
        assert!(meta.is_stale(ts("2024-06-11T12:00:01Z"), 7));

        let old_version = ShardMeta {
            cache_version: CACHE_VERSION + 1,
            ..meta
        };
        assert!(old_version.is_stale(ts("2024-06-01T13:00:00Z"), 7));
    }

    #[test]
    fn test_meta_json_round_trip() {
        let meta = ShardMeta {
            cached_at: ts("2024-06-01T12:00:00Z"),
            source: CacheSource::Archive,
            first_data_time: ts("2024-06-01T00:00:01Z"),
            last_data_time: ts("2024-06-01T23:59:58Z"),
            row_count: 123,
            cache_version: CACHE_VERSION,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"archive\""));
        assert_eq!(serde_json::from_str::<ShardMeta>(&json).unwrap(), meta);
    }

    #[test]
    fn test_days_in_range_inclusive() {
        let days = days_in_range(date("2024-01-30"), date("2024-02-02"));
        assert_eq!(
            days,
            vec![
                date("2024-01-30"),
                date("2024-01-31"),
                date("2024-02-01"),
                date("2024-02-02"),
            ]
        );
        assert_eq!(days_in_range(date("2024-01-01"), date("2024-01-01")).len(), 1);
        assert!(days_in_range(date("2024-01-02"), date("2024-01-01")).is_empty());
    }
}
