use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 抓取器返回的原始行，数值字段保持字符串原样，由 Normalizer 解析
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub code: String,
    pub date: NaiveDate,
    pub price: String,
    pub name: Option<String>,
    pub size: Option<String>,
    pub holder_count: Option<String>,
}

impl RawRow {
    pub fn new(code: impl Into<String>, date: NaiveDate, price: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            date,
            price: price.into(),
            name: None,
            size: None,
            holder_count: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_holder_count(mut self, holders: impl Into<String>) -> Self {
        self.holder_count = Some(holders.into());
        self
    }
}

/// Descriptive fields looked up by code when building a record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstrumentMetadata {
    pub name: String,
    pub size: f64,
    pub holder_count: u64,
}

/// One instrument inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub code: String,
    pub date: String,
    pub price: f64,
    pub change_percent: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub holder_count: u64,
}

impl InstrumentRecord {
    pub fn new(code: impl Into<String>, date: NaiveDate, price: f64) -> Self {
        Self {
            code: code.into(),
            date: date.format("%Y-%m-%d").to_string(),
            price,
            change_percent: 0.0,
            name: String::new(),
            size: 0.0,
            holder_count: 0,
        }
    }
}

/// 单个交易日的收盘价
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Price series of one instrument, dates strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentHistory {
    /// Sanitized code, safe to use as a storage key.
    pub code: String,
    /// Code as the source reported it.
    pub symbol: String,
    pub points: Vec<HistoryPoint>,
}

impl InstrumentHistory {
    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.last()
    }
}

/// Composite address of a snapshot: collection, date and optional intraday time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub collection: String,
    pub date: String,
    pub time: Option<String>,
}

impl SnapshotKey {
    pub fn daily(collection: &str, date: &NaiveDate) -> Self {
        Self {
            collection: collection.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            time: None,
        }
    }

    pub fn intraday(collection: &str, date: &NaiveDate, time: &str) -> Self {
        Self {
            collection: collection.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            time: Some(time.to_string()),
        }
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.time {
            Some(time) => write!(f, "{}/{}/snapshots/{}", self.collection, self.date, time),
            None => write!(f, "{}/{}", self.collection, self.date),
        }
    }
}

/// 一次运行产生的快照，写入后不再修改
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: SnapshotKey,
    pub captured_at: DateTime<Utc>,
    pub records: BTreeMap<String, InstrumentRecord>,
}

impl Snapshot {
    pub fn new(key: SnapshotKey, records: BTreeMap<String, InstrumentRecord>) -> Self {
        Self {
            key,
            captured_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Inclusive calendar window handed to fetchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// `days` calendar days back from `end`, both ends included.
    pub fn lookback(end: NaiveDate, days: i64) -> Self {
        Self::new(end - chrono::Duration::days(days.max(0)), end)
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn contains(&self, date: &NaiveDate) -> bool {
        *date >= self.start && *date <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn snapshot_key_display_follows_document_layout() {
        let daily = SnapshotKey::daily("fonlar", &d(2025, 12, 3));
        assert_eq!(daily.to_string(), "fonlar/2025-12-03");

        let intraday = SnapshotKey::intraday("fonlar", &d(2025, 12, 3), "19:42");
        assert_eq!(intraday.to_string(), "fonlar/2025-12-03/snapshots/19:42");
    }

    #[test]
    fn date_range_orders_its_bounds() {
        let range = DateRange::new(d(2025, 1, 10), d(2025, 1, 5));
        assert_eq!(range.start, d(2025, 1, 5));
        assert!(range.contains(&d(2025, 1, 10)));
        assert!(!range.contains(&d(2025, 1, 11)));

        let back = DateRange::lookback(d(2025, 1, 10), 5);
        assert_eq!(back.start, d(2025, 1, 5));
    }
}
