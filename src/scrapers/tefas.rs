use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, RawRow};
use crate::scrapers::base::{build_client, ensure_success, InstrumentFetcher, RateLimiter};
use crate::util;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://www.tefas.gov.tr";
const HISTORY_PATH: &str = "/api/DB/BindHistoryInfo";
/// TEFAS 单次查询最多约三个月
const MAX_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    data: Vec<HistoryItem>,
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    #[serde(rename = "TARIH", default)]
    date: Value,
    #[serde(rename = "FONKODU")]
    code: Option<String>,
    #[serde(rename = "FONUNVAN")]
    title: Option<String>,
    #[serde(rename = "FIYAT", default)]
    price: Value,
    #[serde(rename = "PORTFOYBUYUKLUK", default)]
    size: Value,
    #[serde(rename = "KISISAYISI", default)]
    holders: Value,
}

/// JSON scalar as the raw string the normalizer expects.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Holder counts may arrive as `1250.0`; numbers are rounded here instead of
/// going through the separator-stripping count parser.
fn count_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.round() as u64))
            .map(|count| count.to_string()),
        other => scalar_text(other),
    }
}

/// TEFAS fund price history (`BindHistoryInfo`).
pub struct TefasFetcher {
    client: Client,
    base_url: String,
    fund_type: String,
    limiter: RateLimiter,
}

impl TefasFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            fund_type: "YAT".to_string(),
            limiter: RateLimiter::new(Duration::from_millis(500)),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// `YAT` (mutual funds), `EMK` (pension) or `BYF` (ETFs).
    pub fn with_fund_type(mut self, fund_type: &str) -> Self {
        self.fund_type = fund_type.to_uppercase();
        self
    }

    /// Splits a long range into windows TEFAS accepts.
    fn windows(range: &DateRange) -> Vec<DateRange> {
        let mut windows = Vec::new();
        let mut start = range.start;
        while start <= range.end {
            let end = (start + ChronoDuration::days(MAX_WINDOW_DAYS - 1)).min(range.end);
            windows.push(DateRange::new(start, end));
            start = end + ChronoDuration::days(1);
        }
        windows
    }

    async fn fetch_window(&self, window: &DateRange, code: &str) -> Result<Vec<RawRow>> {
        self.limiter.wait().await;

        let start = window.start.format("%d.%m.%Y").to_string();
        let end = window.end.format("%d.%m.%Y").to_string();
        debug!("TEFAS {} {} - {} ({})", self.fund_type, start, end, if code.is_empty() { "all" } else { code });

        let response = self
            .client
            .post(format!("{}{}", self.base_url, HISTORY_PATH))
            .header("Origin", DEFAULT_BASE_URL)
            .header("Referer", format!("{}/TarihselVeriler.aspx", DEFAULT_BASE_URL))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&json!({
                "fontip": self.fund_type,
                "sfontip": "",
                "bastarih": start,
                "bittarih": end,
                "fonkod": code,
            }))
            .send()
            .await?;

        let text = ensure_success("TEFAS", response).await?.text().await?;
        let parsed: HistoryResponse = serde_json::from_str(&text).map_err(|e| {
            SnapshotError::FetchError(format!("TEFAS returned an unexpected body: {}", e))
        })?;

        Ok(Self::rows_from(parsed, window))
    }

    fn rows_from(parsed: HistoryResponse, window: &DateRange) -> Vec<RawRow> {
        let mut rows = Vec::with_capacity(parsed.data.len());
        for item in parsed.data {
            let Some(code) = item.code else { continue };
            let date = match scalar_text(&item.date).map(|d| util::epoch_millis_to_date(&d)) {
                Some(Ok(date)) => date,
                _ => {
                    warn!("TEFAS row for {} has no usable date: {}", code, item.date);
                    continue;
                }
            };
            if !window.contains(&date) {
                continue;
            }
            rows.push(RawRow {
                code,
                date,
                price: scalar_text(&item.price).unwrap_or_default(),
                name: item.title,
                size: scalar_text(&item.size),
                holder_count: count_text(&item.holders),
            });
        }
        rows
    }
}

#[async_trait]
impl InstrumentFetcher for TefasFetcher {
    fn source_name(&self) -> &'static str {
        "tefas"
    }

    async fn fetch(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        info!("获取 TEFAS 基金数据 {} - {}", range.start, range.end);

        let targets: Vec<&str> = match codes {
            Some(codes) if !codes.is_empty() => codes.iter().map(|c| c.as_str()).collect(),
            _ => vec![""],
        };

        let mut rows = Vec::new();
        for code in targets {
            for window in Self::windows(range) {
                rows.extend(self.fetch_window(&window, code).await?);
            }
        }

        info!("TEFAS returned {} rows", rows.len());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn long_ranges_are_split_into_windows() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let range = DateRange::lookback(start + ChronoDuration::days(364), 364);
        let windows = TefasFetcher::windows(&range);

        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0].start, start);
        assert_eq!(windows.last().unwrap().end, range.end);
        assert!(windows.windows(2).all(|w| w[0].end + ChronoDuration::days(1) == w[1].start));
    }

    #[test]
    fn rows_keep_prices_as_text_and_drop_undated_items() {
        let body = r#"{"data":[
            {"TARIH":"1764720000000","FONKODU":"TTE","FONUNVAN":"İŞ PORTFÖY","FIYAT":1.234567,"PORTFOYBUYUKLUK":1500000.5,"KISISAYISI":1200},
            {"TARIH":null,"FONKODU":"MAC","FIYAT":2.5}
        ]}"#;
        let parsed: HistoryResponse = serde_json::from_str(body).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 12, 3).unwrap();
        let rows = TefasFetcher::rows_from(parsed, &DateRange::single(day));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "TTE");
        assert_eq!(rows[0].date, day);
        assert_eq!(rows[0].price, "1.234567");
        assert_eq!(rows[0].holder_count.as_deref(), Some("1200"));
    }

    #[test]
    fn decimal_holder_counts_are_not_read_as_thousands() {
        let body = r#"{"data":[
            {"TARIH":"1764720000000","FONKODU":"TTE","FIYAT":1.5,"KISISAYISI":1250.0},
            {"TARIH":"1764720000000","FONKODU":"MAC","FIYAT":2.5,"KISISAYISI":"3.400"}
        ]}"#;
        let parsed: HistoryResponse = serde_json::from_str(body).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 12, 3).unwrap();
        let rows = TefasFetcher::rows_from(parsed, &DateRange::single(day));

        assert_eq!(rows[0].holder_count.as_deref(), Some("1250"));
        assert_eq!(rows[1].holder_count.as_deref(), Some("3.400"));

        let records = crate::services::normalizer::Normalizer::normalize(rows, &Default::default()).records;
        assert_eq!(records["TTE"].holder_count, 1250);
        assert_eq!(records["MAC"].holder_count, 3400);
    }
}
