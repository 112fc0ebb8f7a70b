use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, RawRow};
use crate::scrapers::base::{build_client, ensure_success, InstrumentFetcher, RateLimiter};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://scanner.tradingview.com";
const COLUMNS: [&str; 4] = ["name", "close", "description", "market_cap_basic"];

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    data: Vec<ScanItem>,
}

#[derive(Debug, Deserialize)]
struct ScanItem {
    #[serde(default)]
    d: Vec<Value>,
}

fn cell_text(cells: &[Value], idx: usize) -> Option<String> {
    match cells.get(idx)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// TradingView 行情扫描器，只返回最新价，日期记为查询区间的结束日
pub struct TradingViewFetcher {
    client: Client,
    base_url: String,
    market: String,
    limit: usize,
    sort_by_market_cap: bool,
    limiter: RateLimiter,
}

impl TradingViewFetcher {
    /// `market` is the scanner screen, e.g. `turkey` or `america`.
    pub fn new(market: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            market: market.to_lowercase(),
            limit: 1000,
            sort_by_market_cap: false,
            limiter: RateLimiter::new(Duration::from_millis(500)),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Largest companies first; combined with `with_limit` gives a top-N list.
    pub fn with_market_cap_sort(mut self, enabled: bool) -> Self {
        self.sort_by_market_cap = enabled;
        self
    }

    fn query(&self, codes: Option<&[String]>) -> Value {
        let mut filters = vec![json!({"left": "type", "operation": "in_range", "right": ["stock"]})];
        if let Some(codes) = codes.filter(|c| !c.is_empty()) {
            filters.push(json!({"left": "name", "operation": "in_range", "right": codes}));
        }

        let mut query = json!({
            "filter": filters,
            "columns": COLUMNS,
            "range": [0, self.limit],
        });
        if self.sort_by_market_cap {
            query["sort"] = json!({"sortBy": "market_cap_basic", "sortOrder": "desc"});
        }
        query
    }

    fn rows_from(parsed: ScanResponse, range: &DateRange) -> Vec<RawRow> {
        parsed
            .data
            .into_iter()
            .filter_map(|item| {
                let code = cell_text(&item.d, 0)?;
                Some(RawRow {
                    code,
                    date: range.end,
                    price: cell_text(&item.d, 1).unwrap_or_default(),
                    name: cell_text(&item.d, 2),
                    size: cell_text(&item.d, 3),
                    holder_count: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl InstrumentFetcher for TradingViewFetcher {
    fn source_name(&self) -> &'static str {
        "tradingview"
    }

    async fn fetch(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        info!("Scanning TradingView {} market", self.market);
        self.limiter.wait().await;

        let query = self.query(codes);
        debug!("scanner query: {}", query);

        let response = self
            .client
            .post(format!("{}/{}/scan", self.base_url, self.market))
            .json(&query)
            .send()
            .await?;

        let text = ensure_success("TradingView", response).await?.text().await?;
        let parsed: ScanResponse = serde_json::from_str(&text).map_err(|e| {
            SnapshotError::FetchError(format!("TradingView returned an unexpected body: {}", e))
        })?;

        let rows = Self::rows_from(parsed, range);
        info!("TradingView returned {} rows", rows.len());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn query_adds_code_filter_and_sort() {
        let fetcher = TradingViewFetcher::new("america", Duration::from_secs(5))
            .unwrap()
            .with_limit(50)
            .with_market_cap_sort(true);
        let codes = vec!["AAPL".to_string()];
        let query = fetcher.query(Some(&codes));

        assert_eq!(query["range"], json!([0, 50]));
        assert_eq!(query["filter"].as_array().unwrap().len(), 2);
        assert_eq!(query["sort"]["sortBy"], json!("market_cap_basic"));
    }

    #[test]
    fn rows_are_dated_at_range_end() {
        let body = r#"{"totalCount":2,"data":[
            {"s":"BIST:THYAO","d":["THYAO",290.5,"TURK HAVA YOLLARI",400000000000]},
            {"s":"BIST:X","d":[]}
        ]}"#;
        let parsed: ScanResponse = serde_json::from_str(body).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 12, 3).unwrap();
        let rows = TradingViewFetcher::rows_from(parsed, &DateRange::lookback(end, 5));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, end);
        assert_eq!(rows[0].price, "290.5");
        assert_eq!(rows[0].name.as_deref(), Some("TURK HAVA YOLLARI"));
    }
}
