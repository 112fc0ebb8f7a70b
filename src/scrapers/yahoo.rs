use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, RawRow};
use crate::scrapers::base::{build_client, ensure_success, InstrumentFetcher, RateLimiter};
use crate::scrapers::tradingview::TradingViewFetcher;
use crate::util::round_to;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const CHART_PATH: &str = "/v8/finance/chart";

const CRYPTO_SYMBOLS: &[&str] = &["BTC", "ETH", "SOL", "BNB", "XRP", "AVAX"];
const FX_SYMBOLS: &[&str] = &["TRY=X", "EURTRY=X", "XAUUSD=X"];

/// Instrument groups downloaded for the chart collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YahooGroup {
    Crypto,
    Bist,
    Us,
    Fx,
}

impl YahooGroup {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "crypto" => Ok(YahooGroup::Crypto),
            "bist" => Ok(YahooGroup::Bist),
            "us" => Ok(YahooGroup::Us),
            "fx" => Ok(YahooGroup::Fx),
            other => Err(SnapshotError::ConfigError(format!(
                "unknown group {:?} (crypto, bist, us, fx)",
                other
            ))),
        }
    }

    /// Document id prefix, e.g. `BIST_THYAO`.
    pub fn prefix(&self) -> &'static str {
        match self {
            YahooGroup::Crypto => "CRYPTO",
            YahooGroup::Bist => "BIST",
            YahooGroup::Us => "US",
            YahooGroup::Fx => "FX",
        }
    }

    pub fn asset_type(&self) -> &'static str {
        match self {
            YahooGroup::Crypto => "crypto",
            YahooGroup::Bist | YahooGroup::Us => "stock",
            YahooGroup::Fx => "currency",
        }
    }

    /// Appended to every ticker before asking Yahoo.
    pub fn suffix(&self) -> &'static str {
        match self {
            YahooGroup::Crypto => "-USD",
            YahooGroup::Bist => ".IS",
            YahooGroup::Us | YahooGroup::Fx => "",
        }
    }

    fn default_symbols(&self) -> &'static [&'static str] {
        match self {
            YahooGroup::Crypto => CRYPTO_SYMBOLS,
            YahooGroup::Fx => FX_SYMBOLS,
            YahooGroup::Bist | YahooGroup::Us => &[],
        }
    }

    /// Scanner screen, row limit and market-cap sort for groups whose
    /// tickers come from TradingView.
    fn scanner(&self) -> Option<(&'static str, usize, bool)> {
        match self {
            YahooGroup::Bist => Some(("turkey", 100, false)),
            YahooGroup::Us => Some(("america", 50, true)),
            YahooGroup::Crypto | YahooGroup::Fx => None,
        }
    }
}

/// Yahoo ticker for a code: `BRK.B` → `BRK-B`, then the group suffix.
/// Codes containing `/` (preferred shares) have no Yahoo chart.
pub fn yahoo_symbol(code: &str, suffix: &str) -> Option<String> {
    let code = code.trim();
    if code.is_empty() || code.contains('/') {
        return None;
    }
    Some(format!("{}{}", code.replace('.', "-"), suffix))
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
    #[serde(rename = "longName")]
    long_name: Option<String>,
    #[serde(rename = "shortName")]
    short_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

/// Yahoo Finance daily closes from the chart API, one request per ticker.
///
/// Rows keep the caller's code (`BRK.B`), not the Yahoo ticker (`BRK-B.IS`).
pub struct YahooFetcher {
    client: Client,
    base_url: String,
    suffix: String,
    default_codes: Vec<String>,
    universe: Option<Arc<dyn InstrumentFetcher>>,
    limiter: RateLimiter,
}

impl YahooFetcher {
    pub fn new(suffix: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            suffix: suffix.to_string(),
            default_codes: Vec::new(),
            universe: None,
            limiter: RateLimiter::new(Duration::from_millis(500)),
        })
    }

    /// Fetcher preset for one group: suffix, fixed ticker list or a
    /// TradingView scanner listing the tickers.
    pub fn for_group(group: YahooGroup, timeout: Duration) -> Result<Self> {
        let mut fetcher = Self::new(group.suffix(), timeout)?
            .with_default_codes(group.default_symbols().iter().map(|s| s.to_string()).collect());
        if let Some((market, limit, by_market_cap)) = group.scanner() {
            let scanner = TradingViewFetcher::new(market, timeout)?
                .with_limit(limit)
                .with_market_cap_sort(by_market_cap);
            fetcher = fetcher.with_universe(Arc::new(scanner));
        }
        Ok(fetcher)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Tickers used when the caller passes no codes.
    pub fn with_default_codes(mut self, codes: Vec<String>) -> Self {
        self.default_codes = codes;
        self
    }

    /// Source of tickers when neither codes nor defaults are given.
    pub fn with_universe(mut self, universe: Arc<dyn InstrumentFetcher>) -> Self {
        self.universe = Some(universe);
        self
    }

    async fn resolve_codes(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<String>> {
        if let Some(codes) = codes.filter(|c| !c.is_empty()) {
            return Ok(codes.to_vec());
        }
        if !self.default_codes.is_empty() {
            return Ok(self.default_codes.clone());
        }
        let universe = self.universe.as_ref().ok_or_else(|| {
            SnapshotError::FetchError("yahoo needs ticker codes or a ticker source".to_string())
        })?;

        let mut listed: Vec<String> = Vec::new();
        for row in universe.fetch(range, None).await? {
            if !listed.contains(&row.code) {
                listed.push(row.code);
            }
        }
        info!("{} listed {} tickers", universe.source_name(), listed.len());
        Ok(listed)
    }

    async fn fetch_symbol(&self, code: &str, symbol: &str, range: &DateRange) -> Result<Vec<RawRow>> {
        self.limiter.wait().await;

        let period1 = Utc.from_utc_datetime(&range.start.and_time(NaiveTime::MIN)).timestamp();
        let period2 = Utc
            .from_utc_datetime(&(range.end + ChronoDuration::days(1)).and_time(NaiveTime::MIN))
            .timestamp();
        debug!("Yahoo chart {} ({} - {})", symbol, period1, period2);

        let response = self
            .client
            .get(format!("{}{}/{}", self.base_url, CHART_PATH, symbol))
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
                ("events", "history".to_string()),
            ])
            .send()
            .await?;

        let text = ensure_success("Yahoo", response).await?.text().await?;
        let parsed: ChartResponse = serde_json::from_str(&text).map_err(|e| {
            SnapshotError::FetchError(format!("Yahoo returned an unexpected body for {}: {}", symbol, e))
        })?;

        Self::rows_from(code, parsed, range)
    }

    fn rows_from(code: &str, parsed: ChartResponse, range: &DateRange) -> Result<Vec<RawRow>> {
        if let Some(error) = parsed.chart.error {
            return Err(SnapshotError::FetchError(format!(
                "Yahoo chart error for {}: {} {}",
                code, error.code, error.description
            )));
        }
        let Some(result) = parsed.chart.result.and_then(|r| r.into_iter().next()) else {
            return Ok(Vec::new());
        };

        let name = result.meta.long_name.or(result.meta.short_name);
        let offset = result.meta.gmtoffset;
        let closes = result
            .indicators
            .quote
            .into_iter()
            .next()
            .map(|q| q.close)
            .unwrap_or_default();

        let mut rows = Vec::with_capacity(closes.len());
        for (ts, close) in result.timestamp.iter().zip(closes) {
            // 停牌或未收盘的日子 close 为 null
            let Some(close) = close.filter(|c| c.is_finite()) else { continue };
            let Some(local) = Utc.timestamp_opt(ts + offset, 0).single() else { continue };
            let date = local.date_naive();
            if !range.contains(&date) {
                continue;
            }
            rows.push(RawRow {
                code: code.to_string(),
                date,
                price: round_to(close, 4).to_string(),
                name: name.clone(),
                size: None,
                holder_count: None,
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl InstrumentFetcher for YahooFetcher {
    fn source_name(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        let codes = self.resolve_codes(range, codes).await?;
        info!("Downloading Yahoo charts for {} tickers ({} - {})", codes.len(), range.start, range.end);

        let mut rows = Vec::new();
        let mut last_error = None;
        for code in &codes {
            let Some(symbol) = yahoo_symbol(code, &self.suffix) else {
                debug!("no Yahoo ticker for {}", code);
                continue;
            };
            match self.fetch_symbol(code, &symbol, range).await {
                Ok(found) => rows.extend(found),
                Err(e) => {
                    warn!("skipping {}: {}", symbol, e);
                    last_error = Some(e);
                }
            }
        }

        // 全部失败才算本次抓取失败
        if rows.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        info!("Yahoo returned {} rows", rows.len());
        Ok(rows)
    }
}
