use crate::errors::{Result, SnapshotError};
use crate::models::record::{DateRange, RawRow};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Base trait for market data fetchers
#[async_trait]
pub trait InstrumentFetcher: Send + Sync {
    /// Source name used in logs
    fn source_name(&self) -> &'static str;

    /// Fetch raw price rows inside `range`, optionally limited to `codes`
    async fn fetch(&self, range: &DateRange, codes: Option<&[String]>) -> Result<Vec<RawRow>>;
}

/// 请求频率限制：两次请求之间至少间隔 `min_interval`
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(instant) = *last {
            let elapsed = instant.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("等待 {:?} 以遵守频率限制", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(SnapshotError::RequestError)
}

/// Maps transport failures and non-2xx answers to `FetchError`.
pub async fn ensure_success(source: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        return Err(SnapshotError::FetchError(format!(
            "{} answered HTTP {}: {}",
            source, status, snippet
        )));
    }
    Ok(response)
}
