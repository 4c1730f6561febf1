//! HTTP implementation of [`RecordSource`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use url::Url;

use crate::api::types::{DetailResponse, FetchWindow, RecordPage, UpstreamRecord};
use crate::api::{ApiError, RecordSource};
use crate::clock::Clock;
use crate::config::{ApiConfig, SyncConfig};
use crate::observability::metrics;
use crate::resilience::retries::is_retryable_status;
use crate::resilience::{CircuitBreaker, CircuitError, CircuitStats, RateLimiter, RetryPolicy};
use crate::store::{ResilienceState, Store};

/// Key under which limiter and breaker state is persisted.
pub const PROTECTION_NAME: &str = "upstream_api";

/// Bodies longer than this are cut in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Limiter and breaker guarding one upstream. Held for the duration of each
/// attempt so calls through one client are serialized.
struct Protection {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    retry: RetryPolicy,
    protection: Mutex<Protection>,
    store: Option<Arc<dyn Store>>,
    clock: Arc<dyn Clock>,
    requests: AtomicU64,
}

impl ApiClient {
    /// Build a client, adopting any limiter/breaker state found in `store`.
    pub fn new(config: &SyncConfig, store: Option<Arc<dyn Store>>, clock: Arc<dyn Clock>) -> Result<Self, ApiError> {
        Url::parse(&config.api.base_url).map_err(|e| ApiError::Url(format!("{}: {}", config.api.base_url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.api.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.api.read_timeout_secs))
            .build()?;

        let mut limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            Duration::from_secs(config.rate_limit.window_secs),
            clock.clone(),
        );
        let mut breaker = CircuitBreaker::from_config(PROTECTION_NAME, &config.circuit_breaker, clock.clone());

        if let Some(store) = &store {
            match store.load_resilience_state(PROTECTION_NAME) {
                Ok(Some(state)) => {
                    if let Some(snapshot) = state.limiter {
                        limiter.restore(snapshot);
                    }
                    if let Some(snapshot) = state.breaker {
                        breaker.restore(snapshot);
                    }
                    tracing::debug!(
                        remaining_requests = limiter.get_remaining_requests(),
                        breaker_state = %breaker.state(),
                        "Restored upstream protection state"
                    );
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to load upstream protection state, starting fresh"),
            }
        }

        Ok(Self {
            http,
            config: config.api.clone(),
            retry: RetryPolicy::from_config(&config.retries),
            protection: Mutex::new(Protection { limiter, breaker }),
            store,
            clock,
            requests: AtomicU64::new(0),
        })
    }

    pub async fn circuit_stats(&self) -> CircuitStats {
        self.protection.lock().await.breaker.get_stats()
    }

    pub async fn remaining_requests(&self) -> usize {
        self.protection.lock().await.limiter.get_remaining_requests()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let raw = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut url = Url::parse(&raw).map_err(|e| ApiError::Url(format!("{raw}: {e}")))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("api_key", &self.config.api_key);
        }
        Ok(url)
    }

    fn list_url(&self, window: &FetchWindow, offset: usize) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&self.config.records_path)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("offset", &offset.to_string())
                .append_pair("limit", &self.config.page_size.to_string());
            if let Some(from) = window.from {
                query.append_pair("from_date", &from.format("%Y-%m-%d").to_string());
            }
            if let Some(to) = window.to {
                query.append_pair("to_date", &to.format("%Y-%m-%d").to_string());
            }
        }
        Ok(url)
    }

    fn detail_url(&self, external_id: &str) -> Result<Url, ApiError> {
        let encoded: String = url::form_urlencoded::byte_serialize(external_id.as_bytes()).collect();
        self.endpoint(&self.config.detail_path.replace("{id}", &encoded))
    }

    /// GET with retries. Circuit-open errors are returned immediately.
    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        path = url.path(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upstream request failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(&self, url: &Url) -> Result<T, ApiError> {
        let mut guard = self.protection.lock().await;
        guard.limiter.wait_if_needed().await;
        let outcome = guard.breaker.call(|| self.send(url)).await;
        self.persist(&guard);
        drop(guard);

        let body = match outcome {
            Ok(Ok(body)) => body,
            Ok(Err(final_err)) => return Err(final_err),
            Err(CircuitError::Open { name, remaining }) => return Err(ApiError::CircuitOpen { name, remaining }),
            Err(CircuitError::Inner(err)) => return Err(err),
        };

        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// One request. The outer error counts against the breaker (transport,
    /// 429, 5xx); the inner error is a final client-side rejection.
    async fn send(&self, url: &Url) -> Result<Result<String, ApiError>, ApiError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let response = match self.http.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_api_request("error", started);
                return Err(ApiError::Http(e));
            }
        };

        let status = response.status();
        metrics::record_api_request(status.as_str(), started);
        let body = response.text().await?;

        if status.is_success() {
            return Ok(Ok(body));
        }

        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            body.truncate(cut);
        }
        let err = ApiError::Status {
            status: status.as_u16(),
            body,
        };
        if is_retryable_status(status) {
            Err(err)
        } else {
            Ok(Err(err))
        }
    }

    fn persist(&self, protection: &Protection) {
        let Some(store) = &self.store else {
            return;
        };
        let state = ResilienceState {
            limiter: Some(protection.limiter.snapshot()),
            breaker: Some(protection.breaker.snapshot()),
        };
        if let Err(e) = store.save_resilience_state(PROTECTION_NAME, &state) {
            tracing::warn!(error = %e, "Failed to persist upstream protection state");
        }
    }
}

#[async_trait]
impl RecordSource for ApiClient {
    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<UpstreamRecord>, ApiError> {
        let page_size = self.config.page_size.max(1);
        let mut records = Vec::new();
        let mut offset = 0usize;

        loop {
            let url = self.list_url(window, offset)?;
            let page: RecordPage = self.get_json(&url).await?;
            let received = page.records.len();
            records.extend(page.records);

            tracing::debug!(offset, received, total = records.len(), "Fetched record page");
            if received < page_size {
                break;
            }
            offset += received;
        }

        Ok(records)
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<UpstreamRecord, ApiError> {
        let url = self.detail_url(external_id)?;
        let detail: DetailResponse = self.get_json(&url).await?;
        let mut record = detail.into_record();
        if record.external_id.is_empty() {
            record.external_id = external_id.to_string();
        }
        Ok(record)
    }

    fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url)
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;

    fn client(base_url: &str) -> ApiClient {
        let mut config = SyncConfig::default();
        config.api.base_url = base_url.to_string();
        config.api.api_key = "secret".to_string();
        config.api.page_size = 25;
        ApiClient::new(&config, None, Arc::new(ManualClock::default())).unwrap()
    }

    #[test]
    fn test_list_url_carries_window_and_paging() {
        let client = client("http://api.example.com/v3/");
        let window = FetchWindow::between(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        );
        let url = client.list_url(&window, 50).unwrap();
        assert_eq!(url.path(), "/v3/records");
        let query = url.query().unwrap();
        assert!(query.contains("api_key=secret"));
        assert!(query.contains("offset=50"));
        assert!(query.contains("limit=25"));
        assert!(query.contains("from_date=2024-01-01"));
        assert!(query.contains("to_date=2024-06-30"));
    }

    #[test]
    fn test_detail_url_encodes_id() {
        let client = client("http://api.example.com");
        let url = client.detail_url("H 1/2").unwrap();
        assert_eq!(url.path(), "/records/H+1%2F2");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let mut config = SyncConfig::default();
        config.api.base_url = "not a url".to_string();
        let result = ApiClient::new(&config, None, Arc::new(ManualClock::default()));
        assert!(matches!(result, Err(ApiError::Url(_))));
    }
}
