use crate::error::FeedError;
use crate::feed::cache::TtlCache;
use crate::feed::exchange::post_info;
use crate::feed::rate_budget::{RateBudget, ViolationBackoff};
use crate::feed::types::FeedConfig;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CHEAP_REQUEST_WEIGHT: u32 = 2;
pub const DEFAULT_REQUEST_WEIGHT: u32 = 20;
pub const PRIVILEGED_REQUEST_WEIGHT: u32 = 60;
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const CHEAP_REQUEST_TYPES: [&str; 6] = [
    "allMids",
    "l2Book",
    "clearinghouseState",
    "orderStatus",
    "spotClearinghouseState",
    "exchangeStatus",
];
const PRIVILEGED_REQUEST_TYPES: [&str; 1] = ["userRole"];
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub struct InfoRequest {
    pub request_type: String,
    pub params: Map<String, Value>,
}

impl InfoRequest {
    pub fn new(request_type: &str) -> Self {
        Self {
            request_type: request_type.to_string(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn meta() -> Self {
        Self::new("meta")
    }

    pub fn all_mids() -> Self {
        Self::new("allMids")
    }

    pub fn candle_snapshot(coin: &str, interval: &str, start_time: i64, end_time: i64) -> Self {
        Self::new("candleSnapshot").with_param(
            "req",
            json!({
                "coin": coin,
                "interval": interval,
                "startTime": start_time,
                "endTime": end_time,
            }),
        )
    }

    pub fn body(&self) -> Value {
        let mut body = self.params.clone();
        body.insert(
            "type".to_string(),
            Value::String(self.request_type.clone()),
        );
        Value::Object(body)
    }

    /// Same request, same key, whatever order the params were added in.
    pub fn cache_key(&self) -> String {
        let sorted = self.params.iter().collect::<BTreeMap<_, _>>();
        let params = serde_json::to_string(&sorted).unwrap_or_default();
        format!("{}|{params}", self.request_type)
    }

    pub fn weight(&self) -> u32 {
        let request_type = self.request_type.as_str();
        if CHEAP_REQUEST_TYPES.contains(&request_type) {
            CHEAP_REQUEST_WEIGHT
        } else if PRIVILEGED_REQUEST_TYPES.contains(&request_type) {
            PRIVILEGED_REQUEST_WEIGHT
        } else {
            DEFAULT_REQUEST_WEIGHT
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.request_type.as_str() {
            "meta" | "spotMeta" | "perpDexs" => Some(Duration::from_secs(300)),
            "metaAndAssetCtxs" | "spotMetaAndAssetCtxs" => Some(Duration::from_secs(30)),
            "candleSnapshot" => Some(Duration::from_secs(10)),
            _ => None,
        }
    }
}

struct InfoShared {
    http: Client,
    rest_url: String,
    budget: Mutex<RateBudget>,
    cache: Mutex<TtlCache<Value>>,
}

/// REST reads against the info endpoint, paced by the weight budget and
/// memoized for cacheable request types.
#[derive(Clone)]
pub struct InfoClient {
    shared: Arc<InfoShared>,
}

impl InfoClient {
    pub fn new(config: &FeedConfig) -> Self {
        Self::with_http(Client::new(), config)
    }

    pub fn with_http(http: Client, config: &FeedConfig) -> Self {
        let budget = RateBudget::new(
            "rest_weight",
            config.weight_limit,
            config.rate_window,
            ViolationBackoff::new(config.rate_limit_backoff_base, config.rate_limit_backoff_max),
            Instant::now(),
        );

        Self {
            shared: Arc::new(InfoShared {
                http,
                rest_url: config.rest_url.clone(),
                budget: Mutex::new(budget),
                cache: Mutex::new(TtlCache::new()),
            }),
        }
    }

    pub async fn post(&self, request: &InfoRequest) -> Result<Value, FeedError> {
        let ttl = request.cache_ttl();
        let cache_key = request.cache_key();

        if ttl.is_some() {
            let cached = self.shared.cache.lock().get(&cache_key, Instant::now());
            if let Some(value) = cached {
                debug!(request_type = %request.request_type, "info cache hit");
                return Ok(value);
            }
        }

        let body = request.body();
        let weight = request.weight().min(self.shared.budget.lock().limit());

        loop {
            self.acquire(weight).await;

            match post_info(&self.shared.http, &self.shared.rest_url, &body).await {
                Ok(value) => {
                    self.shared.budget.lock().clear_violations();
                    if let Some(ttl) = ttl {
                        self.shared
                            .cache
                            .lock()
                            .set(cache_key, value.clone(), ttl, Instant::now());
                    }
                    return Ok(value);
                }
                Err(FeedError::RateLimited { retry_after }) => {
                    let delay = self
                        .shared
                        .budget
                        .lock()
                        .record_violation(Instant::now(), retry_after);
                    warn!(
                        request_type = %request.request_type,
                        delay_ms = delay.as_millis() as u64,
                        "info request rate limited, retrying"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn acquire(&self, weight: u32) {
        loop {
            let wait = {
                let mut budget = self.shared.budget.lock();
                let now = Instant::now();
                if budget.try_consume(weight, now) {
                    return;
                }
                budget.time_until_available(weight, now)
            };
            debug!(
                weight,
                wait_ms = wait.as_millis() as u64,
                "waiting for rest weight budget"
            );
            tokio::time::sleep(wait.max(MIN_WAIT)).await;
        }
    }

    pub fn sweep_cache(&self) -> usize {
        self.shared.cache.lock().sweep(Instant::now())
    }

    pub fn cached_entries(&self) -> usize {
        self.shared.cache.lock().len()
    }

    pub fn spawn_cache_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = client.sweep_cache();
                        if removed > 0 {
                            debug!(removed, "swept expired info cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::FeedClientArgs;
    use mockito::Matcher;

    fn config_for(server: &mockito::Server) -> FeedConfig {
        FeedClientArgs {
            rest_url: Some(format!("{}/info", server.url())),
            rate_limit_backoff_base_ms: Some(10),
            rate_limit_backoff_max_ms: Some(20),
            ..FeedClientArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    #[test]
    fn assigns_weights_from_the_fixed_table() {
        assert_eq!(InfoRequest::all_mids().weight(), CHEAP_REQUEST_WEIGHT);
        assert_eq!(InfoRequest::meta().weight(), DEFAULT_REQUEST_WEIGHT);
        assert_eq!(InfoRequest::new("userRole").weight(), PRIVILEGED_REQUEST_WEIGHT);
    }

    #[test]
    fn cache_key_ignores_param_insertion_order() {
        let first = InfoRequest::new("clearinghouseState")
            .with_param("user", "0xabc")
            .with_param("dex", "");
        let second = InfoRequest::new("clearinghouseState")
            .with_param("dex", "")
            .with_param("user", "0xabc");
        assert_eq!(first.cache_key(), second.cache_key());
    }

    #[test]
    fn only_snapshot_and_metadata_requests_are_cacheable() {
        assert_eq!(InfoRequest::meta().cache_ttl(), Some(Duration::from_secs(300)));
        assert_eq!(
            InfoRequest::candle_snapshot("BTC", "1m", 0, 60_000).cache_ttl(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(InfoRequest::all_mids().cache_ttl(), None);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .match_body(Matcher::Json(json!({"type": "meta"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"universe":[{"name":"BTC","szDecimals":5}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = InfoClient::new(&config_for(&server));
        let first = client
            .post(&InfoRequest::meta())
            .await
            .expect("first request should succeed");
        let second = client
            .post(&InfoRequest::meta())
            .await
            .expect("cached request should succeed");

        assert_eq!(first, second);
        assert_eq!(client.cached_entries(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn uncacheable_requests_always_hit_the_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .match_body(Matcher::Json(json!({"type": "allMids"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"BTC":"65000.0"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = InfoClient::new(&config_for(&server));
        for _ in 0..2 {
            client
                .post(&InfoRequest::all_mids())
                .await
                .expect("request should succeed");
        }

        assert_eq!(client.cached_entries(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn too_many_requests_is_retried_rather_than_returned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .with_status(429)
            .expect_at_least(2)
            .create_async()
            .await;

        let client = InfoClient::new(&config_for(&server));
        let request = tokio::spawn(async move { client.post(&InfoRequest::meta()).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!request.is_finished());
        request.abort();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limited_request_succeeds_once_the_server_recovers() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/info")
            .match_body(Matcher::Json(json!({"type": "meta"})))
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(1)
            .create_async()
            .await;
        let recovered = server
            .mock("POST", "/info")
            .match_body(Matcher::Json(json!({"type": "meta"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"universe":[{"name":"ETH","szDecimals":4}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = InfoClient::new(&config_for(&server));
        let value = client
            .post(&InfoRequest::meta())
            .await
            .expect("request should succeed after the rate limit");

        assert_eq!(value["universe"][0]["name"], "ETH");
        assert_eq!(client.cached_entries(), 1);
        limited.assert_async().await;
        recovered.assert_async().await;
    }
}
