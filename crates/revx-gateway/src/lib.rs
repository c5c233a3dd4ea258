//! Allow-listed content retrieval gateway + the TTL caches behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "revx-gateway";

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Keyed TTL store. Entries are lazily evicted: a stale entry is checked
/// and removed on the next lookup, never swept proactively. Two concurrent
/// misses may both fetch and overwrite the same key; that race is benign
/// by contract.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("target {url} is not an allow-listed origin")]
    ForbiddenTarget { url: String },
    #[error("target {url} is not a valid absolute URL")]
    InvalidTarget { url: String },
    #[error("upstream did not respond within the timeout bound for {url}")]
    Timeout { url: String },
    #[error("upstream status {status} for {url}")]
    UpstreamStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct FetchedText {
    pub final_url: String,
    pub body: String,
}

/// Outbound fetch seam. Production code goes through [`HttpFetch`]; tests
/// substitute a counting or failing implementation.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<FetchedText, GatewayError>;
}

fn classify_request_error(url: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            url: url.to_string(),
        }
    } else {
        GatewayError::Request(err)
    }
}

/// Reqwest-backed [`RemoteFetch`] with a bounded per-request timeout. No
/// automatic retries: a timed-out or failed fetch is reported once.
#[derive(Debug)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);

        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetch for HttpFetch {
    async fn get_text(&self, url: &str) -> Result<FetchedText, GatewayError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| classify_request_error(url, err))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|err| classify_request_error(&final_url, err))?;
        Ok(FetchedText { final_url, body })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub trusted_host: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub user_agent: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trusted_host: "steamcommunity.com".to_string(),
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trusted_host: std::env::var("REVX_TRUSTED_HOST").unwrap_or(defaults.trusted_host),
            timeout: std::env::var("REVX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            cache_ttl: std::env::var("REVX_PROXY_CACHE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            user_agent: std::env::var("REVX_USER_AGENT").ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxiedContent {
    pub body: String,
    pub served_from_cache: bool,
}

/// Fetches a single external URL on behalf of the rest of the system,
/// enforcing the trusted-origin allow-list, the per-request timeout, and a
/// short-lived response cache keyed by the exact target URL string.
pub struct ContentGateway {
    fetch: Arc<dyn RemoteFetch>,
    cache: TtlCache<String>,
    trusted_host: String,
}

impl ContentGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let fetch = Arc::new(HttpFetch::new(config.timeout, config.user_agent.as_deref())?);
        Ok(Self::with_fetcher(config, fetch))
    }

    /// Builds a gateway over an explicit fetch implementation. Tests use
    /// this to observe or fail outbound calls.
    pub fn with_fetcher(config: GatewayConfig, fetch: Arc<dyn RemoteFetch>) -> Self {
        Self {
            fetch,
            cache: TtlCache::new(config.cache_ttl),
            trusted_host: config.trusted_host,
        }
    }

    fn check_target(&self, raw: &str) -> Result<Url, GatewayError> {
        let url = Url::parse(raw).map_err(|_| GatewayError::InvalidTarget {
            url: raw.to_string(),
        })?;
        let trusted =
            url.scheme() == "https" && url.host_str() == Some(self.trusted_host.as_str());
        if !trusted {
            return Err(GatewayError::ForbiddenTarget {
                url: raw.to_string(),
            });
        }
        Ok(url)
    }

    pub async fn fetch_proxied(&self, target: &str) -> Result<ProxiedContent, GatewayError> {
        self.check_target(target)?;

        if let Some(body) = self.cache.get(target).await {
            debug!(url = target, "proxy cache hit");
            return Ok(ProxiedContent {
                body,
                served_from_cache: true,
            });
        }

        let fetched = self.fetch.get_text(target).await?;
        self.cache
            .insert(target.to_string(), fetched.body.clone())
            .await;
        Ok(ProxiedContent {
            body: fetched.body,
            served_from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetch {
        calls: AtomicUsize,
        body: String,
    }

    impl CountingFetch {
        fn new(body: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                body: body.to_string(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteFetch for CountingFetch {
        async fn get_text(&self, url: &str) -> Result<FetchedText, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedText {
                final_url: url.to_string(),
                body: self.body.clone(),
            })
        }
    }

    struct TimingOutFetch;

    #[async_trait]
    impl RemoteFetch for TimingOutFetch {
        async fn get_text(&self, url: &str) -> Result<FetchedText, GatewayError> {
            Err(GatewayError::Timeout {
                url: url.to_string(),
            })
        }
    }

    fn gateway_over(fetch: Arc<dyn RemoteFetch>, cache_ttl: Duration) -> ContentGateway {
        ContentGateway::with_fetcher(
            GatewayConfig {
                cache_ttl,
                ..GatewayConfig::default()
            },
            fetch,
        )
    }

    #[tokio::test]
    async fn forbidden_target_performs_no_network_call() {
        let fetch = Arc::new(CountingFetch::new("<html></html>"));
        let gateway = gateway_over(fetch.clone(), Duration::from_secs(60));

        let err = gateway
            .fetch_proxied("https://evil.example/x")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ForbiddenTarget { .. }));
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn insecure_scheme_is_forbidden_even_for_trusted_host() {
        let fetch = Arc::new(CountingFetch::new(""));
        let gateway = gateway_over(fetch.clone(), Duration::from_secs(60));

        let err = gateway
            .fetch_proxied("http://steamcommunity.com/profiles/1/recommended/")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ForbiddenTarget { .. }));
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn allow_listed_target_is_fetched_once_then_cached() {
        let fetch = Arc::new(CountingFetch::new("<html>feed</html>"));
        let gateway = gateway_over(fetch.clone(), Duration::from_secs(60));
        let url = "https://steamcommunity.com/profiles/1/recommended/";

        let first = gateway.fetch_proxied(url).await.unwrap();
        assert!(!first.served_from_cache);
        assert_eq!(first.body, "<html>feed</html>");

        let second = gateway.fetch_proxied(url).await.unwrap();
        assert!(second.served_from_cache);
        assert_eq!(second.body, first.body);
        assert_eq!(fetch.calls(), 1);
    }

    #[tokio::test]
    async fn stale_cache_entry_triggers_refetch() {
        let fetch = Arc::new(CountingFetch::new("x"));
        let gateway = gateway_over(fetch.clone(), Duration::ZERO);
        let url = "https://steamcommunity.com/profiles/1/recommended/";

        let first = gateway.fetch_proxied(url).await.unwrap();
        let second = gateway.fetch_proxied(url).await.unwrap();
        assert!(!first.served_from_cache);
        assert!(!second.served_from_cache);
        assert_eq!(fetch.calls(), 2);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_distinct_classification() {
        let gateway = gateway_over(Arc::new(TimingOutFetch), Duration::from_secs(60));
        let err = gateway
            .fetch_proxied("https://steamcommunity.com/profiles/1/recommended/")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
    }

    #[tokio::test]
    async fn ttl_cache_evicts_stale_entries_on_lookup() {
        let cache: TtlCache<String> = TtlCache::new(Duration::ZERO);
        cache.insert("k".to_string(), "v".to_string()).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.len().await, 0, "stale entry removed on lookup");
    }

    #[tokio::test]
    async fn ttl_cache_serves_fresh_entries() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k".to_string(), 7).await;
        assert_eq!(cache.get("k").await, Some(7));
        assert_eq!(cache.len().await, 1);
    }
}
