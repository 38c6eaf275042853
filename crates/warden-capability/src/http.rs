//! `reqwest`-backed network capability with per-domain permissions and a
//! per-plugin token-bucket rate limiter.
//!
//! Redirects are followed here rather than by `reqwest` so that every hop
//! passes the same scheme and domain checks as the original URL.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backend::NetworkBackend;
use warden_core::{HttpRequest, HttpResponse, PermissionCategory, PermissionRegistry, Result, WardenError};

/// Redirect hops followed before a request fails.
const MAX_REDIRECTS: usize = 10;

/// Headers dropped when a redirect moves to a different host.
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Default per-request timeout.
    pub timeout: Duration,
    /// Maximum burst size (tokens in each plugin's bucket).
    pub burst: u32,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
    pub user_agent: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            burst: 60,
            refill_per_sec: 10.0,
            user_agent: format!("warden/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A token bucket for a single plugin.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time, then try to consume one.
    fn try_consume(&mut self, burst: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token is available.
    fn retry_after(&self, refill_per_sec: f64) -> u64 {
        if refill_per_sec <= 0.0 {
            return 60;
        }
        let needed = 1.0 - self.tokens;
        (needed / refill_per_sec).ceil().max(1.0) as u64
    }
}

/// Per-plugin request rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    burst: u32,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(burst: u32, refill_per_sec: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            burst,
            refill_per_sec,
        }
    }

    /// Take one token for `plugin_id`, or return the retry-after seconds.
    pub fn acquire(&self, plugin_id: &str) -> std::result::Result<(), u64> {
        let mut bucket = self
            .buckets
            .entry(plugin_id.to_string())
            .or_insert_with(|| Bucket::new(self.burst));
        if bucket.try_consume(self.burst, self.refill_per_sec) {
            Ok(())
        } else {
            Err(bucket.retry_after(self.refill_per_sec))
        }
    }

    /// Forget a plugin's bucket (on deactivation).
    pub fn forget(&self, plugin_id: &str) {
        self.buckets.remove(plugin_id);
    }
}

/// Network backend performing real HTTP requests.
pub struct HttpNetwork {
    client: reqwest::Client,
    permissions: PermissionRegistry,
    limiter: RateLimiter,
}

impl HttpNetwork {
    pub fn new(permissions: PermissionRegistry, settings: NetworkSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WardenError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            permissions,
            limiter: RateLimiter::new(settings.burst, settings.refill_per_sec),
        })
    }

    /// Parse and validate a URL, returning it with its host for the
    /// permission check.
    fn checked_target(raw: &str) -> Result<(url::Url, String)> {
        let url = url::Url::parse(raw)
            .map_err(|e| WardenError::InvalidInput(format!("invalid URL '{}': {}", raw, e)))?;
        let host = Self::target_host(&url)?;
        Ok((url, host))
    }

    fn target_host(url: &url::Url) -> Result<String> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WardenError::InvalidInput(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| WardenError::InvalidInput(format!("URL '{}' has no host", url)))
    }

    /// Resolve a redirect's `Location` against the URL that produced it.
    fn redirect_target(current: &url::Url, response: &reqwest::Response) -> Result<Option<url::Url>> {
        if !response.status().is_redirection() {
            return Ok(None);
        }
        let Some(location) = response.headers().get(reqwest::header::LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|e| WardenError::Network(format!("unreadable redirect location: {}", e)))?;
        current
            .join(location)
            .map(Some)
            .map_err(|e| WardenError::Network(format!("invalid redirect location '{}': {}", location, e)))
    }
}

#[async_trait]
impl NetworkBackend for HttpNetwork {
    async fn request(&self, plugin_id: &str, request: HttpRequest) -> Result<HttpResponse> {
        let (mut url, mut host) = Self::checked_target(&request.url)?;
        self.permissions
            .check(plugin_id, PermissionCategory::Network, "request", Some(host.as_str()))?;

        if let Err(retry_after) = self.limiter.acquire(plugin_id) {
            warn!(plugin_id, host = %host, retry_after, "plugin rate limited");
            return Err(WardenError::Network(format!(
                "rate limit exceeded, retry after {}s",
                retry_after
            )));
        }

        let mut method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| WardenError::InvalidInput(e.to_string()))?;
        let mut headers = request.headers;
        let mut body = request.body;

        let mut hops = 0;
        let response = loop {
            let mut builder = self.client.request(method.clone(), url.clone());
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            if let Some(ms) = request.timeout_ms {
                builder = builder.timeout(Duration::from_millis(ms));
            }

            debug!(plugin_id, method = %method, host = %host, hops, "sending request");
            let response = builder
                .send()
                .await
                .map_err(|e| WardenError::Network(e.to_string()))?;

            let Some(next) = Self::redirect_target(&url, &response)? else {
                break response;
            };
            if hops == MAX_REDIRECTS {
                return Err(WardenError::Network(format!(
                    "too many redirects (limit {})",
                    MAX_REDIRECTS
                )));
            }
            hops += 1;

            let next_host = Self::target_host(&next)?;
            if let Err(e) = self.permissions.check(
                plugin_id,
                PermissionCategory::Network,
                "request",
                Some(next_host.as_str()),
            ) {
                warn!(plugin_id, from = %host, to = %next_host, "redirect to unpermitted host refused");
                return Err(e);
            }

            let status = response.status();
            if status == reqwest::StatusCode::SEE_OTHER
                || (matches!(status.as_u16(), 301 | 302) && method == reqwest::Method::POST)
            {
                method = reqwest::Method::GET;
                body = None;
                headers.retain(|name, _| {
                    !name.eq_ignore_ascii_case("content-type") && !name.eq_ignore_ascii_case("content-length")
                });
            }
            if next_host != host {
                headers.retain(|name, _| {
                    !CREDENTIAL_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
                });
            }
            url = next;
            host = next_host;
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| WardenError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn release_plugin(&self, plugin_id: &str) {
        self.limiter.forget(plugin_id);
    }
}
