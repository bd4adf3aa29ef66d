use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::header::{COOKIE, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, StatusCode, redirect};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ScraperError, ScraperResult};
use crate::config::Rate;
use crate::rate_limiter::{RatePolicy, Throttle, pace};

/// Browser-like user agent; the forum rejects obvious bots.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP side of the scraper: one reqwest client, the session cookie and
/// request spacing.
pub struct ForumClient {
    http: Client,
    policy: RatePolicy,
    throttle: Throttle,
    cookie: RwLock<Option<String>>,
}

impl ForumClient {
    pub fn new(rate: &Rate, policy: RatePolicy) -> ScraperResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(rate.scraper_timeout_secs))
            .redirect(redirect::Policy::limited(rate.scraper_max_redirects))
            .user_agent(USER_AGENT)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .use_rustls_tls()
            .build()?;

        Ok(Self {
            http,
            throttle: Throttle::new(policy.page_delay),
            policy,
            cookie: RwLock::new(None),
        })
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub fn set_cookie(&self, cookie: Option<String>) {
        *self.cookie.write() = cookie;
    }

    pub fn cookie(&self) -> Option<String> {
        self.cookie.read().clone()
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        self.throttle.average_response_time()
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.cookie.read().as_deref().map(HeaderValue::from_str) {
            Some(Ok(value)) => builder.header(COOKIE, value),
            _ => builder,
        }
    }

    /// GET a forum page. 401/403 mean the session cookie is missing or stale;
    /// 429 and 5xx are retried with linear backoff.
    pub async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> ScraperResult<String> {
        let mut attempt = 0;
        loop {
            self.throttle.wait_for_request().await;
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScraperError::Cancelled),
                outcome = self.request(Method::GET, url).send() => outcome,
            };
            self.throttle.record_response_time(started.elapsed());

            let retry_reason = match outcome {
                Ok(response) => {
                    let status = response.status();
                    debug!("GET {} -> {}", url, status);
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(ScraperError::AuthenticationRequired);
                    }
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }
                    if !RatePolicy::is_retryable(status) || attempt >= self.policy.max_retries {
                        return Err(ScraperError::Http {
                            status: status.as_u16(),
                        });
                    }
                    format!("status {}", status)
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.policy.max_retries => e.to_string(),
                Err(e) => return Err(e.into()),
            };

            let wait = self.policy.retry_delay(attempt);
            attempt += 1;
            warn!(
                "GET {} failed ({}), retry {}/{} in {:?}",
                url, retry_reason, attempt, self.policy.max_retries, wait
            );
            if !pace(wait, cancel).await {
                return Err(ScraperError::Cancelled);
            }
        }
    }

    /// HEAD probe used as the last pagination signal. A redirect that lands on
    /// a different page (the forum clamps out-of-range pages) counts as absent.
    pub async fn page_exists(&self, url: &str) -> bool {
        self.throttle.wait_for_request().await;
        match self.request(Method::HEAD, url).send().await {
            Ok(response) => response.status() == StatusCode::OK && response.url().as_str() == url,
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                false
            }
        }
    }
}
