use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Rate;

/// Fixed pacing policy for outbound requests.
///
/// The defaults are tuned to what the upstream forum tolerates; lowering them
/// risks a ban.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    /// Delay between pages of one thread
    pub page_delay: Duration,
    /// Delay between forum index pages
    pub index_page_delay: Duration,
    /// Delay between threads of a forum scrape
    pub thread_delay: Duration,
    /// Delay between links during thread verification
    pub link_delay: Duration,
    /// Delay between links during the background sweep
    pub sweep_link_delay: Duration,
    /// Base of the linear retry backoff
    pub retry_base: Duration,
    pub max_retries: u32,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self::from_config(&Rate::default())
    }
}

impl RatePolicy {
    pub fn from_config(rate: &Rate) -> Self {
        Self {
            page_delay: Duration::from_millis(rate.page_delay_ms),
            index_page_delay: Duration::from_millis(rate.index_page_delay_ms),
            thread_delay: Duration::from_millis(rate.thread_delay_ms),
            link_delay: Duration::from_millis(rate.link_delay_ms),
            sweep_link_delay: Duration::from_millis(rate.sweep_link_delay_ms),
            retry_base: Duration::from_millis(rate.retry_base_ms),
            max_retries: rate.max_retries,
        }
    }

    /// No waiting at all; used by tests against local stubs.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            page_delay: Duration::ZERO,
            index_page_delay: Duration::ZERO,
            thread_delay: Duration::ZERO,
            link_delay: Duration::ZERO,
            sweep_link_delay: Duration::ZERO,
            retry_base: Duration::ZERO,
            max_retries: 3,
        }
    }

    /// Linear backoff: `retry_base × (attempt + 1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base * (attempt + 1)
    }

    /// Rate limiting and server-side failures are worth another attempt.
    pub fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns false when cancelled.
pub async fn pace(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Enforces a minimum spacing between consecutive requests and keeps a short
/// history of response times.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    state: Arc<RwLock<ThrottleState>>,
}

#[derive(Debug, Default)]
struct ThrottleState {
    /// Start of the most recently reserved request slot
    last_request_time: Option<Instant>,
    /// Recent response times for analysis
    recent_response_times: Vec<Duration>,
}

const RESPONSE_HISTORY: usize = 20;

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Arc::new(RwLock::new(ThrottleState::default())),
        }
    }

    /// Wait until `min_interval` has passed since the previous request.
    /// Concurrent callers each reserve their own slot, so they queue up
    /// `min_interval` apart instead of firing together.
    pub async fn wait_for_request(&self) -> Duration {
        let delay = {
            let mut state = self.state.write();
            let now = Instant::now();
            let slot = state
                .last_request_time
                .map(|last| (last + self.min_interval).max(now))
                .unwrap_or(now);
            state.last_request_time = Some(slot);
            slot - now
        };

        if !delay.is_zero() {
            debug!("Throttle waiting for {:?}", delay);
            tokio::time::sleep(delay).await;
        }
        delay
    }

    pub fn record_response_time(&self, response_time: Duration) {
        let mut state = self.state.write();
        state.recent_response_times.push(response_time);
        if state.recent_response_times.len() > RESPONSE_HISTORY {
            state.recent_response_times.remove(0);
        }
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        let state = self.state.read();
        if state.recent_response_times.is_empty() {
            return None;
        }
        let total: Duration = state.recent_response_times.iter().sum();
        Some(total / state.recent_response_times.len() as u32)
    }
}
