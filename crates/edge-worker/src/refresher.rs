use chrono::{DateTime, Utc};
use common::bloom::BloomFilterPayload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry::metrics::{BLOOM_FILTER_BITS, BLOOM_FILTER_REFRESHES};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bloom::{BloomFilter, BloomFilterError, InvalidationSetHandle};
use crate::fetch::{CacheMode, FetchError, FetchRequest, Fetcher};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalidation set endpoint returned status {0}")]
    Status(u16),
    #[error("invalidation set payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Filter(#[from] BloomFilterError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshState {
    pub in_flight: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Keeps an [`InvalidationSetHandle`] current.
///
/// At most one refresh runs at a time. A failed refresh keeps the previous
/// set and blocks further attempts for the back-off period.
pub struct BloomFilterRefresher {
    url: String,
    fetcher: Arc<dyn Fetcher>,
    handle: InvalidationSetHandle,
    interval: Duration,
    backoff: Duration,
    in_flight: AtomicBool,
    last_success: Mutex<Option<DateTime<Utc>>>,
    backoff_until: Mutex<Option<DateTime<Utc>>>,
}

impl BloomFilterRefresher {
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn Fetcher>, handle: InvalidationSetHandle) -> Self {
        Self {
            url: url.into(),
            fetcher,
            handle,
            interval: DEFAULT_REFRESH_INTERVAL,
            backoff: DEFAULT_BACKOFF,
            in_flight: AtomicBool::new(false),
            last_success: Mutex::new(None),
            backoff_until: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn handle(&self) -> &InvalidationSetHandle {
        &self.handle
    }

    pub fn state(&self) -> RefreshState {
        RefreshState {
            in_flight: self.in_flight.load(Ordering::Acquire),
            last_success: self.last_success.lock().ok().and_then(|guard| *guard),
            backoff_until: self.backoff_until.lock().ok().and_then(|guard| *guard),
        }
    }

    /// Starts a background refresh unless one is in flight, a back-off is
    /// active, or the current set is younger than the refresh interval.
    /// Returns the task when one was started.
    pub async fn ensure_freshness(self: &Arc<Self>) -> Option<JoinHandle<bool>> {
        if self.in_flight.load(Ordering::Acquire) || self.current_is_fresh().await {
            return None;
        }
        if !self.try_begin() {
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run().await }))
    }

    /// Refreshes inline, unless another refresh holds the in-flight flag.
    pub async fn refresh_now(self: &Arc<Self>) -> bool {
        if !self.try_begin() {
            debug!("refresh already in flight");
            return false;
        }
        Arc::clone(self).run().await
    }

    fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn current_is_fresh(&self) -> bool {
        let Some(filter) = self.handle.load().await else {
            return false;
        };
        match (Utc::now() - filter.created_at()).to_std() {
            Ok(age) => age < self.interval,
            // Created in the future: clock moved backwards.
            Err(_) => true,
        }
    }

    async fn run(self: Arc<Self>) -> bool {
        match self.fetch_filter().await {
            Ok(filter) => {
                let bits = filter.bits();
                self.handle.publish(filter).await;
                if let Ok(mut last) = self.last_success.lock() {
                    *last = Some(Utc::now());
                }
                if let Ok(mut until) = self.backoff_until.lock() {
                    *until = None;
                }
                BLOOM_FILTER_BITS.set(i64::try_from(bits).unwrap_or(i64::MAX));
                BLOOM_FILTER_REFRESHES.with_label_values(&["success"]).inc();
                self.in_flight.store(false, Ordering::Release);
                info!(bits, "invalidation set refreshed");
                true
            }
            Err(err) => {
                BLOOM_FILTER_REFRESHES.with_label_values(&["failure"]).inc();
                warn!(url = %self.url, error = %err, backoff_ms = self.backoff.as_millis() as u64, "invalidation set refresh failed");
                if let Ok(mut until) = self.backoff_until.lock() {
                    *until = chrono::Duration::from_std(self.backoff)
                        .ok()
                        .and_then(|backoff| Utc::now().checked_add_signed(backoff));
                }

                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    tokio::time::sleep(this.backoff).await;
                    if let Ok(mut until) = this.backoff_until.lock() {
                        *until = None;
                    }
                    this.in_flight.store(false, Ordering::Release);
                });
                false
            }
        }
    }

    async fn fetch_filter(&self) -> Result<BloomFilter, RefreshError> {
        let response = self
            .fetcher
            .fetch(FetchRequest::get(self.url.clone()).with_mode(CacheMode::Default))
            .await?;
        if response.status != 200 {
            return Err(RefreshError::Status(response.status));
        }
        let payload: BloomFilterPayload = serde_json::from_slice(&response.body)?;
        Ok(BloomFilter::from_payload(&payload)?)
    }
}
