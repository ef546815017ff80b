//! Seed list retrieval.
//!
//! The seed is a plain text file served over HTTP(S) with one `ip:port` per
//! line. It is fetched at most once per reseed interval; the last good list
//! is served in between and whenever a fetch fails. A failed fetch is not
//! retried for [`SEED_RETRY`] or the interval, whichever is shorter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{P2pError, P2pResult};

/// Wait after a failed fetch before asking the seed server again.
pub const SEED_RETRY: Duration = Duration::from_secs(60);

struct SeedCache {
    fetched: Option<Instant>,
    retry_at: Option<Instant>,
    endpoints: Vec<Endpoint>,
}

/// Cached view of the seed file.
pub struct Seed {
    url: String,
    interval: Duration,
    client: reqwest::Client,
    cache: Mutex<SeedCache>,
}

impl Seed {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            url: url.into(),
            interval,
            client,
            cache: Mutex::new(SeedCache {
                fetched: None,
                retry_at: None,
                endpoints: Vec::new(),
            }),
        }
    }

    /// Seed endpoints, refreshed when the cached list is older than the
    /// interval.
    pub async fn retrieve(&self) -> Vec<Endpoint> {
        if self.url.is_empty() {
            return Vec::new();
        }

        {
            let cache = self.cache.lock();
            if let Some(fetched) = cache.fetched {
                if fetched.elapsed() < self.interval {
                    return cache.endpoints.clone();
                }
            }
            if cache.retry_at.is_some_and(|at| Instant::now() < at) {
                return cache.endpoints.clone();
            }
        }

        match self.fetch().await {
            Ok(endpoints) => {
                tracing::debug!(url = %self.url, count = endpoints.len(), "Retrieved seed list");
                let mut cache = self.cache.lock();
                cache.fetched = Some(Instant::now());
                cache.retry_at = None;
                cache.endpoints = endpoints.clone();
                endpoints
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Unable to retrieve seed list");
                let mut cache = self.cache.lock();
                cache.retry_at = Some(Instant::now() + SEED_RETRY.min(self.interval));
                cache.endpoints.clone()
            }
        }
    }

    async fn fetch(&self) -> P2pResult<Vec<Endpoint>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| P2pError::Seed(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| P2pError::Seed(e.to_string()))?;
        Ok(parse_seed(&body))
    }
}

/// Parse a seed file, skipping lines that are not valid endpoints.
pub fn parse_seed(body: &str) -> Vec<Endpoint> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match Endpoint::parse(line) {
            Ok(ep) => Some(ep),
            Err(e) => {
                tracing::debug!(line = %line, error = %e, "Skipping bad seed entry");
                None
            }
        })
        .collect()
}
