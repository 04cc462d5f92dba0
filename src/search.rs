//! Search/retrieval tool interface.
//!
//! The retrieval logic itself is an external collaborator; this module pins
//! down the contract evidence-gathering task units consume: an ordered hit
//! list, a distinguishable rate-limit condition, and self-enforced minimum
//! spacing between outbound calls via the `PacedSearch` wrapper.

use crate::errors::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

/// Search backend contract.
#[async_trait]
pub trait SearchTool: Send + Sync {
    /// Run a query, returning hits in ranked order. Implementations raise
    /// `SearchError::RateLimited` when the backend throttles them.
    async fn query(&self, text: &str, max_results: usize)
    -> Result<Vec<SearchHit>, SearchError>;
}

/// Wrapper enforcing a minimum spacing between call starts, so a burst of
/// evidence-gathering units cannot trip the backend's rate limit.
pub struct PacedSearch<T> {
    inner: T,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<T> PacedSearch<T> {
    /// Default spacing: 1.1 seconds, slightly above one call per second.
    pub fn new(inner: T) -> Self {
        Self::with_interval(inner, Duration::from_millis(1100))
    }

    pub fn with_interval(inner: T, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_call: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<T: SearchTool> SearchTool for PacedSearch<T> {
    async fn query(
        &self,
        text: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        {
            // Hold the slot lock through the wait so concurrent callers queue
            // up and each departs min_interval after the previous one.
            let mut last_call = self.last_call.lock().await;
            if let Some(previous) = *last_call {
                let elapsed = previous.elapsed();
                if elapsed < self.min_interval {
                    let wait = self.min_interval - elapsed;
                    debug!(wait_ms = wait.as_millis() as u64, "pacing search call");
                    tokio::time::sleep(wait).await;
                }
            }
            *last_call = Some(Instant::now());
        }

        self.inner.query(text, max_results).await
    }
}
