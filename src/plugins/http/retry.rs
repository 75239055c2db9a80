use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::plugins::http::driver::HttpDriverError;
use crate::plugins::registry::{DriverContext, RangeFetcher, RangeResponse};

/// Retries the opening of a transfer on transient failures.
///
/// Only `fetch` is retried; once a body stream is handed out its errors go
/// straight to the worker, which fails the item.
pub struct RetryingFetcher<F> {
    inner: F,
    retries: u32,
    backoff_ms: u64,
}

impl<F: RangeFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, ctx: &DriverContext) -> Self {
        Self { inner, retries: ctx.retries, backoff_ms: ctx.retry_backoff_ms }
    }

    fn is_transient(err: &anyhow::Error) -> bool {
        if let Some(e) = err.downcast_ref::<HttpDriverError>() {
            return e.is_transient();
        }
        if let Some(e) = err.downcast_ref::<reqwest::Error>() {
            return e.is_timeout() || e.is_connect() || e.is_request();
        }
        false
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl<F: RangeFetcher> RangeFetcher for RetryingFetcher<F> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn fetch(&self, url: &Url, start: u64) -> anyhow::Result<RangeResponse> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch(url, start).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retries && Self::is_transient(&e) => {
                    tracing::debug!(%url, attempt, error = %e, "transient fetch error, backing off");
                    self.sleep_backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
