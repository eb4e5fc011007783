//! Retry with exponential backoff for broker calls.
//!
//! Retryable: transient failures and rate limits. Not retryable: permanent
//! failures, and timeouts on the submit path (the original request may
//! have executed; reconciliation resolves it instead).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AccountSnapshot, Broker, BrokerError, BrokerPosition, OpenOrder, OrderSpec};

/// Retry policy for broker API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Exponential growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.2 = plus or minus 20%).
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter(),
        }
    }
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> f64 {
    0.2
}

/// Calculator for exponential backoff with jitter.
#[derive(Debug)]
pub struct BackoffCalculator {
    attempt: u32,
    max_attempts: u32,
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
}

impl BackoffCalculator {
    /// Create a calculator from a policy.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
            initial_ms: policy.initial_backoff_ms,
            max_ms: policy.max_backoff_ms,
            multiplier: policy.multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Next backoff duration, or `None` once attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let base = (self.initial_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let jitter = 1.0 + self.jitter_factor * (rand::rng().random::<f64>() * 2.0 - 1.0);
        let jittered = (base * jitter).max(0.0) as u64;
        self.attempt += 1;
        Some(Duration::from_millis(jittered.min(self.max_ms)))
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Decorator adding bounded retry to any broker.
///
/// State is never advanced here; a call that exhausts its retries surfaces
/// the final error to the engine unchanged.
pub struct RetryingBroker<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: Broker> RetryingBroker<B> {
    /// Wrap a broker with a retry policy.
    pub const fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn retry<T, F, Fut>(
        &self,
        op_name: &str,
        allow_retry: fn(&BrokerError) -> bool,
        mut call: F,
    ) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, BrokerError>> + Send,
    {
        let mut backoff = BackoffCalculator::new(&self.policy);
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if allow_retry(&error) => {
                    let Some(delay) = backoff.next_backoff() else {
                        warn!(op = op_name, error = %error, "broker retries exhausted");
                        return Err(error);
                    };
                    debug!(
                        op = op_name,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "retrying broker call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<B: Broker> Broker for RetryingBroker<B> {
    async fn submit(&self, spec: &OrderSpec) -> Result<String, BrokerError> {
        self.retry("submit", BrokerError::is_safe_to_retry_submit, || {
            self.inner.submit(spec)
        })
        .await
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        self.retry("cancel", BrokerError::is_retriable, || {
            self.inner.cancel(broker_order_id)
        })
        .await
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        self.retry("list_open_orders", BrokerError::is_retriable, || {
            self.inner.list_open_orders()
        })
        .await
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.retry("list_positions", BrokerError::is_retriable, || {
            self.inner.list_positions()
        })
        .await
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        self.retry("get_account", BrokerError::is_retriable, || {
            self.inner.get_account()
        })
        .await
    }
}
