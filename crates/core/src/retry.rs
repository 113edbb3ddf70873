//! Retry mechanism with incremental backoff
//!
//! Wraps chunk-level operations. Only transient failures (network errors, 5xx,
//! throttling) consume retry budget; an authentication failure triggers one
//! token refresh; everything else propagates immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result, RetryScope};
use crate::token::AccessTokenCache;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per operation, including the first one
    pub max_attempts: u32,
    /// Delay before every retry
    pub backoff_base_ms: u64,
    /// Extra delay added per attempt already made
    pub backoff_factor_ms: u64,
    /// Retries allowed across all chunks of one session
    pub session_retry_budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_factor_ms: 1000,
            session_retry_budget: 100,
        }
    }
}

/// Retry configuration builder for easy customization
#[derive(Debug, Clone)]
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.config.backoff_base_ms = ms;
        self
    }

    pub fn backoff_factor_ms(mut self, ms: u64) -> Self {
        self.config.backoff_factor_ms = ms;
        self
    }

    pub fn session_retry_budget(mut self, n: u32) -> Self {
        self.config.session_retry_budget = n;
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before the retry that follows attempt `attempt` (1-based)
pub fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let extra = config.backoff_factor_ms.saturating_mul(attempt as u64);
    Duration::from_millis(config.backoff_base_ms.saturating_add(extra))
}

/// Check if an error is retryable (transient)
pub fn is_retryable_error(error: &Error) -> bool {
    error.is_transient()
}

/// Session-scoped retry executor
///
/// One policy is created per upload or download call; its session retry
/// budget is shared by every chunk worker of that call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries_used: Arc<AtomicU32>,
    tokens: Option<Arc<AccessTokenCache>>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retries_used: Arc::new(AtomicU32::new(0)),
            tokens: None,
        }
    }

    /// Refresh this cache once when an operation fails with an auth error
    pub fn with_token_cache(mut self, tokens: Arc<AccessTokenCache>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries consumed so far in this session
    pub fn retries_used(&self) -> u32 {
        self.retries_used.load(Ordering::SeqCst)
    }

    fn take_session_retry(&self) -> bool {
        self.retries_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.config.session_retry_budget).then_some(used + 1)
            })
            .is_ok()
    }

    /// Generation of the token the next attempt will use
    async fn token_generation(&self) -> Result<Option<u64>> {
        match &self.tokens {
            Some(tokens) => Ok(Some(tokens.get().await?.generation)),
            None => Ok(None),
        }
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of budget
    pub async fn execute<T, F, Fut>(&self, chunk_index: Option<usize>, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut refreshed = false;

        loop {
            attempt += 1;

            let (error, generation) = match self.token_generation().await {
                Ok(generation) => match operation().await {
                    Ok(result) => return Ok(result),
                    Err(e) => (e, generation),
                },
                Err(e) => (e, None),
            };

            if let Error::Auth(_) = &error
                && !refreshed
                && let Some(tokens) = &self.tokens
            {
                tracing::warn!(
                    chunk_index = ?chunk_index,
                    error = %error,
                    "Credentials rejected, refreshing access token"
                );
                refreshed = true;
                if let Some(generation) = generation {
                    tokens.invalidate(generation).await;
                }
                // a refresh does not count as a retry
                attempt -= 1;
                continue;
            }

            if !is_retryable_error(&error) {
                return Err(error);
            }

            if attempt >= self.config.max_attempts {
                return Err(Error::RetryExhausted {
                    scope: RetryScope::Chunk,
                    chunk_index,
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            if !self.take_session_retry() {
                return Err(Error::RetryExhausted {
                    scope: RetryScope::Session,
                    chunk_index,
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let backoff = calculate_backoff(&self.config, attempt);
            tracing::debug!(
                chunk_index = ?chunk_index,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );

            tokio::time::sleep(backoff).await;
        }
    }
}
