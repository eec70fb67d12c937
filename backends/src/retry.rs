use async_trait::async_trait;
use bytes::Bytes;
use onesnap_core::remote::{BackendType, RemoteStore};
use onesnap_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
    /// Upper bound for a single attempt
    #[serde(rename = "attempt_timeout_ms", with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        // Jitter: up to 25% on top
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            Error::Backend(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("rate limit")
                    || msg.contains("throttl")
                    || msg.contains("slow down")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
            }
            // Missing keys, integrity failures and lock conflicts never heal
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// runs out of attempts. Each attempt is bounded by the configured timeout;
/// running out of attempts yields [`Error::TransportExhausted`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    key: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let outcome = match timeout(config.attempt_timeout, operation()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Transport(format!(
                "{} {} timed out after {:?}",
                operation_name, key, config.attempt_timeout
            ))),
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        key = key,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_retryable() => {
                debug!(
                    operation = operation_name,
                    key = key,
                    error = %error,
                    "Error is not retryable, failing immediately"
                );
                return Err(error);
            }
            Err(error) => {
                // No sleep after the last attempt
                if attempt + 1 < attempts {
                    let backoff = config.backoff_duration(attempt);
                    warn!(
                        operation = operation_name,
                        key = key,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying after backoff"
                    );
                    sleep(backoff).await;
                }
                last_error = Some(error);
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempt was made".to_string());
    warn!(
        operation = operation_name,
        key = key,
        max_attempts = attempts,
        error = %reason,
        "Operation failed after all retry attempts"
    );
    Err(Error::TransportExhausted {
        operation: operation_name.to_string(),
        key: key.to_string(),
        attempts,
        reason,
    })
}

/// Adds bounded retries and per-attempt timeouts to every call of `S`.
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: RemoteStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RemoteStore> RemoteStore for RetryingStore<S> {
    async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        retry_with_backoff(&self.config, "init", "", move || inner.init()).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        retry_with_backoff(&self.config, "put", key, move || inner.put(key, data.clone())).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let inner = &self.inner;
        retry_with_backoff(&self.config, "get", key, move || inner.get(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let inner = &self.inner;
        retry_with_backoff(&self.config, "delete", key, move || inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = &self.inner;
        retry_with_backoff(&self.config, "list", prefix, move || inner.list(prefix)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onesnap_core::MemoryStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(), "test_operation", "k", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::Transport("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_transport_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(), "put", "objects/x", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")))
            }
        })
        .await;

        match result {
            Err(Error::TransportExhausted { operation, key, attempts: n, .. }) => {
                assert_eq!(operation, "put");
                assert_eq!(key, "objects/x");
                assert_eq!(n, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast(), "get", "lock", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::not_found("lock"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempts_time_out() {
        let config = RetryConfig {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(10),
            ..fast()
        };

        let result = retry_with_backoff(&config, "get", "slow", || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::TransportExhausted { attempts: 2, .. })));
    }

    #[test]
    fn test_backoff_duration_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(10), Duration::from_secs(10));
    }

    #[test]
    fn test_classification() {
        assert!(Error::Transport("x".into()).is_retryable());
        assert!(Error::Backend("503 Slow Down".into()).is_retryable());
        assert!(!Error::Backend("AccessDenied".into()).is_retryable());
        assert!(!Error::integrity("objects/x", "bad tag").is_retryable());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no")).is_retryable());
    }

    #[tokio::test]
    async fn test_retrying_store_delegates() {
        let store = RetryingStore::new(MemoryStore::new(), fast());
        store.put("lock", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(store.list("").await.unwrap(), vec!["lock"]);
        assert_eq!(store.inner().put_count(), 1);
        assert!(matches!(store.get("missing").await, Err(Error::NotFound { .. })));
        assert_eq!(store.backend_type(), BackendType::Memory);
    }
}
