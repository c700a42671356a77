//! Circuit breaker guarding calls to external embedding services.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close it again.
    pub recovery_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub open_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_threshold: 2,
            open_secs: 30,
        }
    }
}

/// Errors that can pass through a [`CircuitBreaker`].
pub trait CircuitError {
    /// Error returned while the circuit is open.
    fn circuit_open(name: &str) -> Self;

    /// Whether this failure counts towards opening the circuit.
    fn trips_circuit(&self) -> bool {
        true
    }
}

/// Circuit breaker implementation
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_threshold: u32,
    timeout: Duration,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU32>,
    success_count: Arc<AtomicU32>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_threshold: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
            timeout,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            success_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            config.recovery_threshold,
            Duration::from_secs(config.open_secs),
        )
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Execute an async operation through the circuit breaker
    pub async fn call<F, T, E, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: CircuitError,
    {
        let state = *self.state.read().await;
        if let CircuitState::Open { opened_at } = state {
            if opened_at.elapsed() >= self.timeout {
                *self.state.write().await = CircuitState::HalfOpen;
                self.success_count.store(0, Ordering::Relaxed);
                tracing::info!(circuit = %self.name, "Circuit breaker transitioning to half-open");
            } else {
                return Err(E::circuit_open(&self.name));
            }
        }

        match f().await {
            Ok(val) => {
                self.record_success().await;
                Ok(val)
            }
            Err(err) => {
                if err.trips_circuit() {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.recovery_threshold {
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    tracing::info!(circuit = %self.name, "Circuit breaker recovered (closed)");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open { .. } => {}
        }
    }

    async fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write().await;
        match *state {
            // A failed probe reopens immediately.
            CircuitState::HalfOpen => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(circuit = %self.name, "Circuit breaker probe failed (open)");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(circuit = %self.name, failures, "Circuit breaker tripped (open)");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Open,
        Broken,
        BadInput,
    }

    impl CircuitError for TestError {
        fn circuit_open(_name: &str) -> Self {
            TestError::Open
        }

        fn trips_circuit(&self) -> bool {
            *self != TestError::BadInput
        }
    }

    async fn fail(breaker: &CircuitBreaker, err: TestError) -> Result<(), TestError> {
        breaker.call(|| async { Err::<(), _>(err) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", 2, 1, Duration::from_secs(60));
        assert_eq!(fail(&breaker, TestError::Broken).await, Err(TestError::Broken));
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(fail(&breaker, TestError::Broken).await, Err(TestError::Broken));
        assert!(matches!(breaker.state().await, CircuitState::Open { .. }));

        let rejected: Result<(), TestError> = breaker.call(|| async { Ok(()) }).await;
        assert_eq!(rejected, Err(TestError::Open));
    }

    #[tokio::test]
    async fn test_non_tripping_errors_are_ignored() {
        let breaker = CircuitBreaker::new("test", 1, 1, Duration::from_secs(60));
        assert_eq!(fail(&breaker, TestError::BadInput).await, Err(TestError::BadInput));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovers() {
        let breaker = CircuitBreaker::new("test", 1, 1, Duration::from_millis(10));
        let _ = fail(&breaker, TestError::Broken).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe: Result<u32, TestError> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(probe, Ok(7));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("test", 3, 1, Duration::from_millis(10));
        for _ in 0..3 {
            let _ = fail(&breaker, TestError::Broken).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = fail(&breaker, TestError::Broken).await;
        assert!(matches!(breaker.state().await, CircuitState::Open { .. }));
    }
}
