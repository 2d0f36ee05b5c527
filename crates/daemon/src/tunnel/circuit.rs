// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Circuit Breaker Module
// Per-tunnel failure accounting guarding reconnection storms

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tunneld_common::{Error, Result};

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow; failures are counted
    Closed,
    /// Requests are refused until the recovery timeout elapses
    Open,
    /// A single probe request is allowed
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub max_failures: u32,
    /// Time the circuit stays open before allowing a probe
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    state_changed: Instant,
}

/// Three-state circuit breaker. All transitions happen under one lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                state_changed: Instant::now(),
            }),
        }
    }

    /// Check whether a request may proceed. An open circuit whose recovery
    /// timeout has elapsed transitions to half-open and admits the request.
    pub fn allow(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let open_for = inner.state_changed.elapsed();
                if open_for > self.config.recovery_timeout {
                    transition(&mut inner, BreakerState::HalfOpen);
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(format!(
                        "circuit has been open for {:.1}s",
                        open_for.as_secs_f64()
                    )))
                }
            }
            BreakerState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Closed);
            }
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                if inner.failures >= self.config.max_failures {
                    transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failures
    }

    /// Run `op` if the breaker admits it, recording the outcome.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// Failures reset when entering closed or open
fn transition(inner: &mut BreakerInner, next: BreakerState) {
    inner.state = next;
    inner.state_changed = Instant::now();
    if matches!(next, BreakerState::Closed | BreakerState::Open) {
        inner.failures = 0;
    }
}

/// Lazily-allocated per-tunnel circuit breakers
pub struct TunnelBreakers {
    breakers: RwLock<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
    config: BreakerConfig,
}

impl TunnelBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or create the breaker for a tunnel id (double-checked on miss)
    pub fn get(&self, tunnel_id: &str) -> std::sync::Arc<CircuitBreaker> {
        if let Some(cb) = self
            .breakers
            .read()
            .expect("breaker map lock poisoned")
            .get(tunnel_id)
        {
            return cb.clone();
        }

        let mut map = self.breakers.write().expect("breaker map lock poisoned");
        if let Some(cb) = map.get(tunnel_id) {
            return cb.clone();
        }
        let cb = std::sync::Arc::new(CircuitBreaker::new(self.config));
        map.insert(tunnel_id.to_string(), cb.clone());
        cb
    }

    pub fn remove(&self, tunnel_id: &str) {
        self.breakers
            .write()
            .expect("breaker map lock poisoned")
            .remove(tunnel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(max_failures: u32, recovery_ms: u64) -> BreakerConfig {
        BreakerConfig {
            max_failures,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    #[test]
    fn opens_after_exactly_max_failures() {
        let cb = CircuitBreaker::new(quick_config(3, 60_000));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        // Counter resets on the transition
        assert_eq!(cb.failures(), 0);
        assert!(cb.allow().is_err());
    }

    #[test]
    fn success_resets_failure_count_in_closed() {
        let cb = CircuitBreaker::new(quick_config(3, 60_000));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failures(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_then_recovers_through_half_open() {
        let cb = CircuitBreaker::new(quick_config(2, 50));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        let err = cb.allow().unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_OPEN");

        tokio::time::sleep(Duration::from_millis(75)).await;

        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow().is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let cb = CircuitBreaker::new(quick_config(1, 20));

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.allow().is_err());
    }

    #[tokio::test]
    async fn execute_records_outcomes() {
        let cb = CircuitBreaker::new(quick_config(1, 60_000));

        let err: Result<()> = cb
            .execute(|| async { Err(Error::Connection("refused".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cb.state(), BreakerState::Open);

        // Open circuit short-circuits without running the closure
        let res: Result<()> = cb.execute(|| async { Ok(()) }).await;
        assert_eq!(res.unwrap_err().code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn breaker_map_returns_same_instance_per_id() {
        let map = TunnelBreakers::new(BreakerConfig::default());
        let a = map.get("t-1");
        let b = map.get("t-1");
        assert!(std::sync::Arc::ptr_eq(&a, &b));

        let other = map.get("t-2");
        assert!(!std::sync::Arc::ptr_eq(&a, &other));

        map.remove("t-1");
        let c = map.get("t-1");
        assert!(!std::sync::Arc::ptr_eq(&a, &c));
    }
}
