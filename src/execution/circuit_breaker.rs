//! Per-venue circuit breaker. Grounded on the corpus's `DataSourceKillSwitch`
//! (consecutive-failure counting plus a rolling p95 latency window), adapted
//! from "kill this data source" to "stop submitting orders to this venue".

use super::{ExecutionAdapter, ExecutionError, OpenOrder, OrderRequest, OrderResult, SlippageEstimate, Fill};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const LATENCY_WINDOW: usize = 64;
const MIN_LATENCY_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping to `Open`.
    pub failure_threshold: u32,
    /// p95 latency (ms) above which a call counts as a latency violation.
    pub latency_threshold_ms: f64,
    /// Cooldown before `Open` relaxes to `HalfOpen`.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            latency_threshold_ms: 2000.0,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let failure_threshold = std::env::var("CB_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(default.failure_threshold);
        let latency_threshold_ms = std::env::var("CB_LATENCY_THRESHOLD_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &f64| *v > 0.0)
            .unwrap_or(default.latency_threshold_ms);
        let cooldown_secs = std::env::var("CB_COOLDOWN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u64| *v > 0)
            .unwrap_or(default.cooldown.as_secs());
        Self {
            failure_threshold,
            latency_threshold_ms,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    latencies_ms: VecDeque<f64>,
    half_open_probe_in_flight: bool,
}

/// Thread-safe breaker for a single venue. Wrapped per-platform by
/// `CircuitBreakingExecutor` when multiple venues share one process.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
                half_open_probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.cfg.cooldown {
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Called before a submission. Returns `Err` if the breaker is open (or
    /// half-open with a probe already in flight).
    pub fn admit(&self) -> Result<(), ExecutionError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                let mut inner = self.inner.lock();
                if inner.half_open_probe_in_flight {
                    Err(ExecutionError::CircuitOpen("probe in flight".to_string()))
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => Err(ExecutionError::CircuitOpen("open".to_string())),
        }
    }

    pub fn record_success(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.half_open_probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closing after successful probe");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
        push_latency(&mut inner.latencies_ms, latency_ms);
    }

    pub fn record_failure(&self, latency_ms: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.half_open_probe_in_flight = false;
        inner.consecutive_failures += 1;
        if let Some(l) = latency_ms {
            push_latency(&mut inner.latencies_ms, l);
        }
        let p95_violation = p95(&inner.latencies_ms).map(|p| p > self.cfg.latency_threshold_ms).unwrap_or(false);
        if inner.consecutive_failures >= self.cfg.failure_threshold || p95_violation {
            if inner.state != CircuitState::Open {
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "circuit breaker tripped"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn p95_latency(&self) -> Option<f64> {
        p95(&self.inner.lock().latencies_ms)
    }
}

fn push_latency(buf: &mut VecDeque<f64>, v: f64) {
    if buf.len() == LATENCY_WINDOW {
        buf.pop_front();
    }
    buf.push_back(v);
}

fn p95(buf: &VecDeque<f64>) -> Option<f64> {
    if buf.len() < MIN_LATENCY_SAMPLES {
        return None;
    }
    let mut sorted: Vec<f64> = buf.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
    sorted.get(idx.min(sorted.len() - 1)).copied()
}

/// Wraps any `ExecutionAdapter` with circuit-breaker accounting on every
/// order-submitting call. Query calls (`get_order`, `get_open_orders`,
/// `estimate_slippage`, `get_tracked_fills`) pass through untouched.
pub struct CircuitBreakingExecutor<A: ExecutionAdapter> {
    inner: A,
    breaker: Arc<CircuitBreaker>,
}

impl<A: ExecutionAdapter> CircuitBreakingExecutor<A> {
    pub fn new(inner: A, cfg: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(cfg)),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    async fn guarded<F, Fut>(&self, call: F) -> Result<OrderResult, ExecutionError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<OrderResult, ExecutionError>>,
    {
        self.breaker.admit()?;
        let start = Instant::now();
        let result = call().await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(r) if r.success => self.breaker.record_success(latency_ms),
            Ok(_) => self.breaker.record_success(latency_ms),
            Err(e) if e.class().counts_toward_circuit_breaker() => {
                self.breaker.record_failure(Some(latency_ms))
            }
            Err(_) => self.breaker.record_failure(None),
        }
        result
    }
}

#[async_trait]
impl<A: ExecutionAdapter> ExecutionAdapter for CircuitBreakingExecutor<A> {
    async fn buy_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.buy_limit(req)).await
    }

    async fn sell_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.sell_limit(req)).await
    }

    async fn maker_buy(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.maker_buy(req)).await
    }

    async fn maker_sell(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.maker_sell(req)).await
    }

    async fn protected_buy(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.protected_buy(req, max_slippage)).await
    }

    async fn protected_sell(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError> {
        self.guarded(|| self.inner.protected_sell(req, max_slippage)).await
    }

    async fn cancel_order(&self, platform: &str, order_id: &str) -> Result<bool, ExecutionError> {
        self.inner.cancel_order(platform, order_id).await
    }

    async fn cancel_all_orders(&self, platform: &str) -> Result<usize, ExecutionError> {
        self.inner.cancel_all_orders(platform).await
    }

    async fn get_order(&self, platform: &str, order_id: &str) -> Result<Option<OpenOrder>, ExecutionError> {
        self.inner.get_order(platform, order_id).await
    }

    async fn get_open_orders(&self, platform: &str) -> Result<Vec<OpenOrder>, ExecutionError> {
        self.inner.get_open_orders(platform).await
    }

    async fn estimate_slippage(&self, req: &OrderRequest) -> Result<SlippageEstimate, ExecutionError> {
        self.inner.estimate_slippage(req).await
    }

    fn get_tracked_fills(&self) -> Vec<Fill> {
        self.inner.get_tracked_fills()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(None);
        cb.record_failure(None);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(None);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        cb.record_failure(None);
        cb.record_success(10.0);
        cb.record_failure(None);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_allows_single_probe() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(1),
            ..Default::default()
        });
        cb.record_failure(None);
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.admit().is_ok());
        assert!(cb.admit().is_err());
    }
}
