//! Signal router (§4.E): admission control between strategies and
//! execution. Serializes per `(platform, marketId, outcome)` key so
//! cooldown monotonicity holds without a global lock, grounded on the
//! corpus's per-key risk gating in `risk.rs` generalized to the full
//! admission pipeline the spec enumerates.

use crate::execution::{ExecutionAdapter, ExecutionError, OrderRequest, OrderResult, OrderSide, TimeInForce};
use crate::types::{MarketKey, Signal, SignalType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Limit,
    Market,
    ProtectedMarket,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub dry_run: bool,
    pub min_strength: f64,
    pub default_size_usd: Decimal,
    pub max_size_usd: Decimal,
    pub strength_scaling: bool,
    pub max_daily_loss: Decimal,
    pub max_concurrent_positions: usize,
    pub cooldown_ms: i64,
    pub order_mode: OrderMode,
    pub protected_max_slippage: Decimal,
    pub max_order_notional: Decimal,
    pub max_exposure_per_key: Decimal,
    pub allowed_signal_types: Option<Vec<SignalType>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            min_strength: 0.0,
            default_size_usd: Decimal::new(10, 0),
            max_size_usd: Decimal::new(1000, 0),
            strength_scaling: true,
            max_daily_loss: Decimal::new(1_000_000, 0),
            max_concurrent_positions: 50,
            cooldown_ms: 0,
            order_mode: OrderMode::Market,
            protected_max_slippage: Decimal::new(2, 2),
            max_order_notional: Decimal::new(1_000_000, 0),
            max_exposure_per_key: Decimal::new(1_000_000, 0),
            allowed_signal_types: None,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dry_run: env_bool("ROUTER_DRY_RUN", d.dry_run),
            min_strength: env_f64_range("ROUTER_MIN_STRENGTH", d.min_strength, 0.0, 1.0),
            default_size_usd: env_decimal("ROUTER_DEFAULT_SIZE_USD", d.default_size_usd),
            max_size_usd: env_decimal("ROUTER_MAX_SIZE_USD", d.max_size_usd),
            strength_scaling: env_bool("ROUTER_STRENGTH_SCALING", d.strength_scaling),
            max_daily_loss: env_decimal("ROUTER_MAX_DAILY_LOSS", d.max_daily_loss),
            max_concurrent_positions: std::env::var("ROUTER_MAX_CONCURRENT_POSITIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_concurrent_positions),
            cooldown_ms: std::env::var("ROUTER_COOLDOWN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &i64| *v >= 0)
                .unwrap_or(d.cooldown_ms),
            order_mode: d.order_mode,
            protected_max_slippage: env_decimal("ROUTER_PROTECTED_MAX_SLIPPAGE", d.protected_max_slippage),
            max_order_notional: env_decimal("ROUTER_MAX_ORDER_NOTIONAL", d.max_order_notional),
            max_exposure_per_key: env_decimal("ROUTER_MAX_EXPOSURE_PER_KEY", d.max_exposure_per_key),
            allowed_signal_types: None,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64_range(key: &str, default: f64, lo: f64, hi: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| *v >= lo && *v <= hi)
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str_exact(&v).ok())
        .unwrap_or(default)
}

/// Typed rejection reasons, exhaustively matchable — never a raw `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterRejection {
    TypeNotAllowed,
    BelowMinStrength,
    DailyLossLimit,
    MaxPositions,
    Cooldown,
    MaxOrderNotional,
    MaxExposure,
    DryRun,
    KillSwitch,
}

impl RouterRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            RouterRejection::TypeNotAllowed => "type_not_allowed",
            RouterRejection::BelowMinStrength => "below_min_strength",
            RouterRejection::DailyLossLimit => "daily_loss_limit",
            RouterRejection::MaxPositions => "max_positions",
            RouterRejection::Cooldown => "cooldown",
            RouterRejection::MaxOrderNotional => "max_order_notional",
            RouterRejection::MaxExposure => "max_exposure",
            RouterRejection::DryRun => "dry_run",
            RouterRejection::KillSwitch => "kill_switch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Executed,
    Rejected,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: uuid::Uuid,
    pub signal: Signal,
    pub status: RecordStatus,
    pub order_id: Option<String>,
    pub order_price: Option<Decimal>,
    pub order_size: Option<Decimal>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_executed(&self) -> bool {
        self.status == RecordStatus::Executed
    }
}

struct KeyState {
    last_executed_at: Option<DateTime<Utc>>,
    exposure: Decimal,
    lock: Arc<AsyncMutex<()>>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            last_executed_at: None,
            exposure: Decimal::ZERO,
            lock: Arc::new(AsyncMutex::new(())),
        }
    }
}

struct DailyLoss {
    day: chrono::NaiveDate,
    realized: Decimal,
    stopped: bool,
}

/// Clock abstraction so admission timing (cooldowns, day-boundary resets)
/// can be driven deterministically in tests; production wiring uses
/// `SystemClock`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Policy layer between strategies and execution. Holds the admission
/// pipeline state (cooldowns, exposure, daily-loss accumulator) and emits
/// an `ExecutionRecord` broadcast for every decision.
pub struct SignalRouter {
    cfg: parking_lot::RwLock<RouterConfig>,
    executor: Arc<dyn ExecutionAdapter>,
    key_state: Mutex<HashMap<MarketKey, KeyState>>,
    open_position_count: Arc<dyn Fn() -> usize + Send + Sync>,
    daily_loss: Mutex<DailyLoss>,
    kill_switch: std::sync::atomic::AtomicBool,
    events: broadcast::Sender<ExecutionRecord>,
    records: Mutex<std::collections::VecDeque<ExecutionRecord>>,
    clock: Arc<dyn Clock>,
}

const RECORD_RETENTION: usize = 1000;

impl SignalRouter {
    pub fn new(
        cfg: RouterConfig,
        executor: Arc<dyn ExecutionAdapter>,
        open_position_count: Arc<dyn Fn() -> usize + Send + Sync>,
    ) -> Self {
        Self::new_with_clock(cfg, executor, open_position_count, Arc::new(SystemClock))
    }

    /// Same wiring as `new`, with an injected clock — used by tests that
    /// need to drive cooldown/day-boundary behavior without sleeping
    /// real wall-clock time.
    pub fn new_with_clock(
        cfg: RouterConfig,
        executor: Arc<dyn ExecutionAdapter>,
        open_position_count: Arc<dyn Fn() -> usize + Send + Sync>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        let now = clock.now();
        Self {
            cfg: parking_lot::RwLock::new(cfg),
            executor,
            key_state: Mutex::new(HashMap::new()),
            open_position_count,
            daily_loss: Mutex::new(DailyLoss {
                day: now.date_naive(),
                realized: Decimal::ZERO,
                stopped: false,
            }),
            kill_switch: std::sync::atomic::AtomicBool::new(false),
            events: tx,
            records: Mutex::new(std::collections::VecDeque::with_capacity(RECORD_RETENTION)),
            clock,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionRecord> {
        self.events.subscribe()
    }

    pub fn set_kill_switch(&self, enabled: bool) {
        self.kill_switch.store(enabled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Updates router config; applies atomically, "at most once per call".
    pub fn set_config(&self, cfg: RouterConfig) {
        *self.cfg.write() = cfg;
    }

    pub fn config(&self) -> RouterConfig {
        self.cfg.read().clone()
    }

    /// Feeds realized PnL from an execution fill into the daily-loss
    /// accumulator. Resets at the UTC day boundary.
    pub fn record_realized_pnl(&self, pnl: Decimal, at: DateTime<Utc>) {
        let cfg = self.cfg.read();
        let mut dl = self.daily_loss.lock();
        let today = at.date_naive();
        if today != dl.day {
            dl.day = today;
            dl.realized = Decimal::ZERO;
            dl.stopped = false;
        }
        dl.realized += pnl;
        if dl.realized <= -cfg.max_daily_loss {
            dl.stopped = true;
        }
    }

    fn is_daily_stopped(&self) -> bool {
        self.daily_loss.lock().stopped
    }

    fn key_lock(&self, key: &MarketKey) -> Arc<AsyncMutex<()>> {
        self.key_state
            .lock()
            .entry(key.clone())
            .or_insert_with(KeyState::default)
            .lock
            .clone()
    }

    /// Runs the full admission pipeline for one signal and, if admitted,
    /// dispatches to execution. Distinct keys proceed in parallel; same-key
    /// admissions serialize FIFO via the per-key lock.
    pub async fn admit(&self, signal: Signal, strategy_id: String) -> ExecutionRecord {
        let _ = &strategy_id;
        let key = signal.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        self.admit_locked(signal, &key).await
    }

    async fn admit_locked(&self, signal: Signal, key: &MarketKey) -> ExecutionRecord {
        let now = self.clock.now();
        let reject = |reason: RouterRejection, status: RecordStatus| ExecutionRecord {
            id: uuid::Uuid::new_v4(),
            signal: signal.clone(),
            status,
            order_id: None,
            order_price: None,
            order_size: None,
            reason: Some(reason.as_str().to_string()),
            timestamp: now,
        };

        if self.kill_switch.load(std::sync::atomic::Ordering::SeqCst) {
            return self.finalize(reject(RouterRejection::KillSwitch, RecordStatus::Rejected));
        }

        let cfg = self.cfg.read().clone();

        if let Some(allowed) = &cfg.allowed_signal_types {
            if !allowed.contains(&signal.signal_type) {
                return self.finalize(reject(RouterRejection::TypeNotAllowed, RecordStatus::Rejected));
            }
        }

        if signal.confidence < cfg.min_strength {
            return self.finalize(reject(RouterRejection::BelowMinStrength, RecordStatus::Rejected));
        }

        if signal.signal_type == SignalType::Buy && self.is_daily_stopped() {
            return self.finalize(reject(RouterRejection::DailyLossLimit, RecordStatus::Rejected));
        }

        if signal.signal_type == SignalType::Buy
            && (self.open_position_count)() >= cfg.max_concurrent_positions
        {
            return self.finalize(reject(RouterRejection::MaxPositions, RecordStatus::Rejected));
        }

        {
            let mut states = self.key_state.lock();
            let state = states.entry(key.clone()).or_insert_with(KeyState::default);
            if let Some(last) = state.last_executed_at {
                let elapsed = now.signed_duration_since(last).num_milliseconds();
                if elapsed < cfg.cooldown_ms {
                    return self.finalize(reject(RouterRejection::Cooldown, RecordStatus::Skipped));
                }
            }
        }

        let notional = cfg.default_size_usd;
        let size_usd = if cfg.strength_scaling {
            (notional * Decimal::from_f64(signal.confidence).unwrap_or(Decimal::ONE))
                .clamp(Decimal::ONE, cfg.max_size_usd)
        } else {
            notional.min(cfg.max_size_usd)
        };

        if size_usd > cfg.max_order_notional {
            return self.finalize(reject(RouterRejection::MaxOrderNotional, RecordStatus::Rejected));
        }

        {
            let states = self.key_state.lock();
            if let Some(state) = states.get(key) {
                if state.exposure + size_usd > cfg.max_exposure_per_key {
                    return self.finalize(reject(RouterRejection::MaxExposure, RecordStatus::Rejected));
                }
            }
        }

        let size = if signal.price.is_zero() {
            Decimal::ZERO
        } else {
            size_usd / signal.price
        };

        if cfg.dry_run {
            let record = ExecutionRecord {
                id: uuid::Uuid::new_v4(),
                signal: signal.clone(),
                status: RecordStatus::Skipped,
                order_id: None,
                order_price: Some(signal.price),
                order_size: Some(size),
                reason: Some(RouterRejection::DryRun.as_str().to_string()),
                timestamp: now,
            };
            return self.finalize(record);
        }

        let req = OrderRequest {
            platform: signal.platform.clone(),
            market_id: signal.market_id.clone(),
            token_id: signal.outcome.clone(),
            side: if signal.signal_type == SignalType::Buy { OrderSide::Buy } else { OrderSide::Sell },
            price: signal.price,
            size,
            time_in_force: TimeInForce::Gtc,
            idempotency_key: format!("{key}:{}", now.timestamp_millis()),
        };

        let result = self.dispatch(req, cfg.order_mode, cfg.protected_max_slippage).await;

        let record = match result {
            Ok(r) if r.success => {
                let mut states = self.key_state.lock();
                let state = states.entry(key.clone()).or_insert_with(KeyState::default);
                state.last_executed_at = Some(now);
                state.exposure += size_usd;
                ExecutionRecord {
                    id: uuid::Uuid::new_v4(),
                    signal: signal.clone(),
                    status: RecordStatus::Executed,
                    order_id: r.order_id,
                    order_price: Some(r.avg_fill_price),
                    order_size: Some(r.filled_size),
                    reason: None,
                    timestamp: now,
                }
            }
            Ok(r) => ExecutionRecord {
                id: uuid::Uuid::new_v4(),
                signal: signal.clone(),
                status: RecordStatus::Failed,
                order_id: None,
                order_price: None,
                order_size: None,
                reason: r.error,
                timestamp: now,
            },
            Err(e) => ExecutionRecord {
                id: uuid::Uuid::new_v4(),
                signal: signal.clone(),
                status: RecordStatus::Failed,
                order_id: None,
                order_price: None,
                order_size: None,
                reason: Some(e.to_string()),
                timestamp: now,
            },
        };
        self.finalize(record)
    }

    async fn dispatch(
        &self,
        req: OrderRequest,
        mode: OrderMode,
        max_slippage: Decimal,
    ) -> Result<OrderResult, ExecutionError> {
        match (mode, req.side) {
            (OrderMode::Limit, OrderSide::Buy) => self.executor.buy_limit(req).await,
            (OrderMode::Limit, OrderSide::Sell) => self.executor.sell_limit(req).await,
            (OrderMode::Market, OrderSide::Buy) => self.executor.buy_limit(req).await,
            (OrderMode::Market, OrderSide::Sell) => self.executor.sell_limit(req).await,
            (OrderMode::ProtectedMarket, OrderSide::Buy) => self.executor.protected_buy(req, max_slippage).await,
            (OrderMode::ProtectedMarket, OrderSide::Sell) => self.executor.protected_sell(req, max_slippage).await,
        }
    }

    fn finalize(&self, record: ExecutionRecord) -> ExecutionRecord {
        info!(
            status = ?record.status,
            reason = ?record.reason,
            market = %record.signal.key(),
            "router admission decision"
        );
        let mut records = self.records.lock();
        if records.len() == RECORD_RETENTION {
            records.pop_front();
        }
        records.push_back(record.clone());
        let _ = self.events.send(record.clone());
        record
    }

    pub fn recent_records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExecutionAdapter;

    fn signal(confidence: f64) -> Signal {
        Signal {
            signal_type: SignalType::Buy,
            platform: "poly".to_string(),
            market_id: "MKT1".to_string(),
            outcome: "YES".to_string(),
            price: Decimal::new(50, 2),
            size: None,
            confidence,
            reason: "test".to_string(),
            metadata: None,
        }
    }

    fn router() -> SignalRouter {
        let exec = Arc::new(PaperExecutionAdapter::new(Default::default()));
        SignalRouter::new(
            RouterConfig {
                cooldown_ms: 0,
                ..Default::default()
            },
            exec,
            Arc::new(|| 0),
        )
    }

    #[tokio::test]
    async fn rejects_below_min_strength() {
        let r = SignalRouter::new(
            RouterConfig {
                min_strength: 0.5,
                ..Default::default()
            },
            Arc::new(PaperExecutionAdapter::new(Default::default())),
            Arc::new(|| 0),
        );
        let rec = r.admit(signal(0.1), "s1".to_string()).await;
        assert_eq!(rec.status, RecordStatus::Rejected);
        assert_eq!(rec.reason.as_deref(), Some("below_min_strength"));
    }

    #[tokio::test]
    async fn cooldown_rejects_second_admission_within_window() {
        let r = SignalRouter::new(
            RouterConfig {
                cooldown_ms: 5000,
                ..Default::default()
            },
            Arc::new(PaperExecutionAdapter::new(crate::execution::PaperExecutionConfig {
                reject_prob: 0.0,
                partial_fill_prob: 0.0,
                ..Default::default()
            })),
            Arc::new(|| 0),
        );
        let first = r.admit(signal(0.9), "s1".to_string()).await;
        assert_eq!(first.status, RecordStatus::Executed);
        let second = r.admit(signal(0.9), "s1".to_string()).await;
        assert_eq!(second.status, RecordStatus::Skipped);
        assert_eq!(second.reason.as_deref(), Some("cooldown"));
    }

    #[tokio::test]
    async fn daily_stop_blocks_buys_but_not_info() {
        let r = router();
        r.record_realized_pnl(Decimal::new(-110, 0), Utc::now());
        let rec = r.admit(signal(0.9), "s1".to_string()).await;
        assert_eq!(rec.status, RecordStatus::Rejected);
        assert_eq!(rec.reason.as_deref(), Some("daily_loss_limit"));
    }
}
