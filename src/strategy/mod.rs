//! Strategy contract (§4.C): a pure, venue-agnostic `evaluate()` over a
//! read-only context snapshot, plus optional lifecycle hooks. Default no-op
//! bodies mirror the corpus's pattern of optional lifecycle hooks on
//! long-lived task-spawning structs, so implementers override only what
//! they need.

use crate::ringbuffer::RingBuffer;
use crate::types::{MarketKey, OrderbookSnapshot, Platform, Signal, Tick, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Typed replacement for exception-driven `evaluate` failures (§9): a fault
/// inside a strategy's evaluation is a normal return value, not a panic or
/// exception, so the scheduler's error policy can branch on it without
/// catching unwinds.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("evaluation fault: {0}")]
    EvaluationFault(String),
}

pub const DEFAULT_PRICE_HISTORY_CAPACITY: usize = 200;
pub const DEFAULT_TRADE_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub id: String,
    pub name: String,
    pub platforms: Vec<Platform>,
    pub markets: Vec<String>,
    /// Cadence; enforced ≥100ms by the scheduler at registration.
    pub interval_ms: u64,
    pub max_position_size: Option<Decimal>,
    pub max_exposure: Option<Decimal>,
    pub dry_run: bool,
    pub params: Value,
}

/// An open position as visible to a strategy — a read-only projection of
/// the position manager's richer internal record.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub id: String,
    pub platform: Platform,
    pub market_id: String,
    pub outcome: String,
    pub side: crate::types::Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Read-only snapshot built fresh by the scheduler every evaluation. Cloning
/// it (or mutating the clone) never affects the runtime — it carries copies
/// of the rolling windows, not references into them.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub portfolio_value: Decimal,
    pub free_cash: Decimal,
    pub positions: HashMap<MarketKey, PositionView>,
    pub recent_trades: Vec<Trade>,
    pub price_history: HashMap<MarketKey, Vec<Tick>>,
    pub orderbook: Option<OrderbookSnapshot>,
    pub current_tick: Option<Tick>,
    pub timestamp: DateTime<Utc>,
    pub is_backtest: bool,
}

impl StrategyContext {
    pub fn empty(timestamp: DateTime<Utc>, is_backtest: bool) -> Self {
        Self {
            portfolio_value: Decimal::ZERO,
            free_cash: Decimal::ZERO,
            positions: HashMap::new(),
            recent_trades: Vec::new(),
            price_history: HashMap::new(),
            orderbook: None,
            current_tick: None,
            timestamp,
            is_backtest,
        }
    }
}

/// Bounded per-market rolling state the scheduler maintains and snapshots
/// into `StrategyContext::price_history` / `recent_trades` each evaluation.
pub struct RollingWindows {
    pub price_history: HashMap<MarketKey, RingBuffer<Tick>>,
    pub recent_trades: RingBuffer<Trade>,
}

impl RollingWindows {
    pub fn new() -> Self {
        Self {
            price_history: HashMap::new(),
            recent_trades: RingBuffer::new(DEFAULT_TRADE_HISTORY_CAPACITY),
        }
    }

    pub fn record_tick(&mut self, key: MarketKey, tick: Tick) {
        self.price_history
            .entry(key)
            .or_insert_with(|| RingBuffer::new(DEFAULT_PRICE_HISTORY_CAPACITY))
            .push(tick);
    }

    pub fn record_trade(&mut self, trade: Trade) {
        self.recent_trades.push(trade);
    }

    pub fn snapshot_price_history(&self) -> HashMap<MarketKey, Vec<Tick>> {
        self.price_history
            .iter()
            .map(|(k, v)| (k.clone(), v.as_vec()))
            .collect()
    }
}

impl Default for RollingWindows {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure behavioral interface implemented by every strategy, including the
/// market-making engine (§4.G).
#[async_trait]
pub trait Strategy: Send + Sync {
    fn config(&self) -> &StrategyConfig;

    /// Called once at start; may subscribe to feeds for private buffers.
    async fn init(&self, _ctx: &StrategyContext) {}

    /// Called per cadence. Must not mutate `ctx`; returning more than one
    /// signal per `(market, outcome)` is permitted — the router collapses
    /// duplicates. A fault is a typed `Err`, never a panic: the scheduler
    /// channels it into the bot's status rather than catching an unwind.
    async fn evaluate(&self, ctx: &StrategyContext) -> Result<Vec<Signal>, StrategyError>;

    /// Called after a fill attributable to this strategy.
    async fn on_trade(&self, _trade: &Trade) {}

    /// Called on stop; cancels open orders, releases subscriptions. Must be
    /// idempotent.
    async fn cleanup(&self) {}
}
