//! Execution service contract (§4.B): idempotent order submission,
//! cancellation, fill tracking, slippage-protected market orders, and a
//! per-venue circuit breaker. Grounded in the corpus's `ExecutionAdapter`
//! trait and paper-trading simulator; the live venue adapters themselves
//! (Polymarket CLOB, Binance, etc.) are out of scope and are expected to
//! implement this same trait.

mod circuit_breaker;
mod paper;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakingExecutor, CircuitState};
pub use paper::{PaperExecutionAdapter, PaperExecutionConfig};

use crate::error::FailureClass;
use crate::types::Platform;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Gtc,
    Fok,
    Gtd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
    Partial,
    Open,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub platform: Platform,
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub time_in_force: TimeInForce,
    /// Caller-supplied idempotency key. The adapter derives a deterministic
    /// client order id from `(platform, idempotency_key)` so a retried
    /// submission after a transient failure never double-submits.
    pub idempotency_key: String,
}

impl OrderRequest {
    pub fn client_order_id(&self) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("tradeloop:order:{}:{}", self.platform, self.idempotency_key).as_bytes(),
        )
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            status: OrderStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub platform: Platform,
    pub market_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub remaining_size: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageEstimate {
    pub expected_price: Decimal,
    pub slippage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub platform: Platform,
    pub market_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("would cross spread")]
    WouldCross,
    #[error("expected slippage exceeded bound")]
    SlippageExceeded,
    #[error("circuit open for platform {0}")]
    CircuitOpen(Platform),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("timeout")]
    Timeout,
}

impl ExecutionError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExecutionError::WouldCross | ExecutionError::SlippageExceeded => FailureClass::Validation,
            ExecutionError::CircuitOpen(_) => FailureClass::Policy,
            ExecutionError::Transient(_) => FailureClass::Transient,
            ExecutionError::Permanent(_) => FailureClass::Permanent,
            ExecutionError::Timeout => FailureClass::Timeout,
        }
    }
}

/// Uniform venue operation surface. One adapter per platform; the router
/// and position manager hold `Arc<dyn ExecutionAdapter>` and never branch
/// on which venue they're talking to.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn buy_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError>;
    async fn sell_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError>;

    /// Post-only; must fail `WouldCross` rather than take liquidity.
    async fn maker_buy(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError>;
    async fn maker_sell(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError>;

    async fn protected_buy(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError>;
    async fn protected_sell(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError>;

    async fn cancel_order(&self, platform: &str, order_id: &str) -> Result<bool, ExecutionError>;
    async fn cancel_all_orders(&self, platform: &str) -> Result<usize, ExecutionError>;

    async fn get_order(&self, platform: &str, order_id: &str) -> Result<Option<OpenOrder>, ExecutionError>;
    async fn get_open_orders(&self, platform: &str) -> Result<Vec<OpenOrder>, ExecutionError>;

    async fn estimate_slippage(&self, req: &OrderRequest) -> Result<SlippageEstimate, ExecutionError>;

    fn get_tracked_fills(&self) -> Vec<Fill>;
}
