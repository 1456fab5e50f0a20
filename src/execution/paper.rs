//! Paper-trading execution adapter: simulates latency, slippage scaling
//! with order notional, partial fills, and random rejection. Grounded
//! directly on the corpus's `PaperExecutionAdapter` — kept as the one
//! concrete `ExecutionAdapter` this crate ships, since both live dry-run
//! mode and the backtest engine need a reference fill model.

use super::{
    ExecutionAdapter, ExecutionError, Fill, OpenOrder, OrderRequest, OrderResult, OrderSide,
    OrderStatus, SlippageEstimate, TimeInForce,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PaperExecutionConfig {
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Additional slippage (bps) per $1000 of notional.
    pub slippage_bps_per_1k: f64,
    pub base_slippage_bps: f64,
    pub fee_rate: Decimal,
    pub partial_fill_prob: f64,
    pub min_fill_ratio: f64,
    pub reject_prob: f64,
}

impl Default for PaperExecutionConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 50,
            latency_jitter_ms: 30,
            slippage_bps_per_1k: 2.0,
            base_slippage_bps: 1.0,
            fee_rate: Decimal::new(1, 3), // 0.001
            partial_fill_prob: 0.05,
            min_fill_ratio: 0.5,
            reject_prob: 0.01,
        }
    }
}

impl PaperExecutionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_latency_ms: env_u64("PAPER_BASE_LATENCY_MS", d.base_latency_ms),
            latency_jitter_ms: env_u64("PAPER_LATENCY_JITTER_MS", d.latency_jitter_ms),
            slippage_bps_per_1k: env_f64("PAPER_SLIPPAGE_BPS_PER_1K", d.slippage_bps_per_1k),
            base_slippage_bps: env_f64("PAPER_BASE_SLIPPAGE_BPS", d.base_slippage_bps),
            fee_rate: d.fee_rate,
            partial_fill_prob: env_f64("PAPER_PARTIAL_FILL_PROB", d.partial_fill_prob),
            min_fill_ratio: env_f64("PAPER_MIN_FILL_RATIO", d.min_fill_ratio),
            reject_prob: env_f64("PAPER_REJECT_PROB", d.reject_prob),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| (0.0..=1.0).contains(v) || *v >= 0.0)
        .unwrap_or(default)
}

pub struct PaperExecutionAdapter {
    cfg: PaperExecutionConfig,
    fills: Mutex<Vec<Fill>>,
    open_orders: Mutex<HashMap<String, OpenOrder>>,
    /// Last traded price per `platform:market_id:token_id`, the adapter's
    /// only notion of "current market" in the absence of a live book — used
    /// to decide whether a post-only order would cross.
    last_price: Mutex<HashMap<String, Decimal>>,
}

impl PaperExecutionAdapter {
    pub fn new(cfg: PaperExecutionConfig) -> Self {
        Self {
            cfg,
            fills: Mutex::new(Vec::new()),
            open_orders: Mutex::new(HashMap::new()),
            last_price: Mutex::new(HashMap::new()),
        }
    }

    fn market_key(req: &OrderRequest) -> String {
        format!("{}:{}:{}", req.platform, req.market_id, req.token_id)
    }

    /// A post-only order crosses if it would immediately take liquidity: a
    /// buy at or above the last traded price lifts the offer, a sell at or
    /// below it hits the bid. With no prior trade there is nothing to cross.
    fn would_cross(&self, req: &OrderRequest) -> bool {
        let Some(&reference) = self.last_price.lock().get(&Self::market_key(req)) else {
            return false;
        };
        match req.side {
            OrderSide::Buy => req.price >= reference,
            OrderSide::Sell => req.price <= reference,
        }
    }

    fn slippage_bps(&self, notional: Decimal) -> f64 {
        let notional_f = notional.to_f64().unwrap_or(0.0);
        self.cfg.base_slippage_bps + (notional_f / 1000.0) * self.cfg.slippage_bps_per_1k
    }

    async fn simulate_latency(&self) {
        let jitter = if self.cfg.latency_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.cfg.latency_jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(std::time::Duration::from_millis(self.cfg.base_latency_ms + jitter)).await;
    }

    async fn fill(&self, req: OrderRequest, allow_cross: bool) -> Result<OrderResult, ExecutionError> {
        self.simulate_latency().await;

        if rand::thread_rng().gen_bool(self.cfg.reject_prob.clamp(0.0, 1.0)) {
            return Ok(OrderResult::failed("rejected"));
        }

        if !allow_cross && self.would_cross(&req) {
            return Err(ExecutionError::WouldCross);
        }

        let slip_bps = self.slippage_bps(req.notional());
        let slip_frac = Decimal::from_f64(slip_bps / 10_000.0).unwrap_or(Decimal::ZERO);
        let adverse = match req.side {
            OrderSide::Buy => Decimal::ONE + slip_frac,
            OrderSide::Sell => Decimal::ONE - slip_frac,
        };
        let fill_price = (req.price * adverse).max(Decimal::ZERO);

        let mut filled_size = req.size;
        let mut status = OrderStatus::Filled;
        if rand::thread_rng().gen_bool(self.cfg.partial_fill_prob.clamp(0.0, 1.0)) {
            let ratio = self.cfg.min_fill_ratio
                + rand::thread_rng().gen::<f64>() * (1.0 - self.cfg.min_fill_ratio);
            let ratio_dec = Decimal::from_f64(ratio).unwrap_or(Decimal::ONE);
            filled_size = req.size * ratio_dec;
            status = OrderStatus::Partial;
            if req.time_in_force == TimeInForce::Fok {
                return Ok(OrderResult::failed("partial_fill_on_fok"));
            }
        }

        let order_id = req.client_order_id().to_string();
        let fee = filled_size * fill_price * self.cfg.fee_rate;

        self.last_price.lock().insert(Self::market_key(&req), fill_price);

        self.fills.lock().push(Fill {
            order_id: order_id.clone(),
            platform: req.platform.clone(),
            market_id: req.market_id.clone(),
            side: req.side,
            price: fill_price,
            size: filled_size,
            fee,
            filled_at: Utc::now(),
        });

        if status == OrderStatus::Partial {
            self.open_orders.lock().insert(
                order_id.clone(),
                OpenOrder {
                    order_id: order_id.clone(),
                    platform: req.platform.clone(),
                    market_id: req.market_id.clone(),
                    side: req.side,
                    price: req.price,
                    remaining_size: req.size - filled_size,
                    created_at: Utc::now(),
                },
            );
        }

        Ok(OrderResult {
            success: true,
            order_id: Some(order_id),
            filled_size,
            avg_fill_price: fill_price,
            status,
            error: None,
        })
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn buy_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.fill(req, true).await
    }

    async fn sell_limit(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.fill(req, true).await
    }

    async fn maker_buy(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.fill(req, false).await
    }

    async fn maker_sell(&self, req: OrderRequest) -> Result<OrderResult, ExecutionError> {
        self.fill(req, false).await
    }

    async fn protected_buy(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError> {
        let est = self.estimate_slippage(&req).await?;
        if est.slippage > max_slippage {
            return Err(ExecutionError::SlippageExceeded);
        }
        self.fill(req, true).await
    }

    async fn protected_sell(&self, req: OrderRequest, max_slippage: Decimal) -> Result<OrderResult, ExecutionError> {
        let est = self.estimate_slippage(&req).await?;
        if est.slippage > max_slippage {
            return Err(ExecutionError::SlippageExceeded);
        }
        self.fill(req, true).await
    }

    async fn cancel_order(&self, _platform: &str, order_id: &str) -> Result<bool, ExecutionError> {
        Ok(self.open_orders.lock().remove(order_id).is_some())
    }

    async fn cancel_all_orders(&self, platform: &str) -> Result<usize, ExecutionError> {
        let mut orders = self.open_orders.lock();
        let before = orders.len();
        orders.retain(|_, o| o.platform != platform);
        Ok(before - orders.len())
    }

    async fn get_order(&self, _platform: &str, order_id: &str) -> Result<Option<OpenOrder>, ExecutionError> {
        Ok(self.open_orders.lock().get(order_id).cloned())
    }

    async fn get_open_orders(&self, platform: &str) -> Result<Vec<OpenOrder>, ExecutionError> {
        Ok(self
            .open_orders
            .lock()
            .values()
            .filter(|o| o.platform == platform)
            .cloned()
            .collect())
    }

    async fn estimate_slippage(&self, req: &OrderRequest) -> Result<SlippageEstimate, ExecutionError> {
        let slip_bps = self.slippage_bps(req.notional());
        let slip_frac = Decimal::from_f64(slip_bps / 10_000.0).unwrap_or(Decimal::ZERO);
        let expected_price = match req.side {
            OrderSide::Buy => req.price * (Decimal::ONE + slip_frac),
            OrderSide::Sell => req.price * (Decimal::ONE - slip_frac),
        };
        Ok(SlippageEstimate {
            expected_price,
            slippage: slip_frac,
        })
    }

    fn get_tracked_fills(&self) -> Vec<Fill> {
        self.fills.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(side: OrderSide, price: &str, size: &str) -> OrderRequest {
        OrderRequest {
            platform: "poly".to_string(),
            market_id: "MKT1".to_string(),
            token_id: "YES".to_string(),
            side,
            price: Decimal::from_str_exact(price).unwrap(),
            size: Decimal::from_str_exact(size).unwrap(),
            time_in_force: TimeInForce::Gtc,
            idempotency_key: "k1".to_string(),
        }
    }

    #[tokio::test]
    async fn fills_at_adverse_slippage() {
        let adapter = PaperExecutionAdapter::new(PaperExecutionConfig {
            reject_prob: 0.0,
            partial_fill_prob: 0.0,
            ..Default::default()
        });
        let result = adapter.buy_limit(req(OrderSide::Buy, "0.50", "10")).await.unwrap();
        assert!(result.success);
        assert!(result.avg_fill_price >= Decimal::from_str_exact("0.50").unwrap());
    }

    #[tokio::test]
    async fn protected_buy_aborts_on_excess_slippage() {
        let adapter = PaperExecutionAdapter::new(PaperExecutionConfig {
            base_slippage_bps: 10_000.0, // force huge slippage
            reject_prob: 0.0,
            partial_fill_prob: 0.0,
            ..Default::default()
        });
        let result = adapter
            .protected_buy(req(OrderSide::Buy, "0.50", "10"), Decimal::new(2, 2))
            .await;
        assert!(matches!(result, Err(ExecutionError::SlippageExceeded)));
    }

    #[tokio::test]
    async fn maker_order_crossing_the_last_trade_is_rejected() {
        let adapter = PaperExecutionAdapter::new(PaperExecutionConfig {
            reject_prob: 0.0,
            partial_fill_prob: 0.0,
            base_latency_ms: 0,
            latency_jitter_ms: 0,
            ..Default::default()
        });
        adapter.buy_limit(req(OrderSide::Buy, "0.50", "10")).await.unwrap();

        let crossing = adapter.maker_buy(req(OrderSide::Buy, "0.51", "10")).await;
        assert!(matches!(crossing, Err(ExecutionError::WouldCross)));

        let posting = adapter.maker_buy(req(OrderSide::Buy, "0.40", "10")).await.unwrap();
        assert!(posting.success);
    }
}
