//! Deterministic backtest engine (§4.H): replays a recorded tick stream
//! through any `Strategy` implementation with a synchronous fill model,
//! mirroring the live router's sizing and slippage treatment closely
//! enough that a strategy's evaluate-path code is identical in both
//! modes. Grounded on the corpus's deterministic tick-replay shape in
//! `vault/unified_15m_strategy.rs` and `vault/engine.rs`'s equity-curve
//! bookkeeping, generalized from one hardcoded strategy to any `Strategy`.

pub mod metrics;
pub mod montecarlo;

pub use metrics::BacktestMetrics;
pub use montecarlo::{MonteCarloConfig, MonteCarloResult};

use crate::strategy::{PositionView, RollingWindows, Strategy, StrategyContext};
use crate::types::{MarketKey, OrderbookSnapshot, Side, SignalType, Tick};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("ticks must be sorted nondecreasing by time")]
    UnsortedTicks,
    #[error("strategy faulted during replay: {0}")]
    StrategyFault(String),
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub platform: String,
    pub market_id: String,
    pub outcome_id: String,
    pub initial_capital: Decimal,
    pub commission_pct: Decimal,
    pub slippage_pct: Decimal,
    /// Throttles `evaluate` against tick time, not wall clock. `0` = every tick.
    pub eval_interval_ms: i64,
    pub price_history_size: usize,
    pub include_orderbook: bool,
    pub risk_free_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            platform: "poly".to_string(),
            market_id: "MKT1".to_string(),
            outcome_id: "YES".to_string(),
            initial_capital: Decimal::new(10_000, 0),
            commission_pct: Decimal::new(1, 3), // 0.1%
            slippage_pct: Decimal::new(5, 4),   // 0.05%
            eval_interval_ms: 0,
            price_history_size: 200,
            include_orderbook: false,
            risk_free_rate: 0.0,
        }
    }
}

const ORDERBOOK_STALENESS: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, Clone)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub return_pct: f64,
    pub commission: Decimal,
    pub slippage: Decimal,
}

#[derive(Debug, Clone, Default)]
struct OpenLot {
    size: Decimal,
    avg_price: Decimal,
}

pub struct BacktestResult {
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: BacktestMetrics,
}

/// Fully synchronous replay driver: `&mut self`, an ordinary `for tick in
/// ticks` loop, no tokio scheduling primitives. `evaluate` is still an
/// `async fn` on the strategy trait, so each call is driven to completion
/// on a dedicated single-threaded runtime rather than awaited inline —
/// from the caller's perspective this is indistinguishable from a
/// blocking call.
pub struct BacktestEngine {
    cfg: BacktestConfig,
    runtime: tokio::runtime::Runtime,
}

impl BacktestEngine {
    pub fn new(cfg: BacktestConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("current-thread runtime build is infallible in practice");
        Self { cfg, runtime }
    }

    pub fn run(
        &mut self,
        strategy: &dyn Strategy,
        ticks: &[Tick],
        orderbooks: &[OrderbookSnapshot],
    ) -> Result<BacktestResult, BacktestError> {
        if !ticks.windows(2).all(|w| w[0].time <= w[1].time) {
            return Err(BacktestError::UnsortedTicks);
        }

        let key = MarketKey::new(self.cfg.platform.clone(), self.cfg.market_id.clone(), self.cfg.outcome_id.clone());
        let mut windows = RollingWindows::new();
        let mut cash = self.cfg.initial_capital;
        let mut lot = OpenLot::default();
        let mut trades = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut last_eval: Option<DateTime<Utc>> = None;
        let mut last_equity_second: Option<i64> = None;

        for tick in ticks {
            windows.record_tick(key.clone(), *tick);

            let position_value = lot.size * tick.price;
            let equity = cash + position_value;

            if tick.time.timestamp() != last_equity_second.unwrap_or(i64::MIN) {
                equity_curve.push(EquityPoint { time: tick.time, equity });
                last_equity_second = Some(tick.time.timestamp());
            }

            let due = match (self.cfg.eval_interval_ms, last_eval) {
                (ms, _) if ms <= 0 => true,
                (ms, Some(last)) => tick.time.signed_duration_since(last).num_milliseconds() >= ms,
                (_, None) => true,
            };
            if !due {
                continue;
            }
            last_eval = Some(tick.time);

            let mut ctx = StrategyContext::empty(tick.time, true);
            ctx.current_tick = Some(*tick);
            ctx.portfolio_value = equity;
            ctx.free_cash = cash;
            ctx.price_history = windows.snapshot_price_history();
            ctx.recent_trades = Vec::new();
            if lot.size > Decimal::ZERO {
                ctx.positions.insert(
                    key.clone(),
                    PositionView {
                        id: key.to_string(),
                        platform: self.cfg.platform.clone(),
                        market_id: self.cfg.market_id.clone(),
                        outcome: self.cfg.outcome_id.clone(),
                        side: Side::Long,
                        size: lot.size,
                        entry_price: lot.avg_price,
                        current_price: tick.price,
                        unrealized_pnl: (tick.price - lot.avg_price) * lot.size,
                    },
                );
            }
            if self.cfg.include_orderbook {
                ctx.orderbook = nearest_orderbook(orderbooks, tick.time);
            }

            let signals = self
                .runtime
                .block_on(strategy.evaluate(&ctx))
                .map_err(|e| BacktestError::StrategyFault(e.to_string()))?;

            for signal in signals {
                match signal.signal_type {
                    SignalType::Buy => {
                        let size = signal.size.unwrap_or(Decimal::ZERO);
                        if size <= Decimal::ZERO {
                            continue;
                        }
                        let fill_price = tick.price * (Decimal::ONE + self.cfg.slippage_pct);
                        let commission = size * fill_price * self.cfg.commission_pct;
                        let cost = size * fill_price + commission;
                        if cash < cost {
                            continue;
                        }
                        cash -= cost;
                        let new_size = lot.size + size;
                        lot.avg_price = if new_size.is_zero() {
                            Decimal::ZERO
                        } else {
                            (lot.avg_price * lot.size + fill_price * size) / new_size
                        };
                        lot.size = new_size;
                        trades.push(TradeRecord {
                            time: tick.time,
                            side: Side::Long,
                            price: fill_price,
                            size,
                            pnl: Decimal::ZERO,
                            return_pct: 0.0,
                            commission,
                            slippage: size * tick.price * self.cfg.slippage_pct,
                        });
                    }
                    SignalType::Sell => {
                        let requested = signal.size.unwrap_or(lot.size);
                        let size = requested.min(lot.size);
                        if size <= Decimal::ZERO {
                            continue;
                        }
                        let fill_price = tick.price * (Decimal::ONE - self.cfg.slippage_pct);
                        let commission = size * fill_price * self.cfg.commission_pct;
                        let proceeds = size * fill_price - commission;
                        let pnl = (fill_price - lot.avg_price) * size - commission;
                        cash += proceeds;
                        lot.size -= size;
                        if lot.size.is_zero() {
                            lot.avg_price = Decimal::ZERO;
                        }
                        let return_pct = if lot.avg_price.is_zero() {
                            0.0
                        } else {
                            ((fill_price - lot.avg_price) / lot.avg_price).to_f64().unwrap_or(0.0) * 100.0
                        };
                        trades.push(TradeRecord {
                            time: tick.time,
                            side: Side::Short,
                            price: fill_price,
                            size,
                            pnl,
                            return_pct,
                            commission,
                            slippage: size * tick.price * self.cfg.slippage_pct,
                        });
                    }
                    SignalType::Hold => {}
                }
            }
        }

        if let Some(last) = ticks.last() {
            let final_equity = cash + lot.size * last.price;
            equity_curve.push(EquityPoint { time: last.time, equity: final_equity });
        }

        let metrics = metrics::compute(self.cfg.initial_capital, &equity_curve, &trades, self.cfg.risk_free_rate);
        info!(trades = trades.len(), final_equity = %metrics.final_equity, "backtest_complete");

        Ok(BacktestResult { trades, equity_curve, metrics })
    }

    pub fn monte_carlo(&self, result: &BacktestResult, cfg: &MonteCarloConfig) -> MonteCarloResult {
        let returns = metrics::daily_returns(&result.equity_curve);
        montecarlo::run(&returns, cfg)
    }
}

fn nearest_orderbook(orderbooks: &[OrderbookSnapshot], at: DateTime<Utc>) -> Option<OrderbookSnapshot> {
    orderbooks
        .iter()
        .filter(|ob| ob.time <= at && at.signed_duration_since(ob.time) <= ORDERBOOK_STALENESS)
        .max_by_key(|ob| ob.time)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{StrategyConfig, StrategyError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    struct BuyAndHold {
        config: StrategyConfig,
        bought: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Strategy for BuyAndHold {
        fn config(&self) -> &StrategyConfig {
            &self.config
        }

        async fn evaluate(&self, ctx: &StrategyContext) -> Result<Vec<crate::types::Signal>, StrategyError> {
            if self.bought.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(vec![]);
            }
            let tick = ctx.current_tick.ok_or_else(|| StrategyError::EvaluationFault("no tick".to_string()))?;
            // Sized to the engine's own fill-cost formula — size * fill_price *
            // (1 + commission_pct) — so the full starting cash is deployed
            // instead of being skipped for insufficient funds. Mirrors the
            // slippage_pct/commission_pct set on the engine below.
            let fill_price = tick.price * (Decimal::ONE + Decimal::new(5, 4));
            let commission_pct = Decimal::new(1, 3);
            let size = ctx.free_cash / (fill_price * (Decimal::ONE + commission_pct));
            Ok(vec![crate::types::Signal {
                signal_type: SignalType::Buy,
                platform: "poly".to_string(),
                market_id: "MKT1".to_string(),
                outcome: "YES".to_string(),
                price: tick.price,
                size: Some(size),
                confidence: 1.0,
                reason: "buy_and_hold".to_string(),
                metadata: None,
            }])
        }
    }

    #[test]
    fn buy_and_hold_baseline() {
        let strategy = BuyAndHold {
            config: StrategyConfig {
                id: "bh".to_string(),
                name: "buy_and_hold".to_string(),
                platforms: vec!["poly".to_string()],
                markets: vec!["MKT1".to_string()],
                interval_ms: 1000,
                max_position_size: None,
                max_exposure: None,
                dry_run: false,
                params: json!({}),
            },
            bought: std::sync::atomic::AtomicBool::new(false),
        };

        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let ticks = vec![
            Tick { time: t0, price: Decimal::new(100, 2), prev_price: None },
            Tick { time: t1, price: Decimal::new(110, 2), prev_price: Some(Decimal::new(100, 2)) },
        ];

        let mut engine = BacktestEngine::new(BacktestConfig {
            initial_capital: Decimal::new(1000, 0),
            commission_pct: Decimal::new(1, 3),
            slippage_pct: Decimal::new(5, 4),
            ..Default::default()
        });
        let result = engine.run(&strategy, &ticks, &[]).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.metrics.max_drawdown_pct, 0.0);
        let equity_f = result.metrics.final_equity.to_f64().unwrap();
        assert!((equity_f - 1098.35).abs() < 0.01, "final equity was {equity_f}");
    }
}
