//! Market-making engine (§4.G): a specialized `Strategy` that quotes both
//! sides of the book around a smoothed fair value, skewed by inventory,
//! with a requote-discipline timer and an inventory/loss halt. Grounded
//! on the corpus's `unified_15m_strategy.rs` evaluate-loop shape, with the
//! fair-value/skew/ladder math generalized from the `inventory_mm` quoter
//! seen in the reference pack.

use crate::strategy::{Strategy, StrategyConfig, StrategyContext, StrategyError};
use crate::types::{OrderbookSnapshot, Platform, Signal, SignalType, Trade};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FairValueMethod {
    Midpoint,
    Microprice,
    VolumeWeighted,
}

#[derive(Debug, Clone)]
pub struct MarketMakingConfig {
    pub fair_value_method: FairValueMethod,
    pub ema_alpha: f64,
    pub base_half_spread: Decimal,
    pub skew_coefficient: Decimal,
    pub level_count: u32,
    pub level_step: Decimal,
    pub level_size: Decimal,
    pub max_inventory: Decimal,
    pub requote_threshold_cents: Decimal,
    pub requote_interval_ms: i64,
    pub max_position_value_usd: Decimal,
    pub max_loss_usd: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub volume_weighted_levels: usize,
}

impl Default for MarketMakingConfig {
    fn default() -> Self {
        Self {
            fair_value_method: FairValueMethod::Microprice,
            ema_alpha: 0.2,
            base_half_spread: Decimal::new(1, 2), // 0.01
            skew_coefficient: Decimal::new(2, 2),  // 0.02
            level_count: 3,
            level_step: Decimal::new(5, 3), // 0.005
            level_size: Decimal::new(50, 0),
            max_inventory: Decimal::new(500, 0),
            requote_threshold_cents: Decimal::new(2, 1), // 0.2 cents
            requote_interval_ms: 2_000,
            max_position_value_usd: Decimal::new(5_000, 0),
            max_loss_usd: Decimal::new(500, 0),
            min_price: Decimal::new(1, 2),
            max_price: Decimal::new(99, 2),
            volume_weighted_levels: 5,
        }
    }
}

impl MarketMakingConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fair_value_method: d.fair_value_method,
            ema_alpha: env_f64("MM_EMA_ALPHA", d.ema_alpha).clamp(0.0, 1.0),
            base_half_spread: env_decimal("MM_BASE_HALF_SPREAD", d.base_half_spread),
            skew_coefficient: env_decimal("MM_SKEW_COEFFICIENT", d.skew_coefficient),
            level_count: env_u32("MM_LEVEL_COUNT", d.level_count),
            level_step: env_decimal("MM_LEVEL_STEP", d.level_step),
            level_size: env_decimal("MM_LEVEL_SIZE", d.level_size),
            max_inventory: env_decimal("MM_MAX_INVENTORY", d.max_inventory),
            requote_threshold_cents: env_decimal("MM_REQUOTE_THRESHOLD_CENTS", d.requote_threshold_cents),
            requote_interval_ms: std::env::var("MM_REQUOTE_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &i64| *v >= 0)
                .unwrap_or(d.requote_interval_ms),
            max_position_value_usd: env_decimal("MM_MAX_POSITION_VALUE_USD", d.max_position_value_usd),
            max_loss_usd: env_decimal("MM_MAX_LOSS_USD", d.max_loss_usd),
            min_price: d.min_price,
            max_price: d.max_price,
            volume_weighted_levels: d.volume_weighted_levels,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str_exact(&v).ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct QuoteLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Owned exclusively by the engine instance; never reachable from the
/// scheduler, so there's no path for an external writer to race a quote
/// refresh against a fill.
#[derive(Debug, Clone)]
pub struct MarketMakingState {
    pub fair_value: Decimal,
    pub ema_fair_value: Decimal,
    pub inventory: Decimal,
    pub realized_pnl: Decimal,
    pub fill_count: u64,
    pub active_bids: Vec<QuoteLevel>,
    pub active_asks: Vec<QuoteLevel>,
    pub price_history: VecDeque<Decimal>,
    pub last_requote_at: Option<DateTime<Utc>>,
    pub is_quoting: bool,
    pub halt_reason: Option<String>,
}

impl MarketMakingState {
    fn new() -> Self {
        Self {
            fair_value: Decimal::ZERO,
            ema_fair_value: Decimal::ZERO,
            inventory: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fill_count: 0,
            active_bids: Vec::new(),
            active_asks: Vec::new(),
            price_history: VecDeque::with_capacity(200),
            last_requote_at: None,
            is_quoting: false,
            halt_reason: None,
        }
    }
}

pub struct MarketMakingEngine {
    config: StrategyConfig,
    mm_config: MarketMakingConfig,
    platform: Platform,
    market_id: String,
    outcome: String,
    state: Mutex<MarketMakingState>,
}

impl MarketMakingEngine {
    pub fn new(config: StrategyConfig, mm_config: MarketMakingConfig, platform: Platform, market_id: String, outcome: String) -> Self {
        Self {
            config,
            mm_config,
            platform,
            market_id,
            outcome,
            state: Mutex::new(MarketMakingState::new()),
        }
    }

    pub fn snapshot_state(&self) -> MarketMakingState {
        self.state.lock().clone()
    }

    /// Explicitly resumes quoting after a halt. Does not touch inventory or
    /// realized PnL, so if the condition that tripped the halt still holds
    /// the very next `evaluate` re-halts immediately.
    pub fn resume(&self) {
        self.state.lock().halt_reason = None;
    }

    fn raw_fair_value(&self, book: &OrderbookSnapshot) -> Option<Decimal> {
        match self.mm_config.fair_value_method {
            FairValueMethod::Midpoint => {
                let bid = book.best_bid()?;
                let ask = book.best_ask()?;
                Some((bid.price + ask.price) / Decimal::TWO)
            }
            FairValueMethod::Microprice => book.microprice(),
            FairValueMethod::VolumeWeighted => {
                let k = self.mm_config.volume_weighted_levels;
                let (bid_sum, bid_notional) = weighted(&book.bids, k);
                let (ask_sum, ask_notional) = weighted(&book.asks, k);
                let total = bid_sum + ask_sum;
                if total.is_zero() {
                    return Some(book.mid_price);
                }
                Some((bid_notional + ask_notional) / total)
            }
        }
    }

    fn build_ladder(&self, fair_value: Decimal, inventory: Decimal) -> (Vec<QuoteLevel>, Vec<QuoteLevel>) {
        let cfg = &self.mm_config;
        let skew = cfg.skew_coefficient * (inventory / cfg.max_inventory.max(Decimal::ONE));
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for i in 0..cfg.level_count {
            let step = cfg.level_step * Decimal::from(i);
            let bid_price = fair_value - cfg.base_half_spread - step - skew;
            let ask_price = fair_value + cfg.base_half_spread + step - skew;
            if bid_price >= cfg.min_price && bid_price <= cfg.max_price {
                bids.push(QuoteLevel { price: bid_price, size: cfg.level_size });
            }
            if ask_price >= cfg.min_price && ask_price <= cfg.max_price {
                asks.push(QuoteLevel { price: ask_price, size: cfg.level_size });
            }
        }
        (bids, asks)
    }

    fn should_requote(&self, state: &MarketMakingState, now: DateTime<Utc>) -> bool {
        let moved = match state.active_bids.first().or(state.active_asks.first()) {
            None => true,
            Some(_) => {
                let prior_mid = if state.ema_fair_value.is_zero() {
                    state.fair_value
                } else {
                    state.ema_fair_value
                };
                (state.fair_value - prior_mid).abs() >= self.mm_config.requote_threshold_cents
            }
        };
        let elapsed = state
            .last_requote_at
            .map(|t| now.signed_duration_since(t).num_milliseconds() >= self.mm_config.requote_interval_ms)
            .unwrap_or(true);
        moved || elapsed
    }
}

fn weighted(levels: &[crate::types::BookLevel], k: usize) -> (Decimal, Decimal) {
    let mut size_sum = Decimal::ZERO;
    let mut notional_sum = Decimal::ZERO;
    for level in levels.iter().take(k) {
        size_sum += level.size;
        notional_sum += level.price * level.size;
    }
    (size_sum, notional_sum)
}

#[async_trait]
impl Strategy for MarketMakingEngine {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn evaluate(&self, ctx: &StrategyContext) -> Result<Vec<Signal>, StrategyError> {
        let book = match &ctx.orderbook {
            Some(b) => b.clone(),
            None => return Ok(vec![]),
        };

        let mut state = self.state.lock();

        let inventory_value = state.inventory.abs() * book.mid_price;
        if inventory_value > self.mm_config.max_position_value_usd {
            state.halt_reason = Some("max_position_value_exceeded".to_string());
        } else if state.realized_pnl < -self.mm_config.max_loss_usd {
            state.halt_reason = Some("max_loss_exceeded".to_string());
        }

        if state.halt_reason.is_some() {
            state.is_quoting = false;
            state.active_bids.clear();
            state.active_asks.clear();
            return Ok(vec![]);
        }

        let raw = self
            .raw_fair_value(&book)
            .ok_or_else(|| StrategyError::EvaluationFault("orderbook missing levels for fair value".to_string()))?;
        state.fair_value = raw;
        state.ema_fair_value = if state.ema_fair_value.is_zero() {
            raw
        } else {
            let alpha = Decimal::from_f64(self.mm_config.ema_alpha).unwrap_or(Decimal::new(2, 1));
            alpha * raw + (Decimal::ONE - alpha) * state.ema_fair_value
        };
        if state.price_history.len() == 200 {
            state.price_history.pop_front();
        }
        state.price_history.push_back(raw);

        if !self.should_requote(&state, ctx.timestamp) {
            return Ok(vec![]);
        }

        let (bids, asks) = self.build_ladder(state.ema_fair_value, state.inventory);
        state.active_bids = bids.clone();
        state.active_asks = asks.clone();
        state.last_requote_at = Some(ctx.timestamp);
        state.is_quoting = true;

        let mut signals = Vec::with_capacity(bids.len() + asks.len());
        for level in &bids {
            signals.push(Signal {
                signal_type: SignalType::Buy,
                platform: self.platform.clone(),
                market_id: self.market_id.clone(),
                outcome: self.outcome.clone(),
                price: level.price,
                size: Some(level.size),
                confidence: 1.0,
                reason: "mm_quote".to_string(),
                metadata: None,
            });
        }
        for level in &asks {
            signals.push(Signal {
                signal_type: SignalType::Sell,
                platform: self.platform.clone(),
                market_id: self.market_id.clone(),
                outcome: self.outcome.clone(),
                price: level.price,
                size: Some(level.size),
                confidence: 1.0,
                reason: "mm_quote".to_string(),
                metadata: None,
            });
        }
        Ok(signals)
    }

    async fn on_trade(&self, trade: &Trade) {
        let mut state = self.state.lock();
        let signed_size = match trade.side {
            crate::types::Side::Long => trade.size,
            crate::types::Side::Short => -trade.size,
        };
        let pnl_reference = state.fair_value;
        state.realized_pnl += (pnl_reference - trade.price) * signed_size.abs() * signed_size.signum();
        state.inventory += signed_size;
        state.fill_count += 1;
    }

    async fn cleanup(&self) {
        let mut state = self.state.lock();
        state.is_quoting = false;
        state.active_bids.clear();
        state.active_asks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;
    use serde_json::json;

    fn book(bid: &str, ask: &str, bid_size: &str, ask_size: &str) -> OrderbookSnapshot {
        OrderbookSnapshot {
            time: Utc::now(),
            bids: vec![BookLevel { price: Decimal::from_str_exact(bid).unwrap(), size: Decimal::from_str_exact(bid_size).unwrap() }],
            asks: vec![BookLevel { price: Decimal::from_str_exact(ask).unwrap(), size: Decimal::from_str_exact(ask_size).unwrap() }],
            mid_price: Decimal::from_str_exact(bid).unwrap(),
            spread: Decimal::ZERO,
        }
    }

    fn engine() -> MarketMakingEngine {
        MarketMakingEngine::new(
            StrategyConfig {
                id: "mm1".to_string(),
                name: "mm".to_string(),
                platforms: vec!["poly".to_string()],
                markets: vec!["MKT1".to_string()],
                interval_ms: 1000,
                max_position_size: None,
                max_exposure: None,
                dry_run: false,
                params: json!({}),
            },
            MarketMakingConfig::default(),
            "poly".to_string(),
            "MKT1".to_string(),
            "YES".to_string(),
        )
    }

    #[tokio::test]
    async fn quotes_both_sides_within_bounds() {
        let e = engine();
        let mut ctx = StrategyContext::empty(Utc::now(), false);
        ctx.orderbook = Some(book("0.50", "0.52", "100", "100"));
        let signals = e.evaluate(&ctx).await.unwrap();
        assert!(signals.iter().any(|s| s.signal_type == SignalType::Buy));
        assert!(signals.iter().any(|s| s.signal_type == SignalType::Sell));
        for s in &signals {
            assert!(s.price >= Decimal::new(1, 2) && s.price <= Decimal::new(99, 2));
        }
    }

    #[tokio::test]
    async fn halts_on_loss_limit() {
        let e = engine();
        e.state.lock().realized_pnl = -Decimal::new(600, 0);
        let mut ctx = StrategyContext::empty(Utc::now(), false);
        ctx.orderbook = Some(book("0.50", "0.52", "100", "100"));
        let signals = e.evaluate(&ctx).await.unwrap();
        assert!(signals.is_empty());
        assert_eq!(e.snapshot_state().halt_reason.as_deref(), Some("max_loss_exceeded"));
    }

    #[tokio::test]
    async fn resume_clears_halt_and_allows_quoting_again() {
        let e = engine();
        e.state.lock().realized_pnl = -Decimal::new(600, 0);
        let mut ctx = StrategyContext::empty(Utc::now(), false);
        ctx.orderbook = Some(book("0.50", "0.52", "100", "100"));
        e.evaluate(&ctx).await.unwrap();
        assert!(e.snapshot_state().halt_reason.is_some());

        e.resume();
        assert!(e.snapshot_state().halt_reason.is_none());
        e.state.lock().realized_pnl = Decimal::ZERO;
        let signals = e.evaluate(&ctx).await.unwrap();
        assert!(!signals.is_empty());
        assert!(e.snapshot_state().halt_reason.is_none());
    }
}
