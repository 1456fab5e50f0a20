//! Core data model shared by every component: the venue-agnostic vocabulary
//! that strategies, the router, the position manager, and the backtest
//! engine all speak.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque venue tag (e.g. "polymarket", "binance"). Never parsed, only matched.
pub type Platform = String;

/// A `(platform, marketId, outcome)` triple is the unit the router serializes
/// admissions on and the unit positions are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub platform: Platform,
    pub market_id: String,
    pub outcome: String,
}

impl MarketKey {
    pub fn new(platform: impl Into<String>, market_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            market_id: market_id.into(),
            outcome: outcome.into(),
        }
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.market_id, self.outcome)
    }
}

/// A single price observation for `(platform, marketId, outcomeId)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub price: Decimal,
    pub prev_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub time: DateTime<Utc>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub mid_price: Decimal,
    pub spread: Decimal,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// `(bestBid*askSize + bestAsk*bidSize) / (bidSize + askSize)`
    pub fn microprice(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let denom = bid.size + ask.size;
        if denom.is_zero() {
            return Some(self.mid_price);
        }
        Some((bid.price * ask.size + ask.price * bid.size) / denom)
    }

    /// Stale relative to `now` if older than `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.time) > max_age
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

/// A strategy's intent, emitted per evaluation. `size` is optional; the
/// router derives it when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub platform: Platform,
    pub market_id: String,
    pub outcome: String,
    pub price: Decimal,
    pub size: Option<Decimal>,
    pub confidence: f64,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
}

impl Signal {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(self.platform.clone(), self.market_id.clone(), self.outcome.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

/// A realized trade attributable to a strategy, passed to `onTrade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub platform: Platform,
    pub market_id: String,
    pub outcome: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub realized_pnl: Decimal,
    pub time: DateTime<Utc>,
}

pub fn now_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}
