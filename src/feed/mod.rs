//! Feed subscription interface (collaborator, §4.A).
//!
//! The core only ever consumes a `PriceFeed` trait object; it never knows
//! whether ticks originate from a venue websocket or from a backtest's
//! recorded series. `SimulatedFeed` is the one concrete implementation kept
//! in-tree, used by tests and by anything that wants the live code path
//! without a real venue behind it.

mod simulated;

pub use simulated::SimulatedFeed;

use crate::types::{OrderbookSnapshot, Platform, Tick};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub platform: Platform,
    pub market_id: String,
    pub outcome_id: String,
    pub tick: Tick,
}

/// Dropping the guard unsubscribes. The receiver task exits once the
/// underlying broadcast `Receiver` is dropped.
pub struct FeedSubscription {
    _task: tokio::task::JoinHandle<()>,
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self._task.abort();
    }
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Registers `callback` to run for every tick on `(platform, market_id)`.
    /// The callback must be safe to invoke from any scheduling context —
    /// it runs inside a spawned task, never inline with the publisher.
    fn subscribe_price(
        &self,
        platform: &str,
        market_id: &str,
        callback: Box<dyn Fn(PriceUpdate) + Send + Sync + 'static>,
    ) -> FeedSubscription;

    /// Last-known snapshot, possibly stale. Callers gate on `is_stale`.
    async fn get_orderbook(&self, platform: &str, market_id: &str) -> Option<OrderbookSnapshot>;
}

/// Internal broadcast payload; feeds fan out on one channel per market and
/// filter in the subscriber task so a slow subscriber on one market doesn't
/// block delivery to another.
#[derive(Debug, Clone)]
pub(crate) struct RawTick {
    pub platform: Platform,
    pub market_id: String,
    pub outcome_id: String,
    pub tick: Tick,
}

pub(crate) fn spawn_filtered_subscription(
    mut rx: broadcast::Receiver<RawTick>,
    platform: String,
    market_id: String,
    callback: Arc<dyn Fn(PriceUpdate) + Send + Sync + 'static>,
) -> FeedSubscription {
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(raw) if raw.platform == platform && raw.market_id == market_id => {
                    callback(PriceUpdate {
                        platform: raw.platform,
                        market_id: raw.market_id,
                        outcome_id: raw.outcome_id,
                        tick: raw.tick,
                    });
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    FeedSubscription { _task: task }
}
