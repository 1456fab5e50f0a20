use super::{spawn_filtered_subscription, FeedSubscription, PriceFeed, PriceUpdate, RawTick};
use crate::types::{OrderbookSnapshot, Tick};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// In-memory feed driven by `push_tick`/`set_orderbook`. Backs tests and
/// demo wiring; the backtest engine drives strategies directly rather than
/// through this feed, but it shares the same `Tick`/`OrderbookSnapshot`
/// shapes so a strategy's `init()` can use either interchangeably.
pub struct SimulatedFeed {
    tx: broadcast::Sender<RawTick>,
    books: Arc<RwLock<HashMap<(String, String), OrderbookSnapshot>>>,
}

impl Default for SimulatedFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFeed {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            books: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn push_tick(&self, platform: &str, market_id: &str, outcome_id: &str, tick: Tick) {
        let _ = self.tx.send(RawTick {
            platform: platform.to_string(),
            market_id: market_id.to_string(),
            outcome_id: outcome_id.to_string(),
            tick,
        });
    }

    pub fn set_orderbook(&self, platform: &str, market_id: &str, snapshot: OrderbookSnapshot) {
        self.books
            .write()
            .insert((platform.to_string(), market_id.to_string()), snapshot);
    }
}

#[async_trait]
impl PriceFeed for SimulatedFeed {
    fn subscribe_price(
        &self,
        platform: &str,
        market_id: &str,
        callback: Box<dyn Fn(PriceUpdate) + Send + Sync + 'static>,
    ) -> FeedSubscription {
        spawn_filtered_subscription(
            self.tx.subscribe(),
            platform.to_string(),
            market_id.to_string(),
            Arc::from(callback),
        )
    }

    async fn get_orderbook(&self, platform: &str, market_id: &str) -> Option<OrderbookSnapshot> {
        self.books
            .read()
            .get(&(platform.to_string(), market_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn delivers_ticks_to_matching_subscriber_only() {
        let feed = SimulatedFeed::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _sub = feed.subscribe_price(
            "poly",
            "MKT1",
            Box::new(move |_update| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        feed.push_tick(
            "poly",
            "MKT1",
            "YES",
            Tick {
                time: Utc::now(),
                price: Decimal::new(50, 2),
                prev_price: None,
            },
        );
        feed.push_tick(
            "poly",
            "MKT2",
            "YES",
            Tick {
                time: Utc::now(),
                price: Decimal::new(50, 2),
                prev_price: None,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
