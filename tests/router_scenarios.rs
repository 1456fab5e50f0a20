//! Cross-module router scenarios exercising composition-root wiring
//! (router + paper execution) rather than a single module in isolation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tradeloop_backend::execution::{PaperExecutionAdapter, PaperExecutionConfig};
use tradeloop_backend::router::{Clock, RecordStatus, RouterConfig, SignalRouter};
use tradeloop_backend::{Signal, SignalType};

/// Manually-advanced clock so cooldown timing can be exercised without
/// sleeping real wall-clock seconds in a test.
struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().unwrap() = t;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn buy_signal() -> Signal {
    Signal {
        signal_type: SignalType::Buy,
        platform: "poly".to_string(),
        market_id: "MKT1".to_string(),
        outcome: "YES".to_string(),
        price: Decimal::new(50, 2),
        size: None,
        confidence: 0.9,
        reason: "test".to_string(),
        metadata: None,
    }
}

fn reliable_adapter() -> PaperExecutionAdapter {
    PaperExecutionAdapter::new(PaperExecutionConfig {
        reject_prob: 0.0,
        partial_fill_prob: 0.0,
        base_latency_ms: 0,
        latency_jitter_ms: 0,
        ..Default::default()
    })
}

/// Scenario 1 (§8): 12 admission attempts at a nominal 1s cadence with a
/// 5000ms cooldown admit at t≈0, 5, 10 and skip the other 9.
#[tokio::test]
async fn cooldown_admits_three_of_twelve() {
    let base = Utc::now();
    let clock = Arc::new(FakeClock::new(base));
    let router = SignalRouter::new_with_clock(
        RouterConfig {
            cooldown_ms: 5000,
            ..Default::default()
        },
        Arc::new(reliable_adapter()),
        Arc::new(|| 0),
        clock.clone(),
    );

    let mut executed = 0;
    let mut skipped = 0;
    for second in 0..12 {
        clock.set(base + chrono::Duration::seconds(second));
        let record = router.admit(buy_signal(), "s1".to_string()).await;
        match record.status {
            RecordStatus::Executed => executed += 1,
            RecordStatus::Skipped => skipped += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }

    assert_eq!(executed, 3, "admits at t=0, 5, 10 under a 5000ms cooldown");
    assert_eq!(skipped, 9);
}

/// Scenario 2 (§8): cumulative realized PnL trajectory [-30, -60, -110,
/// -80] with maxDailyLoss=100 trips daily-stop after the third fill and
/// does not reopen on the partial recovery to -80.
#[tokio::test]
async fn daily_stop_trips_after_third_loss_and_stays_tripped_on_recovery() {
    let router = SignalRouter::new(
        RouterConfig {
            max_daily_loss: Decimal::new(100, 0),
            ..Default::default()
        },
        Arc::new(reliable_adapter()),
        Arc::new(|| 0),
    );

    let now = Utc::now();
    router.record_realized_pnl(Decimal::new(-30, 0), now);
    let after_first = router.admit(buy_signal(), "s1".to_string()).await;
    assert_eq!(after_first.status, RecordStatus::Executed);

    router.record_realized_pnl(Decimal::new(-30, 0), now); // cumulative -60
    let after_second = router.admit(buy_signal(), "s1".to_string()).await;
    assert_eq!(after_second.status, RecordStatus::Executed);

    router.record_realized_pnl(Decimal::new(-50, 0), now); // cumulative -110
    let after_third = router.admit(buy_signal(), "s1".to_string()).await;
    assert_eq!(after_third.status, RecordStatus::Rejected);
    assert_eq!(after_third.reason.as_deref(), Some("daily_loss_limit"));

    router.record_realized_pnl(Decimal::new(30, 0), now); // recovers to -80
    let after_recovery = router.admit(buy_signal(), "s1".to_string()).await;
    assert_eq!(after_recovery.status, RecordStatus::Rejected);
    assert_eq!(after_recovery.reason.as_deref(), Some("daily_loss_limit"));
}

/// Scenario 5 (§8): `protectedBuy` with maxSlippage=0.02 against a
/// configuration implying ~10% slippage aborts before any order reaches
/// the venue, and the router surfaces it as a failed (non-executed)
/// record rather than retrying.
#[tokio::test]
async fn protected_market_mode_aborts_on_excess_slippage() {
    let adapter = PaperExecutionAdapter::new(PaperExecutionConfig {
        base_slippage_bps: 1_000.0, // 10%
        reject_prob: 0.0,
        partial_fill_prob: 0.0,
        ..Default::default()
    });
    let router = SignalRouter::new(
        RouterConfig {
            order_mode: tradeloop_backend::router::OrderMode::ProtectedMarket,
            protected_max_slippage: Decimal::new(2, 2), // 0.02
            ..Default::default()
        },
        Arc::new(adapter),
        Arc::new(|| 0),
    );

    let record = router.admit(buy_signal(), "s1".to_string()).await;
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.order_id, None);
}
