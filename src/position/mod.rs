//! Position manager (§4.F): mark-to-market, SL/TP/trailing-stop/partial-TP
//! trigger evaluation, guarded auto-close. Grounded on the corpus's
//! `OpenPosition`/exit-condition logic in `unified_15m_strategy.rs`,
//! generalized from a binary up/down market to absolute/percent SL, a
//! ratcheting trailing stop, and an N-level partial take-profit ladder.

use crate::strategy::PositionView;
use crate::types::{MarketKey, Platform, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Either an absolute price or a percent-from-entry; SL additionally
/// supports a trailing percent with a ratcheting reference price.
#[derive(Debug, Clone, Copy)]
pub enum StopLoss {
    Absolute(Decimal),
    PercentFromEntry(Decimal),
    Trailing { percent: Decimal },
}

#[derive(Debug, Clone, Copy)]
pub struct TakeProfitLevel {
    pub price_pct: Decimal,
    pub close_fraction: Decimal,
    pub fired: bool,
}

#[derive(Debug, Clone)]
pub enum TakeProfit {
    Absolute(Decimal),
    PercentFromEntry(Decimal),
    Ladder(Vec<TakeProfitLevel>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    TimeExit,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    /// Id of the strategy/bot that opened this position, for per-bot PnL
    /// and win-rate accounting.
    pub strategy_id: String,
    pub platform: Platform,
    pub market_id: String,
    pub token_id: String,
    pub outcome_name: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub stop_loss: Option<StopLoss>,
    /// Ratcheted stop price; persists across partial closes (§9, Open
    /// Question ii) — only `size` changes when a partial fires.
    pub stop_loss_price: Option<Decimal>,
    pub take_profit: Option<TakeProfit>,
    pub high_water_mark: Decimal,
    pub low_water_mark: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl Position {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(self.platform.clone(), self.market_id.clone(), self.outcome_name.clone())
    }

    pub fn to_view(&self) -> PositionView {
        PositionView {
            id: self.id.clone(),
            platform: self.platform.clone(),
            market_id: self.market_id.clone(),
            outcome: self.outcome_name.clone(),
            side: self.side,
            size: self.size,
            entry_price: self.entry_price,
            current_price: self.current_price,
            unrealized_pnl: self.unrealized_pnl,
        }
    }

    fn unrealized(&self) -> Decimal {
        match self.side {
            Side::Long => (self.current_price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - self.current_price) * self.size,
        }
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("unknown position id {0}")]
    UnknownPosition(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub portfolio_value: Decimal,
    pub free_cash: Decimal,
}

/// Injected callback the manager uses to request a closing fill. The
/// default implementation submits an opposite-side FOK at `currentPrice`
/// through the execution service; tests can substitute a stub.
#[async_trait]
pub trait CloseExecutor: Send + Sync {
    async fn execute_close(&self, position: &Position, reason: CloseReason) -> bool;
}

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct PositionManager {
    positions: RwLock<HashMap<String, Position>>,
    closer: Arc<dyn CloseExecutor>,
    free_cash: parking_lot::RwLock<Decimal>,
    sweep_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PositionManager {
    pub fn new(closer: Arc<dyn CloseExecutor>, starting_cash: Decimal) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            closer,
            free_cash: parking_lot::RwLock::new(starting_cash),
            sweep_task: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the periodic sweep that re-evaluates triggers for positions
    /// whose markets have gone quiet. Idempotent; normal price-driven
    /// updates arrive through `update_price`/`ingest_tick` and don't need
    /// this task running to fire.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.sweep_task.lock();
        if task.is_some() {
            return;
        }
        let pm = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = pm.sweep().await {
                    error!(error = %e, "position sweep failed");
                }
            }
        }));
    }

    /// Stops the periodic sweep. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
    }

    /// Aggregates closed-position realized PnL and win rate for one
    /// strategy/bot id, for the scheduler's bot-status reporting.
    pub fn strategy_pnl_stats(&self, strategy_id: &str) -> (Decimal, f64) {
        let positions = match self.positions.try_read() {
            Ok(p) => p,
            Err(_) => return (Decimal::ZERO, 0.0),
        };
        let mut total = Decimal::ZERO;
        let mut wins = 0u32;
        let mut closed = 0u32;
        for p in positions.values().filter(|p| p.status == PositionStatus::Closed && p.strategy_id == strategy_id) {
            total += p.realized_pnl;
            closed += 1;
            if p.realized_pnl > Decimal::ZERO {
                wins += 1;
            }
        }
        let win_rate = if closed > 0 { wins as f64 / closed as f64 } else { 0.0 };
        (total, win_rate)
    }

    /// Feed bridge: marks every open position in `key`'s market at `price`.
    /// This is what normally drives `update_price` in the running system;
    /// the periodic sweep only covers markets that have gone silent.
    pub async fn ingest_tick(&self, key: &MarketKey, price: Decimal) -> Result<(), PositionError> {
        let ids: Vec<String> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Open && &p.key() == key)
                .map(|p| p.id.clone())
                .collect()
        };
        for id in ids {
            self.update_price(&id, price).await?;
        }
        Ok(())
    }

    pub async fn open(&self, position: Position) -> Result<(), PositionError> {
        if position.size <= Decimal::ZERO {
            return Err(PositionError::Invariant("opened position must have positive size".into()));
        }
        self.positions.write().await.insert(position.id.clone(), position);
        Ok(())
    }

    /// Open positions for a `(platform, marketId)` pair across whatever
    /// outcome they actually hold — a caller building strategy context from
    /// just `(platform, marketId)` configuration has no way to guess the
    /// outcome string in advance.
    pub fn find_all_by_market(&self, platform: &Platform, market_id: &str) -> Vec<PositionView> {
        self.positions
            .try_read()
            .map(|m| {
                m.values()
                    .filter(|p| p.status == PositionStatus::Open && &p.platform == platform && p.market_id == market_id)
                    .map(Position::to_view)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn portfolio_snapshot(&self) -> PortfolioSnapshot {
        let free_cash = *self.free_cash.read();
        let unrealized: Decimal = self
            .positions
            .try_read()
            .map(|m| m.values().filter(|p| p.status == PositionStatus::Open).map(|p| p.unrealized_pnl).sum())
            .unwrap_or(Decimal::ZERO);
        PortfolioSnapshot {
            portfolio_value: free_cash + unrealized,
            free_cash,
        }
    }

    pub async fn open_count(&self) -> usize {
        self.positions.read().await.values().filter(|p| p.status == PositionStatus::Open).count()
    }

    /// Synchronous count for wiring into the router's injected
    /// `open_position_count` closure, which cannot await.
    pub fn open_position_count(&self) -> usize {
        self.positions
            .try_read()
            .map(|m| m.values().filter(|p| p.status == PositionStatus::Open).count())
            .unwrap_or(0)
    }

    /// Batch update; guarantees a single trigger-evaluation pass per position.
    pub async fn update_prices(&self, updates: &[(String, Decimal)]) -> Result<(), PositionError> {
        for (id, price) in updates {
            self.update_price(id, *price).await?;
        }
        Ok(())
    }

    /// Marks one position and runs its trigger evaluation, serialized per
    /// position id by holding the write lock for the whole sequence except
    /// across the `execute_close` await point.
    pub async fn update_price(&self, id: &str, price: Decimal) -> Result<(), PositionError> {
        let maybe_close: Option<CloseReason>;
        let has_ladder: bool;
        {
            let mut positions = self.positions.write().await;
            let position = positions.get_mut(id).ok_or_else(|| PositionError::UnknownPosition(id.to_string()))?;
            if position.status == PositionStatus::Closed {
                return Ok(());
            }
            mark(position, price);
            maybe_close = evaluate_triggers(position);
            has_ladder = maybe_close.is_none() && matches!(position.take_profit, Some(TakeProfit::Ladder(_)));
        }

        if let Some(reason) = maybe_close {
            self.close(id, reason).await?;
        } else if has_ladder {
            self.fire_ladder_rungs(id).await?;
        }
        Ok(())
    }

    /// Periodic sweep for positions whose markets have been silent; marks
    /// at the last known price (no-op on price, re-evaluates triggers and
    /// time-based exit).
    pub async fn sweep(&self) -> Result<(), PositionError> {
        let ids: Vec<String> = {
            let positions = self.positions.read().await;
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Open)
                .map(|p| p.id.clone())
                .collect()
        };
        for id in ids {
            let price = {
                let positions = self.positions.read().await;
                match positions.get(&id) {
                    Some(p) if p.status == PositionStatus::Open => p.current_price,
                    _ => continue,
                }
            };
            self.update_price(&id, price).await?;
        }
        Ok(())
    }

    async fn close(&self, id: &str, reason: CloseReason) -> Result<(), PositionError> {
        let position_snapshot = {
            let positions = self.positions.read().await;
            positions.get(id).cloned().ok_or_else(|| PositionError::UnknownPosition(id.to_string()))?
        };
        if position_snapshot.status == PositionStatus::Closed {
            return Ok(());
        }

        let ok = self.closer.execute_close(&position_snapshot, reason).await;
        if !ok {
            return Ok(());
        }

        let mut positions = self.positions.write().await;
        if let Some(position) = positions.get_mut(id) {
            if position.status == PositionStatus::Closed {
                error!(position_id = %id, "trigger fired twice on already-closed position");
                return Err(PositionError::Invariant("double close".into()));
            }
            position.status = PositionStatus::Closed;
            position.realized_pnl += position.unrealized_pnl;
            info!(position_id = %id, reason = ?reason, pnl = %position.realized_pnl, "position_closed");
        }
        Ok(())
    }

    /// Partial close for a TP rung: reduces size, realizes PnL on the
    /// closed portion, never fully closes unless the rung consumes all
    /// remaining size.
    async fn partial_close(&self, id: &str, fraction: Decimal, fill_price: Decimal) -> Result<(), PositionError> {
        let mut positions = self.positions.write().await;
        let position = positions.get_mut(id).ok_or_else(|| PositionError::UnknownPosition(id.to_string()))?;
        if position.status != PositionStatus::Open {
            return Ok(());
        }
        let close_size = (position.size * fraction).min(position.size);
        if close_size <= Decimal::ZERO {
            return Ok(());
        }
        let pnl = match position.side {
            Side::Long => (fill_price - position.entry_price) * close_size,
            Side::Short => (position.entry_price - fill_price) * close_size,
        };
        position.realized_pnl += pnl;
        position.size -= close_size;
        if position.size <= Decimal::ZERO {
            position.status = PositionStatus::Closed;
            info!(position_id = %id, reason = ?CloseReason::TakeProfit, "position_closed");
        }
        Ok(())
    }
}

/// `long -> (price - entry) * size`; `short -> (entry - price) * size`.
fn mark(position: &mut Position, price: Decimal) {
    position.current_price = price;
    match position.side {
        Side::Long => {
            if price > position.high_water_mark {
                position.high_water_mark = price;
            }
        }
        Side::Short => {
            if price < position.low_water_mark {
                position.low_water_mark = price;
            }
        }
    }
    position.unrealized_pnl = position.unrealized();
}

/// Evaluates SL, trailing SL, TP, and time exit in order; returns the
/// close reason if a full close should fire. Ladder TP rungs are fired
/// in-place (not returned) since they may only partially close.
fn evaluate_triggers(position: &mut Position) -> Option<CloseReason> {
    // 1: maintain trailing SL ratchet (tightens only, never loosens).
    if let Some(StopLoss::Trailing { percent }) = position.stop_loss {
        let candidate = match position.side {
            Side::Long => position.high_water_mark * (Decimal::ONE - percent / Decimal::new(100, 0)),
            Side::Short => position.low_water_mark * (Decimal::ONE + percent / Decimal::new(100, 0)),
        };
        position.stop_loss_price = Some(match (position.stop_loss_price, position.side) {
            (Some(existing), Side::Long) => existing.max(candidate),
            (Some(existing), Side::Short) => existing.min(candidate),
            (None, _) => candidate,
        });
    } else if let Some(descriptor) = position.stop_loss {
        position.stop_loss_price.get_or_insert(resolve_fixed_stop(&descriptor, position));
    }

    // 1/2: stop-loss fire check (fixed or trailing — same comparison).
    if let Some(stop_price) = position.stop_loss_price {
        let fired = match position.side {
            Side::Long => position.current_price <= stop_price,
            Side::Short => position.current_price >= stop_price,
        };
        if fired {
            let reason = if matches!(position.stop_loss, Some(StopLoss::Trailing { .. })) {
                CloseReason::TrailingStop
            } else {
                CloseReason::StopLoss
            };
            return Some(reason);
        }
    }

    // 3: take-profit (absolute/percent close fully; ladder rungs are
    // applied by the caller via `fire_ladder_rungs`, since a rung may only
    // partially close and this function only signals full closes).
    if let Some(tp) = &position.take_profit {
        match tp {
            TakeProfit::Absolute(price) => {
                let hit = match position.side {
                    Side::Long => position.current_price >= *price,
                    Side::Short => position.current_price <= *price,
                };
                if hit {
                    return Some(CloseReason::TakeProfit);
                }
            }
            TakeProfit::PercentFromEntry(pct) => {
                let target = match position.side {
                    Side::Long => position.entry_price * (Decimal::ONE + pct / Decimal::new(100, 0)),
                    Side::Short => position.entry_price * (Decimal::ONE - pct / Decimal::new(100, 0)),
                };
                let hit = match position.side {
                    Side::Long => position.current_price >= target,
                    Side::Short => position.current_price <= target,
                };
                if hit {
                    return Some(CloseReason::TakeProfit);
                }
            }
            TakeProfit::Ladder(_) => {} // handled by `fire_ladder_rungs`
        }
    }

    // 4: time-based exit.
    if let Some(expires_at) = position.expires_at {
        if Utc::now() >= expires_at {
            return Some(CloseReason::TimeExit);
        }
    }

    None
}

fn resolve_fixed_stop(descriptor: &StopLoss, position: &Position) -> Decimal {
    match descriptor {
        StopLoss::Absolute(p) => *p,
        StopLoss::PercentFromEntry(pct) => match position.side {
            Side::Long => position.entry_price * (Decimal::ONE - pct / Decimal::new(100, 0)),
            Side::Short => position.entry_price * (Decimal::ONE + pct / Decimal::new(100, 0)),
        },
        StopLoss::Trailing { .. } => unreachable!("trailing handled separately"),
    }
}

impl PositionManager {
    /// Evaluates and fires any un-fired TP ladder rungs against the
    /// position's current price. Each rung fires at most once and closes
    /// `closeFraction * remainingSize`; the last rung is clamped to
    /// whatever size remains.
    pub async fn fire_ladder_rungs(&self, id: &str) -> Result<(), PositionError> {
        let (side, entry, current, levels) = {
            let positions = self.positions.read().await;
            let p = positions.get(id).ok_or_else(|| PositionError::UnknownPosition(id.to_string()))?;
            let levels = match &p.take_profit {
                Some(TakeProfit::Ladder(levels)) => levels.clone(),
                _ => return Ok(()),
            };
            (p.side, p.entry_price, p.current_price, levels)
        };

        for (idx, level) in levels.iter().enumerate() {
            if level.fired {
                continue;
            }
            let target = match side {
                Side::Long => entry * (Decimal::ONE + level.price_pct / Decimal::new(100, 0)),
                Side::Short => entry * (Decimal::ONE - level.price_pct / Decimal::new(100, 0)),
            };
            let hit = match side {
                Side::Long => current >= target,
                Side::Short => current <= target,
            };
            if !hit {
                continue;
            }
            self.partial_close(id, level.close_fraction, current).await?;
            let mut positions = self.positions.write().await;
            if let Some(p) = positions.get_mut(id) {
                if let Some(TakeProfit::Ladder(levels)) = &mut p.take_profit {
                    if let Some(l) = levels.get_mut(idx) {
                        l.fired = true;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysClose;

    #[async_trait]
    impl CloseExecutor for AlwaysClose {
        async fn execute_close(&self, _position: &Position, _reason: CloseReason) -> bool {
            true
        }
    }

    fn long_position(entry: &str, size: &str) -> Position {
        let entry_d = Decimal::from_str_exact(entry).unwrap();
        Position {
            id: "p1".to_string(),
            strategy_id: "s1".to_string(),
            platform: "poly".to_string(),
            market_id: "MKT1".to_string(),
            token_id: "YES".to_string(),
            outcome_name: "YES".to_string(),
            side: Side::Long,
            size: Decimal::from_str_exact(size).unwrap(),
            entry_price: entry_d,
            current_price: entry_d,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            stop_loss: None,
            stop_loss_price: None,
            take_profit: None,
            high_water_mark: entry_d,
            low_water_mark: entry_d,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            expires_at: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn trailing_stop_ratchets_and_closes() {
        let pm = PositionManager::new(Arc::new(AlwaysClose), Decimal::new(10_000, 0));
        let mut pos = long_position("0.60", "100");
        pos.stop_loss = Some(StopLoss::Trailing { percent: Decimal::new(10, 0) });
        pm.open(pos).await.unwrap();

        for price in ["0.60", "0.66", "0.72", "0.70", "0.648"] {
            pm.update_price("p1", Decimal::from_str_exact(price).unwrap()).await.unwrap();
        }

        let positions = pm.positions.read().await;
        let p = positions.get("p1").unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        // realized pnl = (0.648 - 0.60) * 100 = 4.8
        assert_eq!(p.realized_pnl, Decimal::from_str_exact("4.800").unwrap());
    }

    #[tokio::test]
    async fn partial_tp_ladder_fires_each_rung_once() {
        let pm = PositionManager::new(Arc::new(AlwaysClose), Decimal::new(10_000, 0));
        let mut pos = long_position("0.50", "200");
        pos.take_profit = Some(TakeProfit::Ladder(vec![
            TakeProfitLevel { price_pct: Decimal::new(10, 0), close_fraction: Decimal::new(5, 1), fired: false },
            TakeProfitLevel { price_pct: Decimal::new(20, 0), close_fraction: Decimal::ONE, fired: false },
        ]));
        pm.open(pos).await.unwrap();

        pm.update_price("p1", Decimal::from_str_exact("0.55").unwrap()).await.unwrap();
        pm.fire_ladder_rungs("p1").await.unwrap();
        {
            let positions = pm.positions.read().await;
            let p = positions.get("p1").unwrap();
            assert_eq!(p.size, Decimal::new(100, 0));
        }

        pm.update_price("p1", Decimal::from_str_exact("0.60").unwrap()).await.unwrap();
        pm.fire_ladder_rungs("p1").await.unwrap();
        {
            let positions = pm.positions.read().await;
            let p = positions.get("p1").unwrap();
            assert_eq!(p.size, Decimal::ZERO);
            assert_eq!(p.status, PositionStatus::Closed);
        }
    }

    #[tokio::test]
    async fn strategy_pnl_stats_aggregate_closed_positions_only() {
        let pm = PositionManager::new(Arc::new(AlwaysClose), Decimal::new(10_000, 0));
        let mut winner = long_position("0.50", "100");
        winner.id = "win".to_string();
        winner.stop_loss = Some(StopLoss::Absolute(Decimal::new(45, 2)));
        winner.take_profit = Some(TakeProfit::Absolute(Decimal::new(60, 2)));
        pm.open(winner).await.unwrap();

        let mut loser = long_position("0.50", "100");
        loser.id = "lose".to_string();
        loser.stop_loss = Some(StopLoss::Absolute(Decimal::new(45, 2)));
        pm.open(loser).await.unwrap();

        let mut still_open = long_position("0.50", "50");
        still_open.id = "open".to_string();
        pm.open(still_open).await.unwrap();

        pm.update_price("win", Decimal::from_str_exact("0.60").unwrap()).await.unwrap();
        pm.update_price("lose", Decimal::from_str_exact("0.44").unwrap()).await.unwrap();

        let (total, win_rate) = pm.strategy_pnl_stats("s1");
        // winner: (0.60 - 0.50) * 100 = 10; loser: (0.44 - 0.50) * 100 = -6.
        assert_eq!(total, Decimal::from_str_exact("4").unwrap());
        assert_eq!(win_rate, 0.5);
    }

    #[tokio::test]
    async fn fixed_stop_loss_fires_on_long() {
        let pm = PositionManager::new(Arc::new(AlwaysClose), Decimal::new(10_000, 0));
        let mut pos = long_position("1.00", "10");
        pos.stop_loss = Some(StopLoss::PercentFromEntry(Decimal::new(5, 0)));
        pm.open(pos).await.unwrap();
        pm.update_price("p1", Decimal::from_str_exact("0.94").unwrap()).await.unwrap();
        let positions = pm.positions.read().await;
        assert_eq!(positions.get("p1").unwrap().status, PositionStatus::Closed);
    }
}
