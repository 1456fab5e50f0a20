//! Composition root: wires execution, routing, position management and
//! the strategy scheduler together and exposes the control-surface of
//! §6 as plain typed calls on `BotManager`/`SignalRouter`/`PositionManager`.
//! No HTTP/RPC framing is added here; a transport adapter translating
//! these into wire requests is an out-of-scope collaborator.

use anyhow::{Context, Result};
use dotenv::dotenv;
use rust_decimal::Decimal;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tradeloop_backend::execution::{
    CircuitBreakerConfig, CircuitBreakingExecutor, ExecutionAdapter, OrderRequest, OrderSide, PaperExecutionAdapter,
    PaperExecutionConfig, TimeInForce,
};
use tradeloop_backend::position::{CloseExecutor, CloseReason, Position, PositionManager};
use tradeloop_backend::router::{RouterConfig, SignalRouter};
use tradeloop_backend::scheduler::BotManager;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Closes a live position by submitting an opposite-side sell at the
/// venue's current mark through the execution service.
struct VenueCloseExecutor {
    executor: Arc<dyn ExecutionAdapter>,
}

#[async_trait::async_trait]
impl CloseExecutor for VenueCloseExecutor {
    async fn execute_close(&self, position: &Position, reason: CloseReason) -> bool {
        let req = OrderRequest {
            platform: position.platform.clone(),
            market_id: position.market_id.clone(),
            token_id: position.token_id.clone(),
            side: OrderSide::Sell,
            price: position.current_price,
            size: position.size,
            time_in_force: TimeInForce::Gtc,
            idempotency_key: format!("close:{}:{:?}", position.id, reason),
        };
        match self.executor.sell_limit(req).await {
            Ok(result) => result.success,
            Err(e) => {
                tracing::warn!(position_id = %position.id, error = %e, "close order failed");
                false
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let initial_capital = env::var("INITIAL_CAPITAL")
        .ok()
        .and_then(|v| Decimal::from_str_exact(&v).ok())
        .unwrap_or(Decimal::new(10_000, 0));

    info!(capital = %initial_capital, "starting trading runtime");

    let paper_cfg = PaperExecutionConfig::from_env();
    let paper_adapter = PaperExecutionAdapter::new(paper_cfg);
    let executor: Arc<dyn ExecutionAdapter> = Arc::new(CircuitBreakingExecutor::new(
        paper_adapter,
        CircuitBreakerConfig::from_env(),
    ));

    let position_manager = Arc::new(PositionManager::new(
        Arc::new(VenueCloseExecutor { executor: executor.clone() }),
        initial_capital,
    ));

    let router_cfg = RouterConfig::from_env();
    let pm_for_closure = position_manager.clone();
    let open_position_count = Arc::new(move || pm_for_closure.open_position_count());
    let router = Arc::new(SignalRouter::new(router_cfg, executor.clone(), open_position_count));

    let bot_manager = Arc::new(BotManager::new(position_manager.clone(), router.clone()));
    position_manager.start();

    info!("runtime wired; register strategies and call start_bot(id) to begin trading");

    // Registration of concrete strategies (market-making, user-supplied
    // signal strategies) and subscribing their markets on a feed (whose
    // ticks drive `position_manager.ingest_tick`) is left to whatever
    // composes this binary for a specific deployment; this process keeps
    // the runtime alive so the registered bot tasks and the position
    // manager's periodic sweep continue running.
    let _ = &bot_manager;
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    position_manager.stop();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeloop_backend=info,tradeloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Loads `.env` from the current directory, falling back to one next to
/// the crate manifest so `cargo run` works regardless of invocation dir.
fn load_env() {
    let _ = dotenv();
    let manifest_relative = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_relative.exists() {
        let _ = dotenv::from_path(&manifest_relative);
    }
}
