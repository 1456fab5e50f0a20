//! Performance metrics computed from a completed equity curve and trade
//! list. Annualization and downside-deviation math follow the standard
//! daily-returns convention; `f64` is used throughout since these are
//! statistical summaries, never money fields used for order sizing.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use super::{EquityPoint, TradeRecord};

const TRADING_DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone)]
pub struct BacktestMetrics {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_trade_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_days: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub total_commission: Decimal,
    pub total_slippage: Decimal,
    pub final_equity: Decimal,
}

/// Daily log-equity returns derived from the equity curve, used by
/// Sharpe/Sortino and by Monte Carlo resampling.
pub fn daily_returns(curve: &[EquityPoint]) -> Vec<f64> {
    let mut by_day: Vec<(chrono::NaiveDate, Decimal)> = Vec::new();
    for point in curve {
        let day = point.time.date_naive();
        match by_day.last_mut() {
            Some((d, v)) if *d == day => *v = point.equity,
            _ => by_day.push((day, point.equity)),
        }
    }
    by_day
        .windows(2)
        .map(|w| {
            let prev = w[0].1.to_f64().unwrap_or(1.0);
            let cur = w[1].1.to_f64().unwrap_or(1.0);
            if prev.abs() < f64::EPSILON {
                0.0
            } else {
                (cur - prev) / prev
            }
        })
        .collect()
}

fn max_drawdown(curve: &[EquityPoint]) -> (f64, f64) {
    let mut peak = Decimal::MIN;
    let mut peak_time = None;
    let mut worst_pct = 0.0f64;
    let mut worst_duration_days = 0.0f64;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
            peak_time = Some(point.time);
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - point.equity) / peak).to_f64().unwrap_or(0.0) * 100.0;
            if dd > worst_pct {
                worst_pct = dd;
                if let Some(pt) = peak_time {
                    worst_duration_days = point.time.signed_duration_since(pt).num_seconds() as f64 / 86_400.0;
                }
            }
        }
    }
    (worst_pct, worst_duration_days)
}

pub fn compute(
    initial_capital: Decimal,
    curve: &[EquityPoint],
    trades: &[TradeRecord],
    risk_free_rate: f64,
) -> BacktestMetrics {
    let final_equity = curve.last().map(|p| p.equity).unwrap_or(initial_capital);
    let total_return_pct = if initial_capital.is_zero() {
        0.0
    } else {
        ((final_equity - initial_capital) / initial_capital).to_f64().unwrap_or(0.0) * 100.0
    };

    let span_days = match (curve.first(), curve.last()) {
        (Some(a), Some(b)) => (b.time - a.time).num_seconds() as f64 / 86_400.0,
        _ => 0.0,
    };
    let annualized_return_pct = if span_days > 0.0 {
        (((final_equity / initial_capital.max(Decimal::new(1, 2))).to_f64().unwrap_or(1.0))
            .powf(TRADING_DAYS_PER_YEAR / span_days)
            - 1.0)
            * 100.0
    } else {
        total_return_pct
    };

    let wins: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl > Decimal::ZERO).collect();
    let losses: Vec<&TradeRecord> = trades.iter().filter(|t| t.pnl < Decimal::ZERO).collect();
    let win_rate = if trades.is_empty() { 0.0 } else { wins.len() as f64 / trades.len() as f64 * 100.0 };

    let gross_profit: Decimal = wins.iter().map(|t| t.pnl).sum();
    let gross_loss: Decimal = losses.iter().map(|t| t.pnl).sum::<Decimal>().abs();
    let profit_factor = if gross_loss.is_zero() {
        if gross_profit.is_zero() { 0.0 } else { f64::INFINITY }
    } else {
        (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
    };

    let avg_pct = |set: &[&TradeRecord]| -> f64 {
        if set.is_empty() {
            0.0
        } else {
            set.iter().map(|t| t.return_pct).sum::<f64>() / set.len() as f64
        }
    };
    let avg_trade_pct = if trades.is_empty() {
        0.0
    } else {
        trades.iter().map(|t| t.return_pct).sum::<f64>() / trades.len() as f64
    };
    let avg_win_pct = avg_pct(&wins);
    let avg_loss_pct = avg_pct(&losses);

    let (max_drawdown_pct, max_drawdown_duration_days) = max_drawdown(curve);

    let returns = daily_returns(curve);
    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let (mean, std) = mean_std(&returns);
    let sharpe_ratio = if std > 0.0 {
        (mean - daily_rf) / std * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let downside: Vec<f64> = returns.iter().filter(|r| **r < daily_rf).map(|r| (r - daily_rf).powi(2)).collect();
    let downside_dev = if downside.is_empty() {
        0.0
    } else {
        (downside.iter().sum::<f64>() / downside.len() as f64).sqrt()
    };
    let sortino_ratio = if downside_dev > 0.0 {
        (mean - daily_rf) / downside_dev * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let calmar_ratio = if max_drawdown_pct > 0.0 {
        annualized_return_pct / max_drawdown_pct
    } else {
        0.0
    };

    let total_commission: Decimal = trades.iter().map(|t| t.commission).sum();
    let total_slippage: Decimal = trades.iter().map(|t| t.slippage).sum();

    BacktestMetrics {
        total_return_pct,
        annualized_return_pct,
        total_trades: trades.len(),
        win_rate,
        profit_factor,
        avg_trade_pct,
        avg_win_pct,
        avg_loss_pct,
        max_drawdown_pct,
        max_drawdown_duration_days,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        total_commission,
        total_slippage,
        final_equity,
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn zero_drawdown_on_monotonic_equity() {
        let curve = vec![
            EquityPoint { time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(), equity: Decimal::new(1000, 0) },
            EquityPoint { time: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(), equity: Decimal::new(1098, 0) },
        ];
        let metrics = compute(Decimal::new(1000, 0), &curve, &[], 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
        assert!((metrics.total_return_pct - 9.8).abs() < 0.5);
    }
}
