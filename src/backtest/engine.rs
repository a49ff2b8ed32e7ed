//! # Backtest Engine
//!
//! $$
//! V_t = \sum_i h_{t-1,i}(1+r_{t,i}),\qquad
//! \tau = \sum_i |w^\*_i - h_{t,i}/V_t|
//! $$
//!
//! Day-by-day simulation of a static or periodically re-optimized allocation.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::NaiveDate;
use impl_new_derive::ImplNew;
use serde::Deserialize;
use serde::Serialize;

use super::schedule::RebalanceFrequency;
use crate::data::GapPolicy;
use crate::data::PriceSeries;
use crate::data::ReturnSeries;
use crate::data::ReturnTable;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::estimation::MomentEstimate;
use crate::portfolio::select;
use crate::portfolio::AllocationPolicy;
use crate::portfolio::CancelFlag;
use crate::portfolio::Constraints;
use crate::portfolio::FrontierOptimizer;
use crate::portfolio::Portfolio;

/// Runtime configuration for [`BacktestEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
  pub rebalance: RebalanceFrequency,
  /// Treatment of missing observations when aligning series.
  pub gap_policy: GapPolicy,
  /// Cost charged on traded notional, in basis points.
  pub transaction_cost_bps: f64,
}

impl Default for BacktestConfig {
  fn default() -> Self {
    Self {
      rebalance: RebalanceFrequency::Monthly,
      gap_policy: GapPolicy::Fail,
      transaction_cost_bps: 0.0,
    }
  }
}

impl BacktestConfig {
  pub fn validate(&self) -> Result<()> {
    if !(self.transaction_cost_bps.is_finite() && self.transaction_cost_bps >= 0.0) {
      return Err(PortfolioError::config(format!(
        "transaction_cost_bps must be non-negative, got {}",
        self.transaction_cost_bps
      )));
    }
    Ok(())
  }
}

/// Produces target weights from the history available at a decision date.
pub trait TargetAllocator: Debug + Send + Sync {
  /// `history` holds only rows dated on or before the decision date.
  fn target(&self, history: &ReturnTable) -> Result<Portfolio>;
}

/// Re-estimates moments on the history, rebuilds the frontier and applies a policy.
#[derive(ImplNew, Clone, Debug)]
pub struct MeanVarianceTarget {
  pub optimizer: FrontierOptimizer,
  pub constraints: Constraints,
  pub policy: AllocationPolicy,
  pub periods_per_year: f64,
  /// Expected-return overrides replacing the historical mean.
  pub forecast: Option<Vec<f64>>,
}

impl TargetAllocator for MeanVarianceTarget {
  fn target(&self, history: &ReturnTable) -> Result<Portfolio> {
    let mut estimate = MomentEstimate::historical(history, self.periods_per_year)?;
    if let Some(f) = &self.forecast {
      estimate = estimate.with_forecast(f)?;
    }
    let frontier = self.optimizer.compute_frontier(&estimate, &self.constraints)?;
    select(&frontier, self.policy, self.optimizer.options().risk_free_rate)
  }
}

#[derive(Clone, Debug)]
pub enum Strategy {
  /// Fixed target weights, restored at every rebalance.
  Static(Portfolio),
  /// Target recomputed at every rebalance from trailing history.
  Dynamic {
    allocator: Arc<dyn TargetAllocator>,
    /// Trailing rows handed to the allocator; `None` for all available history.
    lookback: Option<usize>,
  },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
  pub date: NaiveDate,
  /// `sum |target - drifted|`.
  pub turnover: f64,
  /// Cost deducted from the portfolio value.
  pub cost: f64,
  /// Weights after the rebalance.
  pub weights: Vec<f64>,
}

/// Value path of one simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
  pub symbols: Vec<String>,
  pub initial_value: f64,
  pub initial_weights: Vec<f64>,
  /// Portfolio value at each trading date's close, after any rebalance cost.
  pub points: Vec<(NaiveDate, f64)>,
  pub rebalances: Vec<RebalanceEvent>,
  /// Drifted weights after the last step.
  pub final_weights: Vec<f64>,
  /// Cells filled under [`GapPolicy::ForwardFill`].
  pub forward_filled: usize,
}

impl BacktestResult {
  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  pub fn dates(&self) -> Vec<NaiveDate> {
    self.points.iter().map(|(d, _)| *d).collect()
  }

  pub fn values(&self) -> Vec<f64> {
    self.points.iter().map(|(_, v)| *v).collect()
  }

  pub fn final_value(&self) -> f64 {
    self.points.last().map_or(self.initial_value, |(_, v)| *v)
  }

  /// Simple period returns, the first measured against `initial_value`.
  pub fn period_returns(&self) -> Vec<f64> {
    let mut prev = self.initial_value;
    self
      .points
      .iter()
      .map(|(_, v)| {
        let r = v / prev - 1.0;
        prev = *v;
        r
      })
      .collect()
  }

  pub fn total_turnover(&self) -> f64 {
    self.rebalances.iter().map(|e| e.turnover).sum()
  }

  pub fn total_cost(&self) -> f64 {
    self.rebalances.iter().map(|e| e.cost).sum()
  }
}

#[derive(Clone, Debug, Default)]
pub struct BacktestEngine {
  config: BacktestConfig,
}

impl BacktestEngine {
  pub fn new(config: BacktestConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &BacktestConfig {
    &self.config
  }

  /// Align `series` with the configured gap policy, then [`Self::run`].
  pub fn run_series(
    &self,
    strategy: &Strategy,
    series: &[ReturnSeries],
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<BacktestResult> {
    let table = ReturnTable::from_returns(series, self.config.gap_policy)?;
    self.run(strategy, &table, start, end)
  }

  /// Convert prices to returns with the configured gap policy, then [`Self::run`].
  pub fn run_prices(
    &self,
    strategy: &Strategy,
    prices: &[PriceSeries],
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<BacktestResult> {
    let table = ReturnTable::from_prices(prices, self.config.gap_policy)?;
    self.run(strategy, &table, start, end)
  }

  pub fn run(&self, strategy: &Strategy, table: &ReturnTable, start: NaiveDate, end: NaiveDate) -> Result<BacktestResult> {
    self.run_with_cancel(strategy, table, start, end, &CancelFlag::new())
  }

  /// Simulate `strategy` over the rows of `table` dated within `[start, end]`.
  pub fn run_with_cancel(
    &self,
    strategy: &Strategy,
    table: &ReturnTable,
    start: NaiveDate,
    end: NaiveDate,
    cancel: &CancelFlag,
  ) -> Result<BacktestResult> {
    self.config.validate()?;
    let (first, last) = table.range_indices(start, end)?;
    let dates = table.dates();

    let initial = match strategy {
      Strategy::Static(p) => p.clone(),
      Strategy::Dynamic { allocator, lookback } => {
        let history = table.history_before(first, *lookback);
        if history.is_empty() {
          return Err(PortfolioError::config(format!(
            "dynamic strategy has no history before {start}"
          )));
        }
        allocator.target(&history)?
      }
    };
    let initial_weights = align_weights(&initial, table.symbols())?;

    let initial_value = 1.0;
    let mut value = initial_value;
    let mut holdings: Vec<f64> = initial_weights.iter().map(|w| w * value).collect();
    let mut points = Vec::with_capacity(last - first + 1);
    let mut rebalances = Vec::new();
    let bps = self.config.transaction_cost_bps;

    for t in first..=last {
      cancel.check()?;
      let date = dates[t];
      for (h, r) in holdings.iter_mut().zip(table.row(t)) {
        *h *= 1.0 + r;
      }
      value = holdings.iter().sum();
      if !value.is_finite() {
        return Err(PortfolioError::config(format!("portfolio value is not finite on {date}")));
      }

      let next = (t < last).then(|| dates[t + 1]);
      if self.config.rebalance.is_period_end(date, next) {
        if value.abs() < 1e-12 {
          return Err(PortfolioError::config(format!("portfolio value wiped out on {date}")));
        }
        let target = match strategy {
          Strategy::Static(_) => initial_weights.clone(),
          Strategy::Dynamic { allocator, lookback } => {
            let history = table.history_before(t + 1, *lookback);
            align_weights(&allocator.target(&history)?, table.symbols())?
          }
        };
        let turnover: f64 = target
          .iter()
          .zip(&holdings)
          .map(|(w, h)| (w - h / value).abs())
          .sum();
        let cost = value * turnover * bps / 1e4;
        value -= cost;
        holdings = target.iter().map(|w| w * value).collect();
        tracing::debug!(%date, turnover, cost, "rebalanced");
        rebalances.push(RebalanceEvent {
          date,
          turnover,
          cost,
          weights: target,
        });
      }
      points.push((date, value));
    }

    let final_weights = if value.abs() > 1e-12 {
      holdings.iter().map(|h| h / value).collect()
    } else {
      vec![0.0; holdings.len()]
    };

    tracing::info!(
      start = %dates[first],
      end = %dates[last],
      days = points.len(),
      rebalances = rebalances.len(),
      final_value = value,
      "backtest finished"
    );

    Ok(BacktestResult {
      symbols: table.symbols().to_vec(),
      initial_value,
      initial_weights,
      points,
      rebalances,
      final_weights,
      forward_filled: table.forward_filled(),
    })
  }
}

/// Weights of `portfolio` reordered to `symbols`.
fn align_weights(portfolio: &Portfolio, symbols: &[String]) -> Result<Vec<f64>> {
  if portfolio.len() != symbols.len() {
    return Err(PortfolioError::config(format!(
      "portfolio has {} weights for {} assets",
      portfolio.len(),
      symbols.len()
    )));
  }
  if portfolio.symbols == symbols {
    return Ok(portfolio.weights.clone());
  }
  symbols
    .iter()
    .map(|s| {
      portfolio
        .weight_of(s)
        .ok_or_else(|| PortfolioError::config(format!("portfolio has no weight for {s}")))
    })
    .collect()
}
