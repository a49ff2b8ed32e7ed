//! # Pipeline
//!
//! $$
//! \text{prices} \to (\hat\mu,\hat\Sigma) \to \text{frontier} \to \mathbf w
//! \to V_t \to \text{metrics}
//! $$
//!
//! End-to-end run from aligned returns to a performance report.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::backtest::run_batch;
use crate::backtest::BacktestConfig;
use crate::backtest::BacktestEngine;
use crate::backtest::BacktestJob;
use crate::backtest::BacktestResult;
use crate::backtest::MeanVarianceTarget;
use crate::backtest::BatchOutcome;
use crate::backtest::RebalanceFrequency;
use crate::backtest::Strategy;
use crate::config::PipelineConfig;
use crate::data::PriceSeries;
use crate::data::ReturnTable;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::estimation::MomentEstimate;
use crate::performance::return_series;
use crate::performance::PerformanceReport;
use crate::portfolio::select;
use crate::portfolio::CancelFlag;
use crate::portfolio::Frontier;
use crate::portfolio::FrontierCache;
use crate::portfolio::FrontierKey;
use crate::portfolio::FrontierOptimizer;
use crate::portfolio::Portfolio;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
  /// Frontier on the history before the start date.
  pub frontier: Frontier,
  /// Allocation selected from `frontier`.
  pub portfolio: Portfolio,
  pub backtest: BacktestResult,
  pub report: PerformanceReport,
  pub benchmark_report: Option<PerformanceReport>,
}

struct Allocation {
  frontier: Arc<Frontier>,
  portfolio: Portfolio,
  strategy: Strategy,
}

#[derive(Clone, Debug)]
pub struct Pipeline {
  config: PipelineConfig,
  cache: Arc<FrontierCache>,
  cancel: CancelFlag,
}

impl Pipeline {
  pub fn new(config: PipelineConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      config,
      cache: Arc::new(FrontierCache::new()),
      cancel: CancelFlag::new(),
    })
  }

  /// Share a frontier cache with other pipelines.
  pub fn with_cache(mut self, cache: Arc<FrontierCache>) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn cache(&self) -> &Arc<FrontierCache> {
    &self.cache
  }

  /// Align `prices` with the configured gap policy, then [`Self::run`].
  pub fn run_prices(&self, prices: &[PriceSeries], start: NaiveDate, end: NaiveDate) -> Result<PipelineOutput> {
    let table = ReturnTable::from_prices(prices, self.config.gap_policy)?;
    self.run(&table, start, end)
  }

  pub fn run(&self, table: &ReturnTable, start: NaiveDate, end: NaiveDate) -> Result<PipelineOutput> {
    let cfg = &self.config;
    let Allocation {
      frontier,
      portfolio,
      strategy,
    } = self.allocate(table, start, end)?;

    let engine = BacktestEngine::new(cfg.backtest_config());
    let backtest = engine.run_with_cancel(&strategy, table, start, end, &self.cancel)?;
    let analyzer = cfg.analyzer();

    let (report, benchmark_report) = match &cfg.benchmark {
      None => (analyzer.analyze(&backtest)?, None),
      Some(weights) => {
        let bench = self.benchmark_portfolio(weights, table.symbols())?;
        let bench_result = engine.run_with_cancel(&Strategy::Static(bench), table, start, end, &self.cancel)?;
        let series = return_series(&bench_result, "benchmark")?;
        (
          analyzer.analyze_with_benchmark(&backtest, &series)?,
          Some(analyzer.analyze(&bench_result)?),
        )
      }
    };

    tracing::info!(
      total_return = report.total_return,
      sharpe = report.sharpe_ratio.unwrap_or(f64::NAN),
      max_drawdown = report.max_drawdown,
      "pipeline finished"
    );

    Ok(PipelineOutput {
      frontier: (*frontier).clone(),
      portfolio,
      backtest,
      report,
      benchmark_report,
    })
  }

  /// Run the configured strategy once per rebalancing frequency, in parallel.
  /// Outcomes keep the order of `frequencies`; a failing run does not stop
  /// the others.
  pub fn compare_rebalancing(
    &self,
    table: &ReturnTable,
    start: NaiveDate,
    end: NaiveDate,
    frequencies: &[RebalanceFrequency],
  ) -> Result<Vec<BatchOutcome>> {
    let Allocation { strategy, .. } = self.allocate(table, start, end)?;
    let jobs: Vec<BacktestJob> = frequencies
      .iter()
      .map(|&freq| {
        BacktestJob::new(
          freq.to_string(),
          strategy.clone(),
          BacktestConfig {
            rebalance: freq,
            ..self.config.backtest_config()
          },
          start,
          end,
        )
      })
      .collect();
    Ok(run_batch(&jobs, table, &self.cancel))
  }

  /// Frontier and allocation on the history before `start`, and the
  /// strategy the backtest follows from there.
  fn allocate(&self, table: &ReturnTable, start: NaiveDate, end: NaiveDate) -> Result<Allocation> {
    let cfg = &self.config;
    let (first, _) = table.range_indices(start, end)?;
    let history = table.history_before(first, cfg.lookback);
    if history.n_periods() < 2 {
      return Err(PortfolioError::config(format!(
        "need at least 2 return observations before {start}, found {}",
        history.n_periods()
      )));
    }

    let forecast = cfg.forecast_for(table.symbols())?;
    let mut estimate = MomentEstimate::historical(&history, cfg.periods_per_year)?;
    if let Some(f) = &forecast {
      estimate = estimate.with_forecast(f)?;
    }

    let options = cfg.frontier_options();
    let optimizer = FrontierOptimizer::new(options.clone());
    let window = (history.dates()[0], history.dates()[history.n_periods() - 1]);
    let key = FrontierKey::new(window, &estimate, &cfg.constraints, &options);
    let frontier = self.cache.get_or_compute(key, || {
      optimizer.compute_frontier_with_cancel(&estimate, &cfg.constraints, &self.cancel)
    })?;
    let portfolio = select(&frontier, cfg.policy, cfg.risk_free_rate)?;
    tracing::info!(
      window_start = %window.0,
      window_end = %window.1,
      expected_return = portfolio.expected_return.unwrap_or(f64::NAN),
      volatility = portfolio.volatility.unwrap_or(f64::NAN),
      "allocation selected"
    );

    let strategy = match cfg.lookback {
      None => Strategy::Static(portfolio.clone()),
      Some(n) => Strategy::Dynamic {
        allocator: Arc::new(MeanVarianceTarget::new(
          optimizer,
          cfg.constraints.clone(),
          cfg.policy,
          cfg.periods_per_year,
          forecast,
        )),
        lookback: Some(n),
      },
    };
    Ok(Allocation {
      frontier,
      portfolio,
      strategy,
    })
  }

  fn benchmark_portfolio(
    &self,
    weights: &std::collections::BTreeMap<String, f64>,
    symbols: &[String],
  ) -> Result<Portfolio> {
    if let Some(unknown) = weights.keys().find(|k| !symbols.contains(k)) {
      return Err(PortfolioError::BenchmarkMismatch(format!(
        "benchmark symbol {unknown} is not in the price data"
      )));
    }
    let w: Vec<f64> = symbols
      .iter()
      .map(|s| weights.get(s).copied().unwrap_or(0.0))
      .collect();
    let long_only = w.iter().all(|x| *x >= 0.0);
    Portfolio::from_weights(symbols.to_vec(), w, long_only)
  }
}
