//! Independent backtests over one return table, run in parallel. The
//! pipeline's rebalancing comparison (`frontier --compare`) is built on it.

use chrono::NaiveDate;
use impl_new_derive::ImplNew;
use rayon::prelude::*;

use super::engine::BacktestConfig;
use super::engine::BacktestEngine;
use super::engine::BacktestResult;
use super::engine::Strategy;
use crate::data::ReturnTable;
use crate::error::Result;
use crate::portfolio::CancelFlag;

/// One independent scenario of a batch.
#[derive(ImplNew, Clone, Debug)]
pub struct BacktestJob {
  pub name: String,
  pub strategy: Strategy,
  pub config: BacktestConfig,
  pub start: NaiveDate,
  pub end: NaiveDate,
}

#[derive(Debug)]
pub struct BatchOutcome {
  pub name: String,
  pub result: Result<BacktestResult>,
}

/// Run `jobs` in parallel over a shared table. Outcomes keep job order and a
/// failing job does not stop the others.
pub fn run_batch(jobs: &[BacktestJob], table: &ReturnTable, cancel: &CancelFlag) -> Vec<BatchOutcome> {
  tracing::info!(jobs = jobs.len(), "running backtest batch");
  jobs
    .par_iter()
    .map(|job| {
      let result = BacktestEngine::new(job.config.clone()).run_with_cancel(&job.strategy, table, job.start, job.end, cancel);
      if let Err(err) = &result {
        tracing::warn!(job = %job.name, %err, "backtest job failed");
      }
      BatchOutcome {
        name: job.name.clone(),
        result,
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backtest::schedule::weekdays;
  use crate::backtest::schedule::RebalanceFrequency;
  use crate::error::PortfolioError;
  use crate::portfolio::Portfolio;

  #[test]
  fn batch_matches_sequential_runs() {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let dates = weekdays(start, 100);
    let rows = (0..100)
      .map(|i| vec![0.001 * ((i % 5) as f64 - 2.0), 0.0004])
      .collect();
    let table = ReturnTable::new(vec!["A".into(), "B".into()], dates, rows).unwrap();
    let end = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();

    let jobs: Vec<BacktestJob> = [
      RebalanceFrequency::None,
      RebalanceFrequency::Weekly,
      RebalanceFrequency::Monthly,
      RebalanceFrequency::Quarterly,
    ]
    .into_iter()
    .map(|freq| {
      BacktestJob::new(
        freq.to_string(),
        Strategy::Static(Portfolio::from_weights(vec!["A".into(), "B".into()], vec![0.5, 0.5], true).unwrap()),
        BacktestConfig {
          rebalance: freq,
          ..BacktestConfig::default()
        },
        start,
        end,
      )
    })
    .chain(std::iter::once(BacktestJob::new(
      "bad".into(),
      Strategy::Static(Portfolio::equal_weight(vec!["A".into()])),
      BacktestConfig::default(),
      start,
      end,
    )))
    .collect();

    let outcomes = run_batch(&jobs, &table, &CancelFlag::new());
    assert_eq!(outcomes.len(), 5);
    for (job, outcome) in jobs.iter().zip(&outcomes).take(4) {
      assert_eq!(job.name, outcome.name);
      let sequential = BacktestEngine::new(job.config.clone())
        .run(&job.strategy, &table, start, end)
        .unwrap();
      assert_eq!(outcome.result.as_ref().unwrap(), &sequential);
    }
    assert!(matches!(outcomes[4].result, Err(PortfolioError::ConfigurationError(_))));
  }
}
