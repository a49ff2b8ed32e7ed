//! # Performance Analyzer
//!
//! $$
//! \text{SR} = \frac{R_{\text{ann}} - r_f}{\sigma_{\text{ann}}},\qquad
//! \text{MDD} = \min_t \left(\frac{V_t}{\max_{s\le t} V_s} - 1\right)
//! $$
//!
//! Risk-adjusted metrics of a backtest value path. Pure functions, nothing is cached.

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::backtest::BacktestResult;
use crate::data::ReturnKind;
use crate::data::ReturnSeries;
use crate::error::PortfolioError;
use crate::error::Result;

/// Trading days per year.
pub const TRADING_DAYS: f64 = 252.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
  pub start: NaiveDate,
  pub end: NaiveDate,
  pub periods: usize,
  pub total_return: f64,
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  /// `None` when volatility is zero.
  pub sharpe_ratio: Option<f64>,
  /// `None` without any losing period.
  pub sortino_ratio: Option<f64>,
  /// Deepest peak-to-trough decline, `<= 0`.
  pub max_drawdown: f64,
  /// `None` without a drawdown.
  pub calmar_ratio: Option<f64>,
  pub win_rate: f64,
  /// Historical one-period value at risk, as a positive loss fraction.
  pub var_95: f64,
  pub var_99: f64,
  /// Mean loss beyond the 95% VaR.
  pub cvar_95: f64,
  /// Mean over standard deviation of active returns; requires a benchmark.
  pub information_ratio: Option<f64>,
  pub total_turnover: f64,
  pub total_cost: f64,
}

fn mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

fn sample_std(xs: &[f64]) -> f64 {
  if xs.len() < 2 {
    return 0.0;
  }
  let m = mean(xs);
  let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
  var.sqrt()
}

/// Peak-to-trough drawdown with the running peak starting at `initial`.
pub fn max_drawdown(initial: f64, values: &[f64]) -> f64 {
  let mut peak = initial;
  let mut worst = 0.0_f64;
  for &v in values {
    peak = peak.max(v);
    if peak > 0.0 {
      worst = worst.min(v / peak - 1.0);
    }
  }
  worst
}

/// Historical VaR and CVaR at `confidence`, as positive losses.
pub fn historical_var(returns: &[f64], confidence: f64) -> (f64, f64) {
  if returns.is_empty() {
    return (0.0, 0.0);
  }
  let mut sorted = returns.to_vec();
  sorted.sort_by(f64::total_cmp);
  let k = (((1.0 - confidence) * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
  (-sorted[k], -mean(&sorted[..=k]))
}

/// Analyzer with a fixed risk-free rate and annualization factor.
#[derive(Clone, Copy, Debug)]
pub struct PerformanceAnalyzer {
  pub risk_free_rate: f64,
  pub periods_per_year: f64,
}

impl Default for PerformanceAnalyzer {
  fn default() -> Self {
    Self {
      risk_free_rate: 0.02,
      periods_per_year: TRADING_DAYS,
    }
  }
}

impl PerformanceAnalyzer {
  pub fn new(risk_free_rate: f64, periods_per_year: f64) -> Self {
    Self {
      risk_free_rate,
      periods_per_year,
    }
  }

  pub fn analyze(&self, result: &BacktestResult) -> Result<PerformanceReport> {
    if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
      return Err(PortfolioError::config("periods_per_year must be positive"));
    }
    let (Some(first), Some(last)) = (result.points.first(), result.points.last()) else {
      return Err(PortfolioError::config("cannot analyze an empty backtest"));
    };
    if result.initial_value <= 0.0 {
      return Err(PortfolioError::config("initial portfolio value must be positive"));
    }

    let returns = result.period_returns();
    let n = returns.len() as f64;
    let p = self.periods_per_year;
    let rf = self.risk_free_rate;

    let total_return = last.1 / result.initial_value - 1.0;
    let annualized_return = if total_return > -1.0 {
      (1.0 + total_return).powf(p / n) - 1.0
    } else {
      -1.0
    };
    let annualized_volatility = sample_std(&returns) * p.sqrt();
    let sharpe_ratio = (annualized_volatility > 1e-15).then(|| (annualized_return - rf) / annualized_volatility);

    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt() * p.sqrt();
    let sortino_ratio = (downside > 1e-15).then(|| (annualized_return - rf) / downside);

    let max_drawdown = max_drawdown(result.initial_value, &result.values());
    let calmar_ratio = (max_drawdown < 0.0).then(|| annualized_return / max_drawdown.abs());
    let win_rate = returns.iter().filter(|r| **r > 0.0).count() as f64 / n;

    let (var_95, cvar_95) = historical_var(&returns, 0.95);
    let (var_99, _) = historical_var(&returns, 0.99);

    let report = PerformanceReport {
      start: first.0,
      end: last.0,
      periods: returns.len(),
      total_return,
      annualized_return,
      annualized_volatility,
      sharpe_ratio,
      sortino_ratio,
      max_drawdown,
      calmar_ratio,
      win_rate,
      var_95,
      var_99,
      cvar_95,
      information_ratio: None,
      total_turnover: result.total_turnover(),
      total_cost: result.total_cost(),
    };
    check_finite(&report)?;
    Ok(report)
  }

  /// [`Self::analyze`] plus the information ratio against `benchmark`, whose
  /// dates must match the backtest dates exactly.
  pub fn analyze_with_benchmark(&self, result: &BacktestResult, benchmark: &ReturnSeries) -> Result<PerformanceReport> {
    let mut report = self.analyze(result)?;
    let dates = result.dates();
    if benchmark.dates() != dates.as_slice() {
      let first_diff = dates
        .iter()
        .zip(benchmark.dates())
        .find(|(a, b)| a != b)
        .map(|(a, _)| a.to_string())
        .unwrap_or_else(|| format!("{} vs {} observations", dates.len(), benchmark.len()));
      return Err(PortfolioError::BenchmarkMismatch(format!(
        "benchmark {} does not match backtest dates ({first_diff})",
        benchmark.symbol()
      )));
    }

    let active: Vec<f64> = result
      .period_returns()
      .iter()
      .zip(benchmark.simple_values())
      .map(|(p, b)| p - b)
      .collect();
    let te = sample_std(&active);
    report.information_ratio = (te > 1e-15).then(|| mean(&active) / te);
    Ok(report)
  }
}

/// Metrics with the default 252-period year.
pub fn analyze(result: &BacktestResult, risk_free_rate: f64) -> Result<PerformanceReport> {
  PerformanceAnalyzer::new(risk_free_rate, TRADING_DAYS).analyze(result)
}

pub fn analyze_with_benchmark(
  result: &BacktestResult,
  risk_free_rate: f64,
  benchmark: &ReturnSeries,
) -> Result<PerformanceReport> {
  PerformanceAnalyzer::new(risk_free_rate, TRADING_DAYS).analyze_with_benchmark(result, benchmark)
}

/// Daily simple returns of a backtest as a series, e.g. to serve as a benchmark.
pub fn return_series(result: &BacktestResult, symbol: &str) -> Result<ReturnSeries> {
  ReturnSeries::new(symbol, result.dates(), result.period_returns(), ReturnKind::Simple)
}

fn check_finite(report: &PerformanceReport) -> Result<()> {
  let scalars = [
    report.total_return,
    report.annualized_return,
    report.annualized_volatility,
    report.max_drawdown,
    report.win_rate,
    report.var_95,
    report.var_99,
    report.cvar_95,
  ];
  let optional = [
    report.sharpe_ratio,
    report.sortino_ratio,
    report.calmar_ratio,
    report.information_ratio,
  ];
  if scalars.iter().chain(optional.iter().flatten()).all(|v| v.is_finite()) {
    Ok(())
  } else {
    Err(PortfolioError::config("performance metrics are not finite"))
  }
}
