//! Pipeline configuration, loaded from JSON with every field defaulted.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::backtest::BacktestConfig;
use crate::backtest::RebalanceFrequency;
use crate::data::GapPolicy;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::performance::PerformanceAnalyzer;
use crate::portfolio::AllocationPolicy;
use crate::portfolio::Constraints;
use crate::portfolio::FrontierOptions;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
  /// Annual risk-free rate for tangency and Sharpe.
  pub risk_free_rate: f64,
  pub rebalance_frequency: RebalanceFrequency,
  /// Sampled frontier points.
  pub n_points: usize,
  pub constraints: Constraints,
  pub policy: AllocationPolicy,
  pub periods_per_year: f64,
  /// Trailing rows used for estimation. `None` estimates once on all history
  /// before the start date and holds that allocation; `Some(n)` re-optimizes at
  /// every rebalance on the last `n` rows.
  pub lookback: Option<usize>,
  pub gap_policy: GapPolicy,
  pub transaction_cost_bps: f64,
  pub ridge: Option<f64>,
  pub singular_tolerance: f64,
  /// Benchmark weights by symbol, e.g. `{"SPY": 0.6, "BND": 0.4}`.
  pub benchmark: Option<BTreeMap<String, f64>>,
  /// Annualized expected-return forecasts overriding the historical mean.
  pub forecast_returns: Option<BTreeMap<String, f64>>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      risk_free_rate: 0.02,
      rebalance_frequency: RebalanceFrequency::Monthly,
      n_points: 20,
      constraints: Constraints::long_only(),
      policy: AllocationPolicy::MaxSharpe,
      periods_per_year: 252.0,
      lookback: None,
      gap_policy: GapPolicy::Fail,
      transaction_cost_bps: 0.0,
      ridge: None,
      singular_tolerance: 1e-12,
      benchmark: None,
      forecast_returns: None,
    }
  }
}

impl PipelineConfig {
  pub fn from_json(text: &str) -> Result<Self> {
    let config: Self =
      serde_json::from_str(text).map_err(|e| PortfolioError::config(format!("invalid config: {e}")))?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| PortfolioError::config(format!("cannot read config {}: {e}", path.display())))?;
    Self::from_json(&text)
  }

  pub fn validate(&self) -> Result<()> {
    self.frontier_options().validate()?;
    self.backtest_config().validate()?;
    if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
      return Err(PortfolioError::config("periods_per_year must be positive"));
    }
    if let Some(n) = self.lookback {
      if n < 2 {
        return Err(PortfolioError::config(format!("lookback must be at least 2 rows, got {n}")));
      }
    }
    if let Some(b) = &self.benchmark {
      if b.is_empty() || b.values().any(|w| !w.is_finite()) {
        return Err(PortfolioError::config("benchmark weights must be finite and non-empty"));
      }
      let total: f64 = b.values().sum();
      if (total - 1.0).abs() > crate::portfolio::types::WEIGHT_SUM_TOLERANCE {
        return Err(PortfolioError::config(format!("benchmark weights sum to {total}")));
      }
    }
    if let Some(f) = &self.forecast_returns {
      if f.values().any(|r| !r.is_finite()) {
        return Err(PortfolioError::config("forecast returns must be finite"));
      }
    }
    Ok(())
  }

  pub fn frontier_options(&self) -> FrontierOptions {
    FrontierOptions {
      n_points: self.n_points,
      risk_free_rate: self.risk_free_rate,
      ridge: self.ridge,
      singular_tolerance: self.singular_tolerance,
    }
  }

  pub fn backtest_config(&self) -> BacktestConfig {
    BacktestConfig {
      rebalance: self.rebalance_frequency,
      gap_policy: self.gap_policy,
      transaction_cost_bps: self.transaction_cost_bps,
    }
  }

  pub fn analyzer(&self) -> PerformanceAnalyzer {
    PerformanceAnalyzer::new(self.risk_free_rate, self.periods_per_year)
  }

  /// Forecasts ordered like `symbols`; every symbol needs one and no extras are allowed.
  pub fn forecast_for(&self, symbols: &[String]) -> Result<Option<Vec<f64>>> {
    let Some(map) = &self.forecast_returns else {
      return Ok(None);
    };
    if let Some(extra) = map.keys().find(|k| !symbols.contains(k)) {
      return Err(PortfolioError::config(format!("forecast for unknown symbol {extra}")));
    }
    symbols
      .iter()
      .map(|s| {
        map
          .get(s)
          .copied()
          .ok_or_else(|| PortfolioError::config(format!("missing forecast for {s}")))
      })
      .collect::<Result<Vec<_>>>()
      .map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_json_gives_defaults() {
    let config = PipelineConfig::from_json("{}").unwrap();
    assert_eq!(config, PipelineConfig::default());
    assert_eq!(config.rebalance_frequency, RebalanceFrequency::Monthly);
    assert!(config.constraints.long_only);
  }

  #[test]
  fn parses_nested_fields() {
    let text = r#"{
      "risk_free_rate": 0.03,
      "rebalance_frequency": "quarterly",
      "policy": {"kind": "target_return", "value": 0.08},
      "constraints": {"long_only": true, "upper": [0.6, 0.6, 0.6]},
      "lookback": 126,
      "gap_policy": "forward_fill",
      "benchmark": {"SPY": 0.6, "BND": 0.4}
    }"#;
    let config = PipelineConfig::from_json(text).unwrap();
    assert_eq!(config.policy, AllocationPolicy::TargetReturn(0.08));
    assert_eq!(config.constraints.upper, Some(vec![0.6; 3]));
    assert_eq!(config.lookback, Some(126));
    assert_eq!(config.gap_policy, GapPolicy::ForwardFill);
    assert_eq!(config.backtest_config().rebalance, RebalanceFrequency::Quarterly);
  }

  #[test]
  fn rejects_bad_values() {
    assert!(PipelineConfig::from_json(r#"{"n_points": 1}"#).is_err());
    assert!(PipelineConfig::from_json(r#"{"transaction_cost_bps": -1}"#).is_err());
    assert!(PipelineConfig::from_json(r#"{"benchmark": {"SPY": 0.5}}"#).is_err());
    assert!(PipelineConfig::from_json(r#"{"unknown": 1}"#).is_err());
    assert!(PipelineConfig::from_json(r#"{"ridge": 0.0}"#).is_err());
  }

  #[test]
  fn forecasts_follow_symbol_order() {
    let config = PipelineConfig {
      forecast_returns: Some([("B".to_string(), 0.05), ("A".to_string(), 0.1)].into()),
      ..PipelineConfig::default()
    };
    let symbols = vec!["A".to_string(), "B".to_string()];
    assert_eq!(config.forecast_for(&symbols).unwrap(), Some(vec![0.1, 0.05]));
    assert!(config.forecast_for(&symbols[..1]).is_err());
  }
}
