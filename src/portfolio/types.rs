//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Constraint sets, portfolios, frontier points and allocation policies.

use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;

/// Tolerance on `sum(w) = 1` before weights are renormalized.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Long-only weights above this (negative) level are treated as zero.
pub const LONG_ONLY_SLACK: f64 = 1e-9;

/// Stand-in for an infinite bound when a finite box is required.
pub const WEIGHT_CAP: f64 = 1e3;

/// Constraint set of the allocation problem. Weights always sum to one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
  /// Forbid negative weights.
  pub long_only: bool,
  /// Per-asset lower bounds.
  pub lower: Option<Vec<f64>>,
  /// Per-asset upper bounds.
  pub upper: Option<Vec<f64>>,
}

impl Default for Constraints {
  fn default() -> Self {
    Self::long_only()
  }
}

impl Constraints {
  pub fn long_only() -> Self {
    Self {
      long_only: true,
      lower: None,
      upper: None,
    }
  }

  /// Only the budget constraint; shorting and leverage allowed.
  pub fn unconstrained() -> Self {
    Self {
      long_only: false,
      lower: None,
      upper: None,
    }
  }

  pub fn with_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
    self.lower = Some(lower);
    self.upper = Some(upper);
    self
  }

  /// Resolve into explicit per-asset bounds for `n` assets.
  pub fn resolve(&self, n: usize) -> Result<Bounds> {
    let pick = |v: &Option<Vec<f64>>, default: f64, name: &str| -> Result<Vec<f64>> {
      match v {
        Some(b) if b.len() != n => Err(PortfolioError::config(format!(
          "{name} bounds have {} entries for {n} assets",
          b.len()
        ))),
        Some(b) if b.iter().any(|x| x.is_nan()) => {
          Err(PortfolioError::config(format!("{name} bounds contain NaN")))
        }
        Some(b) => Ok(b.clone()),
        None => Ok(vec![default; n]),
      }
    };

    let mut lower = pick(&self.lower, f64::NEG_INFINITY, "lower")?;
    let upper = pick(&self.upper, f64::INFINITY, "upper")?;
    if self.long_only {
      for l in &mut lower {
        *l = l.max(0.0);
      }
    }

    if let Some(i) = (0..n).find(|&i| lower[i] > upper[i]) {
      return Err(PortfolioError::InfeasibleConstraints(format!(
        "asset {i}: lower bound {} exceeds upper bound {}",
        lower[i], upper[i]
      )));
    }
    let sum_lower: f64 = lower.iter().sum();
    let sum_upper: f64 = upper.iter().sum();
    if sum_lower > 1.0 + 1e-12 || sum_upper < 1.0 - 1e-12 {
      return Err(PortfolioError::InfeasibleConstraints(format!(
        "bounds admit no fully invested portfolio (sum lower {sum_lower}, sum upper {sum_upper})"
      )));
    }

    Ok(Bounds {
      lower,
      upper,
      long_only: self.long_only,
    })
  }
}

/// Per-asset box `lower <= w <= upper`, infinities where unbounded.
#[derive(Clone, Debug, PartialEq)]
pub struct Bounds {
  pub lower: Vec<f64>,
  pub upper: Vec<f64>,
  pub long_only: bool,
}

impl Bounds {
  pub fn unbounded(n: usize) -> Self {
    Self {
      lower: vec![f64::NEG_INFINITY; n],
      upper: vec![f64::INFINITY; n],
      long_only: false,
    }
  }

  pub fn len(&self) -> usize {
    self.lower.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lower.is_empty()
  }

  /// Whether any bound is finite.
  pub fn is_bounded(&self) -> bool {
    self
      .lower
      .iter()
      .chain(self.upper.iter())
      .any(|b| b.is_finite())
  }

  /// Infinite bounds replaced by `±WEIGHT_CAP`.
  pub fn capped(&self) -> (Vec<f64>, Vec<f64>) {
    (
      self.lower.iter().map(|l| l.max(-WEIGHT_CAP)).collect(),
      self.upper.iter().map(|u| u.min(WEIGHT_CAP)).collect(),
    )
  }
}

/// Enforce `sum(w) = 1` and, for long-only, `w >= 0`.
///
/// Sums that drift past [`WEIGHT_SUM_TOLERANCE`] are renormalized.
pub fn normalize_weights(mut w: Vec<f64>, long_only: bool) -> Result<Vec<f64>> {
  if w.iter().any(|x| !x.is_finite()) {
    return Err(PortfolioError::config("weights contain non-finite values"));
  }
  if long_only {
    if let Some(x) = w.iter().find(|x| **x < -LONG_ONLY_SLACK) {
      return Err(PortfolioError::InfeasibleConstraints(format!(
        "negative weight {x} in a long-only portfolio"
      )));
    }
    for x in &mut w {
      *x = x.max(0.0);
    }
  }
  let total: f64 = w.iter().sum();
  if total.abs() < 1e-12 {
    return Err(PortfolioError::config("weights sum to zero"));
  }
  if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
    for x in &mut w {
      *x /= total;
    }
  }
  Ok(w)
}

/// Weight vector over the asset universe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
  pub symbols: Vec<String>,
  pub weights: Vec<f64>,
  /// Model expected return, when the portfolio came from an optimizer.
  pub expected_return: Option<f64>,
  /// Model volatility, when the portfolio came from an optimizer.
  pub volatility: Option<f64>,
}

impl Portfolio {
  /// User-specified weights. The sum must already be one within tolerance.
  pub fn from_weights(symbols: Vec<String>, weights: Vec<f64>, long_only: bool) -> Result<Self> {
    if symbols.len() != weights.len() {
      return Err(PortfolioError::config(format!(
        "{} weights for {} symbols",
        weights.len(),
        symbols.len()
      )));
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
      return Err(PortfolioError::config(format!("weights sum to {total}, expected 1")));
    }
    Ok(Self {
      symbols,
      weights: normalize_weights(weights, long_only)?,
      expected_return: None,
      volatility: None,
    })
  }

  /// Equal weights across `symbols`.
  pub fn equal_weight(symbols: Vec<String>) -> Self {
    let n = symbols.len().max(1);
    Self {
      weights: vec![1.0 / n as f64; symbols.len()],
      symbols,
      expected_return: None,
      volatility: None,
    }
  }

  pub(crate) fn from_point(symbols: &[String], point: &FrontierPoint, long_only: bool) -> Result<Self> {
    Ok(Self {
      symbols: symbols.to_vec(),
      weights: normalize_weights(point.weights.clone(), long_only)?,
      expected_return: Some(point.expected_return),
      volatility: Some(point.volatility()),
    })
  }

  pub fn len(&self) -> usize {
    self.weights.len()
  }

  pub fn is_empty(&self) -> bool {
    self.weights.is_empty()
  }

  pub fn weight_of(&self, symbol: &str) -> Option<f64> {
    self
      .symbols
      .iter()
      .position(|s| s == symbol)
      .map(|i| self.weights[i])
  }

  /// Model Sharpe ratio; `None` without model moments or with zero volatility.
  pub fn sharpe(&self, risk_free: f64) -> Option<f64> {
    match (self.expected_return, self.volatility) {
      (Some(r), Some(v)) if v > 1e-15 => Some((r - risk_free) / v),
      _ => None,
    }
  }
}

/// One solved point of the efficient frontier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
  /// Requested return (equals `expected_return` for return-constrained solves).
  pub target_return: f64,
  /// Achieved `w^T mu`.
  pub expected_return: f64,
  /// Minimal variance `w^T S w`.
  pub variance: f64,
  pub weights: Vec<f64>,
}

impl FrontierPoint {
  pub fn volatility(&self) -> f64 {
    self.variance.max(0.0).sqrt()
  }

  pub fn sharpe(&self, risk_free: f64) -> Option<f64> {
    let vol = self.volatility();
    if vol > 1e-15 {
      Some((self.expected_return - risk_free) / vol)
    } else {
      None
    }
  }
}

/// Efficient frontier sampled at increasing target returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
  pub symbols: Vec<String>,
  /// Points ordered by strictly increasing target return.
  pub points: Vec<FrontierPoint>,
  /// Global minimum-variance portfolio.
  pub min_variance: FrontierPoint,
  /// Maximum-Sharpe portfolio for `risk_free_rate`.
  pub tangency: FrontierPoint,
  pub risk_free_rate: f64,
  pub long_only: bool,
  /// Ridge added to the covariance diagonal, if the matrix was near-singular.
  pub regularization: Option<f64>,
}

impl Frontier {
  pub fn min_return(&self) -> f64 {
    self.points.first().map_or(f64::NAN, |p| p.target_return)
  }

  pub fn max_return(&self) -> f64 {
    self.points.last().map_or(f64::NAN, |p| p.target_return)
  }

  /// `(min, max)` volatility over the sampled points.
  pub fn volatility_range(&self) -> (f64, f64) {
    self
      .points
      .iter()
      .map(FrontierPoint::volatility)
      .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
  }
}

/// Rule for picking one portfolio off the frontier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AllocationPolicy {
  /// Tangency portfolio.
  #[default]
  MaxSharpe,
  /// Frontier point nearest to the target return.
  TargetReturn(f64),
  /// Frontier point whose variance is nearest to `sigma^2`.
  TargetRisk(f64),
}

impl FromStr for AllocationPolicy {
  type Err = PortfolioError;

  /// `max-sharpe`, `target-return:<r>` or `target-risk:<sigma>`.
  fn from_str(s: &str) -> Result<Self> {
    let lower = s.trim().to_lowercase();
    let (name, arg) = match lower.split_once(':') {
      Some((n, a)) => (n.trim(), Some(a.trim())),
      None => (lower.as_str(), None),
    };
    let value = || -> Result<f64> {
      arg
        .ok_or_else(|| PortfolioError::config(format!("policy {name} needs a value")))?
        .parse::<f64>()
        .map_err(|e| PortfolioError::config(format!("policy {name}: {e}")))
    };
    match name {
      "max-sharpe" | "max_sharpe" | "tangency" => Ok(Self::MaxSharpe),
      "target-return" | "target_return" => Ok(Self::TargetReturn(value()?)),
      "target-risk" | "target_risk" => Ok(Self::TargetRisk(value()?)),
      other => Err(PortfolioError::config(format!("unknown allocation policy {other}"))),
    }
  }
}

/// Cooperative cancellation shared between a caller and long-running sampling.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Relaxed);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }

  pub(crate) fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(PortfolioError::Cancelled)
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn long_only_resolves_to_zero_lower_bounds() {
    let b = Constraints::long_only().resolve(3).unwrap();
    assert_eq!(b.lower, vec![0.0; 3]);
    assert!(b.upper.iter().all(|u| u.is_infinite()));
    assert!(b.is_bounded());
    assert!(!Constraints::unconstrained().resolve(3).unwrap().is_bounded());
  }

  #[test]
  fn infeasible_bounds_are_reported() {
    let c = Constraints::long_only().with_bounds(vec![0.5, 0.6], vec![1.0, 1.0]);
    assert!(matches!(c.resolve(2), Err(PortfolioError::InfeasibleConstraints(_))));

    let c = Constraints::long_only().with_bounds(vec![0.0, 0.0], vec![0.3, 0.3]);
    assert!(matches!(c.resolve(2), Err(PortfolioError::InfeasibleConstraints(_))));

    let c = Constraints::long_only().with_bounds(vec![0.0], vec![1.0]);
    assert!(matches!(c.resolve(2), Err(PortfolioError::ConfigurationError(_))));
  }

  #[test]
  fn normalization_only_kicks_in_past_tolerance() {
    let w = normalize_weights(vec![0.5, 0.5 + 1e-8], true).unwrap();
    assert_eq!(w[1], 0.5 + 1e-8);

    let w = normalize_weights(vec![0.5, 0.6], true).unwrap();
    assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);

    let w = normalize_weights(vec![1.0 + 1e-10, -1e-10], true).unwrap();
    assert_eq!(w[1], 0.0);

    assert!(normalize_weights(vec![1.1, -0.1], true).is_err());
    assert!(normalize_weights(vec![1.1, -0.1], false).is_ok());
  }

  #[test]
  fn policy_parses_from_cli_strings() {
    assert_eq!("max-sharpe".parse::<AllocationPolicy>().unwrap(), AllocationPolicy::MaxSharpe);
    assert_eq!(
      "target-return:0.12".parse::<AllocationPolicy>().unwrap(),
      AllocationPolicy::TargetReturn(0.12)
    );
    assert_eq!(
      "TARGET_RISK: 0.2".parse::<AllocationPolicy>().unwrap(),
      AllocationPolicy::TargetRisk(0.2)
    );
    assert!("target-risk".parse::<AllocationPolicy>().is_err());
    assert!("momentum".parse::<AllocationPolicy>().is_err());
  }

  #[test]
  fn cancel_flag_is_shared_between_clones() {
    let flag = CancelFlag::new();
    let other = flag.clone();
    assert!(flag.check().is_ok());
    other.cancel();
    assert_eq!(flag.check(), Err(PortfolioError::Cancelled));
  }
}
