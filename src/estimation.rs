//! # Moment Estimation
//!
//! $$
//! \hat\mu_i = \frac{P}{T}\sum_t r_{t,i},\qquad
//! \hat\Sigma_{ij} = \frac{P}{T-1}\sum_t (r_{t,i}-\bar r_i)(r_{t,j}-\bar r_j)
//! $$
//!
//! Expected-return vectors and covariance matrices fed to the optimizer, either
//! purely historical or with model forecasts replacing the mean.

use serde::Deserialize;
use serde::Serialize;

use crate::data::ReturnTable;
use crate::error::PortfolioError;
use crate::error::Result;

fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

fn sample_covariance(x: &[f64], y: &[f64]) -> f64 {
  let n = x.len().min(y.len());
  if n < 2 {
    return 0.0;
  }
  let mx = sample_mean(&x[..n]);
  let my = sample_mean(&y[..n]);
  let mut acc = 0.0;
  for i in 0..n {
    acc += (x[i] - mx) * (y[i] - my);
  }
  acc / (n - 1) as f64
}

/// Expected returns and covariance for a fixed asset universe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentEstimate {
  symbols: Vec<String>,
  expected_returns: Vec<f64>,
  covariance: Vec<Vec<f64>>,
}

impl MomentEstimate {
  /// Validate shapes, finiteness and non-negative variances.
  pub fn new(symbols: Vec<String>, expected_returns: Vec<f64>, covariance: Vec<Vec<f64>>) -> Result<Self> {
    let n = symbols.len();
    if n == 0 {
      return Err(PortfolioError::config("moment estimate needs at least one asset"));
    }
    if expected_returns.len() != n {
      return Err(PortfolioError::config(format!(
        "{} expected returns for {n} assets",
        expected_returns.len()
      )));
    }
    if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
      return Err(PortfolioError::config(format!("covariance must be {n}x{n}")));
    }
    if expected_returns.iter().chain(covariance.iter().flatten()).any(|v| !v.is_finite()) {
      return Err(PortfolioError::config("moment estimate contains non-finite values"));
    }
    if let Some(i) = (0..n).find(|&i| covariance[i][i] < 0.0) {
      return Err(PortfolioError::config(format!(
        "negative variance {} for {}",
        covariance[i][i], symbols[i]
      )));
    }
    Ok(Self {
      symbols,
      expected_returns,
      covariance,
    })
  }

  /// Sample mean and covariance of a return table, scaled by `periods_per_year`.
  pub fn historical(table: &ReturnTable, periods_per_year: f64) -> Result<Self> {
    if table.n_periods() < 2 {
      return Err(PortfolioError::config(format!(
        "need at least 2 return observations to estimate moments, got {}",
        table.n_periods()
      )));
    }
    let cols = table.columns();
    let n = cols.len();
    let mu = cols.iter().map(|c| sample_mean(c) * periods_per_year).collect();
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
      for j in i..n {
        let c = sample_covariance(&cols[i], &cols[j]) * periods_per_year;
        cov[i][j] = c;
        cov[j][i] = c;
      }
    }
    tracing::debug!(
      assets = n,
      periods = table.n_periods(),
      "estimated historical moments"
    );
    Self::new(table.symbols().to_vec(), mu, cov)
  }

  /// Build from per-asset volatilities and a full correlation matrix,
  /// $\Sigma_{ij} = \sigma_i \sigma_j \rho_{ij}$.
  pub fn from_volatilities(
    symbols: Vec<String>,
    expected_returns: Vec<f64>,
    sigmas: &[f64],
    corr: &[Vec<f64>],
  ) -> Result<Self> {
    let n = sigmas.len();
    if corr.len() != n || corr.iter().any(|row| row.len() != n) {
      return Err(PortfolioError::config(format!(
        "correlation must be {n}x{n} to match the volatilities"
      )));
    }
    if let Some(s) = sigmas.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
      return Err(PortfolioError::config(format!("volatility must be non-negative, got {s}")));
    }
    if let Some((i, _)) = corr.iter().enumerate().find(|(i, row)| row[*i] != 1.0) {
      return Err(PortfolioError::config(format!(
        "correlation diagonal must be 1, got {} for {}",
        corr[i][i],
        symbols.get(i).map_or("?", String::as_str)
      )));
    }
    let cov = (0..n)
      .map(|i| (0..n).map(|j| sigmas[i] * sigmas[j] * corr[i][j]).collect())
      .collect();
    Self::new(symbols, expected_returns, cov)
  }

  /// Replace expected returns with model forecasts, keeping the covariance.
  pub fn with_forecast(mut self, forecast: &[f64]) -> Result<Self> {
    if forecast.len() != self.symbols.len() {
      return Err(PortfolioError::config(format!(
        "{} forecasts for {} assets",
        forecast.len(),
        self.symbols.len()
      )));
    }
    if forecast.iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::config("forecast contains non-finite values"));
    }
    self.expected_returns = forecast.to_vec();
    Ok(self)
  }

  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  pub fn expected_returns(&self) -> &[f64] {
    &self.expected_returns
  }

  pub fn covariance(&self) -> &[Vec<f64>] {
    &self.covariance
  }

  pub fn n_assets(&self) -> usize {
    self.symbols.len()
  }

  /// Per-asset volatilities `sqrt(diag)`.
  pub fn volatilities(&self) -> Vec<f64> {
    (0..self.n_assets()).map(|i| self.covariance[i][i].sqrt()).collect()
  }

  pub fn correlation(&self) -> Vec<Vec<f64>> {
    corr_from_cov(&self.covariance)
  }
}

/// `(S + S^T) / 2`.
pub fn symmetrize(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = cov.len();
  let mut out = vec![vec![0.0; n]; n];
  for i in 0..n {
    for j in 0..n {
      out[i][j] = 0.5 * (cov[i][j] + cov[j][i]);
    }
  }
  out
}

pub(crate) fn corr_from_cov(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = cov.len();
  let sd: Vec<f64> = (0..n).map(|i| cov[i][i].max(0.0).sqrt()).collect();
  let mut corr = vec![vec![0.0; n]; n];

  for i in 0..n {
    for j in 0..n {
      let denom = sd[i] * sd[j];
      corr[i][j] = if i == j {
        1.0
      } else if denom > 1e-15 {
        (cov[i][j] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      };
    }
  }

  corr
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::NaiveDate;

  use super::*;

  #[test]
  fn volatilities_and_correlation_build_the_covariance() {
    let est = MomentEstimate::from_volatilities(
      vec!["A".into(), "B".into()],
      vec![0.05, 0.08],
      &[0.2, 0.3],
      &[vec![1.0, 0.5], vec![0.5, 1.0]],
    )
    .unwrap();
    assert_abs_diff_eq!(est.covariance()[0][0], 0.04, epsilon = 1e-12);
    assert_abs_diff_eq!(est.covariance()[1][1], 0.09, epsilon = 1e-12);
    assert_abs_diff_eq!(est.covariance()[0][1], 0.03, epsilon = 1e-12);
    assert_abs_diff_eq!(est.correlation()[1][0], 0.5, epsilon = 1e-12);

    let ragged = MomentEstimate::from_volatilities(
      vec!["A".into(), "B".into()],
      vec![0.05, 0.08],
      &[0.2, 0.3],
      &[vec![1.0]],
    );
    assert!(matches!(ragged, Err(PortfolioError::ConfigurationError(_))));

    let bad_diag = MomentEstimate::from_volatilities(
      vec!["A".into()],
      vec![0.05],
      &[0.2],
      &[vec![0.9]],
    );
    assert!(matches!(bad_diag, Err(PortfolioError::ConfigurationError(_))));
  }

  #[test]
  fn historical_moments_are_annualized() {
    let dates: Vec<NaiveDate> = (1..=4)
      .map(|d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap())
      .collect();
    let rows = vec![
      vec![0.01, 0.02],
      vec![-0.01, -0.02],
      vec![0.01, 0.02],
      vec![-0.01, -0.02],
    ];
    let table = ReturnTable::new(vec!["A".into(), "B".into()], dates, rows).unwrap();
    let est = MomentEstimate::historical(&table, 252.0).unwrap();

    assert_abs_diff_eq!(est.expected_returns()[0], 0.0, epsilon = 1e-12);
    let var_a = 4.0 * 0.0001 / 3.0 * 252.0;
    assert_abs_diff_eq!(est.covariance()[0][0], var_a, epsilon = 1e-12);
    assert_abs_diff_eq!(est.covariance()[0][1], 2.0 * var_a, epsilon = 1e-12);
    assert_abs_diff_eq!(est.correlation()[0][1], 1.0, epsilon = 1e-12);
  }

  #[test]
  fn rejects_negative_variance_and_bad_forecast() {
    let err = MomentEstimate::new(vec!["A".into()], vec![0.1], vec![vec![-0.01]]).unwrap_err();
    assert!(matches!(err, PortfolioError::ConfigurationError(_)));

    let est = MomentEstimate::new(vec!["A".into()], vec![0.1], vec![vec![0.04]]).unwrap();
    assert!(est.clone().with_forecast(&[0.1, 0.2]).is_err());
    assert_eq!(est.with_forecast(&[0.3]).unwrap().expected_returns(), &[0.3]);
  }

  #[test]
  fn symmetrize_averages_off_diagonals() {
    let s = symmetrize(&[vec![1.0, 0.2], vec![0.4, 2.0]]);
    assert_abs_diff_eq!(s[0][1], 0.3, epsilon = 1e-15);
    assert_abs_diff_eq!(s[1][0], 0.3, epsilon = 1e-15);
  }
}
