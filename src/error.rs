//! # Errors
//!
//! Failure taxonomy shared by the optimizer, allocator, backtest engine and
//! performance analyzer. Every variant is a distinct, catchable outcome; no
//! component substitutes a default portfolio on failure.

use chrono::NaiveDate;
use thiserror::Error;

/// Errors raised by the portfolio pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortfolioError {
  /// No weight vector satisfies the equality and bound constraints.
  #[error("infeasible constraints: {0}")]
  InfeasibleConstraints(String),
  /// Covariance (or a reduced KKT system built from it) is not invertible.
  #[error("singular covariance: {0}")]
  SingularCovariance(String),
  /// Allocation target lies outside the range spanned by the frontier.
  #[error("target {target} outside frontier range [{min}, {max}]")]
  OutOfRange { target: f64, min: f64, max: f64 },
  /// Missing observation in an input series.
  #[error("missing observation for {symbol} on {date}")]
  DataGap { symbol: String, date: NaiveDate },
  /// Benchmark series does not line up with the backtest dates.
  #[error("benchmark mismatch: {0}")]
  BenchmarkMismatch(String),
  /// Invalid parameter or inconsistent input shapes.
  #[error("configuration error: {0}")]
  ConfigurationError(String),
  /// Input series violates its ordering/positivity invariants.
  #[error("invalid series {symbol}: {reason}")]
  InvalidSeries { symbol: String, reason: String },
  /// Active-set iteration cap reached.
  #[error("quadratic solver did not converge after {0} iterations")]
  SolverDidNotConverge(usize),
  /// Work abandoned through a [`crate::portfolio::CancelFlag`].
  #[error("computation cancelled")]
  Cancelled,
}

impl PortfolioError {
  pub(crate) fn config(msg: impl Into<String>) -> Self {
    Self::ConfigurationError(msg.into())
  }

  pub(crate) fn invalid_series(symbol: &str, reason: impl Into<String>) -> Self {
    Self::InvalidSeries {
      symbol: symbol.to_string(),
      reason: reason.into(),
    }
  }

  /// Whether the error stems from bad input or configuration rather than from
  /// the numerical computation itself.
  pub fn is_input_error(&self) -> bool {
    matches!(
      self,
      Self::DataGap { .. }
        | Self::ConfigurationError(_)
        | Self::InvalidSeries { .. }
        | Self::BenchmarkMismatch(_)
    )
  }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PortfolioError>;
