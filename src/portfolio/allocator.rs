//! # Allocator
//!
//! $$
//! \mathbf w = \begin{cases}
//! \mathbf w_{\text{tan}} & \text{max Sharpe}\\
//! \arg\min_{p}|r_p - r^\*| & \text{target return}\\
//! \arg\min_{p}|\sigma_p^2 - \sigma^{\*2}| & \text{target risk}
//! \end{cases}
//! $$
//!
//! Picks one concrete portfolio off a computed frontier.

use super::types::AllocationPolicy;
use super::types::Frontier;
use super::types::FrontierPoint;
use super::types::Portfolio;
use crate::error::PortfolioError;
use crate::error::Result;

const RANGE_SLACK: f64 = 1e-12;

/// Select the portfolio `policy` asks for.
///
/// Targets outside the sampled frontier fail with [`PortfolioError::OutOfRange`]
/// instead of being clamped.
pub fn select(frontier: &Frontier, policy: AllocationPolicy, risk_free_rate: f64) -> Result<Portfolio> {
  if frontier.points.is_empty() {
    return Err(PortfolioError::config("cannot allocate from an empty frontier"));
  }
  if !risk_free_rate.is_finite() {
    return Err(PortfolioError::config("risk_free_rate must be finite"));
  }

  let point = match policy {
    AllocationPolicy::MaxSharpe => max_sharpe(frontier, risk_free_rate),
    AllocationPolicy::TargetReturn(r) => nearest_return(frontier, r)?,
    AllocationPolicy::TargetRisk(sigma) => nearest_risk(frontier, sigma)?,
  };

  let portfolio = Portfolio::from_point(&frontier.symbols, point, frontier.long_only)?;
  tracing::debug!(
    ?policy,
    expected_return = point.expected_return,
    volatility = point.volatility(),
    "allocated portfolio"
  );
  Ok(portfolio)
}

fn max_sharpe(frontier: &Frontier, risk_free_rate: f64) -> &FrontierPoint {
  if (risk_free_rate - frontier.risk_free_rate).abs() <= f64::EPSILON {
    return &frontier.tangency;
  }
  let score = |p: &FrontierPoint| p.sharpe(risk_free_rate).unwrap_or(f64::NEG_INFINITY);
  frontier
    .points
    .iter()
    .chain([&frontier.min_variance, &frontier.tangency])
    .fold(&frontier.tangency, |best, p| if score(p) > score(best) { p } else { best })
}

fn nearest_return(frontier: &Frontier, target: f64) -> Result<&FrontierPoint> {
  if !target.is_finite() {
    return Err(PortfolioError::config("target return must be finite"));
  }
  let (min, max) = (frontier.min_return(), frontier.max_return());
  let slack = RANGE_SLACK * (1.0 + min.abs().max(max.abs()));
  if target < min - slack || target > max + slack {
    return Err(PortfolioError::OutOfRange { target, min, max });
  }
  Ok(nearest_by(&frontier.points, |p| (p.target_return - target).abs()))
}

fn nearest_risk(frontier: &Frontier, sigma: f64) -> Result<&FrontierPoint> {
  if !sigma.is_finite() || sigma < 0.0 {
    return Err(PortfolioError::config(format!("target risk must be a non-negative volatility, got {sigma}")));
  }
  let (min, max) = frontier.volatility_range();
  let slack = RANGE_SLACK * (1.0 + max);
  if sigma < min - slack || sigma > max + slack {
    return Err(PortfolioError::OutOfRange { target: sigma, min, max });
  }
  let var = sigma * sigma;
  Ok(nearest_by(&frontier.points, |p| (p.variance - var).abs()))
}

fn nearest_by(points: &[FrontierPoint], distance: impl Fn(&FrontierPoint) -> f64) -> &FrontierPoint {
  // Ties go to the lower-return point.
  points
    .iter()
    .skip(1)
    .fold(&points[0], |best, p| if distance(p) < distance(best) { p } else { best })
}
