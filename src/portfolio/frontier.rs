//! # Efficient Frontier
//!
//! $$
//! \sigma^2(r) = \min_{\mathbf w}\{\mathbf w^\top\Sigma\mathbf w :
//! \mu^\top\mathbf w = r,\ \mathbf 1^\top\mathbf w = 1,\ \mathbf l\le\mathbf w\le\mathbf u\}
//! $$
//!
//! Samples the frontier at evenly spaced target returns, and locates the
//! global minimum-variance and tangency portfolios.

use std::sync::Arc;

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::goldensectionsearch::GoldenSectionSearch;
use nalgebra::DMatrix;
use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;

use super::solver::greedy_extreme;
use super::solver::portfolio_variance;
use super::solver::ActiveSetSolver;
use super::solver::LagrangeSolver;
use super::solver::MinVarianceSolver;
use super::types::Bounds;
use super::types::CancelFlag;
use super::types::Constraints;
use super::types::Frontier;
use super::types::FrontierPoint;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::estimation::symmetrize;
use crate::estimation::MomentEstimate;

/// Runtime configuration for [`FrontierOptimizer`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontierOptions {
  /// Number of sampled frontier points (>= 2).
  pub n_points: usize,
  /// Risk-free rate for the tangency portfolio, same scale as the expected returns.
  pub risk_free_rate: f64,
  /// Ridge added to the diagonal when the covariance is near-singular.
  pub ridge: Option<f64>,
  /// Smallest/largest eigenvalue ratio below which the covariance counts as singular.
  pub singular_tolerance: f64,
}

impl Default for FrontierOptions {
  fn default() -> Self {
    Self {
      n_points: 20,
      risk_free_rate: 0.02,
      ridge: None,
      singular_tolerance: 1e-12,
    }
  }
}

impl FrontierOptions {
  pub fn validate(&self) -> Result<()> {
    if self.n_points < 2 {
      return Err(PortfolioError::config(format!(
        "n_points must be at least 2, got {}",
        self.n_points
      )));
    }
    if !self.risk_free_rate.is_finite() {
      return Err(PortfolioError::config("risk_free_rate must be finite"));
    }
    if let Some(eps) = self.ridge {
      if !(eps.is_finite() && eps > 0.0) {
        return Err(PortfolioError::config(format!("ridge must be positive, got {eps}")));
      }
    }
    if !(self.singular_tolerance.is_finite() && self.singular_tolerance > 0.0) {
      return Err(PortfolioError::config("singular_tolerance must be positive"));
    }
    Ok(())
  }
}

/// One prepared optimization problem: symmetrized (and possibly ridged)
/// covariance, resolved bounds and the solver that will handle them.
#[derive(Clone, Debug)]
struct Problem {
  mu: DVector<f64>,
  cov: DMatrix<f64>,
  bounds: Bounds,
  solver: Arc<dyn MinVarianceSolver>,
  closed_form: bool,
  regularization: Option<f64>,
}

impl Problem {
  fn solve(&self, target: Option<f64>) -> Result<FrontierPoint> {
    let w = self.solver.solve_min_variance(target, &self.mu, &self.cov, &self.bounds)?;
    Ok(self.point(target, w))
  }

  fn point(&self, target: Option<f64>, w: DVector<f64>) -> FrontierPoint {
    let expected_return = w.dot(&self.mu);
    FrontierPoint {
      target_return: target.unwrap_or(expected_return),
      expected_return,
      variance: portfolio_variance(&w, &self.cov).max(0.0),
      weights: w.iter().copied().collect(),
    }
  }

  /// Sampled return range: greedy extremes under the bounds, clipped to the
  /// per-asset return range.
  fn return_range(&self) -> Result<(f64, f64)> {
    let (lo, hi) = self.bounds.capped();
    let mu = self.mu.as_slice();
    let (_, g_min) = greedy_extreme(mu, &lo, &hi, false)?;
    let (_, g_max) = greedy_extreme(mu, &lo, &hi, true)?;
    let r_lo = g_min.max(self.mu.min());
    let r_hi = g_max.min(self.mu.max());
    let scale = self.mu.amax().max(1e-300);
    if r_hi - r_lo <= 1e-12 * scale {
      return Err(PortfolioError::InfeasibleConstraints(format!(
        "achievable expected returns collapse to a single value ({r_lo})"
      )));
    }
    Ok((r_lo, r_hi))
  }
}

struct NegativeSharpe {
  problem: Problem,
  risk_free: f64,
}

impl CostFunction for NegativeSharpe {
  type Param = f64;
  type Output = f64;

  fn cost(&self, target: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let point = self.problem.solve(Some(*target))?;
    Ok(point.sharpe(self.risk_free).map_or(f64::MAX, |s| -s))
  }
}

/// Efficient frontier optimizer over a pluggable [`MinVarianceSolver`].
#[derive(Clone, Debug, Default)]
pub struct FrontierOptimizer {
  options: FrontierOptions,
  solver: Option<Arc<dyn MinVarianceSolver>>,
}

impl FrontierOptimizer {
  pub fn new(options: FrontierOptions) -> Self {
    Self {
      options,
      solver: None,
    }
  }

  /// Use `solver` for every point instead of picking one from the constraints.
  pub fn with_solver(mut self, solver: Arc<dyn MinVarianceSolver>) -> Self {
    self.solver = Some(solver);
    self
  }

  pub fn options(&self) -> &FrontierOptions {
    &self.options
  }

  fn prepare(&self, estimate: &MomentEstimate, constraints: &Constraints) -> Result<Problem> {
    self.options.validate()?;
    let n = estimate.n_assets();
    let bounds = constraints.resolve(n)?;

    let raw = estimate.covariance();
    let sym = symmetrize(raw);
    let asymmetry = (0..n)
      .flat_map(|i| (0..n).map(move |j| (i, j)))
      .map(|(i, j)| (raw[i][j] - raw[j][i]).abs())
      .fold(0.0, f64::max);
    if asymmetry > 0.0 {
      tracing::debug!(asymmetry, "symmetrized covariance");
    }

    let mut cov = DMatrix::from_fn(n, n, |i, j| sym[i][j]);
    let mu = DVector::from_column_slice(estimate.expected_returns());

    let eigen = cov.clone().symmetric_eigen().eigenvalues;
    let (min_eig, max_eig) = (eigen.min(), eigen.max());
    let scale = max_eig.abs().max(1e-300);
    if min_eig < -1e-8 * scale {
      return Err(PortfolioError::config(format!(
        "covariance is not positive semi-definite (smallest eigenvalue {min_eig:e})"
      )));
    }

    let mut regularization = None;
    if min_eig <= self.options.singular_tolerance * scale {
      match self.options.ridge {
        Some(eps) => {
          tracing::warn!(
            ridge = eps,
            min_eigenvalue = min_eig,
            "near-singular covariance, adding ridge to the diagonal"
          );
          cov += DMatrix::<f64>::identity(n, n) * eps;
          regularization = Some(eps);
        }
        None if !bounds.is_bounded() => {
          return Err(PortfolioError::SingularCovariance(format!(
            "smallest eigenvalue {min_eig:e} vs largest {max_eig:e}; configure a ridge or weight bounds"
          )));
        }
        None => {
          tracing::warn!(
            min_eigenvalue = min_eig,
            "near-singular covariance, relying on the bounded solver"
          );
        }
      }
    }

    let closed_form = self.solver.is_none() && !bounds.is_bounded();
    let solver: Arc<dyn MinVarianceSolver> = match &self.solver {
      Some(s) => s.clone(),
      None if closed_form => Arc::new(LagrangeSolver),
      None => Arc::new(ActiveSetSolver::default()),
    };

    Ok(Problem {
      mu,
      cov,
      bounds,
      solver,
      closed_form,
      regularization,
    })
  }

  /// Minimum-variance portfolio for one target return, or the global minimum
  /// variance portfolio when `target` is `None`.
  pub fn min_variance(
    &self,
    estimate: &MomentEstimate,
    constraints: &Constraints,
    target: Option<f64>,
  ) -> Result<FrontierPoint> {
    self.prepare(estimate, constraints)?.solve(target)
  }

  pub fn compute_frontier(&self, estimate: &MomentEstimate, constraints: &Constraints) -> Result<Frontier> {
    self.compute_frontier_with_cancel(estimate, constraints, &CancelFlag::new())
  }

  /// Like [`Self::compute_frontier`], checking `cancel` before every point solve.
  pub fn compute_frontier_with_cancel(
    &self,
    estimate: &MomentEstimate,
    constraints: &Constraints,
    cancel: &CancelFlag,
  ) -> Result<Frontier> {
    let problem = self.prepare(estimate, constraints)?;
    let (r_lo, r_hi) = problem.return_range()?;
    let n_points = self.options.n_points;

    let mut points = Vec::with_capacity(n_points);
    for i in 0..n_points {
      cancel.check()?;
      let target = if i + 1 == n_points {
        r_hi
      } else {
        r_lo + (r_hi - r_lo) * i as f64 / (n_points - 1) as f64
      };
      points.push(problem.solve(Some(target))?);
    }

    cancel.check()?;
    let min_variance = problem.solve(None)?;
    let tangency = self.tangency(&problem, &points)?;

    tracing::info!(
      points = points.len(),
      solver = problem.solver.name(),
      min_return = r_lo,
      max_return = r_hi,
      tangency_sharpe = tangency.sharpe(self.options.risk_free_rate).unwrap_or(f64::NAN),
      "efficient frontier computed"
    );

    Ok(Frontier {
      symbols: estimate.symbols().to_vec(),
      points,
      min_variance,
      tangency,
      risk_free_rate: self.options.risk_free_rate,
      long_only: problem.bounds.long_only,
      regularization: problem.regularization,
    })
  }

  fn tangency(&self, problem: &Problem, points: &[FrontierPoint]) -> Result<FrontierPoint> {
    let rf = self.options.risk_free_rate;

    if problem.closed_form {
      if let Some(w) = LagrangeSolver.tangency(&problem.mu, &problem.cov, rf)? {
        let expected = w.dot(&problem.mu);
        return Ok(problem.point(Some(expected), w));
      }
    }

    let sharpe_of = |p: &FrontierPoint| p.sharpe(rf).unwrap_or(f64::NEG_INFINITY);
    let best = points
      .iter()
      .enumerate()
      .max_by(|(_, a), (_, b)| sharpe_of(a).total_cmp(&sharpe_of(b)))
      .map(|(i, _)| i)
      .ok_or_else(|| PortfolioError::config("frontier has no points"))?;

    let lo = points[best.saturating_sub(1)].target_return;
    let hi = points[(best + 1).min(points.len() - 1)].target_return;
    let mut tangency = points[best].clone();

    if hi > lo {
      let cost = NegativeSharpe {
        problem: problem.clone(),
        risk_free: rf,
      };
      let refined = GoldenSectionSearch::new(lo, hi)
        .and_then(|s| s.with_tolerance(1e-8))
        .and_then(|solver| {
          Executor::new(cost, solver)
            .configure(|state| state.param(tangency.target_return).max_iters(200))
            .run()
        });
      match refined {
        Ok(res) => {
          if let Some(r) = res.state.best_param {
            let candidate = problem.solve(Some(r))?;
            if sharpe_of(&candidate) > sharpe_of(&tangency) {
              tangency = candidate;
            }
          }
        }
        Err(err) => tracing::debug!(%err, "tangency refinement failed, keeping best sampled point"),
      }
    }

    if sharpe_of(&tangency) <= 0.0 {
      tracing::warn!(
        risk_free_rate = rf,
        "no frontier portfolio earns more than the risk-free rate"
      );
    }
    Ok(tangency)
  }
}

/// Frontier for raw inputs; assets are labelled `asset_0`, `asset_1`, ...
pub fn compute_frontier(
  expected_returns: &[f64],
  covariance: &[Vec<f64>],
  n_points: usize,
  constraints: &Constraints,
  risk_free_rate: f64,
) -> Result<Frontier> {
  let symbols = (0..expected_returns.len()).map(|i| format!("asset_{i}")).collect();
  let estimate = MomentEstimate::new(symbols, expected_returns.to_vec(), covariance.to_vec())?;
  FrontierOptimizer::new(FrontierOptions {
    n_points,
    risk_free_rate,
    ..FrontierOptions::default()
  })
  .compute_frontier(&estimate, constraints)
}
