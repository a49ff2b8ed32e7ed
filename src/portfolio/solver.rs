//! # Minimum-Variance Solvers
//!
//! $$
//! \min_{\mathbf w}\ \mathbf w^\top\Sigma\mathbf w
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ \ \mu^\top\mathbf w = r,\ \
//! \mathbf l \le \mathbf w \le \mathbf u
//! $$
//!
//! The frontier optimizer only talks to [`MinVarianceSolver`]. Two solvers ship
//! with the crate: the closed-form two-fund solution for the unconstrained case
//! and a primal active-set method for box constraints.

use std::fmt::Debug;

use nalgebra::DMatrix;
use nalgebra::DVector;

use super::types::Bounds;
use crate::error::PortfolioError;
use crate::error::Result;

/// Solves one minimum-variance problem.
pub trait MinVarianceSolver: Debug + Send + Sync {
  /// Short name used in logs.
  fn name(&self) -> &'static str;

  /// Minimum-variance weights with `1^T w = 1`, `mu^T w = target` when a target
  /// is given, and `bounds`.
  fn solve_min_variance(
    &self,
    target: Option<f64>,
    mu: &DVector<f64>,
    cov: &DMatrix<f64>,
    bounds: &Bounds,
  ) -> Result<DVector<f64>>;
}

pub fn portfolio_variance(w: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
  w.dot(&(cov * w))
}

fn spread<'a>(xs: impl Iterator<Item = &'a f64>) -> f64 {
  let (lo, hi) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
    (lo.min(x), hi.max(x))
  });
  if hi >= lo {
    hi - lo
  } else {
    0.0
  }
}

/// Closed-form Lagrangian solution; requires an invertible covariance and no bounds.
#[derive(Clone, Copy, Debug, Default)]
pub struct LagrangeSolver;

struct TwoFund {
  s_one: DVector<f64>,
  s_mu: DVector<f64>,
  a: f64,
  b: f64,
  c: f64,
}

impl LagrangeSolver {
  fn two_fund(mu: &DVector<f64>, cov: &DMatrix<f64>) -> Result<TwoFund> {
    let chol = cov.clone().cholesky().ok_or_else(|| {
      PortfolioError::SingularCovariance("covariance is not positive definite".into())
    })?;
    let ones = DVector::from_element(mu.len(), 1.0);
    let s_one = chol.solve(&ones);
    let s_mu = chol.solve(mu);
    let a = ones.dot(&s_one);
    let b = ones.dot(&s_mu);
    let c = mu.dot(&s_mu);
    Ok(TwoFund { s_one, s_mu, a, b, c })
  }

  /// Unconstrained tangency weights `S^-1 (mu - rf) / 1^T S^-1 (mu - rf)`.
  ///
  /// `None` when the denominator is not positive, i.e. the closed form would
  /// land on the inefficient branch.
  pub fn tangency(&self, mu: &DVector<f64>, cov: &DMatrix<f64>, risk_free: f64) -> Result<Option<DVector<f64>>> {
    let tf = Self::two_fund(mu, cov)?;
    let z = &tf.s_mu - &tf.s_one * risk_free;
    let denom = z.sum();
    if denom > 1e-14 * z.amax().max(1e-300) {
      Ok(Some(z / denom))
    } else {
      Ok(None)
    }
  }
}

impl MinVarianceSolver for LagrangeSolver {
  fn name(&self) -> &'static str {
    "lagrange"
  }

  fn solve_min_variance(
    &self,
    target: Option<f64>,
    mu: &DVector<f64>,
    cov: &DMatrix<f64>,
    bounds: &Bounds,
  ) -> Result<DVector<f64>> {
    if bounds.is_bounded() {
      return Err(PortfolioError::config(
        "closed-form solver cannot honour weight bounds",
      ));
    }
    let TwoFund { s_one, s_mu, a, b, c } = Self::two_fund(mu, cov)?;
    let Some(r) = target else {
      return Ok(s_one / a);
    };

    let d = a * c - b * b;
    if d <= 1e-14 * (a * c).abs().max(1e-300) {
      // All expected returns coincide: only the GMV return is reachable.
      let r_gmv = b / a;
      if (r - r_gmv).abs() <= 1e-12 * r.abs().max(1.0) {
        return Ok(s_one / a);
      }
      return Err(PortfolioError::InfeasibleConstraints(format!(
        "identical expected returns only reach {r_gmv}, requested {r}"
      )));
    }

    Ok((s_one * (c - b * r) + s_mu * (a * r - b)) / d)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
  Free,
  Lower,
  Upper,
}

/// Primal active-set QP over box constraints.
///
/// Starts from a feasible blend of the two greedy extreme portfolios, then
/// alternates equality-constrained Newton steps on the free weights with
/// adding blocking bounds and releasing bounds with negative multipliers.
#[derive(Clone, Copy, Debug)]
pub struct ActiveSetSolver {
  pub max_iter: usize,
  pub tolerance: f64,
}

impl Default for ActiveSetSolver {
  fn default() -> Self {
    Self {
      max_iter: 500,
      tolerance: 1e-10,
    }
  }
}

/// Fully invested portfolio reaching the highest (or lowest) return within
/// `lo <= w <= hi`.
pub(crate) fn greedy_extreme(mu: &[f64], lo: &[f64], hi: &[f64], maximize: bool) -> Result<(Vec<f64>, f64)> {
  let mut w = lo.to_vec();
  let mut budget = 1.0 - lo.iter().sum::<f64>();
  if budget < -1e-12 {
    return Err(PortfolioError::InfeasibleConstraints(
      "lower bounds sum above one".into(),
    ));
  }

  let mut order: Vec<usize> = (0..mu.len()).collect();
  order.sort_by(|&i, &j| {
    let ord = mu[i].total_cmp(&mu[j]);
    if maximize {
      ord.reverse()
    } else {
      ord
    }
  });

  for i in order {
    if budget <= 0.0 {
      break;
    }
    let add = budget.min(hi[i] - lo[i]);
    w[i] += add;
    budget -= add;
  }
  if budget > 1e-12 {
    return Err(PortfolioError::InfeasibleConstraints(
      "upper bounds sum below one".into(),
    ));
  }

  let r = w.iter().zip(mu).map(|(a, b)| a * b).sum();
  Ok((w, r))
}

impl ActiveSetSolver {
  fn start(&self, target: Option<f64>, mu: &[f64], lo: &[f64], hi: &[f64]) -> Result<Vec<f64>> {
    let (w_min, r_min) = greedy_extreme(mu, lo, hi, false)?;
    let (w_max, r_max) = greedy_extreme(mu, lo, hi, true)?;

    let t = match target {
      None => 0.5,
      Some(r) => {
        let scale = r_min.abs().max(r_max.abs()).max(1.0);
        if r < r_min - 1e-12 * scale || r > r_max + 1e-12 * scale {
          return Err(PortfolioError::InfeasibleConstraints(format!(
            "target return {r} outside achievable range [{r_min}, {r_max}]"
          )));
        }
        let span = r_max - r_min;
        if span <= 1e-15 * scale {
          0.0
        } else {
          ((r - r_min) / span).clamp(0.0, 1.0)
        }
      }
    };

    Ok(
      w_min
        .iter()
        .zip(&w_max)
        .map(|(a, b)| (1.0 - t) * a + t * b)
        .collect(),
    )
  }
}

impl MinVarianceSolver for ActiveSetSolver {
  fn name(&self) -> &'static str {
    "active-set"
  }

  fn solve_min_variance(
    &self,
    target: Option<f64>,
    mu: &DVector<f64>,
    cov: &DMatrix<f64>,
    bounds: &Bounds,
  ) -> Result<DVector<f64>> {
    let n = mu.len();
    if bounds.len() != n || cov.nrows() != n || cov.ncols() != n {
      return Err(PortfolioError::config("solver inputs have inconsistent dimensions"));
    }
    let (lo, hi) = bounds.capped();
    let mu_s = mu.as_slice();
    let mut w = DVector::from_vec(self.start(target, mu_s, &lo, &hi)?);

    // Return row scaled to unit magnitude for conditioning.
    let mu_scale = mu.amax().max(1e-300);
    let mu_row: Vec<f64> = mu.iter().map(|m| m / mu_scale).collect();
    let tol_mu = 1e-12 * (1.0 + mu.amax());

    let mut side: Vec<Side> = (0..n)
      .map(|i| {
        if w[i] - lo[i] <= 1e-12 {
          w[i] = lo[i];
          Side::Lower
        } else if hi[i] - w[i] <= 1e-12 {
          w[i] = hi[i];
          Side::Upper
        } else {
          Side::Free
        }
      })
      .collect();

    let g_mat = cov * 2.0;

    for iter in 0..self.max_iter {
      let free: Vec<usize> = (0..n).filter(|&i| side[i] == Side::Free).collect();
      let grad = &g_mat * &w;

      let spread_over: Vec<usize> = if free.is_empty() { (0..n).collect() } else { free.clone() };
      let with_return =
        target.is_some() && spread(spread_over.iter().map(|&i| &mu_s[i])) > tol_mu;
      let rows: Vec<Vec<f64>> = if with_return {
        vec![vec![1.0; n], mu_row.clone()]
      } else {
        vec![vec![1.0; n]]
      };
      let m = rows.len();

      let (step, nu) = if free.is_empty() {
        // Vertex: multipliers from a least-squares fit of the stationarity condition.
        let a_t = DMatrix::from_fn(n, m, |i, r| rows[r][i]);
        let nu = a_t
          .svd(true, true)
          .solve(&grad, 1e-14)
          .unwrap_or_else(|_| DVector::zeros(m));
        (DVector::zeros(0), nu)
      } else {
        let k = free.len();
        let mut kkt = DMatrix::<f64>::zeros(k + m, k + m);
        let mut rhs = DVector::<f64>::zeros(k + m);
        for (a, &fa) in free.iter().enumerate() {
          for (b, &fb) in free.iter().enumerate() {
            kkt[(a, b)] = g_mat[(fa, fb)];
          }
          for (r, row) in rows.iter().enumerate() {
            kkt[(a, k + r)] = -row[fa];
            kkt[(k + r, a)] = row[fa];
          }
          rhs[a] = -grad[fa];
        }

        let sv = kkt.clone().svd(false, false).singular_values;
        if sv.min() <= 1e-13 * sv.max().max(1e-300) {
          return Err(PortfolioError::SingularCovariance(
            "reduced KKT system is singular (duplicate or perfectly correlated assets)".into(),
          ));
        }
        let sol = kkt.lu().solve(&rhs).ok_or_else(|| {
          PortfolioError::SingularCovariance("reduced KKT system is singular".into())
        })?;
        (sol.rows(0, k).into_owned(), sol.rows(k, m).into_owned())
      };

      if step.amax() <= self.tolerance {
        let mult_tol = self.tolerance * (1.0 + grad.amax());
        let mut release: Option<(usize, f64)> = None;
        for i in 0..n {
          if side[i] == Side::Free || hi[i] - lo[i] <= 1e-12 {
            continue;
          }
          let resid = grad[i] - (0..m).map(|r| nu[r] * rows[r][i]).sum::<f64>();
          let lambda = if side[i] == Side::Lower { resid } else { -resid };
          if lambda < -mult_tol && release.map_or(true, |(_, best)| lambda < best) {
            release = Some((i, lambda));
          }
        }
        match release {
          None => {
            tracing::trace!(iter, solver = self.name(), "active-set converged");
            return Ok(w);
          }
          Some((i, _)) => side[i] = Side::Free,
        }
        continue;
      }

      let mut alpha = 1.0;
      let mut blocking: Option<(usize, Side)> = None;
      for (a, &i) in free.iter().enumerate() {
        let p = step[a];
        let (limit, bound_side) = if p < -1e-15 {
          ((lo[i] - w[i]) / p, Side::Lower)
        } else if p > 1e-15 {
          ((hi[i] - w[i]) / p, Side::Upper)
        } else {
          continue;
        };
        if limit < alpha {
          alpha = limit.max(0.0);
          blocking = Some((i, bound_side));
        }
      }

      for (a, &i) in free.iter().enumerate() {
        w[i] += alpha * step[a];
      }
      if let Some((i, s)) = blocking {
        w[i] = if s == Side::Lower { lo[i] } else { hi[i] };
        side[i] = s;
      }
    }

    Err(PortfolioError::SolverDidNotConverge(self.max_iter))
  }
}
