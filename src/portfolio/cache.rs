//! Keyed frontier cache.
//!
//! Concurrent callers asking for the same key share one computation. Errors
//! are cached like successes, except [`PortfolioError::Cancelled`], which says
//! nothing about the inputs and is evicted so the next caller recomputes.

use std::sync::Arc;
use std::sync::OnceLock;

use chrono::NaiveDate;
use dashmap::DashMap;
use ordered_float::OrderedFloat;

use super::frontier::FrontierOptions;
use super::types::Constraints;
use super::types::Frontier;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::estimation::MomentEstimate;

fn ordered(v: &[f64]) -> Vec<OrderedFloat<f64>> {
  v.iter().copied().map(OrderedFloat).collect()
}

/// Identifies one frontier computation: the estimation window, the moments
/// estimated on it (after annualization and forecast overrides), the
/// constraint set and every optimizer option.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrontierKey {
  window: (NaiveDate, NaiveDate),
  symbols: Vec<String>,
  expected_returns: Vec<OrderedFloat<f64>>,
  covariance: Vec<OrderedFloat<f64>>,
  long_only: bool,
  lower: Option<Vec<OrderedFloat<f64>>>,
  upper: Option<Vec<OrderedFloat<f64>>>,
  n_points: usize,
  risk_free_rate: OrderedFloat<f64>,
  ridge: Option<OrderedFloat<f64>>,
  singular_tolerance: OrderedFloat<f64>,
}

impl FrontierKey {
  pub fn new(
    window: (NaiveDate, NaiveDate),
    estimate: &MomentEstimate,
    constraints: &Constraints,
    options: &FrontierOptions,
  ) -> Self {
    Self {
      window,
      symbols: estimate.symbols().to_vec(),
      expected_returns: ordered(estimate.expected_returns()),
      covariance: estimate.covariance().iter().flat_map(|row| ordered(row)).collect(),
      long_only: constraints.long_only,
      lower: constraints.lower.as_deref().map(ordered),
      upper: constraints.upper.as_deref().map(ordered),
      n_points: options.n_points,
      risk_free_rate: OrderedFloat(options.risk_free_rate),
      ridge: options.ridge.map(OrderedFloat),
      singular_tolerance: OrderedFloat(options.singular_tolerance),
    }
  }
}

type Slot = Arc<OnceLock<Result<Arc<Frontier>>>>;

#[derive(Debug, Default)]
pub struct FrontierCache {
  entries: DashMap<FrontierKey, Slot>,
}

impl FrontierCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cached frontier for `key`, running `compute` at most once per key.
  /// Callers waiting on a computation that gets cancelled see `Cancelled`;
  /// later callers start over.
  pub fn get_or_compute<F>(&self, key: FrontierKey, compute: F) -> Result<Arc<Frontier>>
  where
    F: FnOnce() -> Result<Frontier>,
  {
    // Clone the slot out so the shard lock is released before computing.
    let slot: Slot = self.entries.entry(key.clone()).or_default().clone();
    let result = slot
      .get_or_init(|| {
        tracing::debug!("frontier cache miss");
        compute().map(Arc::new)
      })
      .clone();
    if matches!(result, Err(PortfolioError::Cancelled)) {
      self.entries.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
      tracing::debug!("evicted cancelled frontier computation");
    }
    result
  }

  /// Completed entry for `key`, if any.
  pub fn get(&self, key: &FrontierKey) -> Option<Result<Arc<Frontier>>> {
    self.entries.get(key).and_then(|slot| slot.get().cloned())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&self) {
    self.entries.clear();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  use super::*;
  use crate::portfolio::frontier::compute_frontier;

  fn estimate(scale: f64) -> MomentEstimate {
    MomentEstimate::new(
      vec!["A".to_string(), "B".to_string()],
      vec![0.08 * scale, 0.12 * scale],
      vec![vec![0.04 * scale, 0.0], vec![0.0, 0.09 * scale]],
    )
    .unwrap()
  }

  fn key_with(scale: f64, options: FrontierOptions) -> FrontierKey {
    let d = |m| NaiveDate::from_ymd_opt(2024, m, 1).unwrap();
    FrontierKey::new((d(1), d(6)), &estimate(scale), &Constraints::long_only(), &options)
  }

  fn key(rf: f64) -> FrontierKey {
    key_with(
      1.0,
      FrontierOptions {
        n_points: 5,
        risk_free_rate: rf,
        ..FrontierOptions::default()
      },
    )
  }

  fn two_asset() -> Result<Frontier> {
    compute_frontier(
      &[0.08, 0.12],
      &[vec![0.04, 0.0], vec![0.0, 0.09]],
      5,
      &Constraints::long_only(),
      0.02,
    )
  }

  #[test]
  fn concurrent_callers_compute_once() {
    let cache = FrontierCache::new();
    let calls = AtomicUsize::new(0);

    std::thread::scope(|s| {
      for _ in 0..8 {
        s.spawn(|| {
          let f = cache
            .get_or_compute(key(0.02), || {
              calls.fetch_add(1, Ordering::SeqCst);
              std::thread::sleep(Duration::from_millis(20));
              two_asset()
            })
            .unwrap();
          assert_eq!(f.points.len(), 5);
        });
      }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&key(0.02)).is_some());
    assert!(cache.get(&key(0.03)).is_none());
  }

  #[test]
  fn failures_are_cached_per_key() {
    let cache = FrontierCache::new();
    let err = PortfolioError::SingularCovariance("test".into());
    let first = cache.get_or_compute(key(0.0), || Err(err.clone()));
    let second = cache.get_or_compute(key(0.0), two_asset);
    assert_eq!(first.unwrap_err(), err);
    assert_eq!(second.unwrap_err(), err);

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.get_or_compute(key(0.0), two_asset).is_ok());
  }

  #[test]
  fn cancelled_computation_is_not_cached() {
    let cache = FrontierCache::new();
    let first = cache.get_or_compute(key(0.02), || Err(PortfolioError::Cancelled));
    assert_eq!(first.unwrap_err(), PortfolioError::Cancelled);
    assert!(cache.get(&key(0.02)).is_none());
    assert!(cache.is_empty());

    let second = cache.get_or_compute(key(0.02), two_asset).unwrap();
    assert_eq!(second.points.len(), 5);
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn key_covers_moments_and_optimizer_options() {
    let base = key(0.02);
    assert_eq!(base, key(0.02));
    assert_ne!(base, key_with(12.0 / 252.0, FrontierOptions { n_points: 5, ..FrontierOptions::default() }));
    assert_ne!(
      base,
      key_with(
        1.0,
        FrontierOptions {
          n_points: 5,
          ridge: Some(1e-8),
          ..FrontierOptions::default()
        }
      )
    );
    assert_ne!(
      base,
      key_with(
        1.0,
        FrontierOptions {
          n_points: 5,
          singular_tolerance: 1e-9,
          ..FrontierOptions::default()
        }
      )
    );
  }
}
