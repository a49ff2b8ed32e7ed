//! # Backtest
//!
//! $$
//! V_t = V_{t-1}\,\bigl(1 + \mathbf w_{t-1}^\top \mathbf r_t\bigr)
//! $$
//!
//! Historical simulation of allocations with calendar rebalancing.

pub mod batch;
pub mod engine;
pub mod schedule;

pub use batch::run_batch;
pub use batch::BacktestJob;
pub use batch::BatchOutcome;
pub use engine::BacktestConfig;
pub use engine::BacktestEngine;
pub use engine::BacktestResult;
pub use engine::MeanVarianceTarget;
pub use engine::RebalanceEvent;
pub use engine::Strategy;
pub use engine::TargetAllocator;
pub use schedule::RebalanceFrequency;
