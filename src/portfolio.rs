//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Efficient frontier construction and allocation.

pub mod allocator;
pub mod cache;
pub mod frontier;
pub mod solver;
pub mod types;

pub use allocator::select;
pub use cache::FrontierCache;
pub use cache::FrontierKey;
pub use frontier::compute_frontier;
pub use frontier::FrontierOptimizer;
pub use frontier::FrontierOptions;
pub use solver::portfolio_variance;
pub use solver::ActiveSetSolver;
pub use solver::LagrangeSolver;
pub use solver::MinVarianceSolver;
pub use types::normalize_weights;
pub use types::AllocationPolicy;
pub use types::Bounds;
pub use types::CancelFlag;
pub use types::Constraints;
pub use types::Frontier;
pub use types::FrontierPoint;
pub use types::Portfolio;
