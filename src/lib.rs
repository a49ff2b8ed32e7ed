//! # frontier-rs
//!
//! $$
//! \min_{\mathbf w}\ \mathbf w^\top\Sigma\mathbf w
//! \quad\text{s.t.}\quad \mu^\top\mathbf w = r,\ \mathbf 1^\top\mathbf w = 1
//! $$
//!
//! Mean-variance efficient frontiers, allocation policies, calendar-rebalanced
//! backtests and performance analytics for multi-asset portfolios.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod estimation;
pub mod performance;
pub mod pipeline;
pub mod portfolio;
pub mod telemetry;

pub use backtest::BacktestConfig;
pub use backtest::BacktestEngine;
pub use backtest::BacktestResult;
pub use backtest::RebalanceFrequency;
pub use backtest::Strategy;
pub use config::PipelineConfig;
pub use data::GapPolicy;
pub use data::PriceSeries;
pub use data::ReturnKind;
pub use data::ReturnSeries;
pub use data::ReturnTable;
pub use error::PortfolioError;
pub use error::Result;
pub use estimation::MomentEstimate;
pub use performance::analyze;
pub use performance::analyze_with_benchmark;
pub use performance::PerformanceReport;
pub use pipeline::Pipeline;
pub use pipeline::PipelineOutput;
pub use portfolio::compute_frontier;
pub use portfolio::select;
pub use portfolio::AllocationPolicy;
pub use portfolio::Constraints;
pub use portfolio::Frontier;
pub use portfolio::Portfolio;
