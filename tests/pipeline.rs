use std::fmt::Write as _;

use approx::assert_abs_diff_eq;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;
use frontier_rs::data::load_price_csv;
use frontier_rs::data::parse_price_csv;
use frontier_rs::performance::return_series;
use frontier_rs::AllocationPolicy;
use frontier_rs::GapPolicy;
use frontier_rs::Pipeline;
use frontier_rs::PipelineConfig;
use frontier_rs::PipelineOutput;
use frontier_rs::PortfolioError;
use frontier_rs::RebalanceFrequency;

fn weekdays(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
  start
    .iter_days()
    .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
    .take(n)
    .collect()
}

/// Three assets over two calendar years of weekdays with deterministic,
/// non-collinear return patterns.
fn price_csv(skip_bnd_on: Option<usize>) -> String {
  let dates = weekdays(NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 520);
  let mut prices = [400.0_f64, 80.0, 170.0];
  let mut csv = String::from("date,SPY,BND,GLD\n");
  for (t, d) in dates.iter().enumerate() {
    if t > 0 {
      let s = if t % 2 == 0 { 1.0 } else { -1.0 };
      let g = if t % 3 == 0 { -1.0 } else { 1.0 };
      let h = if t % 5 < 2 { -1.0 } else { 1.0 };
      prices[0] *= 1.0 + 0.0006 + 0.011 * s;
      prices[1] *= 1.0 + 0.0002 + 0.003 * s * g;
      prices[2] *= 1.0 + 0.0003 + 0.008 * h;
    }
    let bnd = if skip_bnd_on == Some(t) {
      String::new()
    } else {
      format!("{:.6}", prices[1])
    };
    writeln!(csv, "{d},{:.6},{bnd},{:.6}", prices[0], prices[2]).unwrap();
  }
  csv
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

#[test]
fn year_of_monthly_rebalancing_from_csv() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("prices.csv");
  std::fs::write(&path, price_csv(None)).unwrap();

  let prices = load_price_csv(&path).unwrap();
  let config = PipelineConfig {
    n_points: 15,
    benchmark: Some([("SPY".to_string(), 0.6), ("BND".to_string(), 0.4)].into()),
    ..PipelineConfig::default()
  };
  let out = Pipeline::new(config)
    .unwrap()
    .run_prices(&prices, d(2023, 1, 1), d(2023, 12, 31))
    .unwrap();

  // 2023 holds 260 weekdays, all present in the file.
  assert_eq!(out.backtest.len(), 260);
  assert_eq!(out.backtest.rebalances.len(), 12);
  assert_eq!(out.frontier.points.len(), 15);
  assert!(out
    .frontier
    .points
    .windows(2)
    .all(|w| w[1].target_return > w[0].target_return));
  assert_abs_diff_eq!(out.portfolio.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
  assert!(out.portfolio.weights.iter().all(|w| *w >= 0.0));
  assert!(out.report.max_drawdown <= 0.0);
  assert!(out.report.information_ratio.is_some());
  assert!(out.benchmark_report.is_some());

  let json_path = dir.path().join("out.json");
  std::fs::write(&json_path, serde_json::to_string_pretty(&out).unwrap()).unwrap();
  let back: PipelineOutput = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
  assert_eq!(back.backtest.rebalances.len(), 12);
  assert_eq!(back.portfolio.symbols, vec!["SPY", "BND", "GLD"]);
}

#[test]
fn gap_policy_decides_between_failure_and_forward_fill() {
  let prices = parse_price_csv(&price_csv(Some(300))).unwrap();

  let err = Pipeline::new(PipelineConfig::default())
    .unwrap()
    .run_prices(&prices, d(2023, 1, 1), d(2023, 12, 31))
    .unwrap_err();
  assert!(matches!(err, PortfolioError::DataGap { ref symbol, .. } if symbol == "BND"));

  let out = Pipeline::new(PipelineConfig {
    gap_policy: GapPolicy::ForwardFill,
    ..PipelineConfig::default()
  })
  .unwrap()
  .run_prices(&prices, d(2023, 1, 1), d(2023, 12, 31))
  .unwrap();
  assert_eq!(out.backtest.forward_filled, 1);
}

#[test]
fn target_return_outside_frontier_is_out_of_range() {
  let prices = parse_price_csv(&price_csv(None)).unwrap();
  let err = Pipeline::new(PipelineConfig {
    policy: AllocationPolicy::TargetReturn(5.0),
    ..PipelineConfig::default()
  })
  .unwrap()
  .run_prices(&prices, d(2023, 1, 1), d(2023, 12, 31))
  .unwrap_err();
  assert!(matches!(err, PortfolioError::OutOfRange { .. }));
}

#[test]
fn quarterly_dynamic_run_with_costs() {
  let prices = parse_price_csv(&price_csv(None)).unwrap();
  let run = |bps: f64| {
    Pipeline::new(PipelineConfig {
      rebalance_frequency: RebalanceFrequency::Quarterly,
      lookback: Some(126),
      transaction_cost_bps: bps,
      n_points: 8,
      ..PipelineConfig::default()
    })
    .unwrap()
    .run_prices(&prices, d(2023, 1, 1), d(2023, 12, 31))
    .unwrap()
  };
  let free = run(0.0);
  let costly = run(50.0);
  assert_eq!(free.backtest.rebalances.len(), 4);
  assert!(costly.report.total_cost > 0.0);
  assert!(costly.backtest.final_value() < free.backtest.final_value());

  let series = return_series(&free.backtest, "free").unwrap();
  assert_eq!(series.len(), free.backtest.len());
}
