use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use chrono::NaiveDate;
use clap::Parser;
use frontier_rs::backtest::BatchOutcome;
use frontier_rs::data::load_price_csv;
use frontier_rs::telemetry::init_tracing;
use frontier_rs::BacktestResult;
use frontier_rs::PerformanceReport;
use frontier_rs::Pipeline;
use frontier_rs::PipelineConfig;
use frontier_rs::PipelineOutput;
use frontier_rs::PortfolioError;
use frontier_rs::RebalanceFrequency;
use frontier_rs::ReturnTable;
use prettytable::row;
use prettytable::Table;

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
  NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD, got {value:?}: {e}"))
}

#[derive(Parser, Debug)]
#[command(name = "frontier", version, about = "Mean-variance frontier, allocation and backtest")]
struct Args {
  /// Wide price CSV with header `date,SYM1,SYM2,...`
  #[arg(long)]
  prices: PathBuf,

  /// First backtest date (YYYY-MM-DD)
  #[arg(long, value_parser = parse_date)]
  start_date: NaiveDate,

  /// Last backtest date (YYYY-MM-DD)
  #[arg(long, value_parser = parse_date)]
  end_date: NaiveDate,

  /// Pipeline configuration JSON
  #[arg(long)]
  config: Option<PathBuf>,

  /// Write the full results as JSON
  #[arg(long)]
  output: Option<PathBuf>,

  /// Also backtest these rebalancing frequencies side by side, e.g. `none,monthly,quarterly`
  #[arg(long, value_delimiter = ',')]
  compare: Vec<RebalanceFrequency>,

  /// Log as JSON lines
  #[arg(long)]
  log_json: bool,
}

impl Args {
  fn validate(&self) -> Result<()> {
    if self.start_date > self.end_date {
      bail!("--start-date {} is after --end-date {}", self.start_date, self.end_date);
    }
    Ok(())
  }
}

type Scored = frontier_rs::Result<(BacktestResult, PerformanceReport)>;

struct Run {
  output: PipelineOutput,
  /// One row per `--compare` frequency.
  comparison: Vec<(String, Scored)>,
}

fn run(args: &Args) -> Result<Run> {
  let config = match &args.config {
    Some(path) => PipelineConfig::load(path)?,
    None => PipelineConfig::default(),
  };
  let prices = load_price_csv(&args.prices).with_context(|| format!("loading {}", args.prices.display()))?;
  tracing::info!(assets = prices.len(), file = %args.prices.display(), "loaded prices");

  let pipeline = Pipeline::new(config)?;
  let table = ReturnTable::from_prices(&prices, pipeline.config().gap_policy)?;
  let output = pipeline
    .run(&table, args.start_date, args.end_date)
    .context("pipeline run failed")?;

  if let Some(path) = &args.output {
    let json = serde_json::to_string_pretty(&output)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(file = %path.display(), "wrote results");
  }

  let comparison = if args.compare.is_empty() {
    Vec::new()
  } else {
    let analyzer = pipeline.config().analyzer();
    pipeline
      .compare_rebalancing(&table, args.start_date, args.end_date, &args.compare)
      .context("rebalancing comparison failed")?
      .into_iter()
      .map(|BatchOutcome { name, result }| {
        let scored = result.and_then(|r| analyzer.analyze(&r).map(|report| (r, report)));
        (name, scored)
      })
      .collect()
  };
  Ok(Run { output, comparison })
}

fn fmt_opt(v: Option<f64>) -> String {
  v.map_or_else(|| "n/a".to_string(), |x| format!("{x:.4}"))
}

fn fmt_pct(v: f64) -> String {
  format!("{:.2}%", v * 100.0)
}

fn metric_rows(report: &PerformanceReport) -> Vec<(&'static str, String)> {
  vec![
    ("Total return", fmt_pct(report.total_return)),
    ("Annualized return", fmt_pct(report.annualized_return)),
    ("Annualized volatility", fmt_pct(report.annualized_volatility)),
    ("Sharpe", fmt_opt(report.sharpe_ratio)),
    ("Sortino", fmt_opt(report.sortino_ratio)),
    ("Max drawdown", fmt_pct(report.max_drawdown)),
    ("Calmar", fmt_opt(report.calmar_ratio)),
    ("Win rate", fmt_pct(report.win_rate)),
    ("VaR 95%", fmt_pct(report.var_95)),
    ("VaR 99%", fmt_pct(report.var_99)),
    ("CVaR 95%", fmt_pct(report.cvar_95)),
    ("Information ratio", fmt_opt(report.information_ratio)),
    ("Turnover", format!("{:.4}", report.total_turnover)),
  ]
}

fn print_summary(out: &PipelineOutput) {
  let mut weights = Table::new();
  weights.add_row(row!["Asset", "Weight"]);
  for (s, w) in out.portfolio.symbols.iter().zip(&out.portfolio.weights) {
    weights.add_row(row![s, fmt_pct(*w)]);
  }
  weights.add_row(row!["Expected return", fmt_opt(out.portfolio.expected_return)]);
  weights.add_row(row!["Volatility", fmt_opt(out.portfolio.volatility)]);
  weights.printstd();

  let mut metrics = Table::new();
  let bench = out.benchmark_report.as_ref().map(metric_rows);
  match &bench {
    Some(_) => metrics.add_row(row!["Metric", "Portfolio", "Benchmark"]),
    None => metrics.add_row(row!["Metric", "Portfolio"]),
  };
  for (i, (name, value)) in metric_rows(&out.report).into_iter().enumerate() {
    match &bench {
      Some(b) => metrics.add_row(row![name, value, b[i].1]),
      None => metrics.add_row(row![name, value]),
    };
  }
  metrics.printstd();
}

fn print_comparison(rows: &[(String, Scored)]) {
  let mut table = Table::new();
  table.add_row(row!["Rebalancing", "Final value", "Rebalances", "Turnover", "Sharpe"]);
  for (name, scored) in rows {
    match scored {
      Ok((result, report)) => table.add_row(row![
        name,
        format!("{:.4}", result.final_value()),
        result.rebalances.len(),
        format!("{:.4}", result.total_turnover()),
        fmt_opt(report.sharpe_ratio)
      ]),
      Err(err) => table.add_row(row![name, err, "", "", ""]),
    };
  }
  table.printstd();
}

/// 2 for bad input or configuration, 1 for failed computations.
fn exit_code(err: &anyhow::Error) -> u8 {
  match err.downcast_ref::<PortfolioError>() {
    Some(e) if !e.is_input_error() => 1,
    _ => 2,
  }
}

fn main() -> ExitCode {
  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(err) => {
      // Help and version go to stdout and are not failures.
      let _ = err.print();
      return if err.use_stderr() {
        ExitCode::from(2)
      } else {
        ExitCode::SUCCESS
      };
    }
  };
  if let Err(err) = args.validate() {
    eprintln!("error: {err:#}");
    return ExitCode::from(2);
  }
  init_tracing(args.log_json);

  match run(&args) {
    Ok(run) => {
      print_summary(&run.output);
      if !run.comparison.is_empty() {
        print_comparison(&run.comparison);
      }
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!(error = %format!("{err:#}"), "run failed");
      eprintln!("error: {err:#}");
      ExitCode::from(exit_code(&err))
    }
  }
}

#[cfg(test)]
mod tests {
  use clap::error::ErrorKind;

  use super::*;

  fn parse(s: &str) -> std::result::Result<Args, clap::Error> {
    Args::try_parse_from(std::iter::once("frontier").chain(s.split_whitespace()))
  }

  #[test]
  fn parses_required_and_optional_flags() {
    let args = parse(
      "--prices p.csv --start-date 2023-01-02 --end-date 2023-12-29 --output out.json --log-json --compare none,quarterly",
    )
    .unwrap();
    assert_eq!(args.prices, PathBuf::from("p.csv"));
    assert_eq!(args.start_date, NaiveDate::from_ymd_opt(2023, 1, 2).unwrap());
    assert_eq!(args.output, Some(PathBuf::from("out.json")));
    assert!(args.config.is_none());
    assert!(args.log_json);
    assert_eq!(args.compare, vec![RebalanceFrequency::None, RebalanceFrequency::Quarterly]);
    assert!(args.validate().is_ok());
  }

  #[test]
  fn rejects_missing_or_malformed_flags() {
    assert_eq!(parse("--prices p.csv").unwrap_err().kind(), ErrorKind::MissingRequiredArgument);
    assert_eq!(
      parse("--prices p.csv --start-date 2023/01/02 --end-date 2023-12-29").unwrap_err().kind(),
      ErrorKind::ValueValidation
    );
    assert!(parse("--prices p.csv --start-date 2023-01-02 --end-date 2023-12-29 --compare hourly").is_err());
    assert_eq!(parse("--verbose").unwrap_err().kind(), ErrorKind::UnknownArgument);

    let help = parse("--help").unwrap_err();
    assert_eq!(help.kind(), ErrorKind::DisplayHelp);
    assert!(!help.use_stderr());

    let reversed = parse("--prices p.csv --start-date 2023-12-29 --end-date 2023-01-02").unwrap();
    assert!(reversed.validate().is_err());
  }

  #[test]
  fn cli_definition_is_consistent() {
    use clap::CommandFactory;
    Args::command().debug_assert();
  }

  #[test]
  fn exit_codes_split_input_and_computation_failures() {
    let input = anyhow::Error::new(PortfolioError::ConfigurationError("x".into())).context("ctx");
    assert_eq!(exit_code(&input), 2);
    let numeric = anyhow::Error::new(PortfolioError::SingularCovariance("x".into())).context("ctx");
    assert_eq!(exit_code(&numeric), 1);
  }
}
