//! # Return Series
//!
//! $$
//! r_t = \frac{P_t}{P_{t-1}} - 1, \qquad \ell_t = \ln\frac{P_t}{P_{t-1}}
//! $$
//!
//! In-memory price and return series plus the aligned multi-asset
//! [`ReturnTable`] consumed by the estimator and the backtest engine.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use csv::StringRecord;
use csv::Trim;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;

/// Return convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
  #[default]
  Simple,
  Log,
}

impl ReturnKind {
  /// Convert a return in this convention into a simple return.
  pub fn to_simple(self, r: f64) -> f64 {
    match self {
      ReturnKind::Simple => r,
      ReturnKind::Log => r.exp_m1(),
    }
  }
}

/// How missing observations are treated when series are aligned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
  /// Any missing observation is a [`PortfolioError::DataGap`].
  #[default]
  Fail,
  /// Carry the last observed price forward (zero return on the missing day).
  ForwardFill,
}

fn check_dates(symbol: &str, dates: impl Iterator<Item = NaiveDate>) -> Result<()> {
  let mut prev: Option<NaiveDate> = None;
  for d in dates {
    if let Some(p) = prev {
      if d <= p {
        return Err(PortfolioError::invalid_series(
          symbol,
          format!("dates not strictly increasing at {d} (after {p})"),
        ));
      }
    }
    prev = Some(d);
  }
  Ok(())
}

/// Dated closing prices of one asset.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
  symbol: String,
  points: Vec<(NaiveDate, f64)>,
}

impl PriceSeries {
  /// Build a validated series: strictly increasing dates, finite positive prices.
  pub fn new(symbol: impl Into<String>, points: Vec<(NaiveDate, f64)>) -> Result<Self> {
    let symbol = symbol.into();
    check_dates(&symbol, points.iter().map(|(d, _)| *d))?;
    if let Some((d, p)) = points.iter().find(|(_, p)| !p.is_finite() || *p <= 0.0) {
      return Err(PortfolioError::invalid_series(
        &symbol,
        format!("price {p} on {d} is not strictly positive"),
      ));
    }
    Ok(Self { symbol, points })
  }

  pub fn symbol(&self) -> &str {
    &self.symbol
  }

  pub fn points(&self) -> &[(NaiveDate, f64)] {
    &self.points
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  fn price_on(&self, date: NaiveDate) -> Option<f64> {
    self
      .points
      .binary_search_by_key(&date, |(d, _)| *d)
      .ok()
      .map(|i| self.points[i].1)
  }
}

/// Dated returns of one asset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReturnSeries {
  symbol: String,
  dates: Vec<NaiveDate>,
  values: Vec<f64>,
  kind: ReturnKind,
}

impl ReturnSeries {
  pub fn new(
    symbol: impl Into<String>,
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
    kind: ReturnKind,
  ) -> Result<Self> {
    let symbol = symbol.into();
    if dates.len() != values.len() {
      return Err(PortfolioError::invalid_series(
        &symbol,
        format!("{} dates but {} values", dates.len(), values.len()),
      ));
    }
    check_dates(&symbol, dates.iter().copied())?;
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
      return Err(PortfolioError::DataGap {
        symbol,
        date: dates[i],
      });
    }
    Ok(Self {
      symbol,
      dates,
      values,
      kind,
    })
  }

  /// Returns between consecutive prices, dated by the later price.
  pub fn from_prices(prices: &PriceSeries, kind: ReturnKind) -> Self {
    let pts = prices.points();
    let mut dates = Vec::with_capacity(pts.len().saturating_sub(1));
    let mut values = Vec::with_capacity(pts.len().saturating_sub(1));
    for w in pts.windows(2) {
      let ratio = w[1].1 / w[0].1;
      dates.push(w[1].0);
      values.push(match kind {
        ReturnKind::Simple => ratio - 1.0,
        ReturnKind::Log => ratio.ln(),
      });
    }
    Self {
      symbol: prices.symbol().to_string(),
      dates,
      values,
      kind,
    }
  }

  pub fn symbol(&self) -> &str {
    &self.symbol
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn values(&self) -> &[f64] {
    &self.values
  }

  pub fn kind(&self) -> ReturnKind {
    self.kind
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Values converted to simple returns.
  pub fn simple_values(&self) -> Vec<f64> {
    self.values.iter().map(|&r| self.kind.to_simple(r)).collect()
  }
}

/// Aligned simple returns, one row per date and one column per asset.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnTable {
  symbols: Vec<String>,
  dates: Vec<NaiveDate>,
  rows: Vec<Vec<f64>>,
  forward_filled: usize,
}

impl ReturnTable {
  /// Build a table from already aligned rows of simple returns.
  pub fn new(symbols: Vec<String>, dates: Vec<NaiveDate>, rows: Vec<Vec<f64>>) -> Result<Self> {
    if symbols.is_empty() {
      return Err(PortfolioError::config("return table needs at least one asset"));
    }
    if dates.len() != rows.len() {
      return Err(PortfolioError::config(format!(
        "{} dates but {} return rows",
        dates.len(),
        rows.len()
      )));
    }
    check_dates("<table>", dates.iter().copied())?;
    for (t, row) in rows.iter().enumerate() {
      if row.len() != symbols.len() {
        return Err(PortfolioError::config(format!(
          "row {} has {} columns, expected {}",
          dates[t],
          row.len(),
          symbols.len()
        )));
      }
      if let Some(i) = row.iter().position(|v| !v.is_finite()) {
        return Err(PortfolioError::DataGap {
          symbol: symbols[i].clone(),
          date: dates[t],
        });
      }
    }
    Ok(Self {
      symbols,
      dates,
      rows,
      forward_filled: 0,
    })
  }

  /// Align price series on the union of their dates and convert to simple returns.
  ///
  /// Interior gaps fail or are forward-filled per `gap`; an asset that has not
  /// started trading yet on a calendar date is always a gap.
  pub fn from_prices(series: &[PriceSeries], gap: GapPolicy) -> Result<Self> {
    let calendar = union_calendar(series.iter().flat_map(|s| s.points().iter().map(|(d, _)| *d)));
    if calendar.len() < 2 {
      return Err(PortfolioError::config("need at least two price dates"));
    }

    let mut filled = 0usize;
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(series.len());
    for s in series {
      let mut last: Option<f64> = None;
      let mut col = Vec::with_capacity(calendar.len());
      for &d in &calendar {
        let price = match (s.price_on(d), last, gap) {
          (Some(p), _, _) => p,
          (None, Some(p), GapPolicy::ForwardFill) => {
            filled += 1;
            p
          }
          (None, _, _) => {
            return Err(PortfolioError::DataGap {
              symbol: s.symbol().to_string(),
              date: d,
            })
          }
        };
        col.push(price);
        last = Some(price);
      }
      columns.push(col);
    }

    if filled > 0 {
      tracing::warn!(filled, "forward-filled missing prices (gap_policy = forward_fill)");
    }

    let rows = (1..calendar.len())
      .map(|t| columns.iter().map(|c| c[t] / c[t - 1] - 1.0).collect())
      .collect();
    let mut table = Self::new(
      series.iter().map(|s| s.symbol().to_string()).collect(),
      calendar[1..].to_vec(),
      rows,
    )?;
    table.forward_filled = filled;
    Ok(table)
  }

  /// Align return series on the union of their dates.
  ///
  /// Under [`GapPolicy::ForwardFill`] a missing return is a flat price, i.e. `0.0`.
  pub fn from_returns(series: &[ReturnSeries], gap: GapPolicy) -> Result<Self> {
    let calendar = union_calendar(series.iter().flat_map(|s| s.dates().iter().copied()));
    let mut filled = 0usize;
    let mut rows = vec![Vec::with_capacity(series.len()); calendar.len()];
    for s in series {
      let first = s.dates().first().copied();
      for (t, &d) in calendar.iter().enumerate() {
        let r = match s.dates().binary_search(&d) {
          Ok(i) => s.kind().to_simple(s.values()[i]),
          Err(_) if gap == GapPolicy::ForwardFill && first.is_some_and(|f| f < d) => {
            filled += 1;
            0.0
          }
          Err(_) => {
            return Err(PortfolioError::DataGap {
              symbol: s.symbol().to_string(),
              date: d,
            })
          }
        };
        rows[t].push(r);
      }
    }

    if filled > 0 {
      tracing::warn!(filled, "filled missing returns with 0.0 (gap_policy = forward_fill)");
    }

    let mut table = Self::new(
      series.iter().map(|s| s.symbol().to_string()).collect(),
      calendar,
      rows,
    )?;
    table.forward_filled = filled;
    Ok(table)
  }

  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn rows(&self) -> &[Vec<f64>] {
    &self.rows
  }

  pub fn row(&self, t: usize) -> &[f64] {
    &self.rows[t]
  }

  pub fn n_assets(&self) -> usize {
    self.symbols.len()
  }

  pub fn n_periods(&self) -> usize {
    self.dates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dates.is_empty()
  }

  /// Number of cells filled under [`GapPolicy::ForwardFill`].
  pub fn forward_filled(&self) -> usize {
    self.forward_filled
  }

  /// Returns of asset `i` over all dates.
  pub fn column(&self, i: usize) -> Vec<f64> {
    self.rows.iter().map(|r| r[i]).collect()
  }

  /// All columns, asset-major.
  pub fn columns(&self) -> Vec<Vec<f64>> {
    (0..self.n_assets()).map(|i| self.column(i)).collect()
  }

  /// Inclusive row index range of dates within `[start, end]`.
  pub fn range_indices(&self, start: NaiveDate, end: NaiveDate) -> Result<(usize, usize)> {
    if start > end {
      return Err(PortfolioError::config(format!(
        "start date {start} is after end date {end}"
      )));
    }
    let first = self.dates.partition_point(|d| *d < start);
    let past_end = self.dates.partition_point(|d| *d <= end);
    if first >= past_end {
      return Err(PortfolioError::config(format!(
        "no return observations between {start} and {end}"
      )));
    }
    Ok((first, past_end - 1))
  }

  /// Rows `[from, to)` as a new table.
  pub fn slice(&self, from: usize, to: usize) -> ReturnTable {
    let to = to.min(self.n_periods());
    let from = from.min(to);
    ReturnTable {
      symbols: self.symbols.clone(),
      dates: self.dates[from..to].to_vec(),
      rows: self.rows[from..to].to_vec(),
      forward_filled: 0,
    }
  }

  /// Trailing history ending before row `to` (exclusive), at most `lookback` rows.
  pub fn history_before(&self, to: usize, lookback: Option<usize>) -> ReturnTable {
    let from = lookback.map_or(0, |n| to.saturating_sub(n));
    self.slice(from, to)
  }

  /// Rows dated within `[start, end]`.
  pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Result<ReturnTable> {
    let (s, e) = self.range_indices(start, end)?;
    Ok(self.slice(s, e + 1))
  }

  /// Rows dated strictly before `date`.
  pub fn before(&self, date: NaiveDate) -> ReturnTable {
    self.slice(0, self.dates.partition_point(|d| *d < date))
  }

  /// Keep only the given symbols, in the given order.
  pub fn select(&self, symbols: &[String]) -> Result<ReturnTable> {
    let idx = symbols
      .iter()
      .map(|s| {
        self
          .symbols
          .iter()
          .position(|x| x == s)
          .ok_or_else(|| PortfolioError::config(format!("unknown symbol {s}")))
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(ReturnTable {
      symbols: symbols.to_vec(),
      dates: self.dates.clone(),
      rows: self.rows.iter().map(|r| idx.iter().map(|&i| r[i]).collect()).collect(),
      forward_filled: self.forward_filled,
    })
  }
}

fn union_calendar(dates: impl Iterator<Item = NaiveDate>) -> Vec<NaiveDate> {
  dates.collect::<BTreeSet<_>>().into_iter().collect()
}

/// Read a wide price CSV: header `date,SYM1,SYM2,...`, ISO dates, empty cell =
/// missing observation. Short rows leave the trailing symbols missing.
pub fn read_price_csv<R: Read>(reader: R) -> Result<Vec<PriceSeries>> {
  let mut rdr = ReaderBuilder::new()
    .trim(Trim::All)
    .flexible(true)
    .from_reader(reader);
  let header = rdr
    .headers()
    .map_err(|e| PortfolioError::config(format!("bad price header: {e}")))?
    .clone();
  let symbols: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
  if symbols.is_empty() || symbols.iter().any(String::is_empty) {
    return Err(PortfolioError::config(format!(
      "bad price header: {:?}",
      header.iter().collect::<Vec<_>>()
    )));
  }

  let mut points: Vec<Vec<(NaiveDate, f64)>> = vec![Vec::new(); symbols.len()];
  let mut record = StringRecord::new();
  while rdr
    .read_record(&mut record)
    .map_err(|e| PortfolioError::config(format!("reading prices: {e}")))?
  {
    let line = record.position().map_or(0, |p| p.line());
    let raw_date = record.get(0).unwrap_or_default();
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
      .map_err(|e| PortfolioError::config(format!("line {line}: bad date {raw_date:?}: {e}")))?;
    if record.len() > symbols.len() + 1 {
      return Err(PortfolioError::config(format!(
        "line {line}: {} cells for {} header columns",
        record.len(),
        symbols.len() + 1
      )));
    }
    for (i, cell) in record.iter().skip(1).enumerate() {
      if cell.is_empty() {
        continue;
      }
      let price: f64 = cell.parse().map_err(|_| {
        PortfolioError::invalid_series(&symbols[i], format!("unparseable price {cell:?} on {date}"))
      })?;
      points[i].push((date, price));
    }
  }

  symbols
    .into_iter()
    .zip(points)
    .map(|(s, p)| PriceSeries::new(s, p))
    .collect()
}

/// [`read_price_csv`] over an in-memory string.
pub fn parse_price_csv(text: &str) -> Result<Vec<PriceSeries>> {
  read_price_csv(text.as_bytes())
}

/// [`read_price_csv`] over a file.
pub fn load_price_csv(path: impl AsRef<Path>) -> Result<Vec<PriceSeries>> {
  let path = path.as_ref();
  let file = File::open(path).map_err(|e| PortfolioError::config(format!("opening {}: {e}", path.display())))?;
  read_price_csv(file)
}

#[cfg(test)]
mod tests {
  use tracing_test::traced_test;

  use super::*;

  fn d(m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, day).unwrap()
  }

  #[test]
  fn price_series_rejects_unordered_and_non_positive() {
    let err = PriceSeries::new("X", vec![(d(1, 3), 1.0), (d(1, 2), 1.0)]).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidSeries { .. }));

    let err = PriceSeries::new("X", vec![(d(1, 2), 1.0), (d(1, 3), 0.0)]).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidSeries { .. }));

    let err = PriceSeries::new("X", vec![(d(1, 2), 1.0), (d(1, 2), 2.0)]).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidSeries { .. }));
  }

  #[test]
  fn returns_are_one_shorter_than_prices() {
    let p = PriceSeries::new("X", vec![(d(1, 2), 100.0), (d(1, 3), 110.0), (d(1, 4), 99.0)]).unwrap();
    let simple = ReturnSeries::from_prices(&p, ReturnKind::Simple);
    assert_eq!(simple.len(), 2);
    assert_eq!(simple.dates(), &[d(1, 3), d(1, 4)]);
    assert!((simple.values()[0] - 0.1).abs() < 1e-12);
    assert!((simple.values()[1] + 0.1).abs() < 1e-12);

    let log = ReturnSeries::from_prices(&p, ReturnKind::Log);
    assert!((log.values()[0] - 1.1_f64.ln()).abs() < 1e-12);
    assert!((log.simple_values()[0] - 0.1).abs() < 1e-12);
  }

  #[test]
  #[traced_test]
  fn gap_fails_by_default_and_forward_fills_on_request() {
    let a = PriceSeries::new("A", vec![(d(1, 2), 10.0), (d(1, 3), 11.0), (d(1, 4), 12.1)]).unwrap();
    let b = PriceSeries::new("B", vec![(d(1, 2), 20.0), (d(1, 4), 22.0)]).unwrap();

    let err = ReturnTable::from_prices(&[a.clone(), b.clone()], GapPolicy::Fail).unwrap_err();
    assert_eq!(
      err,
      PortfolioError::DataGap {
        symbol: "B".into(),
        date: d(1, 3)
      }
    );

    let table = ReturnTable::from_prices(&[a, b], GapPolicy::ForwardFill).unwrap();
    assert_eq!(table.forward_filled(), 1);
    assert_eq!(table.n_periods(), 2);
    assert!(table.row(0)[1].abs() < 1e-12);
    assert!((table.row(1)[1] - 0.1).abs() < 1e-12);
    assert!((table.row(1)[0] - 0.1).abs() < 1e-12);
    assert!(logs_contain("forward-filled missing prices"));
  }

  #[test]
  fn leading_gap_is_never_filled() {
    let a = PriceSeries::new("A", vec![(d(1, 2), 10.0), (d(1, 3), 11.0), (d(1, 4), 12.0)]).unwrap();
    let b = PriceSeries::new("B", vec![(d(1, 3), 20.0), (d(1, 4), 22.0)]).unwrap();
    let err = ReturnTable::from_prices(&[a, b], GapPolicy::ForwardFill).unwrap_err();
    assert!(matches!(err, PortfolioError::DataGap { ref symbol, .. } if symbol == "B"));
  }

  #[test]
  fn from_returns_fills_interior_gaps_with_zero() {
    let a = ReturnSeries::new("A", vec![d(1, 2), d(1, 3), d(1, 4)], vec![0.01, 0.02, 0.03], ReturnKind::Simple).unwrap();
    let b = ReturnSeries::new("B", vec![d(1, 2), d(1, 4)], vec![0.01, 0.05], ReturnKind::Simple).unwrap();
    assert!(ReturnTable::from_returns(&[a.clone(), b.clone()], GapPolicy::Fail).is_err());

    let table = ReturnTable::from_returns(&[a, b], GapPolicy::ForwardFill).unwrap();
    assert_eq!(table.column(1), vec![0.01, 0.0, 0.05]);
  }

  #[test]
  fn range_and_history_never_cross_the_boundary() {
    let dates: Vec<NaiveDate> = (2..=6).map(|x| d(1, x)).collect();
    let rows = (0..5).map(|t| vec![t as f64 * 0.001]).collect();
    let table = ReturnTable::new(vec!["A".into()], dates, rows).unwrap();

    assert_eq!(table.range_indices(d(1, 3), d(1, 5)).unwrap(), (1, 3));
    assert!(table.range_indices(d(2, 1), d(2, 5)).is_err());

    let hist = table.history_before(3, Some(2));
    assert_eq!(hist.dates(), &[d(1, 3), d(1, 4)]);
    assert_eq!(table.before(d(1, 4)).n_periods(), 2);
  }

  #[test]
  fn csv_with_empty_cells_becomes_gaps() {
    let text = "date,SPY,BND\n2024-01-02,470.0,72.0\n2024-01-03,472.0,\n2024-01-04,468.0,72.5\n";
    let series = parse_price_csv(text).unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(series[0].len(), 3);
    assert_eq!(series[1].len(), 2);
    assert!(ReturnTable::from_prices(&series, GapPolicy::Fail).is_err());
  }

  #[test]
  fn csv_handles_quotes_crlf_and_padding() {
    let text = "\"date\",\"SPY\",\"BND\"\r\n2024-01-02, 470.0 ,\"72.0\"\r\n\r\n2024-01-03,472.0\r\n";
    let series = parse_price_csv(text).unwrap();
    assert_eq!(series[0].symbol(), "SPY");
    assert_eq!(series[1].symbol(), "BND");
    assert_eq!(series[0].points(), &[(d(1, 2), 470.0), (d(1, 3), 472.0)]);
    assert_eq!(series[1].points(), &[(d(1, 2), 72.0)]);
  }

  #[test]
  fn csv_rejects_extra_cells_and_bad_prices() {
    let extra = parse_price_csv("date,SPY\n2024-01-02,470.0,1.0\n").unwrap_err();
    assert!(matches!(extra, PortfolioError::ConfigurationError(_)));
    let bad = parse_price_csv("date,SPY\n2024-01-02,abc\n").unwrap_err();
    assert!(matches!(bad, PortfolioError::InvalidSeries { .. }));
    assert!(parse_price_csv("").is_err());
  }

  #[test]
  fn csv_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prices.csv");
    std::fs::write(&path, "date,SPY\n2024-01-02,470.0\n2024-01-03,471.0\n").unwrap();
    assert_eq!(load_price_csv(&path).unwrap()[0].len(), 2);
    assert!(load_price_csv(dir.path().join("missing.csv")).is_err());
  }
}
