use std::fmt::Display;
use std::str::FromStr;

use chrono::Datelike;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;

/// How often the portfolio is reset to its target weights.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceFrequency {
  /// Buy and hold.
  None,
  Weekly,
  #[default]
  Monthly,
  Quarterly,
  Annually,
}

impl RebalanceFrequency {
  /// Calendar bucket of `date`; `None` for buy-and-hold.
  fn period(self, date: NaiveDate) -> Option<(i32, u32)> {
    match self {
      Self::None => None,
      Self::Weekly => {
        let w = date.iso_week();
        Some((w.year(), w.week()))
      }
      Self::Monthly => Some((date.year(), date.month())),
      Self::Quarterly => Some((date.year(), (date.month() - 1) / 3)),
      Self::Annually => Some((date.year(), 0)),
    }
  }

  /// `date` closes its period when `next` (the following trading date in the
  /// window) falls into another period, or when there is no next date.
  pub fn is_period_end(self, date: NaiveDate, next: Option<NaiveDate>) -> bool {
    match (self.period(date), next) {
      (None, _) => false,
      (Some(_), None) => true,
      (Some(p), Some(n)) => self.period(n) != Some(p),
    }
  }

  /// Rebalance dates for a window of trading dates.
  pub fn rebalance_dates(self, dates: &[NaiveDate]) -> Vec<NaiveDate> {
    dates
      .iter()
      .enumerate()
      .filter(|(i, d)| self.is_period_end(**d, dates.get(i + 1).copied()))
      .map(|(_, d)| *d)
      .collect()
  }
}

impl Display for RebalanceFrequency {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::None => write!(f, "none"),
      Self::Weekly => write!(f, "weekly"),
      Self::Monthly => write!(f, "monthly"),
      Self::Quarterly => write!(f, "quarterly"),
      Self::Annually => write!(f, "annually"),
    }
  }
}

impl FromStr for RebalanceFrequency {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "none" | "never" | "buy-and-hold" => Ok(Self::None),
      "weekly" => Ok(Self::Weekly),
      "monthly" => Ok(Self::Monthly),
      "quarterly" => Ok(Self::Quarterly),
      "annually" | "yearly" => Ok(Self::Annually),
      other => Err(PortfolioError::config(format!("unknown rebalance frequency {other}"))),
    }
  }
}

/// Weekdays from `start`, `n` of them.
#[cfg(test)]
pub(crate) fn weekdays(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
  use chrono::Weekday;

  start
    .iter_days()
    .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
    .take(n)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn year() -> Vec<NaiveDate> {
    weekdays(NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(), 252)
  }

  #[test]
  fn monthly_schedule_has_one_date_per_month() {
    let dates = RebalanceFrequency::Monthly.rebalance_dates(&year());
    assert_eq!(dates.len(), 12);
    assert_eq!(dates[0], NaiveDate::from_ymd_opt(2023, 1, 31).unwrap());
    assert_eq!(dates[1], NaiveDate::from_ymd_opt(2023, 2, 28).unwrap());
  }

  #[test]
  fn other_frequencies() {
    let y = year();
    assert_eq!(RebalanceFrequency::Quarterly.rebalance_dates(&y).len(), 4);
    assert_eq!(RebalanceFrequency::Annually.rebalance_dates(&y).len(), 1);
    assert!(RebalanceFrequency::None.rebalance_dates(&y).is_empty());
    // 252 weekdays from a Monday are 50 full weeks plus two days.
    assert_eq!(RebalanceFrequency::Weekly.rebalance_dates(&y).len(), 51);
  }

  #[test]
  fn parses_names() {
    assert_eq!("Quarterly".parse::<RebalanceFrequency>().unwrap(), RebalanceFrequency::Quarterly);
    assert_eq!(RebalanceFrequency::Weekly.to_string(), "weekly");
    assert!("hourly".parse::<RebalanceFrequency>().is_err());
  }
}
