use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;

use crate::date_util::{last_day_of_month, quarter_of, DateRange};
use crate::error::{Error, Result};

static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// A named reporting period, resolved against a reference date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Quarter(i32, u8),
    Month(i32, u8),
    Week(i32, u8),
    /// Last N days ending on (and including) the reference date.
    Rolling(u32, NaiveDate),
    YearToDate(NaiveDate),
    QuarterToDate(NaiveDate),
    MonthToDate(NaiveDate),
}

impl Period {
    /// Parse a period string relative to the local current date.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_as_of(s, chrono::Local::now().date_naive())
    }

    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `2025`: year
    /// - `2025-Q1`: quarter
    /// - `2025-01`: month
    /// - `2025-W05`: ISO week
    /// - `30d`: rolling last N days
    /// - `ytd`, `qtd`, `mtd`: to-date periods ending on `today`
    pub fn parse_as_of(s: &str, today: NaiveDate) -> Result<Self> {
        let s = s.trim();

        match s.to_lowercase().as_str() {
            "ytd" => return Ok(Period::YearToDate(today)),
            "qtd" => return Ok(Period::QuarterToDate(today)),
            "mtd" => return Ok(Period::MonthToDate(today)),
            _ => {}
        }

        if let Some(n) = s.strip_suffix(['d', 'D']) {
            if let Ok(n) = n.parse::<u32>() {
                if n == 0 {
                    return Err(Error::PeriodParse(format!("rolling period must be at least 1 day: {s}")));
                }
                return Ok(Period::Rolling(n, today));
            }
        }

        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            let q: u8 = caps[2].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            return Ok(Period::Quarter(year, q));
        }

        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            let week: u8 = caps[2].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            if NaiveDate::from_isoywd_opt(year, week as u32, Weekday::Mon).is_some() {
                return Ok(Period::Week(year, week));
            }
        }

        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            let month: u8 = caps[2].parse().map_err(|_| Error::PeriodParse(s.to_string()))?;
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// The inclusive date range this period covers.
    pub fn date_range(&self) -> Result<DateRange> {
        let ymd = |y: i32, m: u32, d: u32| {
            NaiveDate::from_ymd_opt(y, m, d)
                .ok_or_else(|| Error::PeriodParse(format!("date out of range: {y}-{m:02}-{d:02}")))
        };
        let (start, end) = match self {
            Period::Year(y) => (ymd(*y, 1, 1)?, ymd(*y, 12, 31)?),
            Period::Quarter(y, q) => {
                let start_month = (*q as u32 - 1) * 3 + 1;
                (ymd(*y, start_month, 1)?, last_day_of_month(*y, *q as u32 * 3))
            }
            Period::Month(y, m) => (ymd(*y, *m as u32, 1)?, last_day_of_month(*y, *m as u32)),
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon)
                    .ok_or_else(|| Error::PeriodParse(format!("no such week: {y}-W{w:02}")))?;
                let end = start
                    .checked_add_signed(Duration::days(6))
                    .ok_or_else(|| Error::PeriodParse(format!("no such week: {y}-W{w:02}")))?;
                (start, end)
            }
            Period::Rolling(n, as_of) => {
                let days = i64::from(n.saturating_sub(1));
                let start = as_of
                    .checked_sub_signed(Duration::days(days))
                    .ok_or_else(|| Error::PeriodParse(format!("{n}d reaches before the calendar")))?;
                (start, *as_of)
            }
            Period::YearToDate(today) => (ymd(today.year(), 1, 1)?, *today),
            Period::QuarterToDate(today) => {
                let start_month = (quarter_of(*today) as u32 - 1) * 3 + 1;
                (ymd(today.year(), start_month, 1)?, *today)
            }
            Period::MonthToDate(today) => (ymd(today.year(), today.month(), 1)?, *today),
        };
        DateRange::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_fixed_periods() {
        let today = d(2025, 5, 14);
        assert_eq!(Period::parse_as_of("2025", today).unwrap(), Period::Year(2025));
        assert_eq!(Period::parse_as_of("2025-Q2", today).unwrap(), Period::Quarter(2025, 2));
        assert_eq!(Period::parse_as_of("2025-03", today).unwrap(), Period::Month(2025, 3));
        assert_eq!(Period::parse_as_of("2025-W05", today).unwrap(), Period::Week(2025, 5));
        assert_eq!(Period::parse_as_of("30d", today).unwrap(), Period::Rolling(30, today));
    }

    #[test]
    fn test_parse_invalid() {
        let today = d(2025, 5, 14);
        assert!(Period::parse_as_of("garbage", today).is_err());
        assert!(Period::parse_as_of("2025-Q5", today).is_err());
        assert!(Period::parse_as_of("2025-13", today).is_err());
        assert!(Period::parse_as_of("0d", today).is_err());
    }

    #[test]
    fn test_quarter_range() {
        let r = Period::Quarter(2025, 1).date_range().unwrap();
        assert_eq!((r.start, r.end), (d(2025, 1, 1), d(2025, 3, 31)));
    }

    #[test]
    fn test_to_date_ranges() {
        let today = d(2025, 5, 14);
        let q = Period::parse_as_of("qtd", today).unwrap().date_range().unwrap();
        assert_eq!((q.start, q.end), (d(2025, 4, 1), today));
        let m = Period::parse_as_of("MTD", today).unwrap().date_range().unwrap();
        assert_eq!((m.start, m.end), (d(2025, 5, 1), today));
        let y = Period::parse_as_of("ytd", today).unwrap().date_range().unwrap();
        assert_eq!(y.start, d(2025, 1, 1));
    }

    #[test]
    fn test_rolling_range_includes_today() {
        let today = d(2025, 5, 14);
        let r = Period::Rolling(7, today).date_range().unwrap();
        assert_eq!(r.start, d(2025, 5, 8));
        assert_eq!(r.days(), 7);
    }

    #[test]
    fn test_huge_rolling_window_is_an_error() {
        let err = Period::parse_as_of("200000000d", d(2025, 5, 14))
            .and_then(|p| p.date_range())
            .unwrap_err();
        assert!(matches!(err, Error::PeriodParse(_)));
    }

    #[test]
    fn test_week_range() {
        let r = Period::Week(2025, 1).date_range().unwrap();
        assert_eq!(r.start.weekday(), Weekday::Mon);
        assert_eq!(r.days(), 7);
    }
}
