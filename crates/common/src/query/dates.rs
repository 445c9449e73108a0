//! Date range resolution
//!
//! Turns relative periods ("today", "last month", ...) and absolute
//! day-first dates into closed UTC instant ranges. Calendar boundaries are
//! placed in a fixed offset so a deployment can follow plant-local days.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

/// Inclusive instant range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Named relative periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativePeriod {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
}

impl RelativePeriod {
    /// Parse a keyword as it appears in a question (whitespace-normalized, any case)
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = token
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        match normalized.as_str() {
            "today" => Some(Self::Today),
            "yesterday" => Some(Self::Yesterday),
            "this week" => Some(Self::ThisWeek),
            "last week" => Some(Self::LastWeek),
            "this month" => Some(Self::ThisMonth),
            "last month" => Some(Self::LastMonth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Yesterday => "yesterday",
            Self::ThisWeek => "this week",
            Self::LastWeek => "last week",
            Self::ThisMonth => "this month",
            Self::LastMonth => "last month",
        }
    }
}

/// A date mention extracted from a question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateExpression {
    Relative(RelativePeriod),
    /// Raw digit pattern such as `24_02_2025`, separators untouched
    Absolute(String),
}

/// Resolves date expressions against a supplied "now"
#[derive(Debug, Clone, Copy)]
pub struct DateRangeResolver {
    offset: FixedOffset,
    week_start: Weekday,
}

impl Default for DateRangeResolver {
    fn default() -> Self {
        Self {
            offset: Utc.fix(),
            week_start: Weekday::Sun,
        }
    }
}

impl DateRangeResolver {
    pub fn new(offset: FixedOffset, week_start: Weekday) -> Self {
        Self { offset, week_start }
    }

    /// Resolve any expression; invalid absolute dates yield `None`.
    pub fn resolve_expression(&self, expr: &DateExpression, now: DateTime<Utc>) -> Option<DateRange> {
        match expr {
            DateExpression::Relative(period) => Some(self.resolve(*period, now)),
            DateExpression::Absolute(raw) => {
                let day = parse_absolute_date(raw)?;
                Some(self.day_range(day))
            }
        }
    }

    /// Resolve a relative period to its closed range
    pub fn resolve(&self, period: RelativePeriod, now: DateTime<Utc>) -> DateRange {
        let today = now.with_timezone(&self.offset).date_naive();

        match period {
            RelativePeriod::Today => self.day_range(today),
            RelativePeriod::Yesterday => {
                let yesterday = today - Duration::days(1);
                DateRange {
                    start: self.start_of(yesterday),
                    end: self.last_instant_before(today),
                }
            }
            RelativePeriod::ThisWeek => DateRange {
                start: self.start_of(self.week_start_of(today)),
                end: now,
            },
            RelativePeriod::LastWeek => {
                let this_week = self.week_start_of(today);
                DateRange {
                    start: self.start_of(this_week - Duration::days(7)),
                    end: self.last_instant_before(this_week),
                }
            }
            RelativePeriod::ThisMonth => DateRange {
                start: self.start_of(first_of_month(today)),
                end: now,
            },
            RelativePeriod::LastMonth => {
                let this_month = first_of_month(today);
                let previous = first_of_month(this_month - Duration::days(1));
                DateRange {
                    start: self.start_of(previous),
                    end: self.last_instant_before(this_month),
                }
            }
        }
    }

    /// `[00:00:00.000, 23:59:59.999]` of one calendar day
    pub fn day_range(&self, day: NaiveDate) -> DateRange {
        DateRange {
            start: self.start_of(day),
            end: self.last_instant_before(day + Duration::days(1)),
        }
    }

    fn week_start_of(&self, day: NaiveDate) -> NaiveDate {
        let back = (7 + day.weekday().num_days_from_monday()
            - self.week_start.num_days_from_monday())
            % 7;
        day - Duration::days(back as i64)
    }

    fn start_of(&self, day: NaiveDate) -> DateTime<Utc> {
        let local_midnight = day.and_time(NaiveTime::MIN);
        let utc = local_midnight - Duration::seconds(self.offset.local_minus_utc() as i64);
        Utc.from_utc_datetime(&utc)
    }

    fn last_instant_before(&self, day: NaiveDate) -> DateTime<Utc> {
        self.start_of(day) - Duration::milliseconds(1)
    }
}

fn first_of_month(day: NaiveDate) -> NaiveDate {
    day - Duration::days(day.day0() as i64)
}

/// Parse a day-first date whose separators may be `_`, `/` or `-`.
pub fn parse_absolute_date(raw: &str) -> Option<NaiveDate> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| if c == '_' || c == '/' { '-' } else { c })
        .collect();
    NaiveDate::parse_from_str(&normalized, "%d-%m-%Y").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    // Wednesday
    const NOW: &str = "2025-03-12T15:30:00Z";

    #[test]
    fn test_last_month_covers_whole_previous_month() {
        let resolver = DateRangeResolver::default();
        let range = resolver.resolve(RelativePeriod::LastMonth, at(NOW));

        assert_eq!(range.start, at("2025-02-01T00:00:00Z"));
        assert_eq!(range.end, at("2025-02-28T23:59:59.999Z"));
    }

    #[test]
    fn test_last_month_across_year_boundary() {
        let resolver = DateRangeResolver::default();
        let range = resolver.resolve(RelativePeriod::LastMonth, at("2025-01-15T08:00:00Z"));

        assert_eq!(range.start, at("2024-12-01T00:00:00Z"));
        assert_eq!(range.end, at("2024-12-31T23:59:59.999Z"));
    }

    #[test]
    fn test_today_and_yesterday() {
        let resolver = DateRangeResolver::default();

        let today = resolver.resolve(RelativePeriod::Today, at(NOW));
        assert_eq!(today.start, at("2025-03-12T00:00:00Z"));
        assert_eq!(today.end, at("2025-03-12T23:59:59.999Z"));

        let yesterday = resolver.resolve(RelativePeriod::Yesterday, at(NOW));
        assert_eq!(yesterday.start, at("2025-03-11T00:00:00Z"));
        assert_eq!(yesterday.end, at("2025-03-11T23:59:59.999Z"));
    }

    #[test]
    fn test_weeks_start_on_sunday_by_default() {
        let resolver = DateRangeResolver::default();

        let this_week = resolver.resolve(RelativePeriod::ThisWeek, at(NOW));
        assert_eq!(this_week.start, at("2025-03-09T00:00:00Z"));
        assert_eq!(this_week.end, at(NOW));

        let last_week = resolver.resolve(RelativePeriod::LastWeek, at(NOW));
        assert_eq!(last_week.start, at("2025-03-02T00:00:00Z"));
        assert_eq!(last_week.end, at("2025-03-08T23:59:59.999Z"));
    }

    #[test]
    fn test_monday_week_start() {
        let resolver = DateRangeResolver::new(FixedOffset::east_opt(0).unwrap(), Weekday::Mon);
        let this_week = resolver.resolve(RelativePeriod::ThisWeek, at(NOW));
        assert_eq!(this_week.start, at("2025-03-10T00:00:00Z"));
    }

    #[test]
    fn test_this_month_ends_now() {
        let resolver = DateRangeResolver::default();
        let range = resolver.resolve(RelativePeriod::ThisMonth, at(NOW));
        assert_eq!(range.start, at("2025-03-01T00:00:00Z"));
        assert_eq!(range.end, at(NOW));
    }

    #[test]
    fn test_offset_moves_day_boundaries() {
        // UTC+05:30; 20:00Z is already the 13th locally
        let resolver = DateRangeResolver::new(FixedOffset::east_opt(330 * 60).unwrap(), Weekday::Sun);
        let today = resolver.resolve(RelativePeriod::Today, at("2025-03-12T20:00:00Z"));

        assert_eq!(today.start, at("2025-03-12T18:30:00Z"));
        assert_eq!(today.end, at("2025-03-13T18:29:59.999Z"));
    }

    #[test]
    fn test_absolute_dates() {
        let resolver = DateRangeResolver::default();
        for raw in ["24_02_2025", "24/02/2025", "24-02-2025"] {
            let range = resolver
                .resolve_expression(&DateExpression::Absolute(raw.to_string()), at(NOW))
                .unwrap();
            assert_eq!(range.start, at("2025-02-24T00:00:00Z"));
            assert_eq!(range.end, at("2025-02-24T23:59:59.999Z"));
        }
    }

    #[test]
    fn test_invalid_absolute_date_is_not_an_error() {
        let resolver = DateRangeResolver::default();
        let expr = DateExpression::Absolute("31_02_2025".to_string());
        assert!(resolver.resolve_expression(&expr, at(NOW)).is_none());
    }

    #[test]
    fn test_relative_period_parse() {
        assert_eq!(RelativePeriod::parse("Last  Month"), Some(RelativePeriod::LastMonth));
        assert_eq!(RelativePeriod::parse("TODAY"), Some(RelativePeriod::Today));
        assert_eq!(RelativePeriod::parse("next week"), None);
    }
}
