//! Subscriptions and cron-like schedules
//!
//! A subscription fires either on a schedule or when new data is captured.
//! Schedule matching is a pure function of the timestamp.

use super::query::QueryParameter;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleParseError(pub String);

impl fmt::Display for ScheduleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule: {}", self.0)
    }
}

impl std::error::Error for ScheduleParseError {}

/// One schedule field: a wildcard, or a union of inclusive ranges
///
/// Accepted syntax: absent or `*` (wildcard), `5`, `1,15,30`, `1-5`, `[1-5]`,
/// and combinations such as `0,[10-20]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleField {
    source: Option<String>,
    #[serde(skip)]
    ranges: Vec<RangeInclusive<u32>>,
}

impl ScheduleField {
    pub fn wildcard() -> Self {
        Self::default()
    }

    pub fn parse(source: Option<&str>, min: u32, max: u32) -> Result<Self, ScheduleParseError> {
        let source = match source.map(str::trim) {
            None | Some("") | Some("*") => return Ok(Self::wildcard()),
            Some(s) => s,
        };

        let mut ranges = Vec::new();
        for part in source.split(',') {
            let part = part.trim().trim_start_matches('[').trim_end_matches(']').trim();
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (parse_bound(start, source)?, parse_bound(end, source)?),
                None => {
                    let value = parse_bound(part, source)?;
                    (value, value)
                }
            };
            if start > end || start < min || end > max {
                return Err(ScheduleParseError(format!(
                    "'{}' is outside {}-{}",
                    source, min, max
                )));
            }
            ranges.push(start..=end);
        }

        Ok(Self {
            source: Some(source.to_string()),
            ranges,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn matches(&self, value: u32) -> bool {
        self.is_wildcard() || self.ranges.iter().any(|r| r.contains(&value))
    }

    /// Original text, `None` for wildcards
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

fn parse_bound(value: &str, source: &str) -> Result<u32, ScheduleParseError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ScheduleParseError(format!("'{}' is not a number list", source)))
}

/// Six-field schedule; day of week counts 1 = Monday .. 7 = Sunday
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuerySchedule {
    pub second: ScheduleField,
    pub minute: ScheduleField,
    pub hour: ScheduleField,
    pub day_of_month: ScheduleField,
    pub month: ScheduleField,
    pub day_of_week: ScheduleField,
}

impl QuerySchedule {
    pub fn parse(
        second: Option<&str>,
        minute: Option<&str>,
        hour: Option<&str>,
        day_of_month: Option<&str>,
        month: Option<&str>,
        day_of_week: Option<&str>,
    ) -> Result<Self, ScheduleParseError> {
        Ok(Self {
            second: ScheduleField::parse(second, 0, 59)?,
            minute: ScheduleField::parse(minute, 0, 59)?,
            hour: ScheduleField::parse(hour, 0, 23)?,
            day_of_month: ScheduleField::parse(day_of_month, 1, 31)?,
            month: ScheduleField::parse(month, 1, 12)?,
            day_of_week: ScheduleField::parse(day_of_week, 1, 7)?,
        })
    }

    /// Rebuild parsed ranges after deserialization
    pub fn reparse(&self) -> Result<Self, ScheduleParseError> {
        Self::parse(
            self.second.source(),
            self.minute.source(),
            self.hour.source(),
            self.day_of_month.source(),
            self.month.source(),
            self.day_of_week.source(),
        )
    }

    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.second.matches(now.second())
            && self.minute.matches(now.minute())
            && self.hour.matches(now.hour())
            && self.day_of_month.matches(now.day())
            && self.month.matches(now.month())
            && self.day_of_week.matches(now.weekday().number_from_monday())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTrigger {
    Schedule(QuerySchedule),
    /// Fires when a capture commits; the URI names the trigger
    DataInsert(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Storage id, set once persisted
    pub id: Option<i64>,
    pub subscription_id: String,
    pub query_name: String,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
    pub destination: String,
    pub active: bool,
    pub report_if_empty: bool,
    pub initial_record_time: Option<DateTime<Utc>>,
    pub trigger: SubscriptionTrigger,
}

impl Subscription {
    pub fn scheduled(
        subscription_id: impl Into<String>,
        query_name: impl Into<String>,
        destination: impl Into<String>,
        schedule: QuerySchedule,
    ) -> Self {
        Self {
            id: None,
            subscription_id: subscription_id.into(),
            query_name: query_name.into(),
            parameters: Vec::new(),
            destination: destination.into(),
            active: true,
            report_if_empty: false,
            initial_record_time: None,
            trigger: SubscriptionTrigger::Schedule(schedule),
        }
    }

    pub fn triggered(
        subscription_id: impl Into<String>,
        query_name: impl Into<String>,
        destination: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            subscription_id: subscription_id.into(),
            query_name: query_name.into(),
            parameters: Vec::new(),
            destination: destination.into(),
            active: true,
            report_if_empty: false,
            initial_record_time: None,
            trigger: SubscriptionTrigger::DataInsert(trigger.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2024-01-01 is a Monday
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_every_minute_at_second_zero() {
        let schedule = QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();

        assert!(schedule.matches(at(10, 15, 0)));
        assert!(!schedule.matches(at(10, 15, 30)));
    }

    #[test]
    fn test_lists_and_ranges() {
        let schedule =
            QuerySchedule::parse(Some("0,30"), Some("[10-20]"), Some("8-17"), None, None, Some("1-5"))
                .unwrap();

        assert!(schedule.matches(at(8, 10, 30)));
        assert!(schedule.matches(at(17, 20, 0)));
        assert!(!schedule.matches(at(7, 10, 0)));
        assert!(!schedule.matches(at(8, 21, 0)));
        assert!(!schedule.matches(at(8, 10, 15)));
        // Saturday
        assert!(!schedule.matches(Utc.with_ymd_and_hms(2024, 1, 6, 8, 10, 0).unwrap()));
    }

    #[test]
    fn test_day_of_week_sunday_is_seven() {
        let schedule = QuerySchedule::parse(None, None, None, None, None, Some("7")).unwrap();
        assert!(schedule.matches(Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap()));
        assert!(!schedule.matches(at(0, 0, 0)));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let schedule = QuerySchedule::parse(Some("*"), None, Some(""), None, None, None).unwrap();
        assert!(schedule.second.is_wildcard());
        assert!(schedule.hour.is_wildcard());
        assert!(schedule.matches(at(23, 59, 59)));
    }

    #[test]
    fn test_rejects_out_of_range_and_garbage() {
        assert!(QuerySchedule::parse(Some("60"), None, None, None, None, None).is_err());
        assert!(QuerySchedule::parse(None, None, None, Some("0"), None, None).is_err());
        assert!(QuerySchedule::parse(None, Some("5-1"), None, None, None, None).is_err());
        assert!(QuerySchedule::parse(None, None, Some("noon"), None, None, None).is_err());
    }

    #[test]
    fn test_reparse_restores_ranges_after_serde() {
        let schedule = QuerySchedule::parse(Some("0"), Some("*/"), None, None, None, None);
        assert!(schedule.is_err());

        let schedule = QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let decoded: QuerySchedule = serde_json::from_str(&json).unwrap();
        let restored = decoded.reparse().unwrap();

        assert_eq!(restored, schedule);
        assert!(!restored.matches(at(1, 1, 30)));
    }
}
