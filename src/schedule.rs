//! Schedule points and the daily due rule.
//!
//! A schedule point is one `(database, time-of-day)` obligation. Its due
//! instant is always computed against the *current* day only, so a point
//! missed while the agent was down is caught up for the rest of that day
//! and never retroactively for earlier days.

use std::fmt;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::errors::{AppError, Result};

/// Wall-clock time of day a backup is due, e.g. `02:00`.
///
/// The label is kept as written by the server so that State Store keys stay
/// stable across deployments that wrote `2:00` instead of `02:00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeOfDay {
    label: String,
    time: NaiveTime,
}

impl TimeOfDay {
    pub fn parse(raw: &str) -> Result<Self> {
        let label = raw.trim();
        let (hour, minute) = label
            .split_once(':')
            .ok_or_else(|| AppError::InvalidSchedule(label.to_string()))?;
        let hour: u32 = hour
            .trim()
            .parse()
            .map_err(|_| AppError::InvalidSchedule(label.to_string()))?;
        let minute: u32 = minute
            .trim()
            .parse()
            .map_err(|_| AppError::InvalidSchedule(label.to_string()))?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| AppError::InvalidSchedule(label.to_string()))?;
        Ok(Self {
            label: label.to_string(),
            time,
        })
    }

    /// A label-only point that is never evaluated against the clock, used by
    /// manual runs (`name@manual`).
    pub fn manual() -> Self {
        Self {
            label: "manual".to_string(),
            time: NaiveTime::MIN,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// Today's instant for this time of day.
    pub fn instant_on(&self, now: NaiveDateTime) -> NaiveDateTime {
        now.date().and_time(self.time)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Parses a comma separated schedule (`"02:00, 14:30"`).
///
/// Invalid entries are skipped with a warning and entries naming a time that
/// is already present are dropped, keeping the first label.
pub fn parse_times<'a>(entries: impl IntoIterator<Item = &'a str>) -> Vec<TimeOfDay> {
    let mut times: Vec<TimeOfDay> = Vec::new();
    for raw in entries
        .into_iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        match TimeOfDay::parse(raw) {
            Ok(t) if times.iter().any(|known| known.time() == t.time()) => {
                warn!(time = %t, "Duplicate schedule time ignored");
            }
            Ok(t) => times.push(t),
            Err(e) => warn!(error = %e, "Skipping invalid schedule time"),
        }
    }
    times
}

/// Accepts either `"02:00,14:00"` or `["02:00", "14:00"]`.
pub fn deserialize_times<'de, D>(deserializer: D) -> std::result::Result<Vec<TimeOfDay>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimes {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Option::<RawTimes>::deserialize(deserializer)? {
        Some(RawTimes::Joined(s)) => parse_times([s.as_str()]),
        Some(RawTimes::List(list)) => parse_times(list.iter().map(String::as_str)),
        None => Vec::new(),
    })
}

/// One daily backup obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePoint {
    pub database: String,
    pub time: TimeOfDay,
}

impl SchedulePoint {
    pub fn new(database: impl Into<String>, time: TimeOfDay) -> Self {
        Self {
            database: database.into(),
            time,
        }
    }

    /// State Store key, `database@time`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.database, self.time.label())
    }

    pub fn due_instant(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.time.instant_on(now)
    }

    /// Due iff today's instant has passed and no success is recorded at or
    /// after it.
    pub fn is_due(&self, now: NaiveDateTime, last_success: Option<NaiveDateTime>) -> bool {
        let instant = self.due_instant(now);
        now >= instant && last_success.is_none_or(|last| last < instant)
    }
}

impl fmt::Display for SchedulePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.database, self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_time_of_day_keeps_label() -> anyhow::Result<()> {
        let t = TimeOfDay::parse(" 2:00 ")?;
        assert_eq!(t.label(), "2:00");
        assert_eq!(t.time(), NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        Ok(())
    }

    #[test]
    fn test_parse_time_of_day_rejects_garbage() {
        assert!(TimeOfDay::parse("25:00").is_err());
        assert!(TimeOfDay::parse("02:61").is_err());
        assert!(TimeOfDay::parse("0200").is_err());
        assert!(TimeOfDay::parse("ab:cd").is_err());
    }

    #[test]
    fn test_parse_times_skips_invalid_and_duplicates() {
        let times = parse_times(["02:00, 14:30,bogus, 2:00,,23:59"]);
        let labels: Vec<&str> = times.iter().map(TimeOfDay::label).collect();
        assert_eq!(labels, vec!["02:00", "14:30", "23:59"]);
    }

    #[test]
    fn test_deserialize_times_accepts_string_and_list() -> anyhow::Result<()> {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "deserialize_times")]
            times: Vec<TimeOfDay>,
        }

        let joined: Holder = serde_json::from_value(serde_json::json!({ "times": "02:00,03:00" }))?;
        assert_eq!(joined.times.len(), 2);
        let list: Holder = serde_json::from_value(serde_json::json!({ "times": ["04:00"] }))?;
        assert_eq!(list.times[0].label(), "04:00");
        let missing: Holder = serde_json::from_value(serde_json::json!({}))?;
        assert!(missing.times.is_empty());
        Ok(())
    }

    #[test]
    fn test_point_not_due_before_instant() -> anyhow::Result<()> {
        let point = SchedulePoint::new("orders", TimeOfDay::parse("02:00")?);
        assert!(!point.is_due(at(10, 1, 59), None));
        Ok(())
    }

    #[test]
    fn test_point_due_without_record() -> anyhow::Result<()> {
        let point = SchedulePoint::new("orders", TimeOfDay::parse("02:00")?);
        assert!(point.is_due(at(10, 2, 0), None));
        assert!(point.is_due(at(10, 2, 5), None));
        Ok(())
    }

    #[test]
    fn test_point_satisfied_by_success_today() -> anyhow::Result<()> {
        let point = SchedulePoint::new("orders", TimeOfDay::parse("02:00")?);
        assert!(!point.is_due(at(10, 2, 10), Some(at(10, 2, 5))));
        assert!(!point.is_due(at(10, 2, 10), Some(at(10, 2, 0))));
        Ok(())
    }

    #[test]
    fn test_catch_up_after_restart_same_day() -> anyhow::Result<()> {
        // Agent down across 02:00; yesterday's success does not cover today.
        let point = SchedulePoint::new("orders", TimeOfDay::parse("02:00")?);
        assert!(point.is_due(at(10, 9, 30), Some(at(9, 2, 1))));
        Ok(())
    }

    #[test]
    fn test_due_instant_resets_daily() -> anyhow::Result<()> {
        // A 23:00 point missed yesterday is not due at 00:30 today.
        let point = SchedulePoint::new("orders", TimeOfDay::parse("23:00")?);
        assert!(!point.is_due(at(11, 0, 30), Some(at(9, 23, 5))));
        assert_eq!(point.due_instant(at(11, 0, 30)), at(11, 23, 0));
        Ok(())
    }

    #[test]
    fn test_point_key_format() -> anyhow::Result<()> {
        let point = SchedulePoint::new("orders", TimeOfDay::parse("02:00")?);
        assert_eq!(point.key(), "orders@02:00");
        assert_eq!(SchedulePoint::new("orders", TimeOfDay::manual()).key(), "orders@manual");
        Ok(())
    }
}
