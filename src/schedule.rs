//! Weekly working-hour patterns and their projection onto calendar days.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::{Ms, Span, Staff, WorkingHoursRule};

const DEFAULT_DAY_START_HOUR: u32 = 8;
const DEFAULT_DAY_END_HOUR: u32 = 18;

/// Working-hour rules grouped by staff id.
pub type WeeklyRules = HashMap<Ulid, Vec<WorkingHoursRule>>;

/// The synthesized pattern for staff without any rules: Monday–Friday, 08:00–18:00.
pub fn default_week(staff_id: Ulid) -> Vec<WorkingHoursRule> {
    let start = NaiveTime::from_hms_opt(DEFAULT_DAY_START_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let end = NaiveTime::from_hms_opt(DEFAULT_DAY_END_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    (1..=5)
        .map(|weekday| WorkingHoursRule {
            staff_id,
            weekday,
            start,
            end,
        })
        .collect()
}

/// Give every staff member that has no rules at all the default week.
///
/// `loaded` holds the rules the source returned, including staff whose rules were
/// all rejected as invalid; those keep an empty list and get no fallback.
pub fn with_default_week(staff: &[Staff], mut loaded: WeeklyRules) -> WeeklyRules {
    for member in staff {
        loaded
            .entry(member.id)
            .or_insert_with(|| default_week(member.id));
    }
    loaded
}

/// ISO weekday number, 1 = Monday .. 7 = Sunday.
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().number_from_monday() as u8
}

/// Resolve a local wall-clock time on `date` to an instant. Times inside a DST
/// gap do not exist and yield `None`; ambiguous times take the earlier instant.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Concrete windows a staff member works on `date`, in rule order.
pub fn windows_on(rules: &[WorkingHoursRule], date: NaiveDate, tz: Tz) -> Vec<Span> {
    let weekday = weekday_number(date);
    rules
        .iter()
        .filter(|r| r.weekday == weekday)
        .filter_map(|r| {
            let start = local_instant(tz, date, r.start)?;
            let end = local_instant(tz, date, r.end)?;
            (start < end).then(|| Span::new(start, end))
        })
        .collect()
}
