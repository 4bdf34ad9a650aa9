use std::collections::HashSet;

use chrono_tz::Tz;
use tracing::debug;
use ulid::Ulid;

use crate::limits::GRID_STEP_MS;
use crate::model::*;
use crate::schedule;
use crate::source::SourceSnapshot;

use super::conflict::OccupiedTimeline;

/// Run-wide inputs of slot generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    /// The instant lead times are measured from.
    pub now: Ms,
    /// Margin kept free around every occupied interval.
    pub buffer: Ms,
    pub timezone: Tz,
}

/// Enumerate every candidate slot of the snapshot within the scope's dates.
///
/// Order: staff, date, location, category, duration, window, start. Candidates
/// ending at or before `now + lead time` are not emitted at all. A slot key seen
/// twice (overlapping rules on one weekday) is emitted once.
pub fn generate(
    snapshot: &SourceSnapshot,
    scope: &Scope,
    params: &GenerationParams,
) -> Vec<AvailabilitySlot> {
    let mut slots = Vec::new();

    for member in &snapshot.staff {
        let locations: Vec<&Location> = snapshot
            .locations
            .iter()
            .filter(|l| l.tenant_id == member.tenant_id && l.admits_staff(&member.id))
            .collect();
        let categories: Vec<(&Category, Vec<u32>)> = snapshot
            .categories
            .iter()
            .filter(|c| c.tenant_id == member.tenant_id)
            .filter(|c| member.category_code.as_deref().is_none_or(|code| code == c.code))
            .map(|c| (c, c.lesson_durations()))
            .collect();
        if locations.is_empty() || categories.is_empty() {
            debug!(staff_id = %member.id, "no eligible location or category");
            continue;
        }

        let rules = snapshot
            .working_hours
            .get(&member.id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let timeline = OccupiedTimeline::new(
            snapshot.appointments.get(&member.id).map(Vec::as_slice).unwrap_or(&[]),
            snapshot.busy_times.get(&member.id).map(Vec::as_slice).unwrap_or(&[]),
        );
        let min_bookable = params.now + Ms::from(member.min_lead_time_hours) * HOUR_MS;

        let mut seen: HashSet<(Ulid, &str, Ms, u32)> = HashSet::new();
        let before = slots.len();

        for date in scope.dates() {
            let windows = schedule::windows_on(rules, date, params.timezone);
            if windows.is_empty() {
                continue;
            }
            for location in &locations {
                for (category, durations) in &categories {
                    if !location.admits_category(&category.code) {
                        continue;
                    }
                    for &duration in durations {
                        let length = Ms::from(duration) * MINUTE_MS;
                        for window in &windows {
                            let mut start = window.start;
                            while start + length <= window.end {
                                let end = start + length;
                                let key = (location.id, category.code.as_str(), start, duration);
                                if end > min_bookable && seen.insert(key) {
                                    let candidate = Span::new(start, end);
                                    let busy = timeline.conflicts(&candidate, params.buffer);
                                    slots.push(AvailabilitySlot {
                                        tenant_id: member.tenant_id.clone(),
                                        staff_id: member.id,
                                        location_id: location.id,
                                        category_code: category.code.clone(),
                                        start,
                                        end,
                                        duration_minutes: duration,
                                        is_available: !busy,
                                    });
                                }
                                start += GRID_STEP_MS;
                            }
                        }
                    }
                }
            }
        }

        debug!(
            staff_id = %member.id,
            slots = slots.len() - before,
            occupied = timeline.spans().len(),
            "generated staff slots"
        );
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    use crate::schedule::local_instant;
    use crate::source::LoadReport;

    const M: Ms = MINUTE_MS;
    const TENANT: &str = "acme";

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> Ms {
        local_instant(Tz::UTC, date, NaiveTime::from_hms_opt(h, m, 0).unwrap()).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn rule(staff_id: Ulid, weekday: u8, start: NaiveTime, end: NaiveTime) -> WorkingHoursRule {
        WorkingHoursRule { staff_id, weekday, start, end }
    }

    fn staff(id: Ulid) -> Staff {
        Staff {
            id,
            tenant_id: TENANT.into(),
            active: true,
            category_code: None,
            min_lead_time_hours: 24,
        }
    }

    fn category(code: &str, durations: Vec<u32>) -> Category {
        Category {
            code: code.into(),
            tenant_id: TENANT.into(),
            active: true,
            durations,
        }
    }

    fn location() -> Location {
        Location {
            id: Ulid::new(),
            tenant_id: TENANT.into(),
            active: true,
            kind: LocationKind::Standard,
            staff_ids: None,
            category_codes: None,
        }
    }

    fn snapshot(
        staff_id: Ulid,
        rules: Vec<WorkingHoursRule>,
        categories: Vec<Category>,
    ) -> SourceSnapshot {
        let mut working_hours = schedule::WeeklyRules::new();
        working_hours.insert(staff_id, rules);
        SourceSnapshot {
            staff: vec![staff(staff_id)],
            categories,
            locations: vec![location()],
            working_hours,
            appointments: Default::default(),
            busy_times: Default::default(),
            report: LoadReport::default(),
        }
    }

    fn week_scope() -> Scope {
        Scope {
            tenant_id: Some(TENANT.into()),
            staff_id: None,
            start_date: monday(),
            end_date: monday() + chrono::Days::new(6),
        }
    }

    fn params(now: Ms) -> GenerationParams {
        GenerationParams { now, buffer: 15 * M, timezone: Tz::UTC }
    }

    fn sunday_midnight() -> Ms {
        at(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), 0, 0)
    }

    #[test]
    fn monday_morning_45_minute_lessons() {
        let id = Ulid::new();
        let snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(10, 0))],
            vec![category("B", vec![45])],
        );
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));

        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        let expected: Vec<Ms> = (0..6).map(|i| at(monday(), 8, 0) + i * 15 * M).collect();
        assert_eq!(starts, expected);
        assert_eq!(slots.last().unwrap().end, at(monday(), 10, 0));
        assert!(slots.iter().all(|s| s.is_available && s.duration_minutes == 45));
    }

    #[test]
    fn buffered_appointment_blocks_neighbours() {
        let id = Ulid::new();
        let mut snap = snapshot(
            id,
            vec![rule(id, 1, t(7, 0), t(11, 0))],
            vec![category("B", vec![45])],
        );
        snap.appointments.insert(
            id,
            vec![Appointment {
                id: Ulid::new(),
                staff_id: id,
                location_id: Ulid::new(),
                start: at(monday(), 8, 30),
                end: at(monday(), 9, 15),
                status: AppointmentStatus::Confirmed,
                deleted_at: None,
            }],
        );
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        let available_at = |h, m| {
            slots
                .iter()
                .find(|s| s.start == at(monday(), h, m))
                .map(|s| s.is_available)
                .unwrap()
        };
        assert!(available_at(7, 0));
        assert!(available_at(7, 30)); // ends 08:15, touches the buffer
        assert!(!available_at(7, 45));
        assert!(!available_at(8, 0));
        assert!(!available_at(9, 15));
        assert!(available_at(9, 30));
    }

    #[test]
    fn lead_time_skips_early_candidates() {
        let id = Ulid::new();
        let snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(10, 0))],
            vec![category("B", vec![45])],
        );
        // now = Sunday 09:00 → bookable once a slot ends after Monday 09:00.
        let now = sunday_midnight() + 9 * HOUR_MS;
        let slots = generate(&snap, &week_scope(), &params(now));
        let first = slots.first().unwrap();
        assert_eq!(first.start, at(monday(), 8, 30));
        assert!(slots.iter().all(|s| s.end > at(monday(), 9, 0)));
    }

    #[test]
    fn day_without_rules_has_no_slots() {
        let id = Ulid::new();
        let snap = snapshot(id, vec![rule(id, 3, t(8, 0), t(9, 0))], vec![category("B", vec![60])]);
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start, at(monday() + chrono::Days::new(2), 8, 0));
    }

    #[test]
    fn staff_without_any_rules_in_snapshot_gets_nothing() {
        let id = Ulid::new();
        let snap = snapshot(id, vec![], vec![category("B", vec![60])]);
        assert!(generate(&snap, &week_scope(), &params(sunday_midnight())).is_empty());
    }

    #[test]
    fn durations_share_the_grid() {
        let id = Ulid::new();
        let snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(10, 0))],
            vec![category("B", vec![45, 90])],
        );
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        let long: Vec<Ms> = slots
            .iter()
            .filter(|s| s.duration_minutes == 90)
            .map(|s| s.start)
            .collect();
        assert_eq!(long, vec![at(monday(), 8, 0), at(monday(), 8, 15), at(monday(), 8, 30)]);
        assert_eq!(slots.len(), 6 + 3);
        let at_eight = slots.iter().filter(|s| s.start == at(monday(), 8, 0)).count();
        assert_eq!(at_eight, 2);
    }

    #[test]
    fn restricted_staff_only_gets_their_category() {
        let id = Ulid::new();
        let mut snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(9, 0))],
            vec![category("A", vec![60]), category("B", vec![60])],
        );
        snap.staff[0].category_code = Some("A".into());
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].category_code, "A");

        snap.staff[0].category_code = Some("C".into());
        assert!(generate(&snap, &week_scope(), &params(sunday_midnight())).is_empty());
    }

    #[test]
    fn location_allow_lists_apply() {
        let id = Ulid::new();
        let mut snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(9, 0))],
            vec![category("A", vec![60]), category("B", vec![60])],
        );
        snap.locations[0].category_codes = Some(vec!["B".into()]);
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        assert_eq!(slots.iter().map(|s| s.category_code.as_str()).collect::<Vec<_>>(), vec!["B"]);

        snap.locations[0].staff_ids = Some(vec![Ulid::new()]);
        assert!(generate(&snap, &week_scope(), &params(sunday_midnight())).is_empty());
    }

    #[test]
    fn overlapping_rules_do_not_duplicate_slots() {
        let id = Ulid::new();
        let snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(10, 0)), rule(id, 1, t(9, 0), t(11, 0))],
            vec![category("B", vec![60])],
        );
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        let keys: HashSet<SlotKey> = slots.iter().map(AvailabilitySlot::key).collect();
        assert_eq!(keys.len(), slots.len());
        // 08:00..=09:00 from the first rule, 09:15..=10:00 from the second.
        assert_eq!(slots.len(), 5 + 4);
    }

    #[test]
    fn external_busy_time_blocks_like_appointment() {
        let id = Ulid::new();
        let mut snap = snapshot(
            id,
            vec![rule(id, 1, t(8, 0), t(10, 0))],
            vec![category("B", vec![60])],
        );
        snap.busy_times.insert(
            id,
            vec![BusyTime {
                staff_id: id,
                tenant_id: TENANT.into(),
                start: at(monday(), 9, 30),
                end: at(monday(), 10, 0),
            }],
        );
        let slots = generate(&snap, &week_scope(), &params(sunday_midnight()));
        let flags: Vec<bool> = slots.iter().map(|s| s.is_available).collect();
        // 08:00 ends 09:00 (free), 08:15 ends 09:15 (touches buffer edge), rest blocked.
        assert_eq!(flags, vec![true, true, false, false, false]);
    }
}
