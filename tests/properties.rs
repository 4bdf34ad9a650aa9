//! Property-based tests for slot generation using proptest.
//!
//! These check invariants that must hold for any working-hour rules,
//! appointments, buffer, lead time and clock, not just the fixed scenarios in
//! the unit tests.

use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use proptest::prelude::*;
use ulid::Ulid;

use slotcalc::engine::{generate, overlaps, GenerationParams};
use slotcalc::limits::GRID_STEP_MS;
use slotcalc::model::*;
use slotcalc::schedule::windows_on;
use slotcalc::source::SourceSnapshot;

const TENANT: &str = "acme";
// Monday 2026-03-02 00:00 UTC.
const MONDAY: Ms = 1_772_409_600_000;
const WEEK_MINUTES: i64 = 7 * 24 * 60;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_timezone() -> impl Strategy<Value = Tz> {
    prop_oneof![
        Just(Tz::UTC),
        Just(chrono_tz::Europe::Berlin),
        // Spring-forward falls inside the generated week.
        Just(chrono_tz::America::New_York),
    ]
}

/// (weekday, start quarter-hour, length in quarter-hours), clamped to the day.
fn arb_rule() -> impl Strategy<Value = (u8, u32, u32)> {
    (1u8..=7, 0u32..92, 1u32..40)
}

fn arb_durations() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(prop_oneof![Just(30u32), Just(45), Just(60), Just(90)], 1..=3)
}

/// (offset into the week in minutes, length in minutes)
fn arb_appointment() -> impl Strategy<Value = (i64, i64)> {
    (0i64..WEEK_MINUTES, 15i64..=180)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quarter(q: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(q / 4, (q % 4) * 15, 0).unwrap()
}

struct Case {
    snapshot: SourceSnapshot,
    scope: Scope,
    params: GenerationParams,
    rules: Vec<WorkingHoursRule>,
    occupied: Vec<Span>,
    lead_time: Ms,
}

fn build_case(
    tz: Tz,
    rules: Vec<(u8, u32, u32)>,
    durations: Vec<u32>,
    appointments: Vec<(i64, i64)>,
    buffer_minutes: i64,
    now_offset_minutes: i64,
    lead_hours: u32,
) -> Case {
    let staff_id = Ulid::new();
    let location_id = Ulid::new();
    let rules: Vec<WorkingHoursRule> = rules
        .into_iter()
        .map(|(weekday, start, len)| WorkingHoursRule {
            staff_id,
            weekday,
            start: quarter(start),
            end: quarter((start + len).min(95)),
        })
        .collect();
    let appts: Vec<Appointment> = appointments
        .into_iter()
        .map(|(offset, len)| Appointment {
            id: Ulid::new(),
            staff_id,
            location_id,
            start: MONDAY + offset * MINUTE_MS,
            end: MONDAY + (offset + len) * MINUTE_MS,
            status: AppointmentStatus::Confirmed,
            deleted_at: None,
        })
        .collect();
    let occupied = appts.iter().map(|a| Span::new(a.start, a.end)).collect();

    let mut working_hours = std::collections::HashMap::new();
    working_hours.insert(staff_id, rules.clone());
    let mut by_staff = std::collections::HashMap::new();
    by_staff.insert(staff_id, appts);

    let snapshot = SourceSnapshot {
        staff: vec![Staff {
            id: staff_id,
            tenant_id: TENANT.into(),
            active: true,
            category_code: None,
            min_lead_time_hours: lead_hours,
        }],
        categories: vec![Category {
            code: "B".into(),
            tenant_id: TENANT.into(),
            active: true,
            durations,
        }],
        locations: vec![Location {
            id: location_id,
            tenant_id: TENANT.into(),
            active: true,
            kind: LocationKind::Standard,
            staff_ids: None,
            category_codes: None,
        }],
        working_hours,
        appointments: by_staff,
        ..Default::default()
    };
    let start_date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    let scope = Scope {
        tenant_id: Some(TENANT.into()),
        staff_id: None,
        start_date,
        end_date: start_date + chrono::Days::new(6),
    };
    let params = GenerationParams {
        now: MONDAY + now_offset_minutes * MINUTE_MS,
        buffer: buffer_minutes * MINUTE_MS,
        timezone: tz,
    };
    Case {
        snapshot,
        scope,
        params,
        rules,
        occupied,
        lead_time: Ms::from(lead_hours) * HOUR_MS,
    }
}

fn local_date(tz: Tz, at: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(at)
        .unwrap()
        .with_timezone(&tz)
        .date_naive()
}

fn arb_case() -> impl Strategy<Value = Case> {
    (
        arb_timezone(),
        prop::collection::vec(arb_rule(), 0..6),
        arb_durations(),
        prop::collection::vec(arb_appointment(), 0..12),
        0i64..=60,
        -1440i64..=4 * 1440,
        0u32..=48,
    )
        .prop_map(|(tz, rules, durations, appts, buffer, now, lead)| {
            build_case(tz, rules, durations, appts, buffer, now, lead)
        })
}

impl std::fmt::Debug for Case {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Case")
            .field("rules", &self.rules)
            .field("occupied", &self.occupied)
            .field("params", &self.params)
            .field("lead_time", &self.lead_time)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// Every slot lies inside one working window of its local day and starts
    /// on the 15-minute grid anchored at that window's start.
    #[test]
    fn slots_are_contained_and_grid_aligned(case in arb_case()) {
        let slots = generate(&case.snapshot, &case.scope, &case.params);
        let tz = case.params.timezone;
        for slot in &slots {
            let windows = windows_on(&case.rules, local_date(tz, slot.start), tz);
            let home = windows.iter().find(|w| {
                w.contains_span(&slot.span()) && (slot.start - w.start) % GRID_STEP_MS == 0
            });
            prop_assert!(home.is_some(), "slot {:?} has no aligned window in {:?}", slot, windows);
            prop_assert_eq!(slot.end - slot.start, Ms::from(slot.duration_minutes) * MINUTE_MS);
        }
    }

    /// Availability is exactly "no occupied interval, widened by the buffer, overlaps".
    #[test]
    fn availability_matches_buffered_overlap(case in arb_case()) {
        let slots = generate(&case.snapshot, &case.scope, &case.params);
        for slot in &slots {
            let conflicting = case
                .occupied
                .iter()
                .any(|o| overlaps(slot.start, slot.end, o.start, o.end, case.params.buffer));
            prop_assert_eq!(slot.is_available, !conflicting, "slot {:?}", slot);
        }
    }

    /// Nothing ending at or before now + lead time is ever generated.
    #[test]
    fn lead_time_window_is_excluded(case in arb_case()) {
        let min_bookable = case.params.now + case.lead_time;
        let slots = generate(&case.snapshot, &case.scope, &case.params);
        prop_assert!(slots.iter().all(|s| s.end > min_bookable));
    }

    /// Same inputs, same slots; and no key appears twice.
    #[test]
    fn generation_is_deterministic_and_unique(case in arb_case()) {
        let first = generate(&case.snapshot, &case.scope, &case.params);
        let second = generate(&case.snapshot, &case.scope, &case.params);
        prop_assert_eq!(&first, &second);

        let mut keys: Vec<SlotKey> = first.iter().map(AvailabilitySlot::key).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(keys.len(), total);
    }
}
