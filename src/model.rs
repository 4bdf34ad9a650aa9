use chrono::{Days, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds: the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow the span by `margin` on both sides.
    pub fn widened(&self, margin: Ms) -> Span {
        Span::new(self.start - margin, self.end + margin)
    }
}

// ── Directory records (read-only to the calculator) ─────────────

fn default_lead_time_hours() -> u32 {
    24
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Ulid,
    pub tenant_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// When set, the staff member only teaches this category.
    #[serde(default)]
    pub category_code: Option<String>,
    #[serde(default = "default_lead_time_hours")]
    pub min_lead_time_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub code: String,
    pub tenant_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Allowed lesson lengths in minutes.
    #[serde(default)]
    pub durations: Vec<u32>,
}

impl Category {
    /// Distinct non-zero durations in ascending order.
    pub fn lesson_durations(&self) -> Vec<u32> {
        let mut durations: Vec<u32> = self.durations.iter().copied().filter(|d| *d > 0).collect();
        durations.sort_unstable();
        durations.dedup();
        durations
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Standard,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub tenant_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub kind: LocationKind,
    /// Staff allowed to teach here. `None` or empty means everyone.
    #[serde(default)]
    pub staff_ids: Option<Vec<Ulid>>,
    /// Categories taught here. `None` or empty means every category.
    #[serde(default)]
    pub category_codes: Option<Vec<String>>,
}

impl Location {
    pub fn is_bookable(&self) -> bool {
        self.active && self.kind == LocationKind::Standard
    }

    pub fn admits_staff(&self, staff_id: &Ulid) -> bool {
        match &self.staff_ids {
            Some(ids) if !ids.is_empty() => ids.contains(staff_id),
            _ => true,
        }
    }

    pub fn admits_category(&self, code: &str) -> bool {
        match &self.category_codes {
            Some(codes) if !codes.is_empty() => codes.iter().any(|c| c == code),
            _ => true,
        }
    }
}

/// Recurring weekly working window in local clock time. Never spans midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHoursRule {
    pub staff_id: Ulid,
    /// 1 = Monday .. 7 = Sunday.
    pub weekday: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHoursRule {
    pub fn is_valid(&self) -> bool {
        (1..=7).contains(&self.weekday) && self.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    NoShow,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted_at: Option<Ms>,
}

impl Appointment {
    pub fn occupies_time(&self) -> bool {
        self.deleted_at.is_none() && self.status != AppointmentStatus::Cancelled
    }
}

/// Busy interval imported from a staff member's external calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyTime {
    pub staff_id: Ulid,
    pub tenant_id: String,
    pub start: Ms,
    pub end: Ms,
}

// ── Published artifact ──────────────────────────────────────────

/// One published slot. Carries no customer, payment or appointment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub tenant_id: String,
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub category_code: String,
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    pub is_available: bool,
}

/// Identity of a slot: (staff, location, category, start, duration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub staff_id: Ulid,
    pub location_id: Ulid,
    pub category_code: String,
    pub start: Ms,
    pub duration_minutes: u32,
}

impl AvailabilitySlot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            staff_id: self.staff_id,
            location_id: self.location_id,
            category_code: self.category_code.clone(),
            start: self.start,
            duration_minutes: self.duration_minutes,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

// ── Scopes ──────────────────────────────────────────────────────

/// The (tenant, staff, date-range) bounds of one recalculation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub tenant_id: Option<String>,
    pub staff_id: Option<Ulid>,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
}

impl Scope {
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end_date;
        self.start_date.iter_days().take_while(move |d| *d <= end)
    }

    /// Instant range covering every local day of the scope: `[start_date 00:00, end_date+1 00:00)`.
    pub fn instant_range(&self, tz: Tz) -> Span {
        let start = day_start(tz, self.start_date);
        let end = day_start(tz, self.end_date + Days::new(1));
        Span::new(start, end)
    }

    pub fn filter(&self, tz: Tz) -> ScopeFilter {
        ScopeFilter {
            tenant_id: self.tenant_id.clone(),
            staff_id: self.staff_id,
            range: self.instant_range(tz),
        }
    }
}

/// First instant of a local calendar day. Days whose midnight falls into a
/// DST gap start at the first valid local time after it.
pub fn day_start(tz: Tz, date: NaiveDate) -> Ms {
    let midnight = date.and_time(NaiveTime::MIN);
    for offset_minutes in (0..=180).step_by(15) {
        let local = midnight + chrono::Duration::minutes(offset_minutes);
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return dt.timestamp_millis();
        }
    }
    midnight.and_utc().timestamp_millis()
}

/// The persisted form of a scope: which published slots a replace owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub tenant_id: Option<String>,
    pub staff_id: Option<Ulid>,
    /// Slots whose start lies in this range belong to the scope.
    pub range: Span,
}

impl ScopeFilter {
    pub fn matches_staff(&self, tenant_id: &str, staff_id: &Ulid) -> bool {
        self.tenant_id.as_deref().is_none_or(|t| t == tenant_id)
            && self.staff_id.is_none_or(|s| s == *staff_id)
    }

    pub fn matches(&self, slot: &AvailabilitySlot) -> bool {
        self.matches_staff(&slot.tenant_id, &slot.staff_id)
            && self.range.contains_instant(slot.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// A replace is a transaction: `ScopeCleared`, zero or more `SlotsInserted`,
/// then `ReplaceCommitted`. Pruning is a transaction of one `SlotsExpired` and its
/// commit. Records of a transaction without a commit are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScopeCleared {
        txn: Ulid,
        filter: ScopeFilter,
    },
    SlotsInserted {
        txn: Ulid,
        slots: Vec<AvailabilitySlot>,
    },
    ReplaceCommitted {
        txn: Ulid,
    },
    /// Every slot ending at or before `before` is dropped.
    SlotsExpired {
        txn: Ulid,
        before: Ms,
    },
}

impl Event {
    pub fn txn(&self) -> Ulid {
        match self {
            Event::ScopeCleared { txn, .. }
            | Event::SlotsInserted { txn, .. }
            | Event::ReplaceCommitted { txn }
            | Event::SlotsExpired { txn, .. } => *txn,
        }
    }
}
