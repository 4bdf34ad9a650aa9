use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::{SourceError, SourceGateway};

/// Serialized export of the directories, as produced by the admin tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub staff: Vec<Staff>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub working_hours: Vec<WorkingHoursRule>,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
    #[serde(default)]
    pub busy_times: Vec<BusyTime>,
}

/// In-process directory. Mutations stand in for the admin tooling, the booking
/// flow and the calendar import; the calculator only ever reads.
pub struct InMemorySource {
    staff: DashMap<Ulid, Staff>,
    /// Keyed by (tenant, code).
    categories: DashMap<(String, String), Category>,
    locations: DashMap<Ulid, Location>,
    working_hours: DashMap<Ulid, Vec<WorkingHoursRule>>,
    appointments: DashMap<Ulid, Appointment>,
    busy_times: DashMap<Ulid, Vec<BusyTime>>,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySource {
    pub fn new() -> Self {
        Self {
            staff: DashMap::new(),
            categories: DashMap::new(),
            locations: DashMap::new(),
            working_hours: DashMap::new(),
            appointments: DashMap::new(),
            busy_times: DashMap::new(),
        }
    }

    pub fn from_directory(directory: Directory) -> Self {
        let source = Self::new();
        for s in directory.staff {
            source.upsert_staff(s);
        }
        for c in directory.categories {
            source.upsert_category(c);
        }
        for l in directory.locations {
            source.upsert_location(l);
        }
        for r in directory.working_hours {
            source.working_hours.entry(r.staff_id).or_default().push(r);
        }
        for a in directory.appointments {
            source.upsert_appointment(a);
        }
        for b in directory.busy_times {
            source.add_busy_time(b);
        }
        source
    }

    /// Load a JSON [`Directory`] export.
    pub fn load_json(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)?;
        let directory: Directory = serde_json::from_str(&raw)?;
        Ok(Self::from_directory(directory))
    }

    // ── Directory maintenance ────────────────────────────────

    pub fn upsert_staff(&self, staff: Staff) {
        self.staff.insert(staff.id, staff);
    }

    pub fn upsert_category(&self, category: Category) {
        self.categories
            .insert((category.tenant_id.clone(), category.code.clone()), category);
    }

    pub fn upsert_location(&self, location: Location) {
        self.locations.insert(location.id, location);
    }

    /// Replace all working-hour rules of one staff member.
    pub fn set_working_hours(&self, staff_id: Ulid, rules: Vec<WorkingHoursRule>) {
        self.working_hours.insert(staff_id, rules);
    }

    pub fn upsert_appointment(&self, appointment: Appointment) {
        self.appointments.insert(appointment.id, appointment);
    }

    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    pub fn add_busy_time(&self, busy: BusyTime) {
        self.busy_times.entry(busy.staff_id).or_default().push(busy);
    }

    /// Replace the synced busy times of one staff member.
    pub fn set_busy_times(&self, staff_id: Ulid, busy: Vec<BusyTime>) {
        self.busy_times.insert(staff_id, busy);
    }
}

#[async_trait]
impl SourceGateway for InMemorySource {
    async fn tenants(&self) -> Result<Vec<String>, SourceError> {
        let tenants: BTreeSet<String> = self
            .staff
            .iter()
            .map(|e| e.value().tenant_id.clone())
            .collect();
        Ok(tenants.into_iter().collect())
    }

    async fn staff(
        &self,
        tenant_id: Option<&str>,
        staff_id: Option<Ulid>,
    ) -> Result<Vec<Staff>, SourceError> {
        let mut staff: Vec<Staff> = self
            .staff
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| tenant_id.is_none_or(|t| t == s.tenant_id))
            .filter(|s| staff_id.is_none_or(|id| id == s.id))
            .collect();
        staff.sort_by_key(|s| s.id);
        Ok(staff)
    }

    async fn categories(&self, tenant_id: &str) -> Result<Vec<Category>, SourceError> {
        let mut categories: Vec<Category> = self
            .categories
            .iter()
            .filter(|e| e.key().0 == tenant_id)
            .map(|e| e.value().clone())
            .collect();
        categories.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(categories)
    }

    async fn locations(&self, tenant_id: &str) -> Result<Vec<Location>, SourceError> {
        let mut locations: Vec<Location> = self
            .locations
            .iter()
            .filter(|e| e.value().tenant_id == tenant_id)
            .map(|e| e.value().clone())
            .collect();
        locations.sort_by_key(|l| l.id);
        Ok(locations)
    }

    async fn working_hours(
        &self,
        staff_ids: &[Ulid],
    ) -> Result<Vec<WorkingHoursRule>, SourceError> {
        Ok(staff_ids
            .iter()
            .filter_map(|id| self.working_hours.get(id).map(|e| e.value().clone()))
            .flatten()
            .collect())
    }

    async fn appointments(
        &self,
        staff_ids: &[Ulid],
        range: Span,
    ) -> Result<Vec<Appointment>, SourceError> {
        let mut appointments: Vec<Appointment> = self
            .appointments
            .iter()
            .map(|e| e.value().clone())
            .filter(|a| staff_ids.contains(&a.staff_id))
            .filter(|a| a.deleted_at.is_none())
            .filter(|a| a.start < range.end && range.start < a.end)
            .collect();
        appointments.sort_by_key(|a| (a.start, a.id));
        Ok(appointments)
    }

    async fn busy_times(
        &self,
        tenant_id: &str,
        staff_id: Ulid,
        range: Span,
    ) -> Result<Vec<BusyTime>, SourceError> {
        let mut busy: Vec<BusyTime> = self
            .busy_times
            .get(&staff_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.tenant_id == tenant_id)
            .filter(|b| b.start < range.end && range.start < b.end)
            .collect();
        busy.sort_by_key(|b| b.start);
        Ok(busy)
    }
}
