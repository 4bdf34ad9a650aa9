//! Read-only access to the directories the calculator draws from: staff,
//! categories, locations, working hours, appointments and external busy times.

mod memory;

pub use memory::{Directory, InMemorySource};

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::schedule::{self, WeeklyRules};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed directory data: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A fatal load failure: nothing meaningful can be generated without this data.
#[derive(Debug, Error)]
#[error("failed to load {what}: {source}")]
pub struct LoadError {
    pub what: &'static str,
    #[source]
    pub source: SourceError,
}

fn fatal(what: &'static str) -> impl FnOnce(SourceError) -> LoadError {
    move |source| LoadError { what, source }
}

/// Batched, read-only queries against the externally owned directories.
///
/// Implementations may return inactive or cancelled records; filtering for the
/// calculator happens in [`load_snapshot`].
#[async_trait]
pub trait SourceGateway: Send + Sync {
    /// Every tenant with staff in the directory.
    async fn tenants(&self) -> Result<Vec<String>, SourceError>;

    async fn staff(
        &self,
        tenant_id: Option<&str>,
        staff_id: Option<Ulid>,
    ) -> Result<Vec<Staff>, SourceError>;

    async fn categories(&self, tenant_id: &str) -> Result<Vec<Category>, SourceError>;

    async fn locations(&self, tenant_id: &str) -> Result<Vec<Location>, SourceError>;

    async fn working_hours(&self, staff_ids: &[Ulid]) -> Result<Vec<WorkingHoursRule>, SourceError>;

    /// Appointments of the given staff overlapping `range`.
    async fn appointments(
        &self,
        staff_ids: &[Ulid],
        range: Span,
    ) -> Result<Vec<Appointment>, SourceError>;

    /// Externally synced busy intervals of one staff member overlapping `range`.
    async fn busy_times(
        &self,
        tenant_id: &str,
        staff_id: Ulid,
        range: Span,
    ) -> Result<Vec<BusyTime>, SourceError>;
}

/// Non-fatal conditions met while loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Staff whose external busy times could not be loaded; they were treated
    /// as having no external conflicts.
    pub degraded_staff: Vec<Ulid>,
    /// Working-hour rules dropped for being overnight, empty or on an unknown weekday.
    pub invalid_rules: usize,
}

/// Everything one run needs, already filtered to what may participate.
#[derive(Debug, Default)]
pub struct SourceSnapshot {
    pub staff: Vec<Staff>,
    pub categories: Vec<Category>,
    pub locations: Vec<Location>,
    pub working_hours: WeeklyRules,
    pub appointments: HashMap<Ulid, Vec<Appointment>>,
    pub busy_times: HashMap<Ulid, Vec<BusyTime>>,
    pub report: LoadReport,
}

/// Load the data for `scope`.
///
/// Appointments and busy times are fetched for the scope's instant range widened
/// by `buffer` so that occupied time just outside the range still blocks slots at
/// its edges.
pub async fn load_snapshot(
    source: &dyn SourceGateway,
    scope: &Scope,
    tz: Tz,
    buffer: Ms,
) -> Result<SourceSnapshot, LoadError> {
    let mut staff: Vec<Staff> = source
        .staff(scope.tenant_id.as_deref(), scope.staff_id)
        .await
        .map_err(fatal("staff"))?
        .into_iter()
        .filter(|s| s.active)
        .filter(|s| scope.tenant_id.as_deref().is_none_or(|t| t == s.tenant_id))
        .filter(|s| scope.staff_id.is_none_or(|id| id == s.id))
        .collect();
    staff.sort_by_key(|s| s.id);

    if staff.is_empty() {
        debug!(?scope, "no active staff in scope");
        return Ok(SourceSnapshot::default());
    }

    let tenants: BTreeSet<String> = match &scope.tenant_id {
        Some(t) => BTreeSet::from([t.clone()]),
        None => staff.iter().map(|s| s.tenant_id.clone()).collect(),
    };

    let mut categories = Vec::new();
    let mut locations = Vec::new();
    for tenant in &tenants {
        categories.extend(
            source
                .categories(tenant)
                .await
                .map_err(fatal("categories"))?
                .into_iter()
                .filter(|c| c.active && c.tenant_id == *tenant),
        );
        locations.extend(
            source
                .locations(tenant)
                .await
                .map_err(fatal("locations"))?
                .into_iter()
                .filter(|l| l.is_bookable() && l.tenant_id == *tenant),
        );
    }
    categories.sort_by(|a, b| (&a.tenant_id, &a.code).cmp(&(&b.tenant_id, &b.code)));
    locations.sort_by_key(|l| l.id);

    let staff_ids: Vec<Ulid> = staff.iter().map(|s| s.id).collect();
    let mut report = LoadReport::default();

    let mut loaded_rules = WeeklyRules::new();
    for rule in source
        .working_hours(&staff_ids)
        .await
        .map_err(fatal("working hours"))?
    {
        if !staff_ids.contains(&rule.staff_id) {
            continue;
        }
        let rules = loaded_rules.entry(rule.staff_id).or_default();
        if rule.is_valid() {
            rules.push(rule);
        } else {
            warn!(
                staff_id = %rule.staff_id,
                weekday = rule.weekday,
                start = %rule.start,
                end = %rule.end,
                "dropping invalid working-hour rule"
            );
            report.invalid_rules += 1;
        }
    }
    let working_hours = schedule::with_default_week(&staff, loaded_rules);

    let range = scope.instant_range(tz).widened(buffer);

    let mut appointments: HashMap<Ulid, Vec<Appointment>> = HashMap::new();
    for appt in source
        .appointments(&staff_ids, range)
        .await
        .map_err(fatal("appointments"))?
    {
        if !appt.occupies_time() || !staff_ids.contains(&appt.staff_id) {
            continue;
        }
        if appt.start >= appt.end {
            warn!(appointment_id = %appt.id, "ignoring appointment with empty span");
            continue;
        }
        if Span::new(appt.start, appt.end).overlaps(&range) {
            appointments.entry(appt.staff_id).or_default().push(appt);
        }
    }

    let busy_loads = staff.iter().map(|member| async move {
        let result = source.busy_times(&member.tenant_id, member.id, range).await;
        (member.id, result)
    });
    let mut busy_times: HashMap<Ulid, Vec<BusyTime>> = HashMap::new();
    for (staff_id, result) in futures::future::join_all(busy_loads).await {
        match result {
            Ok(entries) => {
                let entries: Vec<BusyTime> = entries
                    .into_iter()
                    .filter(|b| b.staff_id == staff_id && b.start < b.end)
                    .filter(|b| Span::new(b.start, b.end).overlaps(&range))
                    .collect();
                if !entries.is_empty() {
                    busy_times.insert(staff_id, entries);
                }
            }
            Err(e) => {
                warn!(%staff_id, "busy times unavailable, continuing without them: {e}");
                metrics::counter!(crate::observability::BUSY_TIME_FAILURES_TOTAL).increment(1);
                report.degraded_staff.push(staff_id);
            }
        }
    }

    Ok(SourceSnapshot {
        staff,
        categories,
        locations,
        working_hours,
        appointments,
        busy_times,
        report,
    })
}
