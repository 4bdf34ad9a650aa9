mod clock;
mod conflict;
mod error;
mod generator;
mod hooks;
mod locks;

pub use clock::{Clock, FixedClock, SystemClock};
pub use conflict::{merge_overlapping, overlaps, OccupiedTimeline};
pub use error::EngineError;
pub use generator::{generate, GenerationParams};
pub use hooks::AppointmentHook;
pub use locks::{ScopeGuard, ScopeLocks};

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Days};
use chrono_tz::Tz;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::source::{load_snapshot, SourceGateway};
use crate::store::{materialize, SlotRepository};

/// Defaults applied when a trigger does not say otherwise.
#[derive(Debug, Clone)]
pub struct CalcSettings {
    pub buffer_minutes: u32,
    pub horizon_days: u32,
    pub timezone: Tz,
    pub insert_batch_size: usize,
}

impl Default for CalcSettings {
    fn default() -> Self {
        Self {
            buffer_minutes: DEFAULT_BUFFER_MINUTES,
            horizon_days: DEFAULT_HORIZON_DAYS,
            timezone: Tz::UTC,
            insert_batch_size: MAX_INSERT_BATCH,
        }
    }
}

/// Outcome of one recalculation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecalcReport {
    pub scope: Scope,
    /// Active staff members the run generated for.
    pub staff: usize,
    pub generated: usize,
    pub available: usize,
    /// Rows published by the replace.
    pub written: usize,
    /// Staff calculated without their external busy times.
    pub degraded_staff: Vec<Ulid>,
    pub invalid_rules: usize,
}

/// The trigger surface: every entrypoint loads, generates and replaces the
/// published slots for one scope.
pub struct Recalculator {
    source: Arc<dyn SourceGateway>,
    store: Arc<dyn SlotRepository>,
    clock: Arc<dyn Clock>,
    locks: ScopeLocks,
    settings: CalcSettings,
}

impl Recalculator {
    pub fn new(
        source: Arc<dyn SourceGateway>,
        store: Arc<dyn SlotRepository>,
        clock: Arc<dyn Clock>,
        settings: CalcSettings,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            locks: ScopeLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &CalcSettings {
        &self.settings
    }

    pub fn source(&self) -> &Arc<dyn SourceGateway> {
        &self.source
    }

    /// Recalculate one staff member from today over `horizon_days` (default 30).
    pub async fn recalculate_for_staff(
        &self,
        tenant_id: &str,
        staff_id: Ulid,
        horizon_days: Option<u32>,
    ) -> Result<RecalcReport, EngineError> {
        let scope = self.horizon_scope(Some(tenant_id), Some(staff_id), horizon_days)?;
        self.run(scope, self.settings.buffer_minutes, "staff").await
    }

    /// Recalculate every staff member of a tenant from today over `horizon_days` (default 30).
    pub async fn recalculate_for_tenant(
        &self,
        tenant_id: &str,
        horizon_days: Option<u32>,
    ) -> Result<RecalcReport, EngineError> {
        let scope = self.horizon_scope(Some(tenant_id), None, horizon_days)?;
        self.run(scope, self.settings.buffer_minutes, "tenant").await
    }

    /// The general form: an explicit scope and buffer (default 15 minutes).
    pub async fn calculate_availability(
        &self,
        scope: Scope,
        buffer_minutes: Option<u32>,
    ) -> Result<RecalcReport, EngineError> {
        let buffer = buffer_minutes.unwrap_or(self.settings.buffer_minutes);
        self.run(scope, buffer, "explicit").await
    }

    /// Refresh the staff an appointment change affects.
    pub async fn on_appointment(
        &self,
        hook: &AppointmentHook,
    ) -> Result<Vec<RecalcReport>, EngineError> {
        let mut reports = Vec::new();
        for staff_id in hook.affected_staff() {
            let scope = self.horizon_scope(Some(hook.tenant_id()), Some(staff_id), None)?;
            reports.push(self.run(scope, self.settings.buffer_minutes, hook.label()).await?);
        }
        Ok(reports)
    }

    /// Drop published slots that ended at or before the clock's current time.
    pub async fn prune_expired(&self) -> Result<usize, EngineError> {
        let now = self.clock.now_ms();
        let pruned = self.store.prune_expired(now).await?;
        if pruned > 0 {
            info!(pruned, now, "expired slots pruned");
        }
        Ok(pruned)
    }

    fn horizon_scope(
        &self,
        tenant_id: Option<&str>,
        staff_id: Option<Ulid>,
        horizon_days: Option<u32>,
    ) -> Result<Scope, EngineError> {
        let horizon = horizon_days.unwrap_or(self.settings.horizon_days);
        let now = self.clock.now_ms();
        let today = DateTime::from_timestamp_millis(now)
            .ok_or_else(|| EngineError::InvalidScope(format!("clock out of range: {now}")))?
            .with_timezone(&self.settings.timezone)
            .date_naive();
        let end_date = today
            .checked_add_days(Days::new(u64::from(horizon)))
            .ok_or_else(|| {
                EngineError::InvalidScope(format!("horizon of {horizon} days overflows"))
            })?;
        Ok(Scope {
            tenant_id: tenant_id.map(str::to_string),
            staff_id,
            start_date: today,
            end_date,
        })
    }

    async fn run(
        &self,
        scope: Scope,
        buffer_minutes: u32,
        trigger: &'static str,
    ) -> Result<RecalcReport, EngineError> {
        validate_scope(&scope, buffer_minutes)?;
        let started = Instant::now();
        let _guard = self
            .locks
            .acquire(scope.tenant_id.as_deref(), scope.staff_id)
            .await;

        let result = self.run_locked(scope, buffer_minutes).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::RECALC_RUNS_TOTAL,
            "trigger" => trigger,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(crate::observability::RECALC_DURATION_SECONDS, "trigger" => trigger)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(trigger, "recalculation failed: {e}");
        }
        result
    }

    async fn run_locked(
        &self,
        scope: Scope,
        buffer_minutes: u32,
    ) -> Result<RecalcReport, EngineError> {
        let tz = self.settings.timezone;
        let buffer = Ms::from(buffer_minutes) * MINUTE_MS;
        // Read under the scope lock so a later run never computes with an earlier "now".
        let now = self.clock.now_ms();

        let snapshot = load_snapshot(self.source.as_ref(), &scope, tz, buffer).await?;
        let params = GenerationParams {
            now,
            buffer,
            timezone: tz,
        };
        let slots = generate(&snapshot, &scope, &params);
        let generated = slots.len();
        let available = slots.iter().filter(|s| s.is_available).count();

        let written = materialize(
            self.store.as_ref(),
            scope.filter(tz),
            slots,
            self.settings.insert_batch_size,
        )
        .await?;

        info!(
            tenant = scope.tenant_id.as_deref().unwrap_or("*"),
            staff = ?scope.staff_id,
            start = %scope.start_date,
            end = %scope.end_date,
            generated,
            available,
            written,
            degraded = snapshot.report.degraded_staff.len(),
            "availability recalculated"
        );

        Ok(RecalcReport {
            scope,
            staff: snapshot.staff.len(),
            generated,
            available,
            written,
            degraded_staff: snapshot.report.degraded_staff,
            invalid_rules: snapshot.report.invalid_rules,
        })
    }
}

fn validate_scope(scope: &Scope, buffer_minutes: u32) -> Result<(), EngineError> {
    if scope.end_date < scope.start_date {
        return Err(EngineError::InvalidScope(format!(
            "end date {} is before start date {}",
            scope.end_date, scope.start_date
        )));
    }
    let days = (scope.end_date - scope.start_date).num_days();
    if days > i64::from(MAX_HORIZON_DAYS) {
        return Err(EngineError::InvalidScope(format!(
            "range of {days} days exceeds {MAX_HORIZON_DAYS}"
        )));
    }
    if let Some(tenant) = &scope.tenant_id
        && (tenant.is_empty() || tenant.len() > MAX_TENANT_ID_LEN)
    {
        return Err(EngineError::InvalidScope("tenant id empty or too long".into()));
    }
    if buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::InvalidScope(format!(
            "buffer of {buffer_minutes} minutes exceeds {MAX_BUFFER_MINUTES}"
        )));
    }
    Ok(())
}
