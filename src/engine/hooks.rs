use ulid::Ulid;

/// Appointment lifecycle notifications from the booking flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentHook {
    Created {
        tenant_id: String,
        staff_id: Ulid,
    },
    /// `previous_staff_id` is set when the edit moved the appointment to another instructor.
    Updated {
        tenant_id: String,
        staff_id: Ulid,
        previous_staff_id: Option<Ulid>,
    },
    Cancelled {
        tenant_id: String,
        staff_id: Ulid,
    },
}

impl AppointmentHook {
    pub fn tenant_id(&self) -> &str {
        match self {
            AppointmentHook::Created { tenant_id, .. }
            | AppointmentHook::Updated { tenant_id, .. }
            | AppointmentHook::Cancelled { tenant_id, .. } => tenant_id,
        }
    }

    /// Staff whose published slots are stale after this change, without duplicates.
    pub fn affected_staff(&self) -> Vec<Ulid> {
        match self {
            AppointmentHook::Created { staff_id, .. }
            | AppointmentHook::Cancelled { staff_id, .. } => vec![*staff_id],
            AppointmentHook::Updated {
                staff_id,
                previous_staff_id,
                ..
            } => match previous_staff_id {
                Some(prev) if prev != staff_id => vec![*prev, *staff_id],
                _ => vec![*staff_id],
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AppointmentHook::Created { .. } => "appointment_created",
            AppointmentHook::Updated { .. } => "appointment_updated",
            AppointmentHook::Cancelled { .. } => "appointment_cancelled",
        }
    }
}
