use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::TRANSITIONS_TOTAL;

use super::conflict::span_at;
use super::{DayLockGuard, Engine, EngineError, detach};

impl AppointmentStatus {
    pub fn can_transition_to(self, to: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Rejected)
                | (Scheduled, Completed)
                | (Scheduled, Cancelled)
                | (Scheduled, NoShow)
        )
    }

    pub fn transition(self, to: AppointmentStatus) -> Result<AppointmentStatus, EngineError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(EngineError::InvalidTransition { from: self, to })
        }
    }
}

/// Whether `role` may move `appt` to `to`. Legality of the move itself is
/// checked separately.
pub(crate) fn authorize(role: &Role, appt: &Appointment, to: AppointmentStatus) -> Result<(), EngineError> {
    match *role {
        Role::Owner | Role::Admin => Ok(()),
        Role::Staff { staff_id } => {
            if staff_id != appt.staff_id {
                return Err(EngineError::Forbidden("staff may only act on their own appointments"));
            }
            match to {
                AppointmentStatus::Completed
                | AppointmentStatus::Cancelled
                | AppointmentStatus::NoShow => Ok(()),
                _ => Err(EngineError::Forbidden("only an owner or admin can approve or reject")),
            }
        }
        Role::Customer { customer_id } => {
            if customer_id != appt.customer_id {
                return Err(EngineError::Forbidden("customers may only act on their own appointments"));
            }
            if to != AppointmentStatus::Cancelled {
                return Err(EngineError::Forbidden("customers may only cancel"));
            }
            Ok(())
        }
    }
}

/// Moving an appointment is a back-office action; customers must cancel and rebook.
fn authorize_reschedule(role: &Role, appt: &Appointment, target_staff: Ulid) -> Result<(), EngineError> {
    match *role {
        Role::Owner | Role::Admin => Ok(()),
        Role::Staff { staff_id } if staff_id == appt.staff_id && staff_id == target_staff => Ok(()),
        Role::Staff { .. } => Err(EngineError::Forbidden("staff may only move their own appointments")),
        Role::Customer { .. } => Err(EngineError::Forbidden("customers may not reschedule")),
    }
}

/// `start - now >= cancellation_hours`. Exactly on the threshold is allowed.
pub(crate) fn check_cancellation_window(
    appt: &Appointment,
    cancellation_hours: u32,
    now: Ms,
) -> Result<(), EngineError> {
    let lead_ms = appt.start - now;
    if lead_ms < Ms::from(cancellation_hours) * HOUR_MS {
        return Err(EngineError::CancellationWindow {
            required_hours: cancellation_hours,
            lead_ms,
        });
    }
    Ok(())
}

impl Engine {
    pub(super) fn owned_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let appt = self
            .store
            .appointments
            .get(&id)
            .map(|a| a.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(appt.business_id, id)?;
        Ok(appt)
    }

    /// Day locks of every local day an appointment's buffered span touches,
    /// under `settings`. Callers check conflicts with the same snapshot.
    pub(super) async fn lock_appointment_days(
        &self,
        settings: &BusinessSettings,
        staff_id: Ulid,
        span: &Span,
        extra: Option<(Ulid, Span)>,
    ) -> Result<DayLockGuard, EngineError> {
        let buffer = settings.buffer_ms();
        let mut keys = Vec::new();
        let mut push = |staff: Ulid, span: &Span| {
            let window = Span::new(span.start - buffer, span.end + buffer);
            keys.extend(days_covering(&window, settings.utc_offset_min).into_iter().map(|day| {
                super::DayKey {
                    business_id: self.business_id,
                    staff_id: staff,
                    day,
                }
            }));
        };
        push(staff_id, span);
        if let Some((staff, span)) = extra {
            push(staff, &span);
        }
        self.day_locks.acquire_keys(keys, self.lock_timeout).await
    }

    /// Move an appointment to `to` on behalf of `role`.
    pub async fn transition_appointment(
        self: &Arc<Self>,
        id: Ulid,
        to: AppointmentStatus,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        let this = Arc::clone(self);
        detach(async move { this.transition_locked(id, to, role).await }).await
    }

    async fn transition_locked(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        let appt = self.owned_appointment(id)?;
        appt.status.transition(to)?;
        authorize(&role, &appt, to)?;

        let settings = self.settings()?;
        let _days = self
            .lock_appointment_days(&settings, appt.staff_id, &appt.span(), None)
            .await?;

        // Another transition may have won while we waited.
        let mut appt = self.owned_appointment(id)?;
        let from = appt.status;
        appt.status = from.transition(to)?;

        match to {
            AppointmentStatus::Cancelled => {
                check_cancellation_window(&appt, settings.cancellation_hours, self.now_ms())?;
            }
            AppointmentStatus::Completed => {
                let paid = self
                    .store
                    .appointment_payments
                    .get(&id)
                    .is_some_and(|txs| !txs.is_empty());
                if !paid {
                    return Err(EngineError::PaymentRequired(id));
                }
            }
            _ => {}
        }

        self.persist_and_apply(Event::AppointmentStatusChanged { id, status: to })
            .await?;
        metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(appointment_id = %id, %from, %to, "appointment transitioned");
        Ok(appt)
    }

    /// Move a pending or scheduled appointment to a new start and/or staff member.
    pub async fn reschedule_appointment(
        self: &Arc<Self>,
        id: Ulid,
        staff_id: Ulid,
        start: Ms,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        let this = Arc::clone(self);
        detach(async move { this.reschedule_locked(id, staff_id, start, role).await }).await
    }

    async fn reschedule_locked(
        &self,
        id: Ulid,
        staff_id: Ulid,
        start: Ms,
        role: Role,
    ) -> Result<Appointment, EngineError> {
        let appt = self.owned_appointment(id)?;
        authorize_reschedule(&role, &appt, staff_id)?;
        let staff = self.owned_staff(staff_id)?;
        if !staff.active {
            return Err(EngineError::Validation("staff member is inactive"));
        }
        let target = span_at(start, appt.duration_ms())?;

        let settings = self.settings()?;
        let _days = self
            .lock_appointment_days(&settings, staff_id, &target, Some((appt.staff_id, appt.span())))
            .await?;

        let mut appt = self.owned_appointment(id)?;
        if appt.status.is_terminal() {
            return Err(EngineError::Validation("only pending or scheduled appointments can move"));
        }
        if appt.staff_id == staff_id && appt.start == start {
            return Ok(appt);
        }

        self.check_schedule(staff_id, &target, settings.buffer_ms(), Some(id))?;
        if let Some(existing) = self.store.starts.get(&(staff_id, start)).map(|e| *e)
            && existing != id
        {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotTaken(existing));
        }

        self.persist_and_apply(Event::AppointmentRescheduled { id, staff_id, start })
            .await?;
        info!(appointment_id = %id, staff_id = %staff_id, start, "appointment rescheduled");
        appt.staff_id = staff_id;
        appt.start = start;
        Ok(appt)
    }
}
