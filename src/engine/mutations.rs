use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{APPOINTMENTS_CREATED_TOTAL, CONFLICTS_TOTAL};

use super::conflict::span_at;
use super::{Engine, EngineError, detach};

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub customer_id: Ulid,
    pub staff_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub start: Ms,
    pub notes: Option<String>,
    /// Booking through a public link: validated and consumed with the insert.
    pub link_token: Option<String>,
}

/// Drop repeated service ids, keeping first-seen order.
fn dedup_services(ids: &[Ulid]) -> Vec<Ulid> {
    let mut out: Vec<Ulid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

impl Engine {
    /// Book an appointment.
    ///
    /// Link check (if any), then the staff's day locks over the buffered
    /// window, then the conflict check and the durable insert under those
    /// locks. A link use is consumed by the same WAL record as the insert.
    pub async fn create_appointment(
        self: &Arc<Self>,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let this = Arc::clone(self);
        detach(async move { this.create_appointment_locked(req).await }).await
    }

    async fn create_appointment_locked(
        &self,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let service_ids = dedup_services(&req.service_ids);
        if service_ids.is_empty() {
            return Err(EngineError::Validation("at least one service is required"));
        }
        if service_ids.len() > MAX_SERVICES_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        // Link lock comes first and outlives the day locks.
        let mut link_guard = None;
        let mut link_id = None;
        if let Some(token) = &req.link_token {
            let link = self.preview_link(token, &service_ids, req.staff_id)?;
            link_guard = Some(self.lock_link(link.id).await?);
            let link = self.link(link.id)?;
            self.check_link_now(&link, &service_ids, req.staff_id)?;
            link_id = Some(link.id);
        }

        let staff = self.owned_staff(req.staff_id)?;
        if !staff.active {
            return Err(EngineError::Validation("staff member is inactive"));
        }
        self.owned_customer(req.customer_id)?;

        let mut lines = Vec::with_capacity(service_ids.len());
        for id in &service_ids {
            let service = self.owned_service(*id)?;
            if !service.active {
                return Err(EngineError::Validation("service is inactive"));
            }
            lines.push(ServiceLine {
                service_id: service.id,
                price: service.price,
                duration_min: service.duration_min,
            });
        }
        let duration: Ms = lines
            .iter()
            .map(|l| Ms::from(l.duration_min) * MINUTE_MS)
            .sum();
        let span = span_at(req.start, duration)?;

        let settings = self.settings()?;
        let _days = self
            .lock_appointment_days(&settings, staff.id, &span, None)
            .await?;

        self.check_schedule(staff.id, &span, settings.buffer_ms(), None)?;
        if let Some(existing) = self.store.starts.get(&(staff.id, req.start)).map(|e| *e) {
            metrics::counter!(CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotTaken(existing));
        }

        let appointment = Appointment {
            id: Ulid::new(),
            business_id: self.business_id,
            customer_id: req.customer_id,
            staff_id: staff.id,
            start: req.start,
            status: if link_id.is_some() {
                AppointmentStatus::Pending
            } else {
                AppointmentStatus::Scheduled
            },
            notes: req.notes,
            lines,
            link_id,
            created_at: self.now_ms(),
        };
        self.persist_and_apply(Event::AppointmentCreated {
            appointment: appointment.clone(),
            consumed_link: link_id,
        })
        .await?;
        drop(link_guard);

        let source = if link_id.is_some() { "link" } else { "panel" };
        metrics::counter!(APPOINTMENTS_CREATED_TOTAL, "source" => source).increment(1);
        info!(
            appointment_id = %appointment.id,
            staff_id = %appointment.staff_id,
            start = appointment.start,
            status = %appointment.status,
            "appointment created"
        );
        Ok(appointment)
    }
}
