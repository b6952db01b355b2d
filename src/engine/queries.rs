use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::free_slots;
use super::{Engine, EngineError};

/// Record counts of one business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub services: usize,
    pub staff: usize,
    pub customers: usize,
    pub appointments: usize,
    pub links: usize,
    pub transactions: usize,
}

impl Engine {
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            services: self.store.services.len(),
            staff: self.store.staff.len(),
            customers: self.store.customers.len(),
            appointments: self.store.appointments.len(),
            links: self.store.links.len(),
            transactions: self.store.transactions.len(),
        }
    }

    pub fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.owned_appointment(id)
    }

    /// Every appointment of `staff_id` starting on local day `day`, any status.
    pub fn appointments_for_staff_day(
        &self,
        staff_id: Ulid,
        day: NaiveDate,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.owned_staff(staff_id)?;
        let offset = self.settings()?.utc_offset_min;
        let mut found: Vec<Appointment> = self
            .store
            .appointments
            .iter()
            .filter(|a| a.staff_id == staff_id && local_day(a.start, offset) == day)
            .map(|a| a.clone())
            .collect();
        found.sort_by_key(|a| a.start);
        Ok(found)
    }

    /// A customer's appointments, newest first.
    pub fn appointments_for_customer(
        &self,
        customer_id: Ulid,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.owned_customer(customer_id)?;
        let mut found: Vec<Appointment> = self
            .store
            .appointments
            .iter()
            .filter(|a| a.customer_id == customer_id)
            .map(|a| a.clone())
            .collect();
        found.sort_by_key(|a| std::cmp::Reverse(a.start));
        Ok(found)
    }

    /// Start instants on `day` at which `service_ids` could be booked with
    /// `staff_id` right now. Starts in the past are skipped.
    pub fn available_slots(
        &self,
        staff_id: Ulid,
        day: NaiveDate,
        service_ids: &[Ulid],
    ) -> Result<Vec<Ms>, EngineError> {
        let staff = self.owned_staff(staff_id)?;
        if !staff.active {
            return Ok(Vec::new());
        }
        let settings = self.settings()?;

        let mut duration_min: u32 = 0;
        for id in service_ids {
            let service = self.owned_service(*id)?;
            if !service.active {
                return Err(EngineError::Validation("service is inactive"));
            }
            duration_min = duration_min.saturating_add(service.duration_min);
        }
        if duration_min == 0 {
            duration_min = settings.slot_length_min;
        }
        let duration = Ms::from(duration_min) * MINUTE_MS;

        let offset = settings.utc_offset_min;
        let working = Span::new(
            local_instant(day, settings.working_hours_start, offset),
            local_instant(day, settings.working_hours_end, offset),
        );
        let buffer = settings.buffer_ms();
        let around = Span::new(working.start - buffer, working.end + buffer);
        let booked: Vec<Span> = self
            .store
            .schedules
            .get(&staff_id)
            .map(|s| s.overlapping(&around).map(|b| b.span).collect())
            .unwrap_or_default();

        Ok(free_slots(
            working,
            &booked,
            buffer,
            settings.slot_length_ms(),
            duration,
            self.now_ms(),
        ))
    }
}
