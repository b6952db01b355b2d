use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, StaffSchedule};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

/// `[start, start + duration)`, checked. `start` is range-checked before any
/// arithmetic so an extreme instant cannot wrap into a valid-looking span.
pub(crate) fn span_at(start: Ms, duration: Ms) -> Result<Span, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let end = start
        .checked_add(duration)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

/// Fail with the first active appointment whose buffered span overlaps the
/// buffered `proposed` span. Every span is padded by `buffer` after its end.
/// `exclude` skips the appointment being moved.
pub(crate) fn check_no_conflict(
    schedule: &StaffSchedule,
    proposed: &Span,
    buffer: Ms,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    // An existing span can only reach us if it starts before our padded end
    // and its padded end passes our start.
    let search = Span::new(proposed.start - buffer, proposed.end + buffer);
    let ours = proposed.padded(buffer);

    for booked in schedule.overlapping(&search) {
        if Some(booked.appointment_id) == exclude {
            continue;
        }
        if booked.span.padded(buffer).overlaps(&ours) {
            return Err(EngineError::Conflict(booked.appointment_id));
        }
    }
    Ok(())
}

impl Engine {
    /// Conflict check against the current schedule of `staff_id`.
    ///
    /// Advisory on its own; booking paths call it again while holding the
    /// staff's day locks.
    pub fn check_conflict(
        &self,
        staff_id: Ulid,
        start: Ms,
        total_duration_min: u32,
    ) -> Result<(), EngineError> {
        if total_duration_min == 0 {
            return Err(EngineError::Validation("duration must be positive"));
        }
        let span = span_at(start, Ms::from(total_duration_min) * MINUTE_MS)?;
        self.owned_staff(staff_id)?;
        let buffer = self.settings()?.buffer_ms();
        self.check_schedule(staff_id, &span, buffer, None)
    }

    /// `buffer` must come from the same settings read that chose the day locks.
    pub(super) fn check_schedule(
        &self,
        staff_id: Ulid,
        span: &Span,
        buffer: Ms,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let Some(schedule) = self.store.schedules.get(&staff_id) else {
            return Ok(());
        };
        check_no_conflict(&schedule, span, buffer, exclude).inspect_err(|_| {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        })
    }
}
