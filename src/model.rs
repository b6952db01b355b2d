use chrono::{DateTime, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Cents = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The span extended by `buffer` after its end.
    pub fn padded(&self, buffer: Ms) -> Span {
        Span::new(self.start, self.end + buffer)
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Calendar day of `t` in a zone `utc_offset_min` minutes east of UTC.
pub fn local_day(t: Ms, utc_offset_min: i32) -> NaiveDate {
    let shifted = t + Ms::from(utc_offset_min) * MINUTE_MS;
    DateTime::from_timestamp_millis(shifted)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

/// The instant at which local wall-clock `time` occurs on `day`.
pub fn local_instant(day: NaiveDate, time: NaiveTime, utc_offset_min: i32) -> Ms {
    day.and_time(time).and_utc().timestamp_millis() - Ms::from(utc_offset_min) * MINUTE_MS
}

/// Every local day touched by `span`, ascending.
pub fn days_covering(span: &Span, utc_offset_min: i32) -> Vec<NaiveDate> {
    let first = local_day(span.start, utc_offset_min);
    let last = local_day(span.end - 1, utc_offset_min);
    first.iter_days().take_while(|d| *d <= last).collect()
}

// ── Tenant catalog ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessSettings {
    pub business_id: Ulid,
    /// Granularity of bookable start times.
    pub slot_length_min: u32,
    /// Idle gap enforced after every appointment.
    pub buffer_time_min: u32,
    /// Minimum lead time for cancelling a scheduled appointment.
    pub cancellation_hours: u32,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    pub timezone: String,
    /// Offset used for every calendar-day computation of this business.
    pub utc_offset_min: i32,
}

impl BusinessSettings {
    pub fn defaults_for(business_id: Ulid) -> Self {
        Self {
            business_id,
            slot_length_min: 30,
            buffer_time_min: 15,
            cancellation_hours: 24,
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            working_hours_end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            timezone: "UTC".into(),
            utc_offset_min: 0,
        }
    }

    pub fn buffer_ms(&self) -> Ms {
        Ms::from(self.buffer_time_min) * MINUTE_MS
    }

    pub fn slot_length_ms(&self) -> Ms {
        Ms::from(self.slot_length_min) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub price: Cents,
    pub active: bool,
}

/// A schedulable person. `user_id` links an optional panel login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub user_id: Option<Ulid>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub business_id: Ulid,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Scheduled,
    Completed,
    Cancelled,
    Rejected,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Rejected => "rejected",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed
                | AppointmentStatus::Cancelled
                | AppointmentStatus::Rejected
                | AppointmentStatus::NoShow
        )
    }

    /// Whether an appointment in this state still blocks its staff member's time.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Rejected)
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service snapshot taken at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub service_id: Ulid,
    pub price: Cents,
    pub duration_min: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub business_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Ulid,
    pub start: Ms,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub lines: Vec<ServiceLine>,
    /// Booking link this appointment consumed a use of, if any.
    pub link_id: Option<Ulid>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn duration_ms(&self) -> Ms {
        self.lines
            .iter()
            .map(|l| Ms::from(l.duration_min) * MINUTE_MS)
            .sum()
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + self.duration_ms())
    }

    pub fn total_price(&self) -> Cents {
        self.lines.iter().map(|l| l.price).sum()
    }
}

/// Who is asking for a lifecycle change. Authentication happened upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Staff { staff_id: Ulid },
    Customer { customer_id: Ulid },
}

// ── Booking links ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLink {
    pub id: Ulid,
    pub business_id: Ulid,
    pub token: String,
    pub name: String,
    /// `None` = every active service.
    pub service_ids: Option<Vec<Ulid>>,
    /// `None` = every active staff member.
    pub staff_ids: Option<Vec<Ulid>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub max_uses: Option<u32>,
    pub current_uses: u32,
    pub active: bool,
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Card,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Ulid,
    pub business_id: Ulid,
    pub customer_id: Ulid,
    pub appointment_id: Option<Ulid>,
    pub amount: Cents,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub idempotency_key: Option<String>,
    pub recorded_at: Ms,
}

/// Dedup key for payments recorded against an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentKey {
    pub appointment_id: Ulid,
    pub method: PaymentMethod,
    pub amount: Cents,
    pub status: PaymentStatus,
}

impl Transaction {
    pub fn payment_key(&self) -> Option<PaymentKey> {
        self.appointment_id.map(|appointment_id| PaymentKey {
            appointment_id,
            method: self.method,
            amount: self.amount,
            status: self.status,
        })
    }
}

/// One flat event per state change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessRegistered {
        business: Business,
        settings: BusinessSettings,
    },
    SettingsUpdated {
        settings: BusinessSettings,
    },
    ServiceSaved {
        service: Service,
    },
    StaffSaved {
        staff: Staff,
    },
    CustomerSaved {
        customer: Customer,
    },
    LinkSaved {
        link: BookingLink,
    },
    /// Standalone redemption without an appointment.
    LinkRedeemed {
        link_id: Ulid,
    },
    /// Inserts the appointment and, when `consumed_link` is set, takes one
    /// use of that link in the same record.
    AppointmentCreated {
        appointment: Appointment,
        consumed_link: Option<Ulid>,
    },
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentRescheduled {
        id: Ulid,
        staff_id: Ulid,
        start: Ms,
    },
    TransactionRecorded {
        transaction: Transaction,
    },
}
