use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};

/// Why a booking link refused a request. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    NotFound,
    Inactive,
    NotYetActive,
    Expired,
    Exhausted,
    ServiceNotAllowed(Ulid),
    StaffNotAllowed(Ulid),
}

impl LinkError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            LinkError::NotFound => "not_found",
            LinkError::Inactive => "inactive",
            LinkError::NotYetActive => "not_yet_active",
            LinkError::Expired => "expired",
            LinkError::Exhausted => "exhausted",
            LinkError::ServiceNotAllowed(_) => "service_not_allowed",
            LinkError::StaffNotAllowed(_) => "staff_not_allowed",
        }
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NotFound => write!(f, "booking link not found"),
            LinkError::Inactive => write!(f, "booking link is not active"),
            LinkError::NotYetActive => write!(f, "booking link is not yet active"),
            LinkError::Expired => write!(f, "booking link has expired"),
            LinkError::Exhausted => write!(f, "booking link has reached its usage limit"),
            LinkError::ServiceNotAllowed(id) => {
                write!(f, "service {id} is not allowed for this booking link")
            }
            LinkError::StaffNotAllowed(id) => {
                write!(f, "staff {id} is not allowed for this booking link")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Padded overlap with an existing appointment.
    Conflict(Ulid),
    /// Another appointment already starts at this exact instant for this staff member.
    SlotTaken(Ulid),
    LockTimeout,
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Forbidden(&'static str),
    CancellationWindow {
        required_hours: u32,
        lead_ms: Ms,
    },
    PaymentRequired(Ulid),
    Link(LinkError),
    Duplicate(Ulid),
    CrossTenant(Ulid),
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl EngineError {
    /// Recoverable by retrying the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout)
    }
}

impl From<LinkError> for EngineError {
    fn from(e: LinkError) -> Self {
        EngineError::Link(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "time slot conflicts with appointment: {id}"),
            EngineError::SlotTaken(id) => {
                write!(f, "appointment {id} already starts at this time for this staff member")
            }
            EngineError::LockTimeout => {
                write!(f, "booking temporarily contended, retry")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::CancellationWindow {
                required_hours,
                lead_ms,
            } => write!(
                f,
                "cancellation requires {required_hours}h notice; only {}min left",
                (*lead_ms).max(0) / 60_000
            ),
            EngineError::PaymentRequired(id) => {
                write!(f, "appointment {id} has no recorded payment")
            }
            EngineError::Link(e) => write!(f, "{e}"),
            EngineError::Duplicate(id) => write!(f, "already recorded as transaction: {id}"),
            EngineError::CrossTenant(id) => write!(f, "{id} belongs to another business"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
