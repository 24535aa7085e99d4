use ulid::Ulid;

use crate::model::Span;

/// Every way an allocation or lifecycle call can fail. All of these are
/// detected synchronously and leave no partial state behind.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing input; names the offending field.
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    /// Opening-hours payload failed strict validation at registration.
    InvalidHours(String),
    /// The requested interval falls outside the shop's configured hours.
    OutOfHours { span: Span },
    /// Same (customer, staff, start) already booked — client double-submit.
    DuplicateBooking(Ulid),
    /// Another allocation currently holds the lock for this slot key.
    SlotContended,
    /// This exact start can no longer be booked (taken, or overlapping an
    /// existing appointment).
    SlotGone,
    /// The one-booked-slot-per-key constraint tripped at commit time; the
    /// fast-path lock raced. Always safe to retry.
    DoubleBookingPrevented,
    /// The gap finder found no fit in the day's operating window.
    NoSlotAvailable,
    /// The actor is not allowed to perform this transition.
    Forbidden { reason: &'static str },
    AlreadyApproved(Ulid),
    AlreadyCancelled(Ulid),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short stable label, used for metrics and the HTTP error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::InvalidHours(_) => "invalid_hours",
            EngineError::OutOfHours { .. } => "out_of_hours",
            EngineError::DuplicateBooking(_) => "duplicate_booking",
            EngineError::SlotContended => "slot_contended",
            EngineError::SlotGone => "slot_gone",
            EngineError::DoubleBookingPrevented => "double_booking_prevented",
            EngineError::NoSlotAvailable => "no_slot_available",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::AlreadyApproved(_) => "already_approved",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// HTTP-equivalent status. Out-of-hours is a policy violation but is
    /// surfaced as 400 so clients treat it like any other bad request.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation { .. }
            | EngineError::InvalidHours(_)
            | EngineError::OutOfHours { .. }
            | EngineError::NoSlotAvailable
            | EngineError::AlreadyApproved(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Forbidden { .. } => 403,
            EngineError::NotFound(_) => 404,
            EngineError::DuplicateBooking(_)
            | EngineError::SlotContended
            | EngineError::DoubleBookingPrevented => 409,
            EngineError::SlotGone => 410,
            EngineError::WalError(_) => 500,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::InvalidHours(reason) => write!(f, "invalid opening hours: {reason}"),
            EngineError::OutOfHours { span } => write!(
                f,
                "requested time [{}, {}) is outside opening hours",
                span.start, span.end
            ),
            EngineError::DuplicateBooking(id) => {
                write!(f, "an identical booking already exists: {id}")
            }
            EngineError::SlotContended => {
                write!(f, "slot is being booked by someone else, try again")
            }
            EngineError::SlotGone => write!(f, "slot is no longer available, pick another time"),
            EngineError::DoubleBookingPrevented => {
                write!(f, "concurrent booking detected at commit, safe to retry")
            }
            EngineError::NoSlotAvailable => write!(f, "no slot available for this service"),
            EngineError::Forbidden { reason } => write!(f, "forbidden: {reason}"),
            EngineError::AlreadyApproved(id) => write!(f, "booking {id} is already approved"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
