use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::tenant::OpeningHours;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

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

    /// True iff the intervals share any instant. Touching endpoints do not
    /// overlap (half-open semantics).
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Extract a leading minute count from a service duration label like
/// `"45 min"` or `"30min"`. Returns 0 when the label does not match —
/// callers must treat 0 as invalid configuration, not an instant service.
pub fn parse_duration_minutes(label: &str) -> u32 {
    let s = label.trim_start();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    let rest = s[digits.len()..].trim_start();
    if rest.len() < 3 || !rest[..3].eq_ignore_ascii_case("min") {
        return 0;
    }
    digits.parse().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    /// To be paid in cash at the shop.
    #[default]
    CashPending,
    OnlinePaid,
    OnlinePending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Approved,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderWindow {
    H24,
    H1,
}

/// One reserved interval for one staff member. Never deleted; the `booked`
/// flag flips false→true at most once (cancellation does not clear it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub staff_id: Ulid,
    /// Nullable: slots created before tenancy was resolved carry no shop.
    pub shop_id: Option<Ulid>,
    pub span: Span,
    /// Derived from `span.start`, stored redundantly for range queries.
    pub date: NaiveDate,
    pub booked: bool,
    pub created_at: Ms,
}

/// The customer-facing reservation. Owns its TimeSlot one-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub shop_id: Option<Ulid>,
    pub customer_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub slot_id: Ulid,
    pub start: Ms,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub notes: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub reminder_sent_24h: bool,
    pub reminder_sent_1h: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub shop_id: Option<Ulid>,
    pub name: String,
    /// Free-text duration label, e.g. `"45 min"`. Parsed at allocation time.
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Ulid,
    pub shop_id: Option<Ulid>,
    pub name: String,
    pub role: Role,
}

/// First-party notification row, created inside the same commit as the
/// state change it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub message: String,
    pub booking_id: Option<Ulid>,
    pub created_at: Ms,
}

/// Per-staff slot calendar. Slots are kept sorted by `span.start`; mutation
/// only happens under the calendar's write lock.
#[derive(Debug, Clone)]
pub struct StaffCalendar {
    pub staff_id: Ulid,
    pub slots: Vec<TimeSlot>,
}

impl StaffCalendar {
    pub fn new(staff_id: Ulid) -> Self {
        Self {
            staff_id,
            slots: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: TimeSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut TimeSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn slots_on(&self, date: NaiveDate) -> impl Iterator<Item = &TimeSlot> {
        self.slots.iter().filter(move |s| s.date == date)
    }

    /// Booked intervals for one date, ascending by start.
    pub fn booked_spans(&self, date: NaiveDate) -> Vec<Span> {
        self.slots_on(date)
            .filter(|s| s.booked)
            .map(|s| s.span)
            .collect()
    }
}

/// The event types — this is the WAL record format. Replay recreates the
/// full engine state from these alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShopRegistered {
        id: Ulid,
        name: String,
        opening_hours: OpeningHours,
        at: Ms,
    },
    ShopHoursUpdated {
        id: Ulid,
        opening_hours: OpeningHours,
    },
    UserRegistered {
        id: Ulid,
        shop_id: Option<Ulid>,
        name: String,
        role: Role,
    },
    ServiceRegistered {
        id: Ulid,
        shop_id: Option<Ulid>,
        name: String,
        duration: String,
    },
    /// Unbooked placeholder row, created speculatively during allocation.
    SlotPlaced { slot: TimeSlot },
    /// The atomic reservation commit: flips the slot's booked flag and
    /// creates the booking plus its in-transaction notification row as one
    /// durable record.
    BookingCreated {
        booking: Booking,
        notification: NotificationRecord,
    },
    BookingApproved {
        id: Ulid,
        at: Ms,
        notification: NotificationRecord,
    },
    BookingCancelled {
        id: Ulid,
        at: Ms,
        notification: NotificationRecord,
    },
    ReminderMarked {
        booking_id: Ulid,
        window: ReminderWindow,
        at: Ms,
    },
    /// Emitted only by compaction snapshots so the notification feed
    /// survives a compact-then-restart. Replay dedupes by record id.
    NotificationLogged { record: NotificationRecord },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn duration_label_variants() {
        assert_eq!(parse_duration_minutes("45 min"), 45);
        assert_eq!(parse_duration_minutes("30min"), 30);
        assert_eq!(parse_duration_minutes("90 MIN"), 90);
        assert_eq!(parse_duration_minutes("15 minutes"), 15);
        assert_eq!(parse_duration_minutes("  60 min  "), 60);
    }

    #[test]
    fn duration_label_invalid() {
        assert_eq!(parse_duration_minutes(""), 0);
        assert_eq!(parse_duration_minutes("an hour"), 0);
        assert_eq!(parse_duration_minutes("min 45"), 0);
        assert_eq!(parse_duration_minutes("45"), 0); // no unit token
        assert_eq!(parse_duration_minutes("45 hours"), 0);
    }

    #[test]
    fn payment_status_wire_names() {
        let json = serde_json::to_string(&PaymentStatus::CashPending).unwrap();
        assert_eq!(json, "\"cash-pending\"");
        let parsed: PaymentStatus = serde_json::from_str("\"online-paid\"").unwrap();
        assert_eq!(parsed, PaymentStatus::OnlinePaid);
    }

    fn slot(date: NaiveDate, start: Ms, end: Ms, booked: bool) -> TimeSlot {
        TimeSlot {
            id: Ulid::new(),
            staff_id: Ulid::new(),
            shop_id: None,
            span: Span::new(start, end),
            date,
            booked,
            created_at: 0,
        }
    }

    #[test]
    fn calendar_keeps_sort_order() {
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let mut cal = StaffCalendar::new(Ulid::new());
        cal.insert_slot(slot(date, 300, 400, true));
        cal.insert_slot(slot(date, 100, 200, true));
        cal.insert_slot(slot(date, 200, 300, false));
        let starts: Vec<Ms> = cal.slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn calendar_booked_spans_excludes_placeholders() {
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let other = NaiveDate::from_ymd_opt(2030, 1, 8).unwrap();
        let mut cal = StaffCalendar::new(Ulid::new());
        cal.insert_slot(slot(date, 100, 200, true));
        cal.insert_slot(slot(date, 200, 300, false)); // orphan placeholder
        cal.insert_slot(slot(other, 400, 500, true)); // different date
        assert_eq!(cal.booked_spans(date), vec![Span::new(100, 200)]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::UserRegistered {
            id: Ulid::new(),
            shop_id: None,
            name: "Dana".into(),
            role: Role::Staff,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
