use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::tenant::operating_window;

use super::gaps::free_intervals;
use super::{Engine, EngineError};

/// Availability row as served to clients: an open stretch of a staff
/// member's day.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub start: Ms,
    pub end: Ms,
}

impl Engine {
    /// Free stretches of `date` for one staff member, clipped to the shop's
    /// operating window, keeping only stretches that fit `min_duration_ms`.
    pub async fn free_slots(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
        min_duration_ms: Ms,
    ) -> Result<Vec<SlotView>, EngineError> {
        let staff = self
            .get_user(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let shop = staff.shop_id.and_then(|id| self.get_shop(&id));
        let window = operating_window(shop.as_ref().map(|s| &s.opening_hours), date);

        let cal = self
            .get_calendar(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let booked = cal.read().await.booked_spans(date);

        Ok(free_intervals(window, &booked)
            .into_iter()
            .filter(|s| s.duration_ms() >= min_duration_ms.max(1))
            .map(|s| SlotView {
                start: s.start,
                end: s.end,
            })
            .collect())
    }

    /// Existing slot rows for `date` that never got booked. These are
    /// leftovers from aborted allocations and are offered first.
    pub async fn unbooked_slots(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let cal = self
            .get_calendar(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = cal.read().await;
        Ok(guard.slots_on(date).filter(|s| !s.booked).cloned().collect())
    }

    pub fn get_booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// The slot row a booking occupies, for response shaping.
    pub async fn slot_for_booking(&self, booking: &Booking) -> Option<TimeSlot> {
        let cal = self.get_calendar(&booking.staff_id)?;
        let guard = cal.read().await;
        guard.slots.iter().find(|s| s.id == booking.slot_id).cloned()
    }

    pub fn bookings_for_customer(&self, customer_id: &Ulid) -> Vec<Booking> {
        self.collect_bookings(|b| b.customer_id == *customer_id)
    }

    pub fn bookings_for_staff(&self, staff_id: &Ulid) -> Vec<Booking> {
        self.collect_bookings(|b| b.staff_id == *staff_id)
    }

    pub fn bookings_for_shop(&self, shop_id: &Ulid) -> Vec<Booking> {
        self.collect_bookings(|b| b.shop_id == Some(*shop_id))
    }

    fn collect_bookings(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| pred(b))
            .map(|b| b.clone())
            .collect();
        out.sort_by_key(|b| b.start);
        out
    }

    /// The user's notification feed, newest first.
    pub fn notifications_for_user(&self, user_id: &Ulid) -> Vec<NotificationRecord> {
        let mut out = self
            .notifications
            .get(user_id)
            .map(|feed| feed.clone())
            .unwrap_or_default();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        out
    }

    /// Active bookings whose start falls inside the reminder window and
    /// whose reminder for that window has not gone out yet.
    pub fn bookings_needing_reminder(&self, window: ReminderWindow, now: Ms) -> Vec<Booking> {
        let horizon_ms: Ms = match window {
            ReminderWindow::H24 => 24 * 3_600_000,
            ReminderWindow::H1 => 3_600_000,
        };
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.status != BookingStatus::Cancelled)
            .filter(|b| b.start > now && b.start - now <= horizon_ms)
            .filter(|b| match window {
                ReminderWindow::H24 => !b.reminder_sent_24h,
                ReminderWindow::H1 => !b.reminder_sent_1h,
            })
            .map(|b| b.clone())
            .collect();
        out.sort_by_key(|b| b.start);
        out
    }
}
