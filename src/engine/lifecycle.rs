use ulid::Ulid;

use crate::model::*;

use super::{now_ms, Engine, EngineError};

/// Who is asking. Resolved from the user directory so the role cannot be
/// spoofed by the transport layer.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Engine {
    pub fn actor(&self, user_id: &Ulid) -> Result<Actor, EngineError> {
        let user = self
            .get_user(user_id)
            .ok_or(EngineError::NotFound(*user_id))?;
        Ok(Actor {
            user_id: user.id,
            role: user.role,
        })
    }

    /// confirmed → approved. Only the assigned staff member or an admin.
    pub async fn approve_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let booking = self
            .bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(booking_id))?;

        let allowed = actor.role == Role::Admin
            || (actor.role == Role::Staff && actor.user_id == booking.staff_id);
        if !allowed {
            return Err(EngineError::Forbidden {
                reason: "only the assigned staff member or an admin can approve",
            });
        }

        let cal = self
            .get_calendar(&booking.staff_id)
            .ok_or(EngineError::NotFound(booking.staff_id))?;
        // The staff calendar lock serializes transitions the same way it
        // serializes allocation commits.
        let _commit = self.commit_lock.read().await;
        let _guard = cal.write().await;

        let current = self
            .bookings
            .get(&booking_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(booking_id))?;
        match current {
            BookingStatus::Cancelled => return Err(EngineError::AlreadyCancelled(booking_id)),
            BookingStatus::Approved => return Err(EngineError::AlreadyApproved(booking_id)),
            BookingStatus::Confirmed => {}
        }

        let at = now_ms();
        let notification = NotificationRecord {
            id: Ulid::new(),
            user_id: booking.customer_id,
            message: "Your booking has been approved".into(),
            booking_id: Some(booking_id),
            created_at: at,
        };
        let event = Event::BookingApproved {
            id: booking_id,
            at,
            notification,
        };
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        drop(_guard);
        drop(_commit);

        metrics::counter!(
            crate::observability::BOOKING_TRANSITIONS_TOTAL,
            "action" => "approve"
        )
        .increment(1);

        self.push_transition(booking.customer_id, "Booking approved", booking_id)
            .await;

        self.bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// confirmed or approved → cancelled. Cancelled is terminal. The slot
    /// row keeps its booked flag; cancellation never reopens the time.
    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let booking = self
            .bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(booking_id))?;

        let allowed = actor.role == Role::Admin
            || actor.user_id == booking.customer_id
            || (actor.role == Role::Staff && actor.user_id == booking.staff_id);
        if !allowed {
            return Err(EngineError::Forbidden {
                reason: "only the customer, the assigned staff member, or an admin can cancel",
            });
        }

        let cal = self
            .get_calendar(&booking.staff_id)
            .ok_or(EngineError::NotFound(booking.staff_id))?;
        let _commit = self.commit_lock.read().await;
        let _guard = cal.write().await;

        let current = self
            .bookings
            .get(&booking_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(booking_id))?;
        if current == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        // Notify the party that did not ask for the cancellation.
        let recipient = if actor.user_id == booking.customer_id {
            booking.staff_id
        } else {
            booking.customer_id
        };
        let at = now_ms();
        let notification = NotificationRecord {
            id: Ulid::new(),
            user_id: recipient,
            message: "Booking cancelled".into(),
            booking_id: Some(booking_id),
            created_at: at,
        };
        let event = Event::BookingCancelled {
            id: booking_id,
            at,
            notification,
        };
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        drop(_guard);
        drop(_commit);

        metrics::counter!(
            crate::observability::BOOKING_TRANSITIONS_TOTAL,
            "action" => "cancel"
        )
        .increment(1);

        self.push_transition(recipient, "Booking cancelled", booking_id)
            .await;

        self.bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Record that a reminder for `window` went out. Idempotent per window.
    pub async fn mark_reminder_sent(
        &self,
        booking_id: Ulid,
        window: ReminderWindow,
    ) -> Result<(), EngineError> {
        let booking = self
            .bookings
            .get(&booking_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(booking_id))?;
        let already = match window {
            ReminderWindow::H24 => booking.reminder_sent_24h,
            ReminderWindow::H1 => booking.reminder_sent_1h,
        };
        if already {
            return Ok(());
        }

        let event = Event::ReminderMarked {
            booking_id,
            window,
            at: now_ms(),
        };
        let _commit = self.commit_lock.read().await;
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        Ok(())
    }

    async fn push_transition(&self, recipient: Ulid, title: &str, booking_id: Ulid) {
        let data = serde_json::json!({ "bookingId": booking_id.to_string() });
        if let Err(e) = self.notifier.notify_user(recipient, title, "", data).await {
            tracing::warn!(user = %recipient, error = %e, "transition push failed");
        }
    }
}
