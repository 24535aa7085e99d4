use chrono::NaiveDate;
use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::lock::{SlotClaim, SlotKey};
use crate::model::*;
use crate::tenant::{date_of, operating_window, within_opening_hours, Shop};

use super::gaps::find_first_gap;
use super::{now_ms, validate_span, Engine, EngineError};

/// One allocation attempt. `start == None` asks the gap finder to pick the
/// earliest fit on `date`.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub shop_id: Option<Ulid>,
    pub customer_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub start: Option<Ms>,
    pub date: Option<NaiveDate>,
    pub notes: String,
    pub payment_status: PaymentStatus,
}

impl Engine {
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        match self.allocate(req).await {
            Ok(booking) => {
                metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
                Ok(booking)
            }
            Err(e) => {
                metrics::counter!(
                    crate::observability::ALLOCATION_FAILURES_TOTAL,
                    "reason" => e.kind()
                )
                .increment(1);
                Err(e)
            }
        }
    }

    async fn allocate(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let customer = self
            .get_user(&req.customer_id)
            .ok_or(EngineError::NotFound(req.customer_id))?;
        if customer.role != Role::Customer {
            return Err(EngineError::Validation {
                field: "customer_id",
                reason: "not a customer",
            });
        }
        let staff = self
            .get_user(&req.staff_id)
            .ok_or(EngineError::NotFound(req.staff_id))?;
        if staff.role != Role::Staff {
            return Err(EngineError::Validation {
                field: "staff_id",
                reason: "not a staff member",
            });
        }
        let service = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let duration_min = parse_duration_minutes(&service.duration);
        if duration_min == 0 {
            return Err(EngineError::Validation {
                field: "service_id",
                reason: "service has no parsable duration",
            });
        }
        if req.notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::Validation {
                field: "notes",
                reason: "too long",
            });
        }
        let duration_ms = duration_min as Ms * 60_000;

        let shop_id = req.shop_id.or(staff.shop_id);
        if let (Some(service_shop), Some(shop)) = (service.shop_id, shop_id)
            && service_shop != shop
        {
            return Err(EngineError::Validation {
                field: "service_id",
                reason: "service belongs to another shop",
            });
        }
        let shop = shop_id.and_then(|id| self.get_shop(&id));

        let cal = self
            .get_calendar(&req.staff_id)
            .ok_or(EngineError::NotFound(req.staff_id))?;

        // Resolve the target span: honor an explicit start, otherwise let
        // the gap finder pick the earliest fit inside the day's window.
        let (span, date) = match req.start {
            Some(start) => {
                let span = Span {
                    start,
                    end: start + duration_ms,
                };
                validate_span(&span)?;
                let date = date_of(start);
                if date < date_of(now_ms()) {
                    return Err(EngineError::Validation {
                        field: "start",
                        reason: "is in the past",
                    });
                }
                if let Some(ref shop) = shop
                    && !within_opening_hours(&shop.opening_hours, date, &span)
                {
                    return Err(EngineError::OutOfHours { span });
                }
                (span, date)
            }
            None => {
                let date = req.date.ok_or(EngineError::Validation {
                    field: "date",
                    reason: "required when start is omitted",
                })?;
                if date < date_of(now_ms()) {
                    return Err(EngineError::Validation {
                        field: "date",
                        reason: "is in the past",
                    });
                }
                let window =
                    operating_window(shop.as_ref().map(|s| &s.opening_hours), date);
                let booked = cal.read().await.booked_spans(date);
                let start = find_first_gap(window, &booked, duration_ms)
                    .ok_or(EngineError::NoSlotAvailable)?;
                let span = Span {
                    start,
                    end: start + duration_ms,
                };
                validate_span(&span)?;
                (span, date)
            }
        };

        // The double-submit guard: identical (customer, staff, start) means
        // a retried request, not a new appointment.
        let dup_key = (req.customer_id, req.staff_id, span.start);
        if let Some(existing) = self.dup_index.get(&dup_key) {
            return Err(EngineError::DuplicateBooking(*existing.value()));
        }

        // Cheap rejection before taking the lock.
        {
            let guard = cal.read().await;
            if guard.booked_spans(date).iter().any(|b| b.overlaps(&span)) {
                return Err(EngineError::SlotGone);
            }
        }

        let key = SlotKey {
            staff_id: req.staff_id,
            date,
            start: span.start,
        };
        let claim = match SlotClaim::acquire(&self.locks, key) {
            Some(claim) => claim,
            None => {
                metrics::counter!(crate::observability::LOCK_CONTENTION_TOTAL).increment(1);
                return Err(EngineError::SlotContended);
            }
        };

        let booking = {
            // commit_lock before the calendar lock, always.
            let _commit = self.commit_lock.read().await;
            let mut guard = cal.write().await;

            // Authoritative re-checks under the calendar's write lock. The
            // TTL lock makes these practically unreachable; they are the
            // backstop when it is bypassed or expired mid-flight.
            if guard.booked_spans(date).iter().any(|b| b.overlaps(&span)) {
                return Err(EngineError::SlotGone);
            }
            if self.dup_index.contains_key(&dup_key) {
                return Err(EngineError::DoubleBookingPrevented);
            }

            let now = now_ms();
            let existing = guard
                .slots_on(date)
                .find(|s| s.span == span)
                .map(|s| (s.id, s.booked));
            let slot_id = match existing {
                Some((_, true)) => return Err(EngineError::SlotGone),
                Some((id, false)) => id,
                None => {
                    if guard.slots_on(date).count() >= MAX_SLOTS_PER_DAY {
                        return Err(EngineError::LimitExceeded("too many slots on this day"));
                    }
                    let slot = TimeSlot {
                        id: Ulid::new(),
                        staff_id: req.staff_id,
                        shop_id,
                        span,
                        date,
                        booked: false,
                        created_at: now,
                    };
                    let event = Event::SlotPlaced { slot: slot.clone() };
                    self.wal_append(&event).await?;
                    let id = slot.id;
                    guard.insert_slot(slot);
                    id
                }
            };

            let booking = Booking {
                id: Ulid::new(),
                shop_id,
                customer_id: req.customer_id,
                staff_id: req.staff_id,
                service_id: req.service_id,
                slot_id,
                start: span.start,
                payment_status: req.payment_status,
                status: BookingStatus::Confirmed,
                notes: req.notes,
                created_at: now,
                updated_at: now,
                reminder_sent_24h: false,
                reminder_sent_1h: false,
            };
            let notification = NotificationRecord {
                id: Ulid::new(),
                user_id: req.customer_id,
                message: format!("Your {} with {} is booked", service.name, staff.name),
                booking_id: Some(booking.id),
                created_at: now,
            };
            let event = Event::BookingCreated {
                booking: booking.clone(),
                notification,
            };
            self.wal_append(&event).await?;
            self.apply_booking_created(&mut guard, &event);
            booking
        };
        drop(claim);

        // Post-commit pushes are best effort: the booking is durable, a
        // missed push is not worth failing the request over.
        self.push_booking_created(&booking, &customer, &staff, shop.as_ref())
            .await;

        Ok(booking)
    }

    async fn push_booking_created(
        &self,
        booking: &Booking,
        customer: &UserRecord,
        staff: &UserRecord,
        shop: Option<&Shop>,
    ) {
        let data = json!({
            "bookingId": booking.id.to_string(),
            "start": booking.start,
        });
        if let Err(e) = self
            .notifier
            .notify_user(
                customer.id,
                "Booking confirmed",
                &format!("You are booked with {}", staff.name),
                data.clone(),
            )
            .await
        {
            tracing::warn!(user = %customer.id, error = %e, "customer push failed");
        }
        if let Err(e) = self
            .notifier
            .notify_user(
                staff.id,
                "New booking",
                &format!("{} booked an appointment", customer.name),
                data.clone(),
            )
            .await
        {
            tracing::warn!(user = %staff.id, error = %e, "staff push failed");
        }
        if let Some(shop) = shop
            && let Err(e) = self
                .notifier
                .notify_shop_staff(
                    shop.id,
                    "New booking",
                    &format!("{} booked with {}", customer.name, staff.name),
                    data,
                    Some(Role::Admin),
                )
                .await
        {
            tracing::warn!(shop = %shop.id, error = %e, "shop push failed");
        }
    }
}
