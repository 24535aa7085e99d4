mod allocate;
mod error;
mod gaps;
mod lifecycle;
mod queries;

pub use allocate::BookingRequest;
pub use error::EngineError;
pub use gaps::{find_first_gap, free_intervals, merge_overlapping, subtract_intervals};
pub use lifecycle::Actor;
pub use queries::SlotView;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::lock::SlotLockRegistry;
use crate::model::*;
use crate::notify::NotificationPort;
use crate::tenant::{validate_opening_hours, OpeningHours, Shop};
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<StaffCalendar>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub(super) shops: DashMap<Ulid, Shop>,
    pub(super) users: DashMap<Ulid, UserRecord>,
    pub(super) services: DashMap<Ulid, Service>,
    /// staff id → slot calendar. One write lock per staff member is the
    /// transaction boundary for allocation.
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// user id → notification feed, newest last.
    pub(super) notifications: DashMap<Ulid, Vec<NotificationRecord>>,
    /// (customer, staff, start) → booking. The double-submit guard.
    pub(super) dup_index: DashMap<(Ulid, Ulid, Ms), Ulid>,
    /// Held shared across every append+apply pair. Compaction takes it
    /// exclusively, so the snapshot always covers every acked append and
    /// no append can slip into the old file between snapshot and swap.
    /// Acquired before any calendar lock, never after.
    pub(super) commit_lock: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub locks: Arc<dyn SlotLockRegistry>,
    pub notifier: Arc<dyn NotificationPort>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        locks: Arc<dyn SlotLockRegistry>,
        notifier: Arc<dyn NotificationPort>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            shops: DashMap::new(),
            users: DashMap::new(),
            services: DashMap::new(),
            calendars: DashMap::new(),
            bookings: DashMap::new(),
            notifications: DashMap::new(),
            dup_index: DashMap::new(),
            commit_lock: RwLock::new(()),
            wal_tx,
            locks,
            notifier,
        };

        // Replay — we're the sole owner of the calendar Arcs here, so
        // try_write always succeeds instantly. Never use blocking_write:
        // this may run inside an async context.
        for event in &events {
            match event {
                Event::SlotPlaced { slot } => {
                    if let Some(cal) = engine.get_calendar(&slot.staff_id) {
                        let mut guard = cal.try_write().expect("replay: uncontended write");
                        // Snapshots can repeat a slot already applied live.
                        if guard.slots.iter().all(|s| s.id != slot.id) {
                            guard.insert_slot(slot.clone());
                        }
                    }
                }
                Event::BookingCreated { booking, .. } => {
                    if let Some(cal) = engine.get_calendar(&booking.staff_id) {
                        let mut guard = cal.try_write().expect("replay: uncontended write");
                        engine.apply_booking_created(&mut guard, event);
                    }
                }
                other => engine.apply_directory(other),
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_calendar(&self, staff_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(staff_id).map(|e| e.value().clone())
    }

    pub fn get_shop(&self, id: &Ulid) -> Option<Shop> {
        self.shops.get(id).map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserRecord> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Append a record to a user's notification feed, idempotently.
    /// Replay can see the same record twice (embedded in a commit event
    /// and again as a snapshot NotificationLogged), hence the id check.
    pub(super) fn push_notification(&self, record: NotificationRecord) {
        let mut feed = self.notifications.entry(record.user_id).or_default();
        if !feed.iter().any(|r| r.id == record.id) {
            feed.push(record);
        }
    }

    /// Apply a directory-level event (everything except slot placement and
    /// the booking commit, which mutate a locked calendar).
    pub(super) fn apply_directory(&self, event: &Event) {
        match event {
            Event::ShopRegistered {
                id,
                name,
                opening_hours,
                at,
            } => {
                self.shops.insert(
                    *id,
                    Shop {
                        id: *id,
                        name: name.clone(),
                        opening_hours: opening_hours.clone(),
                        created_at: *at,
                    },
                );
            }
            Event::ShopHoursUpdated { id, opening_hours } => {
                if let Some(mut shop) = self.shops.get_mut(id) {
                    shop.opening_hours = opening_hours.clone();
                }
            }
            Event::UserRegistered {
                id,
                shop_id,
                name,
                role,
            } => {
                self.users.insert(
                    *id,
                    UserRecord {
                        id: *id,
                        shop_id: *shop_id,
                        name: name.clone(),
                        role: *role,
                    },
                );
                if *role == Role::Staff {
                    self.calendars
                        .entry(*id)
                        .or_insert_with(|| Arc::new(RwLock::new(StaffCalendar::new(*id))));
                }
            }
            Event::ServiceRegistered {
                id,
                shop_id,
                name,
                duration,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        shop_id: *shop_id,
                        name: name.clone(),
                        duration: duration.clone(),
                    },
                );
            }
            Event::BookingApproved {
                id,
                at,
                notification,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = BookingStatus::Approved;
                    booking.updated_at = *at;
                }
                self.push_notification(notification.clone());
            }
            Event::BookingCancelled {
                id,
                at,
                notification,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = BookingStatus::Cancelled;
                    booking.updated_at = *at;
                }
                self.push_notification(notification.clone());
            }
            Event::ReminderMarked {
                booking_id,
                window,
                at,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(booking_id) {
                    match window {
                        ReminderWindow::H24 => booking.reminder_sent_24h = true,
                        ReminderWindow::H1 => booking.reminder_sent_1h = true,
                    }
                    booking.updated_at = *at;
                }
            }
            Event::NotificationLogged { record } => {
                self.push_notification(record.clone());
            }
            Event::SlotPlaced { .. } | Event::BookingCreated { .. } => {
                unreachable!("calendar events apply under the calendar lock")
            }
        }
    }

    /// Apply the atomic reservation commit. The caller holds the staff
    /// calendar's write lock; everything here is infallible bookkeeping.
    pub(super) fn apply_booking_created(&self, cal: &mut StaffCalendar, event: &Event) {
        let Event::BookingCreated {
            booking,
            notification,
        } = event
        else {
            unreachable!("apply_booking_created on non-commit event")
        };
        if let Some(slot) = cal.slot_mut(booking.slot_id) {
            slot.booked = true;
        }
        self.dup_index.insert(
            (booking.customer_id, booking.staff_id, booking.start),
            booking.id,
        );
        self.bookings.insert(booking.id, booking.clone());
        self.push_notification(notification.clone());
    }

    // ── Directory operations ─────────────────────────────

    pub async fn register_shop(
        &self,
        name: String,
        opening_hours: OpeningHours,
    ) -> Result<Shop, EngineError> {
        validate_name(&name)?;
        validate_opening_hours(&opening_hours).map_err(EngineError::InvalidHours)?;
        if self.shops.len() >= crate::limits::MAX_SHOPS {
            return Err(EngineError::LimitExceeded("too many shops"));
        }

        let id = Ulid::new();
        let event = Event::ShopRegistered {
            id,
            name,
            opening_hours,
            at: now_ms(),
        };
        let _commit = self.commit_lock.read().await;
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        self.get_shop(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn update_shop_hours(
        &self,
        shop_id: Ulid,
        opening_hours: OpeningHours,
    ) -> Result<(), EngineError> {
        if !self.shops.contains_key(&shop_id) {
            return Err(EngineError::NotFound(shop_id));
        }
        validate_opening_hours(&opening_hours).map_err(EngineError::InvalidHours)?;

        let event = Event::ShopHoursUpdated {
            id: shop_id,
            opening_hours,
        };
        let _commit = self.commit_lock.read().await;
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        Ok(())
    }

    pub async fn register_user(
        &self,
        shop_id: Option<Ulid>,
        name: String,
        role: Role,
    ) -> Result<UserRecord, EngineError> {
        validate_name(&name)?;
        if let Some(shop_id) = shop_id
            && !self.shops.contains_key(&shop_id)
        {
            return Err(EngineError::NotFound(shop_id));
        }
        if self.users.len() >= crate::limits::MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let id = Ulid::new();
        let event = Event::UserRegistered {
            id,
            shop_id,
            name,
            role,
        };
        let _commit = self.commit_lock.read().await;
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        self.get_user(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn register_service(
        &self,
        shop_id: Option<Ulid>,
        name: String,
        duration: String,
    ) -> Result<Service, EngineError> {
        validate_name(&name)?;
        if parse_duration_minutes(&duration) == 0 {
            return Err(EngineError::Validation {
                field: "duration",
                reason: "must look like \"45 min\"",
            });
        }
        if let Some(shop_id) = shop_id
            && !self.shops.contains_key(&shop_id)
        {
            return Err(EngineError::NotFound(shop_id));
        }
        if self.services.len() >= crate::limits::MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let id = Ulid::new();
        let event = Event::ServiceRegistered {
            id,
            shop_id,
            name,
            duration,
        };
        let _commit = self.commit_lock.read().await;
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        self.get_service(&id).ok_or(EngineError::NotFound(id))
    }

    // ── Compaction ───────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as a state snapshot. Slot rows carry their booked
    /// flag, bookings their current status, so no transition events are
    /// needed in the snapshot.
    ///
    /// Holds `commit_lock` exclusively from snapshot through swap. Every
    /// acked append has applied before we read, and nothing can append to
    /// the old file while the writer rewrites it.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _commit = self.commit_lock.write().await;
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for shop in self.shops.iter() {
            events.push(Event::ShopRegistered {
                id: shop.id,
                name: shop.name.clone(),
                opening_hours: shop.opening_hours.clone(),
                at: shop.created_at,
            });
        }
        for user in self.users.iter() {
            events.push(Event::UserRegistered {
                id: user.id,
                shop_id: user.shop_id,
                name: user.name.clone(),
                role: user.role,
            });
        }
        for service in self.services.iter() {
            events.push(Event::ServiceRegistered {
                id: service.id,
                shop_id: service.shop_id,
                name: service.name.clone(),
                duration: service.duration.clone(),
            });
        }
        // Collect the Arcs first so no map guard is held across an await.
        let calendars: Vec<SharedCalendar> =
            self.calendars.iter().map(|e| e.value().clone()).collect();
        for cal in calendars {
            let guard = cal.read().await;
            for slot in &guard.slots {
                events.push(Event::SlotPlaced { slot: slot.clone() });
            }
        }
        for booking in self.bookings.iter() {
            let notification = self
                .creation_notification(&booking)
                .unwrap_or_else(|| NotificationRecord {
                    id: Ulid::new(),
                    user_id: booking.customer_id,
                    message: "Booking confirmed".into(),
                    booking_id: Some(booking.id),
                    created_at: booking.created_at,
                });
            events.push(Event::BookingCreated {
                booking: booking.clone(),
                notification,
            });
        }
        for feed in self.notifications.iter() {
            for record in feed.value() {
                events.push(Event::NotificationLogged {
                    record: record.clone(),
                });
            }
        }
        events
    }

    fn creation_notification(&self, booking: &Booking) -> Option<NotificationRecord> {
        let feed = self.notifications.get(&booking.customer_id)?;
        feed.iter()
            .filter(|r| r.booking_id == Some(booking.id))
            .min_by_key(|r| r.created_at)
            .cloned()
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation {
            field: "name",
            reason: "must not be empty",
        });
    }
    if name.len() > crate::limits::MAX_NAME_LEN {
        return Err(EngineError::Validation {
            field: "name",
            reason: "too long",
        });
    }
    Ok(())
}
