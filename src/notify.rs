use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Role;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum NotifyError {
    Delivery(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Delivery(msg) => write!(f, "delivery failed: {msg}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound push contract. Fire-and-forget from the engine's perspective:
/// the error is part of the signature so the swallow-and-log happens
/// visibly at the call site, never inside the port.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify_user(
        &self,
        user_id: Ulid,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<(), NotifyError>;

    async fn notify_shop_staff(
        &self,
        shop_id: Ulid,
        title: &str,
        body: &str,
        data: Value,
        role_filter: Option<Role>,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: Value,
    /// Set on shop-wide sends; subscribers drop messages not matching
    /// their role.
    pub role_filter: Option<Role>,
}

/// In-process broadcast hub. Per-user and per-shop channels; sending with
/// nobody listening is a no-op, not a failure.
pub struct PushHub {
    users: DashMap<Ulid, broadcast::Sender<PushMessage>>,
    shops: DashMap<Ulid, broadcast::Sender<PushMessage>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            shops: DashMap::new(),
        }
    }

    pub fn subscribe_user(&self, user_id: Ulid) -> broadcast::Receiver<PushMessage> {
        self.users
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_shop(&self, shop_id: Ulid) -> broadcast::Receiver<PushMessage> {
        self.shops
            .entry(shop_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn send(
        channels: &DashMap<Ulid, broadcast::Sender<PushMessage>>,
        id: Ulid,
        message: PushMessage,
    ) {
        if let Some(sender) = channels.get(&id) {
            let _ = sender.send(message);
        }
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationPort for PushHub {
    async fn notify_user(
        &self,
        user_id: Ulid,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<(), NotifyError> {
        Self::send(
            &self.users,
            user_id,
            PushMessage {
                title: title.to_string(),
                body: body.to_string(),
                data,
                role_filter: None,
            },
        );
        Ok(())
    }

    async fn notify_shop_staff(
        &self,
        shop_id: Ulid,
        title: &str,
        body: &str,
        data: Value,
        role_filter: Option<Role>,
    ) -> Result<(), NotifyError> {
        Self::send(
            &self.shops,
            shop_id,
            PushMessage {
                title: title.to_string(),
                body: body.to_string(),
                data,
                role_filter,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = PushHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe_user(user);

        hub.notify_user(user, "Booking confirmed", "See you at 9:00", json!({}))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.title, "Booking confirmed");
        assert_eq!(msg.role_filter, None);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = PushHub::new();
        hub.notify_user(Ulid::new(), "t", "b", json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shop_send_carries_role_filter() {
        let hub = PushHub::new();
        let shop = Ulid::new();
        let mut rx = hub.subscribe_shop(shop);

        hub.notify_shop_staff(shop, "New booking", "", json!({}), Some(Role::Admin))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.role_filter, Some(Role::Admin));
    }
}
