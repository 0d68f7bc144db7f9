use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    StatusChanged,
    Rescheduled,
}

/// One scheduling decision, as seen by downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub resource_id: Ulid,
    pub actor_id: Ulid,
    pub fields: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification sink closed")]
    Closed,
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Fire-and-forget consumer of scheduling events. A failure here is logged
/// by the engine and never undoes the decision it reports.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Broadcast hub: one channel per resource, created on first subscribe.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a resource's channel, disconnecting its subscribers.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(&notification.resource_id) {
            let _ = sender.send(notification.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(resource_id: Ulid) -> Notification {
        Notification {
            kind: NotificationKind::StatusChanged,
            booking_id: Ulid::new(),
            resource_id,
            actor_id: Ulid::new(),
            fields: Map::new(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let n = note(rid);
        hub.notify(&n).unwrap();
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn other_resources_are_not_delivered() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.notify(&note(Ulid::new())).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(hub.notify(&note(Ulid::new())).is_ok());
    }

    #[tokio::test]
    async fn remove_disconnects_subscribers() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.remove(&rid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_value(NotificationKind::BookingCreated).unwrap();
        assert_eq!(json, "booking_created");
    }
}
