use log::trace;
use tokio::sync::broadcast;

use crate::control_interface::protocol::Notification;

const EVENT_CAPACITY: usize = 64;

/// Observations published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Notification(Notification),
    /// A transport failure, published before the `Disconnected` it causes.
    Error(String),
}

/// Fans session events out to every subscriber.
///
/// Publishing never blocks and never fails: with no subscribers the event is dropped,
/// and a subscriber that falls behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct NotificationRouter {
    sender: broadcast::Sender<DeviceEvent>,
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        NotificationRouter { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DeviceEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for device event");
        }
    }

    pub fn notify(&self, notification: Notification) {
        self.publish(DeviceEvent::Notification(notification));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_every_subscriber_receives_notification() {
        let router = NotificationRouter::new();
        let mut first = router.subscribe();
        let mut second = router.subscribe();
        let notification = Notification {
            method: "props".to_string(),
            params: json!({"power": "off"}),
        };

        router.notify(notification.clone());

        for receiver in [&mut first, &mut second] {
            assert_eq!(
                receiver.recv().await.unwrap(),
                DeviceEvent::Notification(notification.clone())
            );
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let router = NotificationRouter::new();
        router.publish(DeviceEvent::Connected);
    }
}
