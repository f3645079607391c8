use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 64;

/// Broadcast hub of reservation lifecycle events, one channel per reservation.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to events of one reservation. Creates the channel if needed.
    pub fn subscribe(&self, reservation_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(reservation_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, reservation_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&reservation_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel once the reservation can no longer change.
    pub fn remove(&self, reservation_id: &Ulid) {
        self.channels.remove(reservation_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationState;

    fn transition(id: Ulid) -> Event {
        Event::ReservationTransitioned {
            id,
            computer_id: Ulid::new(),
            from: ReservationState::Pending,
            to: ReservationState::Acknowledged,
            at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = transition(rid);
        hub.send(rid, &event);

        let received = tokio_test::assert_ok!(rx.recv().await);
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &transition(rid));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn remove_closes_channel() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.remove(&rid);
        assert!(rx.recv().await.is_err());
    }
}
