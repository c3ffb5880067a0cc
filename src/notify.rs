use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-station change feed. Every committed event is published to the
/// channels of the stations it touches, after it is durable.
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

    /// Subscribe to a station's events. Creates the channel if needed.
    /// A receiver that falls more than a channel's worth behind sees `Lagged`.
    pub fn subscribe(&self, station_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(station_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, station_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&station_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a station's channel once its last subscriber is gone.
    /// Returns true if a channel was removed.
    pub fn prune(&self, station_id: &Ulid) -> bool {
        self.channels
            .remove_if(station_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
    }
}
