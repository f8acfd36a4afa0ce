use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-trainer fan-out of applied events as JSON payloads, feeding
/// `LISTEN trainer_<id>`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    pub fn subscribe(&self, trainer_id: Ulid) -> broadcast::Receiver<String> {
        self.channels
            .entry(trainer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Serializes only when someone is listening.
    pub fn send(&self, trainer_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&trainer_id) else { return };
        if sender.receiver_count() == 0 {
            drop(sender);
            self.channels.remove_if(&trainer_id, |_, s| s.receiver_count() == 0);
            return;
        }
        let _ = sender.send(event.to_payload());
    }
}
