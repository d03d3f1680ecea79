use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const CHANNEL_PREFIX: &str = "slot_";

/// Broadcast hub for LISTEN/NOTIFY per slot.
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

    /// Subscribe to committed events for a slot. Creates the channel if needed.
    pub fn subscribe(&self, slot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, slot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&slot_id) {
            let _ = sender.send(event.clone());
        }
    }
}

/// `LISTEN` channel name for a slot.
pub fn channel_name(slot_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{slot_id}")
}

/// Slot id named by a `LISTEN` channel, if it has the `slot_<ulid>` shape.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let id = channel.trim().trim_matches('"').strip_prefix(CHANNEL_PREFIX)?;
    Ulid::from_string(&id.to_ascii_uppercase()).ok()
}
