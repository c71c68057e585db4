use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 1024;

/// Broadcast hub for change notifications, per entity and for everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
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
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Events touching one work order, resource or part. Creates the channel if needed.
    pub fn subscribe(&self, entity_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Every applied event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Deliver `event` once to the firehose and once per distinct subject.
    /// No-op for channels nobody listens on.
    pub fn send(&self, subjects: &[Ulid], event: &Event) {
        let _ = self.firehose.send(event.clone());
        for (i, id) in subjects.iter().enumerate() {
            if subjects[..i].contains(id) {
                continue;
            }
            if let Some(sender) = self.channels.get(id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
