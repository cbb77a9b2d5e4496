use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::LedgerChange;

const CHANNEL_CAPACITY: usize = 256;

/// Per-lab broadcast of availability changes (bookings bound or freed,
/// timetable edits). Timetable grids and other read-side collaborators
/// subscribe here instead of polling `free_slots`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<LedgerChange>>,
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

    /// Subscribe to a lab. Creates the channel if needed.
    pub fn subscribe(&self, lab_id: Ulid) -> broadcast::Receiver<LedgerChange> {
        self.channels
            .entry(lab_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, lab_id: Ulid, change: LedgerChange) {
        if let Some(sender) = self.channels.get(&lab_id) {
            let _ = sender.send(change);
        }
    }

    pub fn subscriber_count(&self, lab_id: &Ulid) -> usize {
        self.channels
            .get(lab_id)
            .map_or(0, |s| s.receiver_count())
    }
}
