//! Change-notification broadcast.
//!
//! Level-triggered rather than delta-queued: each subscriber has a one-slot
//! channel, and a full slot means a signal is already pending, so further
//! sends are dropped. Subscribers react by re-reading the full snapshot.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::Store;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    channels: HashMap<u64, mpsc::Sender<()>>,
}

impl Store {
    /// Register a subscriber. The returned receiver yields an empty signal
    /// after any store mutation; coalesced signals carry no payload.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
        let id = subs.next_id;
        subs.next_id += 1;
        subs.channels.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; safe to call with an unknown or stale id.
    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock().expect("subscriber lock poisoned");
        subs.channels.remove(&id);
    }

    /// Send a non-blocking change signal to every subscriber.
    pub(crate) fn notify(&self) {
        let subs = self.subscribers.lock().expect("subscriber lock poisoned");
        for tx in subs.channels.values() {
            let _ = tx.try_send(());
        }
    }
}
