use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::types::{ProgressEvent, RunId};

/// Progress channels keyed by run id.
///
/// Each run gets its own broadcast channel; pushing to a run with no open
/// channel, or with no live receivers, is silently dropped.
pub struct ProgressBus {
    capacity: usize,
    channels: Mutex<HashMap<RunId, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<RunId, broadcast::Sender<ProgressEvent>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create the channel for a run (or join it if already open).
    pub fn open(&self, run_id: &RunId) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels();
        if let Some(tx) = channels.get(run_id) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(self.capacity);
        channels.insert(run_id.clone(), tx);
        rx
    }

    /// Attach another consumer to an already open channel.
    pub fn subscribe(&self, run_id: &RunId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.channels().get(run_id).map(|tx| tx.subscribe())
    }

    pub fn emit(&self, run_id: &RunId, event: ProgressEvent) {
        if let Some(tx) = self.channels().get(run_id) {
            // Ignore error if no receivers
            let _ = tx.send(event);
        }
    }

    /// Remove the channel. Receivers drain what is buffered, then see `Closed`.
    pub fn close(&self, run_id: &RunId) -> bool {
        self.channels().remove(run_id).is_some()
    }

    pub fn is_open(&self, run_id: &RunId) -> bool {
        self.channels().contains_key(run_id)
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
