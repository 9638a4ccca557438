use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use droidmirror_protocol::VideoUnit;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Counters exported on `/metrics` (atomic for lock-free updates)
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub units_broadcast: AtomicU64,
    pub viewers_dropped: AtomicU64,
    pub corrupt_frames: AtomicU64,
}

/// A viewer's end of the fan-out. The queue closes when the viewer is
/// dropped by the broadcaster or the session ends.
pub struct ViewerConnection {
    pub id: Uuid,
    pub rx: mpsc::Receiver<VideoUnit>,
}

/// Fans video units out to every connected viewer.
///
/// Each viewer has its own bounded queue. A viewer that cannot keep up is
/// disconnected rather than allowed to stall the demuxer or other viewers.
pub struct Broadcaster {
    viewers: Mutex<HashMap<Uuid, mpsc::Sender<VideoUnit>>>,
    capacity: usize,
    metrics: Arc<StreamMetrics>,
}

impl Broadcaster {
    pub fn new(capacity: usize, metrics: Arc<StreamMetrics>) -> Self {
        Self {
            viewers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            metrics,
        }
    }

    pub fn subscribe(&self) -> ViewerConnection {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers.insert(id, tx);
        tracing::info!(viewer_id = %id, viewers = viewers.len(), "Viewer subscribed");
        ViewerConnection { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        if viewers.remove(&id).is_some() {
            tracing::info!(viewer_id = %id, viewers = viewers.len(), "Viewer unsubscribed");
        }
    }

    /// Queue `unit` for every viewer. Returns the number of viewers it reached.
    pub fn broadcast(&self, unit: &VideoUnit) -> usize {
        if unit.is_empty() {
            return 0;
        }

        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0u64;
        viewers.retain(|id, tx| match tx.try_send(unit.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(viewer_id = %id, "Viewer queue full, disconnecting");
                dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(viewer_id = %id, "Viewer went away");
                dropped += 1;
                false
            }
        });

        self.metrics.units_broadcast.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.metrics
                .viewers_dropped
                .fetch_add(dropped, Ordering::Relaxed);
        }
        viewers.len()
    }

    /// Disconnect every viewer.
    pub fn close_all(&self) {
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        if !viewers.is_empty() {
            tracing::info!(viewers = viewers.len(), "Closing all viewers");
        }
        viewers.clear();
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }
}
