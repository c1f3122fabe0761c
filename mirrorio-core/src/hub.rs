use crate::blobref::BlobRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Fire-and-forget fan-out of "blob received" notifications.
///
/// Observers subscribe and get the reference of every blob successfully
/// written through the owning store. Notification carries no
/// acknowledgment; a subscriber that falls away is dropped on the next
/// notify.
#[derive(Debug, Default)]
pub struct BlobHub {
    listeners: Mutex<Vec<mpsc::UnboundedSender<BlobRef>>>,
}

impl BlobHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BlobRef> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().expect("lock poisoned").push(tx);
        rx
    }

    pub fn notify_blob_received(&self, blob: &BlobRef) {
        let mut listeners = self.listeners.lock().expect("lock poisoned");
        listeners.retain(|tx| tx.send(blob.clone()).is_ok());
    }
}

/// Lazily-created hub per content partition.
#[derive(Debug, Default)]
pub struct BlobHubPartitionMap {
    hubs: Mutex<HashMap<String, Arc<BlobHub>>>,
}

impl BlobHubPartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(&self, partition: &str) -> Arc<BlobHub> {
        let mut hubs = self.hubs.lock().expect("lock poisoned");
        Arc::clone(hubs.entry(partition.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_notify() {
        let hub = BlobHub::new();
        let mut rx = hub.subscribe();

        let blob = BlobRef::from_bytes(b"notify me");
        hub.notify_blob_received(&blob);
        assert_eq!(rx.recv().await.unwrap(), blob);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let hub = BlobHub::new();
        let rx = hub.subscribe();
        drop(rx);

        // Does not error, and the dead listener is removed.
        hub.notify_blob_received(&BlobRef::from_bytes(b"x"));
        assert!(hub.listeners.lock().unwrap().is_empty());
    }

    #[test]
    fn test_partition_map_returns_same_hub() {
        let map = BlobHubPartitionMap::new();
        let a = map.hub("part-a");
        let a2 = map.hub("part-a");
        let b = map.hub("part-b");
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
