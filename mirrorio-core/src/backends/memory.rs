use crate::backend::{BlobRead, Storage};
use crate::blobref::{BlobRef, SizedBlobRef};
use crate::context::OpContext;
use crate::error::{MirrorError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Notify, mpsc};

/// In-memory, BTreeMap-backed storage backend.
///
/// Intended for tests and embedding. Blobs are held behind an `RwLock`;
/// the map's key order gives canonical enumeration order for free.
/// Writes wake tasks blocked on a `wait` hint.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<BTreeMap<BlobRef, Bytes>>,
    changed: Notify,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }

    /// Direct lookup, bypassing the streaming interface. Test helper.
    pub fn get(&self, blob: &BlobRef) -> Option<Bytes> {
        self.blobs.read().expect("lock poisoned").get(blob).cloned()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn fetch_streaming(&self, _ctx: &OpContext, blob: &BlobRef) -> Result<(BlobRead, u64)> {
        let data = self
            .blobs
            .read()
            .expect("lock poisoned")
            .get(blob)
            .cloned()
            .ok_or_else(|| MirrorError::NotFound(blob.to_string()))?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }

    async fn stat_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Option<Duration>,
    ) -> Result<()> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);
        let mut pending: Vec<BlobRef> = blobs.to_vec();

        loop {
            // Arm the wakeup before scanning so a write between scan and
            // sleep is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut found = Vec::new();
            let mut still_missing = Vec::new();
            {
                let map = self.blobs.read().expect("lock poisoned");
                for blob in pending {
                    match map.get(&blob) {
                        Some(data) => found.push(SizedBlobRef::new(blob, data.len() as u64)),
                        None => still_missing.push(blob),
                    }
                }
            }
            for sb in found {
                if dest.send(sb).await.is_err() {
                    return Ok(());
                }
            }

            pending = still_missing;
            if pending.is_empty() {
                return Ok(());
            }
            let Some(deadline) = deadline else {
                return Ok(());
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = ctx.cancelled() => return Err(MirrorError::Cancelled),
            }
        }
    }

    async fn receive_blob(
        &self,
        ctx: &OpContext,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef> {
        if ctx.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }

        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let size = data.len() as u64;

        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(blob.clone(), Bytes::from(data));
        self.changed.notify_waiters();

        Ok(SizedBlobRef::new(blob.clone(), size))
    }

    async fn remove_blobs(&self, _ctx: &OpContext, blobs: &[BlobRef]) -> Result<()> {
        let mut map = self.blobs.write().expect("lock poisoned");
        for blob in blobs {
            map.remove(blob);
        }
        Ok(())
    }

    async fn enumerate_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Option<Duration>,
    ) -> Result<()> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch: Vec<SizedBlobRef> = {
                let map = self.blobs.read().expect("lock poisoned");
                map.iter()
                    .filter(|(blob, _)| after.map_or(true, |cursor| *blob > cursor))
                    .take(if limit == 0 { usize::MAX } else { limit })
                    .map(|(blob, data)| SizedBlobRef::new(blob.clone(), data.len() as u64))
                    .collect()
            };

            if !batch.is_empty() {
                for sb in batch {
                    if dest.send(sb).await.is_err() {
                        return Ok(());
                    }
                }
                return Ok(());
            }
            let Some(deadline) = deadline else {
                return Ok(());
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = ctx.cancelled() => return Err(MirrorError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn put(store: &MemoryStorage, data: &[u8]) -> SizedBlobRef {
        let blob = BlobRef::from_bytes(data);
        let mut source: &[u8] = data;
        store
            .receive_blob(&OpContext::new(), &blob, &mut source)
            .await
            .unwrap()
    }

    async fn collect(mut rx: mpsc::Receiver<SizedBlobRef>) -> Vec<SizedBlobRef> {
        let mut out = Vec::new();
        while let Some(sb) = rx.recv().await {
            out.push(sb);
        }
        out
    }

    #[tokio::test]
    async fn test_receive_then_fetch() {
        let store = MemoryStorage::new();
        let sb = put(&store, b"memory blob").await;
        assert_eq!(sb.size, 11);

        let ctx = OpContext::new();
        let (mut reader, size) = store.fetch_streaming(&ctx, &sb.blob_ref).await.unwrap();
        assert_eq!(size, 11);

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"memory blob");
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let store = MemoryStorage::new();
        let blob = BlobRef::from_bytes(b"never stored");
        let err = store
            .fetch_streaming(&OpContext::new(), &blob)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MirrorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat_reports_only_held_blobs() {
        let store = MemoryStorage::new();
        let held = put(&store, b"held").await;
        let missing = BlobRef::from_bytes(b"missing");

        let (tx, rx) = mpsc::channel(4);
        store
            .stat_blobs(
                &OpContext::new(),
                tx,
                &[held.blob_ref.clone(), missing],
                None,
            )
            .await
            .unwrap();

        assert_eq!(collect(rx).await, vec![held]);
    }

    #[tokio::test]
    async fn test_stat_wait_sees_later_write() {
        let store = Arc::new(MemoryStorage::new());
        let blob = BlobRef::from_bytes(b"late arrival");

        let (tx, rx) = mpsc::channel(4);
        let stat_store = Arc::clone(&store);
        let stat_blob = blob.clone();
        let stat = tokio::spawn(async move {
            stat_store
                .stat_blobs(
                    &OpContext::new(),
                    tx,
                    &[stat_blob],
                    Some(Duration::from_secs(5)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        put(&store, b"late arrival").await;

        stat.await.unwrap().unwrap();
        let found = collect(rx).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].blob_ref, blob);
    }

    #[tokio::test]
    async fn test_enumerate_order_cursor_and_limit() {
        let store = MemoryStorage::new();
        let mut all = vec![
            put(&store, b"one").await,
            put(&store, b"two").await,
            put(&store, b"three").await,
        ];
        all.sort();

        let (tx, rx) = mpsc::channel(8);
        store
            .enumerate_blobs(&OpContext::new(), tx, None, 0, None)
            .await
            .unwrap();
        assert_eq!(collect(rx).await, all);

        let (tx, rx) = mpsc::channel(8);
        store
            .enumerate_blobs(&OpContext::new(), tx, Some(&all[0].blob_ref), 1, None)
            .await
            .unwrap();
        assert_eq!(collect(rx).await, vec![all[1].clone()]);
    }

    #[tokio::test]
    async fn test_remove_is_permissive_about_missing() {
        let store = MemoryStorage::new();
        let sb = put(&store, b"doomed").await;
        let missing = BlobRef::from_bytes(b"not here");

        store
            .remove_blobs(&OpContext::new(), &[sb.blob_ref.clone(), missing])
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
