use crate::backend::{BlobRead, Storage};
use crate::blobref::{BlobRef, SizedBlobRef};
use crate::context::OpContext;
use crate::error::{MirrorError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// How often a blocked `wait` re-scans the directory tree.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Local-disk storage backend.
///
/// Blobs live at `<root>/<2-hex-prefix>/<reference>` so no single directory
/// grows unbounded. Writes go to a temporary file first and are renamed
/// into place after `sync_all`, so a crash never leaves a partial blob
/// visible under its reference.
pub struct LocalDiskStorage {
    root: PathBuf,
}

impl LocalDiskStorage {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let digest = blob.digest();
        let prefix = &digest[..2.min(digest.len())];
        self.root.join(prefix).join(blob.as_str())
    }

    async fn scan(&self) -> Result<BTreeMap<BlobRef, u64>> {
        let mut found = BTreeMap::new();
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                // Skip temp files and anything else that is not a blob.
                let Ok(blob) = BlobRef::parse(name) else {
                    continue;
                };
                found.insert(blob, entry.metadata().await?.len());
            }
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl Storage for LocalDiskStorage {
    async fn fetch_streaming(&self, _ctx: &OpContext, blob: &BlobRef) -> Result<(BlobRead, u64)> {
        let path = self.blob_path(blob);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MirrorError::NotFound(blob.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();
        Ok((Box::new(file), size))
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
            let mut still_missing = Vec::new();
            for blob in pending {
                match fs::metadata(self.blob_path(&blob)).await {
                    Ok(meta) => {
                        if dest
                            .send(SizedBlobRef::new(blob, meta.len()))
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        still_missing.push(blob);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            pending = still_missing;
            if pending.is_empty() {
                return Ok(());
            }
            let Some(deadline) = deadline else {
                return Ok(());
            };
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
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

        let path = self.blob_path(blob);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a temporary file first, then rename for atomicity.
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        let size = match tokio::io::copy(source, &mut file).await {
            Ok(size) => size,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
        };
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Stored blob {} ({} bytes)", blob, size);
        Ok(SizedBlobRef::new(blob.clone(), size))
    }

    async fn remove_blobs(&self, _ctx: &OpContext, blobs: &[BlobRef]) -> Result<()> {
        for blob in blobs {
            match fs::remove_file(self.blob_path(blob)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
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
            let found = self.scan().await?;
            let batch: Vec<SizedBlobRef> = found
                .into_iter()
                .filter(|(blob, _)| after.map_or(true, |cursor| blob > cursor))
                .take(if limit == 0 { usize::MAX } else { limit })
                .map(|(blob, size)| SizedBlobRef::new(blob, size))
                .collect();

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
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                _ = ctx.cancelled() => return Err(MirrorError::Cancelled),
            }
        }
    }
}
