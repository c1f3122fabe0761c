use crate::blobref::{BlobRef, SizedBlobRef};
use crate::context::OpContext;
use crate::error::Result;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Readable handle to a blob's content.
pub type BlobRead = Box<dyn AsyncRead + Send + Unpin>;

/// The capability set every storage backend implements.
///
/// Backends are shared, read-only handles (`Arc<dyn Storage>`) owned by the
/// storage registry; no backend is exclusively owned by an in-flight
/// operation. Implementations must be idempotent for identical
/// (reference, content) pairs: concurrent duplicate uploads are benign.
///
/// `wait` is a backend-level "block until data appears or the duration
/// elapses" hint; `None` means answer from current state only.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Open a streaming read of the blob and report its stored size.
    async fn fetch_streaming(&self, ctx: &OpContext, blob: &BlobRef) -> Result<(BlobRead, u64)>;

    /// Report the size of each listed blob this backend holds, pushing one
    /// `SizedBlobRef` per match to `dest`. Blobs the backend lacks are
    /// simply not reported; that alone is not an error.
    async fn stat_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Option<Duration>,
    ) -> Result<()>;

    /// Store a blob from a byte stream of unknown length, returning the
    /// reference and the size as stored.
    async fn receive_blob(
        &self,
        ctx: &OpContext,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef>;

    /// Remove the listed blobs. Removing a blob the backend does not hold
    /// is a success.
    async fn remove_blobs(&self, ctx: &OpContext, blobs: &[BlobRef]) -> Result<()>;

    /// Push (reference, size) pairs in canonical (lexicographic reference)
    /// order to `dest`, starting strictly after the `after` cursor, up to
    /// `limit` entries (0 = unlimited).
    ///
    /// A closed `dest` means the caller has seen enough; implementations
    /// stop and return `Ok(())`.
    async fn enumerate_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Option<Duration>,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Storage")
    }
}
