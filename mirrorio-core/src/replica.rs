use crate::backend::{BlobRead, Storage};
use crate::blobref::{BlobRef, SizedBlobRef};
use crate::context::OpContext;
use crate::error::{MirrorError, Result};
use crate::hub::BlobHub;
use crate::merge::merged_enumerate;
use crate::registry::Loader;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the per-replica pipe between the broadcast writer and a
/// receive worker. The slowest replica applies back-pressure once its pipe
/// fills up.
const PIPE_CAPACITY: usize = 64 * 1024;

const COPY_BUFFER: usize = 32 * 1024;

const CHANNEL_BUFFER: usize = 8;

/// How long workers still running after an early quorum return may keep
/// going before their context is cancelled.
const STRAGGLER_GRACE: Duration = Duration::from_secs(30);

/// Configuration for a [`ReplicaStore`].
///
/// `backends` are locator strings resolved through a [`Loader`] at
/// construction time. `minWritesForSuccess` unset or zero means all
/// backends must confirm a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReplicaConfig {
    pub backends: Vec<String>,
    #[serde(default)]
    pub min_writes_for_success: Option<usize>,
}

/// Synchronous quorum mirror over an ordered set of storage backends.
///
/// Every write fans out to all backends concurrently and is acknowledged
/// once `min_writes_for_success` of them confirm receipt of a blob whose
/// size matches the bytes read from the source. Reads try backends in
/// configured order. This is a dumb, best-effort mirror: there is no
/// anti-entropy repair and no re-replication of missing blobs.
#[derive(Clone)]
pub struct ReplicaStore {
    locators: Vec<String>,
    replicas: Vec<Arc<dyn Storage>>,
    min_writes_for_success: usize,
    hub: Arc<BlobHub>,
    ctx: OpContext,
}

impl fmt::Debug for ReplicaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaStore")
            .field("locators", &self.locators)
            .field("replica_count", &self.replicas.len())
            .field("min_writes_for_success", &self.min_writes_for_success)
            .finish()
    }
}

impl ReplicaStore {
    /// Build a store over already-resolved backend handles.
    pub fn new(
        replicas: Vec<Arc<dyn Storage>>,
        min_writes_for_success: Option<usize>,
    ) -> Result<Self> {
        if replicas.is_empty() {
            return Err(MirrorError::Config(
                "replica: need at least one replica".to_string(),
            ));
        }

        let mut min = min_writes_for_success.unwrap_or(0);
        if min == 0 {
            min = replicas.len();
        }
        if min > replicas.len() {
            return Err(MirrorError::Config(format!(
                "replica: minWritesForSuccess {} exceeds {} configured backends",
                min,
                replicas.len()
            )));
        }

        Ok(Self {
            locators: Vec::new(),
            replicas,
            min_writes_for_success: min,
            hub: Arc::new(BlobHub::new()),
            ctx: OpContext::new(),
        })
    }

    /// Resolve every configured backend locator and build the store.
    /// Failure to resolve any locator aborts construction.
    pub fn from_config(loader: &dyn Loader, config: &ReplicaConfig) -> Result<Self> {
        if config.backends.is_empty() {
            return Err(MirrorError::Config(
                "replica: need at least one replica".to_string(),
            ));
        }

        let mut replicas = Vec::with_capacity(config.backends.len());
        for locator in &config.backends {
            replicas.push(loader.resolve(locator)?);
        }

        let mut sto = Self::new(replicas, config.min_writes_for_success)?;
        sto.locators = config.backends.clone();
        tracing::info!(
            "replica store over {:?}, quorum {}",
            sto.locators,
            sto.min_writes_for_success
        );
        Ok(sto)
    }

    /// Derive a request-scoped variant sharing the same backends but
    /// carrying `ctx` for everything it fans out.
    pub fn with_context(&self, ctx: OpContext) -> Self {
        let mut sto = self.clone();
        sto.ctx = ctx;
        sto
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn min_writes_for_success(&self) -> usize {
        self.min_writes_for_success
    }

    /// Hub notified once per successful quorum write.
    pub fn hub(&self) -> Arc<BlobHub> {
        Arc::clone(&self.hub)
    }

    pub async fn fetch_streaming(&self, blob: &BlobRef) -> Result<(BlobRead, u64)> {
        let ctx = self.ctx.clone();
        self.fetch_streaming_with(&ctx, blob).await
    }

    pub async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Option<Duration>,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        self.stat_blobs_with(&ctx, dest, blobs, wait).await
    }

    pub async fn receive_blob(
        &self,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef> {
        let ctx = self.ctx.clone();
        self.receive_blob_with(&ctx, blob, source).await
    }

    pub async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<()> {
        let ctx = self.ctx.clone();
        self.remove_blobs_with(&ctx, blobs).await
    }

    pub async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Option<Duration>,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        self.enumerate_blobs_with(&ctx, dest, after, limit, wait)
            .await
    }

    /// Try each backend in configured order; first success wins. Not
    /// load-balanced or randomized; every call restarts from the first
    /// backend.
    async fn fetch_streaming_with(
        &self,
        ctx: &OpContext,
        blob: &BlobRef,
    ) -> Result<(BlobRead, u64)> {
        let mut last_err = None;
        for replica in &self.replicas {
            match replica.fetch_streaming(ctx, blob).await {
                Ok(found) => return Ok(found),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| MirrorError::NotFound(blob.to_string())))
    }

    /// Fan a stat request out to every backend and forward each requested
    /// reference to `dest` exactly once, first reporting backend wins.
    ///
    /// Backend errors are swallowed as long as the union of backends
    /// covers every requested reference; otherwise the last recorded
    /// backend error is returned.
    async fn stat_blobs_with(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut pending: HashSet<BlobRef> = blobs.iter().cloned().collect();

        // The funnel owns the pending set and hands it back on join, so
        // inspecting it cannot race with late worker results.
        let (funnel_tx, mut funnel_rx) = mpsc::channel::<SizedBlobRef>(CHANNEL_BUFFER);
        let funnel: JoinHandle<HashSet<BlobRef>> = tokio::spawn(async move {
            while let Some(sb) = funnel_rx.recv().await {
                if pending.remove(&sb.blob_ref) && dest.send(sb).await.is_err() {
                    break;
                }
            }
            pending
        });

        let shared_blobs: Arc<[BlobRef]> = blobs.to_vec().into();
        let (err_tx, mut err_rx) = mpsc::channel::<Result<()>>(CHANNEL_BUFFER);
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let blobs = Arc::clone(&shared_blobs);
            let funnel_tx = funnel_tx.clone();
            let err_tx = err_tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let res = replica.stat_blobs(&ctx, funnel_tx, &blobs, wait).await;
                let _ = err_tx.send(res).await;
            });
        }
        drop(funnel_tx);
        drop(err_tx);

        let mut last_err = None;
        while let Some(res) = err_rx.recv().await {
            if let Err(err) = res {
                last_err = Some(err);
            }
        }

        let pending = funnel
            .await
            .map_err(|err| MirrorError::Internal(format!("stat funnel panicked: {err}")))?;

        match last_err {
            Some(err) if !pending.is_empty() => Err(err),
            _ => Ok(()),
        }
    }

    /// Write `source` to every backend concurrently and return once the
    /// quorum confirms receipt with the exact byte count read from
    /// `source`. Workers still running at that point keep going for a
    /// grace period, then their context is cancelled.
    async fn receive_blob_with(
        &self,
        ctx: &OpContext,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef> {
        let write_ctx = ctx.child();
        let (result_tx, mut result_rx) =
            mpsc::channel::<Result<SizedBlobRef>>(self.replicas.len());

        let mut pipes = Vec::with_capacity(self.replicas.len());
        let mut workers = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            let (pipe_wr, mut pipe_rd) = tokio::io::duplex(PIPE_CAPACITY);
            pipes.push(pipe_wr);

            let replica = Arc::clone(replica);
            let blob = blob.clone();
            let worker_ctx = write_ctx.clone();
            let result_tx = result_tx.clone();
            workers.push(tokio::spawn(async move {
                let res = tokio::select! {
                    res = replica.receive_blob(&worker_ctx, &blob, &mut pipe_rd) => res,
                    _ = worker_ctx.cancelled() => Err(MirrorError::Cancelled),
                };
                if res.is_err() {
                    // Keep consuming so the broadcast writer never blocks
                    // on a failed branch.
                    let _ = tokio::io::copy(&mut pipe_rd, &mut tokio::io::sink()).await;
                }
                let _ = result_tx.send(res).await;
            }));
        }
        drop(result_tx);

        let copied = broadcast_copy(source, &mut pipes).await;
        // Close the write ends so workers observe end-of-stream.
        drop(pipes);

        let size = match copied {
            Ok(size) => size,
            Err(err) => {
                // The client side failed; abandon the write without
                // waiting for backend results.
                write_ctx.cancel();
                return Err(err);
            }
        };

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut last_err: Option<MirrorError> = None;
        while let Some(res) = result_rx.recv().await {
            match res {
                Ok(sb) if sb.size == size => {
                    succeeded += 1;
                    if succeeded == self.min_writes_for_success {
                        self.hub.notify_blob_received(blob);
                        spawn_straggler_guard(write_ctx, workers);
                        return Ok(sb);
                    }
                }
                Ok(sb) => {
                    failed += 1;
                    last_err = Some(MirrorError::SizeMismatch {
                        expected: size,
                        actual: sb.size,
                    });
                }
                Err(err) => {
                    failed += 1;
                    last_err = Some(err);
                }
            }
        }

        tracing::warn!(
            "replica: receiving {}: {} successes, {} failures; last error: {}",
            blob,
            succeeded,
            failed,
            last_err
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Err(last_err.unwrap_or(MirrorError::InsufficientWrites {
            succeeded,
            required: self.min_writes_for_success,
        }))
    }

    /// Ask every backend to remove the blobs.
    ///
    /// Best effort by contract: any single backend reporting success makes
    /// the whole operation a success, so a removed blob may survive on
    /// replicas that failed. Callers needing removal from all replicas
    /// must verify separately.
    async fn remove_blobs_with(&self, ctx: &OpContext, blobs: &[BlobRef]) -> Result<()> {
        let shared_blobs: Arc<[BlobRef]> = blobs.to_vec().into();
        let (err_tx, mut err_rx) = mpsc::channel::<Result<()>>(CHANNEL_BUFFER);
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let blobs = Arc::clone(&shared_blobs);
            let err_tx = err_tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = err_tx.send(replica.remove_blobs(&ctx, &blobs).await).await;
            });
        }
        drop(err_tx);

        let mut succeeded = 0usize;
        let mut last_err = None;
        while let Some(res) = err_rx.recv().await {
            match res {
                Ok(()) => succeeded += 1,
                Err(err) => last_err = Some(err),
            }
        }

        if succeeded > 0 {
            return Ok(());
        }
        Err(last_err
            .unwrap_or_else(|| MirrorError::Internal("no replicas responded".to_string())))
    }

    /// Enumerate from all backends merged, so a backend temporarily
    /// missing blobs does not hide them from the listing.
    async fn enumerate_blobs_with(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Option<Duration>,
    ) -> Result<()> {
        merged_enumerate(ctx, &self.replicas, dest, after, limit, wait).await
    }
}

#[async_trait::async_trait]
impl Storage for ReplicaStore {
    async fn fetch_streaming(&self, ctx: &OpContext, blob: &BlobRef) -> Result<(BlobRead, u64)> {
        self.fetch_streaming_with(ctx, blob).await
    }

    async fn stat_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Option<Duration>,
    ) -> Result<()> {
        self.stat_blobs_with(ctx, dest, blobs, wait).await
    }

    async fn receive_blob(
        &self,
        ctx: &OpContext,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef> {
        self.receive_blob_with(ctx, blob, source).await
    }

    async fn remove_blobs(&self, ctx: &OpContext, blobs: &[BlobRef]) -> Result<()> {
        self.remove_blobs_with(ctx, blobs).await
    }

    async fn enumerate_blobs(
        &self,
        ctx: &OpContext,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Option<Duration>,
    ) -> Result<()> {
        self.enumerate_blobs_with(ctx, dest, after, limit, wait)
            .await
    }
}

/// Read `source` exactly once and copy every chunk into all pipes. A pipe
/// whose write fails (its reader is gone) is marked dead and skipped for
/// the rest of the copy so it cannot stall the remaining branches.
async fn broadcast_copy(
    source: &mut (dyn AsyncRead + Send + Unpin),
    pipes: &mut [DuplexStream],
) -> Result<u64> {
    use tokio::io::AsyncReadExt;

    let mut dead = vec![false; pipes.len()];
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await.map_err(MirrorError::Transfer)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        for (idx, pipe) in pipes.iter_mut().enumerate() {
            if dead[idx] {
                continue;
            }
            if pipe.write_all(&buf[..n]).await.is_err() {
                dead[idx] = true;
            }
        }
    }
}

/// Let workers that missed the quorum cutoff finish on their own, but cap
/// how long a hung backend can keep a task alive.
fn spawn_straggler_guard(write_ctx: OpContext, workers: Vec<JoinHandle<()>>) {
    tokio::spawn(async move {
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(STRAGGLER_GRACE, drain).await.is_err() {
            tracing::warn!(
                "replica: cancelling writes still running {:?} after quorum",
                STRAGGLER_GRACE
            );
            write_ctx.cancel();
        }
    });
}
