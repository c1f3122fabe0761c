use crate::backend::Storage;
use crate::blobref::{BlobRef, SizedBlobRef};
use crate::context::OpContext;
use crate::error::{MirrorError, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STREAM_BUFFER: usize = 8;

/// Merge the ordered enumeration streams of every source into one globally
/// ordered stream on `dest`, dropping duplicate references.
///
/// Each source enumerates with the same (after, limit, wait) parameters
/// into its own bounded channel; a min-heap over the stream heads yields
/// the next reference in canonical order. Equal references reported by
/// several sources are forwarded once.
///
/// If a source's enumeration fails, the merge forwards everything the
/// remaining sources produce and returns the last recorded error.
pub async fn merged_enumerate(
    ctx: &OpContext,
    sources: &[Arc<dyn Storage>],
    dest: mpsc::Sender<SizedBlobRef>,
    after: Option<&BlobRef>,
    limit: usize,
    wait: Option<Duration>,
) -> Result<()> {
    let mut streams = Vec::with_capacity(sources.len());
    let mut workers = Vec::with_capacity(sources.len());
    for source in sources {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let source = Arc::clone(source);
        let ctx = ctx.clone();
        let after = after.cloned();
        workers.push(tokio::spawn(async move {
            source
                .enumerate_blobs(&ctx, tx, after.as_ref(), limit, wait)
                .await
        }));
        streams.push(rx);
    }

    let mut heap: BinaryHeap<Reverse<(SizedBlobRef, usize)>> = BinaryHeap::new();
    for (idx, stream) in streams.iter_mut().enumerate() {
        if let Some(sb) = stream.recv().await {
            heap.push(Reverse((sb, idx)));
        }
    }

    let mut sent = 0usize;
    let mut last_sent: Option<BlobRef> = None;
    while let Some(Reverse((sb, idx))) = heap.pop() {
        if let Some(next) = streams[idx].recv().await {
            heap.push(Reverse((next, idx)));
        }
        if last_sent.as_ref() == Some(&sb.blob_ref) {
            continue;
        }
        last_sent = Some(sb.blob_ref.clone());
        if dest.send(sb).await.is_err() {
            break;
        }
        sent += 1;
        if limit != 0 && sent >= limit {
            break;
        }
    }

    // Closing the per-source channels unblocks any source still producing.
    drop(streams);

    let mut ret = Ok(());
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => ret = Err(err),
            Err(err) => {
                ret = Err(MirrorError::Internal(format!(
                    "enumeration worker panicked: {err}"
                )));
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStorage;

    async fn put(store: &MemoryStorage, data: &[u8]) -> SizedBlobRef {
        let blob = BlobRef::from_bytes(data);
        let mut source: &[u8] = data;
        store
            .receive_blob(&OpContext::new(), &blob, &mut source)
            .await
            .unwrap()
    }

    async fn run_merge(
        sources: &[Arc<dyn Storage>],
        after: Option<&BlobRef>,
        limit: usize,
    ) -> Vec<SizedBlobRef> {
        let (tx, mut rx) = mpsc::channel(16);
        let ctx = OpContext::new();
        let merge = merged_enumerate(&ctx, sources, tx, after, limit, None);
        let collect = async {
            let mut out = Vec::new();
            while let Some(sb) = rx.recv().await {
                out.push(sb);
            }
            out
        };
        let (res, out) = tokio::join!(merge, collect);
        res.unwrap();
        out
    }

    #[tokio::test]
    async fn test_merge_orders_and_dedupes() {
        let a = MemoryStorage::new();
        let b = MemoryStorage::new();

        let mut expected = vec![
            put(&a, b"only in a").await,
            put(&b, b"only in b").await,
            put(&a, b"shared").await,
        ];
        put(&b, b"shared").await;
        expected.sort();

        let sources: Vec<Arc<dyn Storage>> = vec![Arc::new(a), Arc::new(b)];
        assert_eq!(run_merge(&sources, None, 0).await, expected);
    }

    #[tokio::test]
    async fn test_merge_honors_cursor_and_limit() {
        let a = MemoryStorage::new();
        let b = MemoryStorage::new();

        let mut all = vec![
            put(&a, b"1").await,
            put(&b, b"2").await,
            put(&a, b"3").await,
            put(&b, b"4").await,
        ];
        all.sort();

        let sources: Vec<Arc<dyn Storage>> = vec![Arc::new(a), Arc::new(b)];
        let got = run_merge(&sources, Some(&all[0].blob_ref), 2).await;
        assert_eq!(got, all[1..3].to_vec());
    }

    #[tokio::test]
    async fn test_merge_single_source_passthrough() {
        let a = MemoryStorage::new();
        let mut expected = vec![put(&a, b"x").await, put(&a, b"y").await];
        expected.sort();

        let sources: Vec<Arc<dyn Storage>> = vec![Arc::new(a)];
        assert_eq!(run_merge(&sources, None, 0).await, expected);
    }
}
