//! `_all_docs` pagination batcher.
//!
//! Turns an unbounded sequence of document ids into bounded keyed
//! `_all_docs` requests, forwarding rows as they decode and rolling the
//! per-batch counters into one summary emitted after all rows:
//! `TotalCount` (sum), then `Offset` (minimum observed) if any batch
//! produced one, then `UpdateSequence` (maximum observed) if any batch
//! produced one.
//!
//! The offset is the minimum because each batch reports its own position;
//! the overall position is the earliest batch's. The update sequence is
//! the maximum because later batches observe a newer or equal cluster
//! sequence. Both are best-effort client-side rollups, not a server
//! contract.

use crate::error::Result;
use crate::view::decoder::ViewDecoder;
use crate::view::ViewEvent;
use futures::{Future, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Drive batched fetches from `ids` into `out`.
///
/// `fetch` issues one keyed `_all_docs` request (with `include_docs=true`
/// and `ignore_not_found=true`) and returns its streaming decoder. The
/// function returns when the input is exhausted, the consumer hangs up,
/// or a batch fails (the error is forwarded first).
pub(crate) async fn run_batches<T, S, F, Fut>(
    ids: S,
    batch_size: usize,
    fetch: F,
    out: async_channel::Sender<Result<ViewEvent<Value, Value, T>>>,
) where
    T: DeserializeOwned,
    S: Stream<Item = String>,
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<ViewDecoder<Value, Value, T>>>,
{
    let mut rollup = Rollup::default();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    futures::pin_mut!(ids);

    while let Some(id) = ids.next().await {
        batch.push(id);
        if batch.len() >= batch_size {
            let ids = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if !flush_batch(ids, &fetch, &mut rollup, &out).await {
                return;
            }
        }
    }
    if !batch.is_empty() && !flush_batch(batch, &fetch, &mut rollup, &out).await {
        return;
    }

    // Rows from every batch are already out; now the aggregate counters.
    let _ = out.send(Ok(ViewEvent::TotalCount(rollup.total))).await;
    if let Some(offset) = rollup.min_offset {
        let _ = out.send(Ok(ViewEvent::Offset(offset))).await;
    }
    if let Some(seq) = rollup.max_seq {
        let _ = out.send(Ok(ViewEvent::UpdateSequence(seq))).await;
    }
}

/// Consumer handle for a batched `_all_docs` fetch.
///
/// Rows arrive as their batch decodes; the aggregate counters follow once
/// the id input is exhausted. Dropping the handle aborts the driver task
/// and with it any in-flight request.
pub struct BatchedAllDocs<T> {
    receiver: async_channel::Receiver<Result<ViewEvent<Value, Value, T>>>,
    task: tokio::task::JoinHandle<()>,
}

impl<T> BatchedAllDocs<T> {
    pub(crate) fn new(
        receiver: async_channel::Receiver<Result<ViewEvent<Value, Value, T>>>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        BatchedAllDocs { receiver, task }
    }

    /// Next event; `None` once the summary has been delivered.
    pub async fn next(&mut self) -> Option<Result<ViewEvent<Value, Value, T>>> {
        self.receiver.recv().await.ok()
    }
}

impl<T> Drop for BatchedAllDocs<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> Stream for BatchedAllDocs<T> {
    type Item = Result<ViewEvent<Value, Value, T>>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        unsafe { std::pin::Pin::new_unchecked(&mut self.get_unchecked_mut().receiver) }.poll_next(cx)
    }
}

#[derive(Default)]
struct Rollup {
    total: u64,
    min_offset: Option<i64>,
    max_seq: Option<u64>,
}

/// Run one batch to completion. Returns false when the consumer is gone
/// or the batch failed terminally.
async fn flush_batch<T, F, Fut>(
    ids: Vec<String>,
    fetch: &F,
    rollup: &mut Rollup,
    out: &async_channel::Sender<Result<ViewEvent<Value, Value, T>>>,
) -> bool
where
    T: DeserializeOwned,
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<ViewDecoder<Value, Value, T>>>,
{
    tracing::debug!(keys = ids.len(), "fetching all_docs batch");
    let mut decoder = match fetch(ids).await {
        Ok(decoder) => decoder,
        Err(e) => {
            let _ = out.send(Err(e)).await;
            return false;
        }
    };

    loop {
        match decoder.next_event().await {
            Ok(Some(ViewEvent::Row(row))) => {
                if out.send(Ok(ViewEvent::Row(row))).await.is_err() {
                    return false;
                }
            }
            Ok(Some(ViewEvent::TotalCount(n))) => rollup.total += n,
            Ok(Some(ViewEvent::Offset(n))) => {
                rollup.min_offset = Some(rollup.min_offset.map_or(n, |m| m.min(n)));
            }
            Ok(Some(ViewEvent::UpdateSequence(s))) => {
                rollup.max_seq = Some(rollup.max_seq.map_or(s, |m| m.max(s)));
            }
            Ok(None) => return true,
            Err(e) => {
                let _ = out.send(Err(e)).await;
                return false;
            }
        }
    }
}
