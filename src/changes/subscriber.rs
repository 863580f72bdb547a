//! Change-feed subscriber.
//!
//! Maintains one long-lived `_changes?feed=continuous` connection and
//! keeps it alive across failures:
//!
//! ```text
//!       ┌──────────────┐   bytes ok   ┌──────────┐
//!       │ Disconnected │ ───────────▶ │ Streaming│──▶ emit change, update last_seq
//!       └──────┬───────┘              └────┬─────┘
//!              │                           │ error / EOF / watchdog
//!              │                           ▼
//!              │                   ┌───────────────┐
//!              └───────────────────│ Backoff(delay)│
//!                                  └───────────────┘
//! ```
//!
//! Every non-cancellation failure (transport close, parse error, non-2xx,
//! heartbeat watchdog) re-enters the loop after the current backoff delay;
//! the delay doubles per consecutive failure up to the configured ceiling
//! and resets on the first successfully decoded change. Reconnects resume
//! with `since=<last emitted seq>`, so sequence ordering holds across
//! sessions. Cancelling (or dropping) the feed aborts immediately and
//! never resubscribes.

use crate::changes::{Change, ChangeEnvelope, ChangesOptions, Seq, TagResolver};
use crate::client::gate::{triage, HeaderRegistry, Missing};
use crate::client::request::RequestBuilder;
use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use crate::transport::HttpTransport;
use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Watchdog window for a heartbeat interval: the server promises a byte at
/// least every interval, so allow the interval plus slack before treating
/// the connection as dead.
fn watchdog_window(heartbeat: Duration) -> Duration {
    Duration::from_secs_f64(1.2 * heartbeat.as_secs_f64() + 3.0)
}

/// A running subscription delivering raw [`ChangeEnvelope`]s.
///
/// The feed task runs until cancelled; failures are retried internally and
/// never surface here. Dropping the feed aborts the task and with it the
/// underlying HTTP response.
pub struct ChangeFeed {
    receiver: async_channel::Receiver<ChangeEnvelope>,
    task: tokio::task::JoinHandle<()>,
}

impl ChangeFeed {
    /// Spawn the feed task against `db`.
    pub(crate) fn spawn(
        transport: Arc<dyn HttpTransport>,
        config: Arc<ClientConfig>,
        registry: Arc<HeaderRegistry>,
        db: String,
        options: ChangesOptions,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(config.stream_buffer.max(1));
        let task = tokio::spawn(feed_loop(transport, config, registry, db, options, tx));
        ChangeFeed {
            receiver: rx,
            task,
        }
    }

    /// Next change; `None` after [`cancel`](Self::cancel).
    pub async fn next(&mut self) -> Option<ChangeEnvelope> {
        self.receiver.recv().await.ok()
    }

    /// Stop the subscription. Idempotent; never triggers a resubscribe.
    pub fn cancel(&self) {
        self.task.abort();
        self.receiver.close();
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Stream for ChangeFeed {
    type Item = ChangeEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        unsafe { Pin::new_unchecked(&mut self.get_unchecked_mut().receiver) }.poll_next(cx)
    }
}

/// The reconnect loop: Disconnected → Streaming → Backoff → …
async fn feed_loop(
    transport: Arc<dyn HttpTransport>,
    config: Arc<ClientConfig>,
    registry: Arc<HeaderRegistry>,
    db: String,
    options: ChangesOptions,
    tx: async_channel::Sender<ChangeEnvelope>,
) {
    let mut last_seq = options.since.clone();
    let mut delay = config.backoff.initial_delay;

    loop {
        match stream_once(
            &*transport,
            &config,
            &registry,
            &db,
            &options,
            &mut last_seq,
            &mut delay,
            &tx,
        )
        .await
        {
            StreamOutcome::Cancelled => return,
            StreamOutcome::Failed(error) => {
                tracing::warn!(
                    %error,
                    since = %last_seq,
                    backoff_ms = delay.as_millis() as u64,
                    "change feed disconnected, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = config.backoff.next_delay(delay);
            }
        }
    }
}

enum StreamOutcome {
    /// Consumer hung up; exit without resubscribing.
    Cancelled,
    /// Connection or decode failure; backoff applies.
    Failed(CouchError),
}

#[allow(clippy::too_many_arguments)]
async fn stream_once(
    transport: &dyn HttpTransport,
    config: &ClientConfig,
    registry: &HeaderRegistry,
    db: &str,
    options: &ChangesOptions,
    last_seq: &mut Seq,
    delay: &mut Duration,
    tx: &async_channel::Sender<ChangeEnvelope>,
) -> StreamOutcome {
    let request = match build_request(config, db, options, last_seq) {
        Ok(request) => request,
        Err(e) => return StreamOutcome::Failed(e),
    };

    let response = match transport.execute(request).await {
        Ok(response) => response,
        Err(e) => return StreamOutcome::Failed(e),
    };
    let mut response = match triage(response, Missing::Error, registry).await {
        Ok(Some(response)) => response,
        Ok(None) => return StreamOutcome::Failed(CouchError::NotFound),
        Err(e) => return StreamOutcome::Failed(e),
    };

    tracing::debug!(since = %last_seq, "change feed connected");

    let window = watchdog_window(config.heartbeat);
    let mut lines = BytesMut::new();

    loop {
        let chunk = match tokio::time::timeout(window, response.body.next()).await {
            Err(_) => return StreamOutcome::Failed(CouchError::Timeout),
            Ok(None) => {
                return StreamOutcome::Failed(CouchError::Transport(
                    "change feed closed by server".into(),
                ))
            }
            Ok(Some(Err(e))) => return StreamOutcome::Failed(e),
            Ok(Some(Ok(chunk))) => chunk,
        };

        lines.extend_from_slice(&chunk);
        while let Some(line) = take_line(&mut lines) {
            match decode_line(&line) {
                Ok(Line::Heartbeat) => {}
                Ok(Line::LastSeq(seq)) => *last_seq = seq,
                Ok(Line::Change(envelope)) => {
                    *last_seq = envelope.seq();
                    *delay = config.backoff.initial_delay;
                    if tx.send(envelope).await.is_err() {
                        return StreamOutcome::Cancelled;
                    }
                }
                Err(e) => return StreamOutcome::Failed(e),
            }
        }
    }
}

fn build_request(
    config: &ClientConfig,
    db: &str,
    options: &ChangesOptions,
    since: &Seq,
) -> Result<crate::transport::PreparedRequest> {
    let mut builder = RequestBuilder::from_config(config)?
        .segment(db)
        .segment("_changes")
        .query("feed", "continuous")
        .query("heartbeat", config.heartbeat.as_millis())
        .query("include_docs", options.include_docs)
        .query("since", since.as_str())
        .streaming();
    if let Some(filter) = &options.filter {
        builder = builder.query("filter", filter);
    }
    builder.build()
}

/// Pop one `\n`-terminated line off the buffer.
fn take_line(buffer: &mut BytesMut) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let line = buffer[..pos].to_vec();
    buffer.advance(pos + 1);
    Some(line)
}

enum Line {
    Heartbeat,
    /// The server announced the feed's final sequence.
    LastSeq(Seq),
    Change(ChangeEnvelope),
}

fn decode_line(line: &[u8]) -> Result<Line> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Line::Heartbeat);
    }
    let value: serde_json::Value = serde_json::from_slice(line)?;
    if let Some(seq) = value.get("last_seq") {
        return Ok(Line::LastSeq(Seq::from(seq)));
    }
    let envelope: ChangeEnvelope = serde_json::from_value(value)?;
    Ok(Line::Change(envelope))
}

/// A subscription routed to one application type via a discriminator
/// field.
///
/// Each envelope's document is inspected at the configured field; when the
/// resolver does not claim the tag, or the document cannot be materialized
/// as `T`, the change is dropped silently.
pub struct TypedChangeFeed<T> {
    inner: ChangeFeed,
    discriminator: String,
    resolver: TagResolver,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedChangeFeed<T> {
    pub(crate) fn new(inner: ChangeFeed, discriminator: String, resolver: TagResolver) -> Self {
        TypedChangeFeed {
            inner,
            discriminator,
            resolver,
            _marker: std::marker::PhantomData,
        }
    }

    /// Next change of the subscribed type.
    pub async fn next(&mut self) -> Option<Change<T>> {
        while let Some(envelope) = self.inner.next().await {
            if let Some(change) = self.route(envelope) {
                return Some(change);
            }
        }
        None
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    fn route(&self, envelope: ChangeEnvelope) -> Option<Change<T>> {
        let doc = envelope.doc.as_ref()?;
        let tag = doc.get(&self.discriminator)?.as_str()?;
        if !(self.resolver)(tag) {
            return None;
        }
        let typed: T = match serde_json::from_value(doc.clone()) {
            Ok(typed) => typed,
            Err(error) => {
                tracing::warn!(id = %envelope.id, %error, "dropping undecodable change");
                return None;
            }
        };
        Some(Change {
            seq: envelope.seq(),
            rev: envelope.rev().map(str::to_string),
            id: envelope.id,
            deleted: envelope.deleted,
            doc: Some(typed),
        })
    }
}
