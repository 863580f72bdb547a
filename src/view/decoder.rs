//! Streaming view-result decoder.
//!
//! Incremental, state-machine based decoder for view responses. Converts
//! the response byte stream into [`ViewEvent`]s without ever materializing
//! the whole JSON document.
//!
//! # Decoding Flow
//!
//! 1. **ExpectTopObject**: consume the opening `{`
//! 2. **InTopObject**: dispatch on recognized keys (`total_rows`,
//!    `offset`, `update_seq`, `rows`, `error`); skip anything else
//! 3. **InRowsArray**: decode one row object per event
//! 4. **Done**: synthesize `Offset(-1)` if the response never carried an
//!    offset, then end
//!
//! Every transition is driven by one JSON token. Arbitrary nesting inside
//! `key`, `value`, and `doc` is delegated to the token source's subtree
//! collector and materialized in one shot through the caller's type
//! parameters.
//!
//! Dropping the decoder (or the stream wrapping it) drops the byte
//! stream, which cancels the underlying HTTP response.

use crate::error::{CouchError, Result};
use crate::json::{JsonToken, TokenSource};
use crate::view::{DocSlot, ViewEvent, ViewRow};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ExpectTopObject,
    InTopObject,
    InRowsArray,
    Done,
}

/// Streaming decoder for one view response.
pub struct ViewDecoder<K, V, T> {
    source: TokenSource,
    state: DecodeState,
    include_docs: bool,
    ignore_not_found: bool,
    /// A real `offset` arrived; suppresses the synthetic `Offset(-1)`.
    offset_seen: bool,
    offset_synthesized: bool,
    /// The stream already failed; everything after is `None`.
    failed: bool,
    _marker: PhantomData<fn() -> (K, V, T)>,
}

impl<K, V, T> ViewDecoder<K, V, T>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
    T: DeserializeOwned,
{
    pub fn new(source: TokenSource, include_docs: bool, ignore_not_found: bool) -> Self {
        ViewDecoder {
            source,
            state: DecodeState::ExpectTopObject,
            include_docs,
            ignore_not_found,
            offset_seen: false,
            offset_synthesized: false,
            failed: false,
            _marker: PhantomData,
        }
    }

    /// Next event, or `None` once the response is fully decoded.
    ///
    /// A returned error ends the stream; later calls return `None`.
    pub async fn next_event(&mut self) -> Result<Option<ViewEvent<K, V, T>>> {
        if self.failed {
            return Ok(None);
        }
        match self.next_event_inner().await {
            Err(e) => {
                self.failed = true;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn next_event_inner(&mut self) -> Result<Option<ViewEvent<K, V, T>>> {
        loop {
            match self.state {
                DecodeState::ExpectTopObject => match self.source.require_token().await? {
                    JsonToken::StartObject => self.state = DecodeState::InTopObject,
                    other => {
                        self.state = DecodeState::Done;
                        return Err(CouchError::Decode(format!(
                            "expected view result object, found {other:?}"
                        )));
                    }
                },
                DecodeState::InTopObject => {
                    match self.source.require_token().await? {
                        JsonToken::FieldName(name) => match name.as_str() {
                            "total_rows" => {
                                let n = self.expect_u64("total_rows").await?;
                                return Ok(Some(ViewEvent::TotalCount(n)));
                            }
                            "offset" => {
                                let n = self.expect_i64("offset").await?;
                                self.offset_seen = true;
                                return Ok(Some(ViewEvent::Offset(n)));
                            }
                            "update_seq" => {
                                if let Some(seq) = self.read_update_seq().await? {
                                    return Ok(Some(ViewEvent::UpdateSequence(seq)));
                                }
                            }
                            "rows" => match self.source.require_token().await? {
                                JsonToken::StartArray => self.state = DecodeState::InRowsArray,
                                other => {
                                    self.state = DecodeState::Done;
                                    return Err(CouchError::Decode(format!(
                                        "expected rows array, found {other:?}"
                                    )));
                                }
                            },
                            "error" => {
                                let message = self.source.collect_value().await?;
                                self.state = DecodeState::Done;
                                return Err(CouchError::ViewResult {
                                    key: None,
                                    message: message
                                        .as_str()
                                        .map(str::to_string)
                                        .unwrap_or_else(|| message.to_string()),
                                });
                            }
                            _ => self.source.skip_value().await?,
                        },
                        JsonToken::EndObject => {
                            self.state = DecodeState::Done;
                        }
                        other => {
                            self.state = DecodeState::Done;
                            return Err(CouchError::Decode(format!(
                                "unexpected token in view result: {other:?}"
                            )));
                        }
                    }
                }
                DecodeState::InRowsArray => match self.source.require_token().await? {
                    JsonToken::StartObject => {
                        if let Some(row) = self.decode_row().await? {
                            return Ok(Some(ViewEvent::Row(row)));
                        }
                        // Row dropped (ignored not_found); keep going.
                    }
                    JsonToken::EndArray => self.state = DecodeState::InTopObject,
                    other => {
                        self.state = DecodeState::Done;
                        return Err(CouchError::Decode(format!(
                            "expected row object, found {other:?}"
                        )));
                    }
                },
                DecodeState::Done => {
                    if !self.offset_seen && !self.offset_synthesized {
                        self.offset_synthesized = true;
                        return Ok(Some(ViewEvent::Offset(-1)));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Decode one row object, positioned just after its `{`. Returns `None`
    /// for rows dropped under `ignore_not_found`.
    async fn decode_row(&mut self) -> Result<Option<ViewRow<K, V, T>>> {
        let mut id: Option<String> = None;
        let mut key: Option<Value> = None;
        let mut value: Option<Value> = None;
        let mut doc: Option<Value> = None;
        let mut error: Option<String> = None;

        loop {
            match self.source.require_token().await? {
                JsonToken::FieldName(name) => match name.as_str() {
                    "id" => match self.source.require_token().await? {
                        JsonToken::String(s) => id = Some(s),
                        other => {
                            return Err(CouchError::Decode(format!(
                                "row id must be a string, found {other:?}"
                            )))
                        }
                    },
                    "key" => key = Some(self.source.collect_value().await?),
                    "value" => value = Some(self.source.collect_value().await?),
                    "doc" => doc = Some(self.source.collect_value().await?),
                    "error" => match self.source.require_token().await? {
                        JsonToken::String(s) => error = Some(s),
                        other => {
                            return Err(CouchError::Decode(format!(
                                "row error must be a string, found {other:?}"
                            )))
                        }
                    },
                    _ => self.source.skip_value().await?,
                },
                JsonToken::EndObject => break,
                other => {
                    return Err(CouchError::Decode(format!(
                        "unexpected token in row: {other:?}"
                    )))
                }
            }
        }

        if let Some(error) = error {
            if self.ignore_not_found && error == "not_found" {
                tracing::trace!(key = ?key, "dropping not_found row");
                return Ok(None);
            }
            self.state = DecodeState::Done;
            return Err(CouchError::ViewResult {
                key,
                message: error,
            });
        }

        // Reduce rows carry no id; model them with an empty one.
        let id = id.unwrap_or_default();

        let key: K = serde_json::from_value(key.unwrap_or(Value::Null))
            .map_err(|e| CouchError::Decode(format!("row `{id}`: bad key: {e}")))?;
        let value: V = serde_json::from_value(value.unwrap_or(Value::Null))
            .map_err(|e| CouchError::Decode(format!("row `{id}`: bad value: {e}")))?;

        let doc = if !self.include_docs {
            DocSlot::NotRequested
        } else {
            match doc {
                Some(Value::Null) | None => DocSlot::Missing,
                Some(doc) => DocSlot::Loaded(serde_json::from_value(doc).map_err(|e| {
                    CouchError::Decode(format!("row `{id}`: bad doc: {e}"))
                })?),
            }
        };

        Ok(Some(ViewRow {
            id,
            key,
            value,
            doc,
        }))
    }

    async fn expect_u64(&mut self, field: &str) -> Result<u64> {
        match self.source.require_token().await? {
            JsonToken::Number(n) => n
                .as_u64()
                .ok_or_else(|| CouchError::Decode(format!("`{field}` out of range"))),
            other => Err(CouchError::Decode(format!(
                "`{field}` must be a number, found {other:?}"
            ))),
        }
    }

    async fn expect_i64(&mut self, field: &str) -> Result<i64> {
        match self.source.require_token().await? {
            JsonToken::Number(n) => n
                .as_i64()
                .ok_or_else(|| CouchError::Decode(format!("`{field}` out of range"))),
            other => Err(CouchError::Decode(format!(
                "`{field}` must be a number, found {other:?}"
            ))),
        }
    }

    /// `update_seq` is numeric on old servers and an opaque string like
    /// `"42-g1AAAA"` on clustered ones; take the numeric prefix, skip
    /// anything unparseable.
    async fn read_update_seq(&mut self) -> Result<Option<u64>> {
        match self.source.require_token().await? {
            JsonToken::Number(n) => Ok(n.as_u64()),
            JsonToken::String(s) => {
                let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
                Ok(digits.parse().ok())
            }
            other => self.source.skip_value_from(other).await.map(|_| None),
        }
    }

    /// Adapt the decoder into a `Stream`. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ViewEvent<K, V, T>>> + Send
    where
        K: Send + 'static,
        V: Send + 'static,
        T: Send + 'static,
    {
        futures::stream::unfold(Some(self), |decoder| async move {
            let mut decoder = decoder?;
            match decoder.next_event().await {
                Ok(Some(event)) => Some((Ok(event), Some(decoder))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
