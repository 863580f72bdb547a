//! Bulk create/update/delete.
//!
//! `_bulk_docs` requests carry every action in one POST; the response is a
//! top-level JSON array with one entry per document, decoded here element
//! by element — an entry is emitted as soon as its closing brace arrives.
//! Partial failures are not errors: failed entries appear alongside
//! successful ones with `error`/`reason` set.

use crate::error::{CouchError, Result};
use crate::json::{JsonToken, TokenSource};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request payload for `_bulk_docs`.
///
/// `all_or_nothing` is retained for wire compatibility and always
/// serializes as `false`; it is deliberately not part of the public
/// surface.
#[derive(Debug, Serialize)]
pub struct BulkRequest {
    docs: Vec<Value>,
    all_or_nothing: bool,
}

impl BulkRequest {
    pub fn new() -> Self {
        BulkRequest {
            docs: Vec::new(),
            all_or_nothing: false,
        }
    }

    /// Add a create/update action.
    pub fn push<T: Serialize>(&mut self, doc: &T) -> Result<()> {
        self.docs.push(serde_json::to_value(doc)?);
        Ok(())
    }

    /// Add a delete action for a known revision.
    pub fn push_delete(&mut self, id: impl Into<String>, rev: impl Into<String>) {
        self.docs.push(serde_json::json!({
            "_id": id.into(),
            "_rev": rev.into(),
            "_deleted": true,
        }));
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Default for BulkRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-document outcome of a bulk update.
///
/// Exactly one of `ok=true` (with a non-null `rev`) or `error != None`
/// holds per entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BulkUpdateResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkUpdateResult {
    pub fn is_ok(&self) -> bool {
        self.ok && self.error.is_none()
    }
}

/// Streaming decoder for the `_bulk_docs` response array.
pub struct BulkDecoder {
    source: TokenSource,
    started: bool,
    done: bool,
}

impl BulkDecoder {
    pub fn new(source: TokenSource) -> Self {
        BulkDecoder {
            source,
            started: false,
            done: false,
        }
    }

    /// Next per-document result in the server's (request) order.
    ///
    /// A returned error ends the stream; later calls return `None`.
    pub async fn next_result(&mut self) -> Result<Option<BulkUpdateResult>> {
        if self.done {
            return Ok(None);
        }
        match self.next_result_inner().await {
            Err(e) => {
                self.done = true;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn next_result_inner(&mut self) -> Result<Option<BulkUpdateResult>> {
        if !self.started {
            match self.source.require_token().await? {
                JsonToken::StartArray => self.started = true,
                other => {
                    self.done = true;
                    return Err(CouchError::Decode(format!(
                        "expected bulk result array, found {other:?}"
                    )));
                }
            }
        }
        match self.source.require_token().await? {
            token @ JsonToken::StartObject => {
                let element = self.source.collect_value_from(token).await?;
                let result: BulkUpdateResult = serde_json::from_value(element)?;
                Ok(Some(result))
            }
            JsonToken::EndArray => {
                self.done = true;
                Ok(None)
            }
            other => {
                self.done = true;
                Err(CouchError::Decode(format!(
                    "unexpected token in bulk result: {other:?}"
                )))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<BulkUpdateResult>> + Send {
        futures::stream::unfold(Some(self), |decoder| async move {
            let mut decoder = decoder?;
            match decoder.next_result().await {
                Ok(Some(result)) => Some((Ok(result), Some(decoder))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    fn decoder_for(body: &str) -> BulkDecoder {
        let chunks: Vec<Result<Bytes>> = body
            .as_bytes()
            .chunks(5)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        BulkDecoder::new(TokenSource::new(stream::iter(chunks).boxed()))
    }

    #[tokio::test]
    async fn test_mixed_results() {
        let body = r#"[
            {"id": "a", "rev": "1-x", "ok": true},
            {"id": "b", "error": "conflict", "reason": "Document update conflict."}
        ]"#;
        let mut decoder = decoder_for(body);

        let first = decoder.next_result().await.unwrap().unwrap();
        assert!(first.is_ok());
        assert_eq!(first.rev.as_deref(), Some("1-x"));

        let second = decoder.next_result().await.unwrap().unwrap();
        assert!(!second.is_ok());
        assert_eq!(second.error.as_deref(), Some("conflict"));

        assert!(decoder.next_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_array() {
        let mut decoder = decoder_for("[]");
        assert!(decoder.next_result().await.unwrap().is_none());
        // Terminal: stays None.
        assert!(decoder.next_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_array_body_fails() {
        let mut decoder = decoder_for(r#"{"error": "bad_request"}"#);
        assert!(decoder.next_result().await.is_err());
    }

    #[test]
    fn test_request_serializes_all_or_nothing_false() {
        let mut request = BulkRequest::new();
        request
            .push(&serde_json::json!({"_id": "a", "v": 1}))
            .unwrap();
        request.push_delete("b", "2-y");
        let text = serde_json::to_string(&request).unwrap();
        assert!(text.contains("\"all_or_nothing\":false"));
        assert!(text.contains("\"_deleted\":true"));
        assert_eq!(request.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        let body = r#"[{"id": "a", "rev": "1-x", "ok": true}]"#;
        let results: Vec<_> = decoder_for(body).into_stream().collect().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap().is_ok());
    }
}
